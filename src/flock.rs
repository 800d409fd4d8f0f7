use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Exclusive advisory lock over the store directory. The lock file carries
/// the owning process id for debugging; the lock itself is released when the
/// handle is dropped (or the process exits).
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    pub fn lock<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        Self::try_lock(&file)?;

        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { _file: file, path })
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> io::Result<()> {
        use libc::{flock, LOCK_EX, LOCK_NB};

        let fd = file.as_raw_fd();
        let result = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock(_file: &File) -> io::Result<()> {
        Ok(())
    }

    /// The lock is released when the handle drops; this exists to make the
    /// release explicit at close time.
    pub fn unlock(self) -> io::Result<()> {
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_lock_writes_pid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock_path = dir.path().join("store.lock");

        let lock = FileLock::lock(&lock_path).expect("Failed to acquire lock");
        assert!(lock_path.exists());
        let content = fs::read_to_string(&lock_path).expect("Failed to read lock file");
        assert!(content.contains(&std::process::id().to_string()));
        lock.unlock().expect("Failed to release lock");
    }

    #[test]
    fn test_second_lock_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock_path = dir.path().join("store.lock");

        let _lock1 = FileLock::lock(&lock_path).expect("Failed to acquire first lock");
        assert!(FileLock::lock(&lock_path).is_err());
    }

    #[test]
    fn test_relock_after_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock_path = dir.path().join("store.lock");

        {
            let _lock = FileLock::lock(&lock_path).expect("Failed to acquire lock");
        }
        let lock2 = FileLock::lock(&lock_path).expect("Should re-acquire after drop");
        assert_eq!(lock2.path(), lock_path.as_path());
    }
}
