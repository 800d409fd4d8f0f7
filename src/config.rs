use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a [`crate::Kv`] store.
#[derive(Debug, Clone)]
pub struct Options {
    /// Directory holding every file the store owns.
    pub dir: PathBuf,

    /// Maximum memtable size in bytes before it is frozen (default: 64MB).
    pub max_table_size: usize,

    /// Maximum key length accepted by writes (default: 1MB).
    pub max_key_size: usize,

    /// Maximum size of a single value-log segment; also the upper bound on
    /// a single value (default: 1GB).
    pub value_log_file_size: u64,

    /// Values whose length exceeds this threshold are stored in the value
    /// log; values at or below it are inlined (default: 32 bytes).
    pub value_threshold: usize,

    /// Fsync the WAL and value log on every write batch (default: false).
    pub sync_writes: bool,

    /// Number of level-0 tables that triggers compaction into level 1
    /// (default: 5).
    pub level0_table_threshold: usize,

    /// Target total size for level 1 (default: 256MB). Each deeper level's
    /// target grows by `level_size_multiplier`.
    pub level_one_size: u64,

    /// Geometric growth factor between level targets (default: 10).
    pub level_size_multiplier: u64,

    /// Maximum number of levels (default: 7).
    pub max_levels: usize,

    /// How often the flush task checks for frozen memtables (default: 1s).
    pub flush_interval: Duration,

    /// How often the compaction task checks level sizes (default: 5s).
    pub compaction_interval: Duration,

    /// How often value-log garbage collection runs (default: 60s).
    pub vlog_gc_interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./cinderdb"),
            max_table_size: 64 * 1024 * 1024,
            max_key_size: 1 << 20,
            value_log_file_size: 1 << 30,
            value_threshold: 32,
            sync_writes: false,
            level0_table_threshold: 5,
            level_one_size: 256 * 1024 * 1024,
            level_size_multiplier: 10,
            max_levels: 7,
            flush_interval: Duration::from_secs(1),
            compaction_interval: Duration::from_secs(5),
            vlog_gc_interval: Duration::from_secs(60),
        }
    }
}

impl Options {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    pub fn max_table_size(mut self, size: usize) -> Self {
        self.max_table_size = size;
        self
    }

    pub fn max_key_size(mut self, size: usize) -> Self {
        self.max_key_size = size;
        self
    }

    pub fn value_log_file_size(mut self, size: u64) -> Self {
        self.value_log_file_size = size;
        self
    }

    pub fn value_threshold(mut self, threshold: usize) -> Self {
        self.value_threshold = threshold;
        self
    }

    pub fn sync_writes(mut self, enabled: bool) -> Self {
        self.sync_writes = enabled;
        self
    }

    pub fn level0_table_threshold(mut self, count: usize) -> Self {
        self.level0_table_threshold = count;
        self
    }

    pub fn level_one_size(mut self, size: u64) -> Self {
        self.level_one_size = size;
        self
    }

    pub fn level_size_multiplier(mut self, factor: u64) -> Self {
        self.level_size_multiplier = factor;
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn compaction_interval(mut self, interval: Duration) -> Self {
        self.compaction_interval = interval;
        self
    }

    pub fn vlog_gc_interval(mut self, interval: Duration) -> Self {
        self.vlog_gc_interval = interval;
        self
    }

    /// Target total size in bytes for a level.
    pub fn level_target_size(&self, level: usize) -> u64 {
        if level == 0 {
            // Level 0 is governed by table count, not size.
            return u64::MAX;
        }
        let mut target = self.level_one_size;
        for _ in 1..level {
            target = target.saturating_mul(self.level_size_multiplier);
        }
        target
    }

    pub(crate) fn validate(&self) -> crate::Result<()> {
        if self.value_threshold as u64 >= self.value_log_file_size {
            return Err(crate::Error::InvalidConfig(
                "value_threshold must be smaller than value_log_file_size".to_string(),
            ));
        }
        if self.level_size_multiplier < 2 {
            return Err(crate::Error::InvalidConfig(
                "level_size_multiplier must be at least 2".to_string(),
            ));
        }
        Ok(())
    }
}
