//! Periodic background task runner with broadcast shutdown.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::error::Result;

/// Handed to a task on every run.
pub struct Context {
    pub task_name: &'static str,
    pub run_id: u64,
    /// Fires when the store is closing; long-running work should bail out.
    pub shutdown: broadcast::Receiver<()>,
}

/// A unit of housekeeping the scheduler runs on a fixed interval.
#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    async fn execute(&self, ctx: Context) -> Result<()>;
}

pub struct Scheduler {
    handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            handles: Mutex::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Starts running `task` every `task.interval()` until shutdown. A run
    /// that returns an error is logged and does not stop the loop.
    pub fn register<T: BackgroundTask + 'static>(&self, task: Arc<T>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(task.interval());
            let mut run_id = 0u64;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_id += 1;
                        let ctx = Context {
                            task_name: task.name(),
                            run_id,
                            shutdown: shutdown_rx.resubscribe(),
                        };
                        if let Err(e) = task.execute(ctx).await {
                            error!(task = task.name(), run_id, error = %e, "background task failed");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!(task = task.name(), "background task stopping");
                        break;
                    }
                }
            }
        });
        self.handles.lock().unwrap().push(handle);
    }

    /// Runs a one-off future on the runtime, logging any error.
    pub fn spawn<F>(&self, f: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        tokio::spawn(async move {
            if let Err(e) = f.await {
                error!(error = %e, "spawned task failed");
            }
        });
    }

    /// Signals every task to stop without waiting for them.
    pub fn request_stop(&self) {
        self.shutdown_tx.send(()).ok();
    }

    /// Signals every task to stop and waits for them to finish.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx.send(()).ok();
        let handles: Vec<_> = self.handles.lock().unwrap().drain(..).collect();
        for handle in handles {
            handle
                .await
                .map_err(|e| crate::Error::InvalidState(format!("task join failed: {}", e)))?;
        }
        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
