//! Background tasks wiring the housekeeping passes to the scheduler.

use std::sync::Arc;
use std::time::Duration;

use crate::compaction;
use crate::config::Options;
use crate::error::Result;
use crate::flush::flush_oldest;
use crate::scheduler::{BackgroundTask, Context};
use crate::state::LsmState;
use crate::vlog::ValueLog;
use crate::vlog_gc::gc_value_log;
use crate::write::WriteCoordinator;

/// Drains the frozen memtable queue into level 0.
pub struct FlushTask {
    state: Arc<LsmState>,
    opts: Arc<Options>,
}

impl FlushTask {
    pub fn new(state: Arc<LsmState>, opts: Arc<Options>) -> Self {
        Self { state, opts }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for FlushTask {
    fn name(&self) -> &'static str {
        "flush"
    }

    fn interval(&self) -> Duration {
        self.opts.flush_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        if !self.state.needs_flush() {
            return Ok(());
        }
        if !self.state.try_mark_flush_pending() {
            return Ok(());
        }
        let result = drain_frozen(&self.state, &self.opts);
        self.state.mark_flush_completed();
        result
    }
}

pub(crate) fn drain_frozen(state: &LsmState, opts: &Options) -> Result<()> {
    while !state.frozen_memtables.read().unwrap().is_empty() {
        flush_oldest(state, &opts.dir)?;
    }
    Ok(())
}

/// Keeps every level within its size target.
pub struct CompactionTask {
    state: Arc<LsmState>,
    opts: Arc<Options>,
}

impl CompactionTask {
    pub fn new(state: Arc<LsmState>, opts: Arc<Options>) -> Self {
        Self { state, opts }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for CompactionTask {
    fn name(&self) -> &'static str {
        "compaction"
    }

    fn interval(&self) -> Duration {
        self.opts.compaction_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        if compaction::needs_compaction(&self.state, &self.opts) {
            compaction::compact(&self.state, &self.opts, &self.opts.dir)?;
        }
        Ok(())
    }
}

/// Reclaims dead value-log segments.
pub struct VlogGcTask {
    state: Arc<LsmState>,
    vlog: Arc<ValueLog>,
    writer: Arc<WriteCoordinator>,
    opts: Arc<Options>,
}

impl VlogGcTask {
    pub fn new(
        state: Arc<LsmState>,
        vlog: Arc<ValueLog>,
        writer: Arc<WriteCoordinator>,
        opts: Arc<Options>,
    ) -> Self {
        Self {
            state,
            vlog,
            writer,
            opts,
        }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for VlogGcTask {
    fn name(&self) -> &'static str {
        "vlog-gc"
    }

    fn interval(&self) -> Duration {
        self.opts.vlog_gc_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        let Some(_guard) = self.state.try_start_vlog_gc() else {
            return Ok(());
        };
        gc_value_log(&self.state, &self.vlog, &self.writer)?;
        Ok(())
    }
}
