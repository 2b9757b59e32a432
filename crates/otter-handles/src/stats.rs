//! Runtime counters.
//!
//! All counters are atomic and can be read at any time without locking.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for tables and resources
#[derive(Debug, Default)]
pub struct HandleStats {
    pub tables_created: AtomicU64,
    pub tables_disposed: AtomicU64,
    pub resources_created: AtomicU64,
    pub resources_disposed: AtomicU64,
    /// Number of id compaction passes
    pub compactions: AtomicU64,
    /// Disposers that only ran because the resource was dropped undisposed
    pub backstop_disposals: AtomicU64,
}

impl HandleStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> HandleStatsSnapshot {
        HandleStatsSnapshot {
            tables_created: self.tables_created.load(Ordering::Relaxed),
            tables_disposed: self.tables_disposed.load(Ordering::Relaxed),
            resources_created: self.resources_created.load(Ordering::Relaxed),
            resources_disposed: self.resources_disposed.load(Ordering::Relaxed),
            compactions: self.compactions.load(Ordering::Relaxed),
            backstop_disposals: self.backstop_disposals.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleStatsSnapshot {
    pub tables_created: u64,
    pub tables_disposed: u64,
    pub resources_created: u64,
    pub resources_disposed: u64,
    pub compactions: u64,
    pub backstop_disposals: u64,
}

impl HandleStatsSnapshot {
    /// Resources created but not yet disposed
    pub fn live_resources(&self) -> u64 {
        self.resources_created
            .saturating_sub(self.resources_disposed)
    }
}

/// Counters for the serializing task queue
#[derive(Debug, Default)]
pub struct QueueStats {
    /// Tasks accepted into the queue
    pub pushed: AtomicU64,
    /// Tasks that ran to completion
    pub executed: AtomicU64,
    /// Tasks that panicked
    pub panicked: AtomicU64,
    /// Tasks rejected because the queue stayed full
    pub dropped: AtomicU64,
    /// Tasks still queued when the queue was disposed
    pub discarded: AtomicU64,
}

impl QueueStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            pushed: self.pushed.load(Ordering::Relaxed),
            executed: self.executed.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatsSnapshot {
    pub pushed: u64,
    pub executed: u64,
    pub panicked: u64,
    pub dropped: u64,
    pub discarded: u64,
}
