//! Sync counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters updated by every sync worker of a scheduler.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    cycles: AtomicU64,
    skipped_cycles: AtomicU64,
    failures: AtomicU64,
    items_synced: AtomicU64,
    actions_replayed: AtomicU64,
    actions_failed: AtomicU64,
    actions_abandoned: AtomicU64,
}

/// Point-in-time copy of [`SyncMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncMetricsSnapshot {
    /// Sync cycles that ran.
    pub cycles: u64,
    /// Cycles skipped because the provider was offline or missing, or another
    /// cycle of the account was still running.
    pub skipped_cycles: u64,
    /// Resource syncs that failed.
    pub failures: u64,
    /// Entities written to the cache.
    pub items_synced: u64,
    /// Offline actions applied remotely.
    pub actions_replayed: u64,
    /// Offline action attempts that failed.
    pub actions_failed: u64,
    /// Offline actions dropped after too many failures.
    pub actions_abandoned: u64,
}

impl SyncMetrics {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_cycle(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_skipped(&self) {
        self.skipped_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_items(&self, count: usize) {
        self.items_synced
            .fetch_add(u64::try_from(count).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    pub(crate) fn record_replayed(&self) {
        self.actions_replayed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_action_failed(&self) {
        self.actions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_abandoned(&self) {
        self.actions_abandoned.fetch_add(1, Ordering::Relaxed);
    }

    /// Read every counter.
    #[must_use]
    pub fn snapshot(&self) -> SyncMetricsSnapshot {
        SyncMetricsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            skipped_cycles: self.skipped_cycles.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            items_synced: self.items_synced.load(Ordering::Relaxed),
            actions_replayed: self.actions_replayed.load(Ordering::Relaxed),
            actions_failed: self.actions_failed.load(Ordering::Relaxed),
            actions_abandoned: self.actions_abandoned.load(Ordering::Relaxed),
        }
    }
}
