//! Background synchronization with the remote provider.
//!
//! A [`SyncScheduler`] runs one loop per account. Each cycle first replays
//! the account's offline queue, then refreshes emails, folders, events and
//! contacts in that order, advancing each resource's checkpoint only after
//! its items are stored.

mod metrics;
#[cfg(test)]
mod mock;
mod online;
mod remote;
mod replay;
mod scheduler;

pub use metrics::{SyncMetrics, SyncMetricsSnapshot};
pub use online::OnlineStatus;
pub use remote::{
    AccountGrant, MessageUpdate, RemoteCalendar, RemoteError, RemoteProvider, RemoteResult,
};
pub use replay::{ReplayReport, RetryPolicy, apply_action, drain_queue};
pub use scheduler::{
    DEFAULT_CYCLE_TIMEOUT, DEFAULT_SYNC_INTERVAL, SkipReason, SyncOptions, SyncReport,
    SyncScheduler,
};
