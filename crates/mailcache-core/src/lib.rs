//! # mailcache-core
//!
//! Offline-first local cache for a mail, calendar and contacts client.
//!
//! This crate provides:
//! - **Entity stores** - per-account `SQLite` storage for emails, folders,
//!   events, contacts, downloaded attachments and sync checkpoints
//! - **Offline queue** - durable FIFO of writes made while disconnected
//! - **Cache manager** - lazily opened per-account databases, optional
//!   encryption at rest, stats and cleanup
//! - **Background sync** - one loop per account pulling from a remote
//!   provider and replaying queued writes
//! - **Unified search** - one query across emails, events and contacts
//! - **Conflict detection** - overlapping busy calendar events

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod config;
pub mod conflict;
pub mod encryption;
mod error;
pub mod manager;
pub mod queue;
pub mod search;
pub mod status;
pub mod store;
pub mod sync;

pub use config::{CacheConfig, CacheSettings};
pub use conflict::{EventConflict, find_conflicts, find_conflicts_in};
pub use encryption::{KeyStore, KeyringKeyStore, MemoryKeyStore};
pub use error::{Error, Result};
pub use manager::{AccountCache, CacheManager, CacheStats};
pub use queue::{ActionPayload, ActionType, OfflineQueue, QueuedAction};
pub use search::{SearchQuery, SearchResult, unified_search};
pub use status::CacheStatus;
pub use store::{
    CachedAttachment, CachedContact, CachedEmail, CachedEvent, CachedFolder, EventWhen, FolderType,
};
pub use sync::{
    AccountGrant, OnlineStatus, RemoteError, RemoteProvider, RetryPolicy, SyncMetrics,
    SyncOptions, SyncScheduler,
};
