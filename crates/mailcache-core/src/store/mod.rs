//! Per-account entity storage.
//!
//! Every account owns one `SQLite` database holding its emails, folders,
//! events, contacts, attachment index, sync checkpoints and offline action
//! queue. The stores in this module are thin views over a shared
//! [`SqlitePool`]; cloning one is cheap.

mod attachment;
mod contact;
mod email;
mod event;
mod folder;
mod photo;
mod schema;
mod sync_state;

use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

pub use attachment::{AttachmentStats, AttachmentStore, CachedAttachment};
pub(crate) use attachment::ATTACHMENT_DIR;
pub use contact::{CachedContact, ContactStore};
pub use email::{CachedEmail, EmailListOptions, EmailStore};
pub use event::{CachedEvent, EventListOptions, EventStatus, EventStore, EventWhen};
pub use folder::{CachedFolder, FolderStore, FolderType};
pub use photo::{CachedPhoto, DEFAULT_PHOTO_TTL_DAYS, PHOTO_DB_FILE, PhotoStats, PhotoStore};
pub use sync_state::{SyncResource, SyncState, SyncStateStore};

pub(crate) use schema::initialize;

use crate::Result;

/// Result limit applied to searches called with a limit of zero.
pub const DEFAULT_SEARCH_LIMIT: u32 = 50;

/// How long a connection waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection options shared by every on-disk cache database.
pub(crate) fn connect_options(path: &std::path::Path) -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(BUSY_TIMEOUT)
        .pragma("cache_size", "-64000")
        .pragma("temp_store", "MEMORY")
}

/// Open an on-disk pool and make sure the schema exists.
pub(crate) async fn open_pool(options: SqliteConnectOptions) -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    initialize(&pool).await?;
    Ok(pool)
}

/// Create an in-memory pool with the account schema, for tests and previews.
///
/// # Errors
///
/// Returns an error if the database connection fails or schema creation fails.
pub async fn memory_pool() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    initialize(&pool).await?;
    Ok(pool)
}

pub(crate) fn to_unix(ts: DateTime<Utc>) -> i64 {
    ts.timestamp()
}

pub(crate) fn from_unix(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

pub(crate) fn from_unix_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

pub(crate) fn count_from(n: i64) -> u64 {
    u64::try_from(n).unwrap_or_default()
}

pub(crate) const fn effective_limit(limit: u32) -> u32 {
    if limit == 0 { DEFAULT_SEARCH_LIMIT } else { limit }
}

/// Split a free-text query into lowercase `LIKE` patterns, one per token.
pub(crate) fn token_patterns(query: &str) -> Vec<String> {
    query
        .split_whitespace()
        .map(|token| {
            let escaped = token
                .to_lowercase()
                .replace('\\', "\\\\")
                .replace('%', "\\%")
                .replace('_', "\\_");
            format!("%{escaped}%")
        })
        .collect()
}

/// Append `AND (LOWER(a) LIKE ? OR LOWER(b) LIKE ? ...)` for every token.
///
/// The builder must already contain a `WHERE` clause.
pub(crate) fn push_token_filter(
    qb: &mut QueryBuilder<'_, Sqlite>,
    columns: &[&str],
    patterns: Vec<String>,
) {
    for pattern in patterns {
        qb.push(" AND (");
        for (i, column) in columns.iter().enumerate() {
            if i > 0 {
                qb.push(" OR ");
            }
            qb.push("LOWER(")
                .push(*column)
                .push(") LIKE ")
                .push_bind(pattern.clone())
                .push(" ESCAPE '\\'");
        }
        qb.push(")");
    }
}

/// Lowercase hex SHA-256 of `data`.
pub(crate) fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

pub(crate) fn ensure_id(kind: &'static str, id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(crate::Error::InvalidEntity {
            kind,
            id: id.to_string(),
            reason: "empty id",
        });
    }
    Ok(())
}
