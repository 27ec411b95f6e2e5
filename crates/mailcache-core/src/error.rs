//! Error types for the cache library.

use thiserror::Error;

/// SQLite result code reported when a file cannot be read as a database,
/// which is what a wrong or missing encryption key looks like.
const SQLITE_NOTADB: &str = "26";

/// Errors that can occur in cache operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Key storage error.
    #[error("Keyring error: {0}")]
    Keyring(#[from] keyring::Error),

    /// The encrypted cache for an account could not be unlocked.
    #[error("Cache for {email} is locked: {reason}")]
    CacheLocked {
        /// Account whose cache could not be opened.
        email: String,
        /// Why the unlock failed.
        reason: String,
    },

    /// The cache handle was closed (for example by a concurrent clear).
    #[error("Cache for {0} is closed")]
    CacheClosed(String),

    /// An entity failed validation before being written.
    #[error("Invalid {kind} {id:?}: {reason}")]
    InvalidEntity {
        /// Entity kind, e.g. "email".
        kind: &'static str,
        /// Offending id (may be empty).
        id: String,
        /// What is wrong with it.
        reason: &'static str,
    },

    /// One entity of a batch write failed; the whole batch was rolled back.
    #[error("Batch item {index} ({id:?}) failed: {source}")]
    BatchItem {
        /// Position of the failing entity in the batch.
        index: usize,
        /// Id of the failing entity.
        id: String,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// A queued action row could not be decoded.
    #[error("Corrupt offline action {id}: {source}")]
    CorruptAction {
        /// Queue row id.
        id: i64,
        /// Decoding failure.
        #[source]
        source: serde_json::Error,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Returns true when the error means the cache itself cannot be used
    /// right now and callers should fall back to the remote provider.
    #[must_use]
    pub fn is_cache_unavailable(&self) -> bool {
        match self {
            Self::CacheLocked { .. } | Self::CacheClosed(_) | Self::Io(_) => true,
            Self::Database(e) => matches!(
                e,
                sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_)
            ) || is_not_a_database(e),
            Self::BatchItem { source, .. } => source.is_cache_unavailable(),
            _ => false,
        }
    }
}

/// Returns true if SQLite refused to read the file as a database.
pub(crate) fn is_not_a_database(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            db.code().is_some_and(|code| code == SQLITE_NOTADB)
                || db.message().contains("file is not a database")
        }
        _ => false,
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
