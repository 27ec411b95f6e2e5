//! Offline action queue storage.

use chrono::{Duration, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use super::model::{ActionPayload, QueuedAction};
use crate::store::{count_from, from_unix_millis};
use crate::{Error, Result};

const COLUMNS: &str = "id, type, resource_id, payload, created_at, attempts, last_error";

/// Durable FIFO of writes made while offline, stored in the account database.
#[derive(Debug, Clone)]
pub struct OfflineQueue {
    pool: SqlitePool,
}

impl OfflineQueue {
    /// Creates a queue over an initialized account pool.
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append an action. Returns its queue id.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized or the insert fails.
    pub async fn enqueue(&self, payload: &ActionPayload) -> Result<i64> {
        let action_type = payload.action_type();
        let result = sqlx::query(
            r"
            INSERT INTO offline_queue (type, resource_id, payload, created_at)
            VALUES (?, ?, ?, ?)
            ",
        )
        .bind(action_type.as_str())
        .bind(payload.resource_id())
        .bind(serde_json::to_string(payload)?)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        debug!("Queued offline action {} ({})", id, action_type);
        Ok(id)
    }

    /// Remove and return the oldest action.
    ///
    /// The select and delete happen in one statement, so concurrent callers
    /// never receive the same action.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails, or [`Error::CorruptAction`] if the
    /// removed row could not be decoded.
    pub async fn dequeue(&self) -> Result<Option<QueuedAction>> {
        let row = sqlx::query(&format!(
            r"
            DELETE FROM offline_queue
            WHERE id = (SELECT id FROM offline_queue ORDER BY created_at, id LIMIT 1)
            RETURNING {COLUMNS}
            "
        ))
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_action).transpose()
    }

    /// Return the oldest action without removing it.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the row cannot be decoded.
    pub async fn peek(&self) -> Result<Option<QueuedAction>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM offline_queue ORDER BY created_at, id LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_action).transpose()
    }

    /// All pending actions, oldest first.
    ///
    /// Rows that cannot be decoded are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn list(&self) -> Result<Vec<QueuedAction>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM offline_queue ORDER BY created_at, id"
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut actions = Vec::with_capacity(rows.len());
        for row in &rows {
            match row_to_action(row) {
                Ok(action) => actions.push(action),
                Err(e) => warn!("Skipping offline action: {}", e),
            }
        }
        Ok(actions)
    }

    /// Number of pending actions.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn count(&self) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM offline_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(count_from(n))
    }

    /// Whether any action is pending.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn has_pending_actions(&self) -> Result<bool> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM offline_queue)")
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    /// Record a failed replay: bump the attempt count and keep the error.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn mark_failed(&self, id: i64, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE offline_queue SET attempts = attempts + 1, last_error = ? WHERE id = ?",
        )
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove one action.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn remove(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM offline_queue WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove every pending action.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn clear(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM offline_queue")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Remove actions queued longer ago than `max_age`. Returns how many.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn remove_stale(&self, max_age: Duration) -> Result<u64> {
        let cutoff = (Utc::now() - max_age).timestamp_millis();
        let result = sqlx::query("DELETE FROM offline_queue WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() > 0 {
            debug!("Dropped {} stale offline actions", result.rows_affected());
        }
        Ok(result.rows_affected())
    }

    /// Remove every action targeting `resource_id`. Returns how many.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn remove_by_resource_id(&self, resource_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM offline_queue WHERE resource_id = ?")
            .bind(resource_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn row_to_action(row: &SqliteRow) -> Result<QueuedAction> {
    let id: i64 = row.try_get("id")?;
    let payload: String = row.try_get("payload")?;
    let payload = serde_json::from_str::<ActionPayload>(&payload)
        .map_err(|source| Error::CorruptAction { id, source })?;
    let attempts: i64 = row.try_get("attempts")?;

    Ok(QueuedAction {
        id,
        resource_id: row.try_get("resource_id")?,
        payload,
        created_at: from_unix_millis(row.try_get("created_at")?),
        attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
        last_error: row.try_get("last_error")?,
    })
}
