//! Per-resource sync checkpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::from_unix_millis;
use crate::Result;

/// A resource kind that is synchronized independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncResource {
    /// Email messages.
    Emails,
    /// Mail folders.
    Folders,
    /// Calendar events.
    Events,
    /// Address book.
    Contacts,
}

impl SyncResource {
    /// Every resource in the order a sync cycle visits them.
    pub const ALL: [Self; 4] = [Self::Emails, Self::Folders, Self::Events, Self::Contacts];

    /// Convert to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Emails => "emails",
            Self::Folders => "folders",
            Self::Events => "events",
            Self::Contacts => "contacts",
        }
    }
}

impl std::fmt::Display for SyncResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last successful sync of one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    /// Resource name, e.g. "emails".
    pub resource: String,
    /// When the resource last synced successfully.
    pub last_sync: DateTime<Utc>,
    /// Provider paging cursor, if any.
    pub cursor: Option<String>,
}

impl SyncState {
    /// Checkpoint for `resource` at the current time.
    #[must_use]
    pub fn now(resource: SyncResource) -> Self {
        Self {
            resource: resource.as_str().to_string(),
            last_sync: Utc::now(),
            cursor: None,
        }
    }
}

/// Checkpoint storage for one account.
#[derive(Debug, Clone)]
pub struct SyncStateStore {
    pool: SqlitePool,
}

impl SyncStateStore {
    /// Creates a store over an initialized account pool.
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get the checkpoint of a resource.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get(&self, resource: &str) -> Result<Option<SyncState>> {
        let row = sqlx::query("SELECT resource, last_sync, cursor FROM sync_state WHERE resource = ?")
            .bind(resource)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_state).transpose()
    }

    /// Record a checkpoint. The stored timestamp never moves backwards.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn set(&self, state: &SyncState) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO sync_state (resource, last_sync, cursor)
            VALUES (?, ?, ?)
            ON CONFLICT(resource) DO UPDATE SET
                last_sync = MAX(sync_state.last_sync, excluded.last_sync),
                cursor = excluded.cursor
            ",
        )
        .bind(&state.resource)
        .bind(state.last_sync.timestamp_millis())
        .bind(&state.cursor)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All checkpoints, by resource name.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn list(&self) -> Result<Vec<SyncState>> {
        let rows = sqlx::query("SELECT resource, last_sync, cursor FROM sync_state ORDER BY resource")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_state).collect()
    }

    /// Most recent checkpoint across all resources.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn last_sync(&self) -> Result<Option<DateTime<Utc>>> {
        let millis: Option<i64> = sqlx::query_scalar("SELECT MAX(last_sync) FROM sync_state")
            .fetch_one(&self.pool)
            .await?;
        Ok(millis.map(from_unix_millis))
    }
}

fn row_to_state(row: &SqliteRow) -> Result<SyncState> {
    Ok(SyncState {
        resource: row.try_get("resource")?,
        last_sync: from_unix_millis(row.try_get("last_sync")?),
        cursor: row.try_get("cursor")?,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::store::memory_pool;

    #[tokio::test]
    async fn test_checkpoint_never_moves_backwards() {
        let store = SyncStateStore::new(memory_pool().await.unwrap());
        assert!(store.get("emails").await.unwrap().is_none());
        assert!(store.last_sync().await.unwrap().is_none());

        let first = SyncState::now(SyncResource::Emails);
        store.set(&first).await.unwrap();

        let mut stale = first.clone();
        stale.last_sync = first.last_sync - Duration::hours(1);
        stale.cursor = Some("page-2".to_string());
        store.set(&stale).await.unwrap();

        let stored = store.get("emails").await.unwrap().unwrap();
        assert_eq!(stored.last_sync.timestamp_millis(), first.last_sync.timestamp_millis());
        assert_eq!(stored.cursor.as_deref(), Some("page-2"));
    }

    #[tokio::test]
    async fn test_last_sync_is_latest_resource() {
        let store = SyncStateStore::new(memory_pool().await.unwrap());
        let mut emails = SyncState::now(SyncResource::Emails);
        emails.last_sync -= Duration::minutes(10);
        let contacts = SyncState::now(SyncResource::Contacts);
        store.set(&emails).await.unwrap();
        store.set(&contacts).await.unwrap();

        let latest = store.last_sync().await.unwrap().unwrap();
        assert_eq!(latest.timestamp_millis(), contacts.last_sync.timestamp_millis());
        assert_eq!(store.list().await.unwrap().len(), 2);
    }
}
