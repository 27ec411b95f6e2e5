//! Cached folder storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::{count_from, ensure_id, from_unix, to_unix};
use crate::{Error, Result};

/// Type of folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FolderType {
    /// Inbox folder.
    Inbox,
    /// Sent mail folder.
    Sent,
    /// Drafts folder.
    Drafts,
    /// Trash folder.
    Trash,
    /// Spam/junk folder.
    Spam,
    /// Any user or provider folder.
    #[default]
    Other,
}

impl FolderType {
    /// Parse from database string representation.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "inbox" => Self::Inbox,
            "sent" => Self::Sent,
            "drafts" => Self::Drafts,
            "trash" => Self::Trash,
            "spam" => Self::Spam,
            _ => Self::Other,
        }
    }

    /// Convert to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Inbox => "inbox",
            Self::Sent => "sent",
            Self::Drafts => "drafts",
            Self::Trash => "trash",
            Self::Spam => "spam",
            Self::Other => "other",
        }
    }

    /// Detect folder type from a folder name.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        let lower = name.to_lowercase();
        if lower == "inbox" {
            Self::Inbox
        } else if lower.contains("sent") {
            Self::Sent
        } else if lower.contains("draft") {
            Self::Drafts
        } else if lower.contains("trash") || lower.contains("deleted") {
            Self::Trash
        } else if lower.contains("spam") || lower.contains("junk") {
            Self::Spam
        } else {
            Self::Other
        }
    }
}

/// A mail folder mirrored from the remote provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedFolder {
    /// Remote folder id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Well-known folder role.
    pub folder_type: FolderType,
    /// Unread messages in the folder.
    pub unread_count: i64,
    /// Total messages in the folder.
    pub total_count: i64,
    /// When this row was last written.
    pub cached_at: DateTime<Utc>,
}

impl CachedFolder {
    /// Creates a folder, inferring its type from the name.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: id.into(),
            folder_type: FolderType::from_name(&name),
            name,
            cached_at: Utc::now(),
            ..Self::default()
        }
    }
}

/// Folder storage for one account.
#[derive(Debug, Clone)]
pub struct FolderStore {
    pool: SqlitePool,
}

impl FolderStore {
    /// Creates a store over an initialized account pool.
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace a folder.
    ///
    /// # Errors
    ///
    /// Returns an error if the folder is malformed or the database query fails.
    pub async fn put(&self, folder: &CachedFolder) -> Result<()> {
        ensure_id("folder", &folder.id)?;
        let mut conn = self.pool.acquire().await?;
        upsert(&mut conn, folder).await
    }

    /// Insert or replace many folders in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BatchItem`] naming the first failing folder.
    pub async fn put_batch(&self, folders: &[CachedFolder]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (index, folder) in folders.iter().enumerate() {
            let written = match ensure_id("folder", &folder.id) {
                Ok(()) => upsert(&mut tx, folder).await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                return Err(Error::BatchItem {
                    index,
                    id: folder.id.clone(),
                    source: Box::new(e),
                });
            }
        }
        tx.commit().await?;
        Ok(())
    }

    /// Get a folder by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get(&self, id: &str) -> Result<Option<CachedFolder>> {
        let row = sqlx::query(
            "SELECT id, name, type, unread_count, total_count, cached_at FROM folders WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_folder).transpose()
    }

    /// Get the canonical folder of a well-known type (the first one cached).
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get_by_type(&self, folder_type: FolderType) -> Result<Option<CachedFolder>> {
        let row = sqlx::query(
            r"
            SELECT id, name, type, unread_count, total_count, cached_at
            FROM folders
            WHERE type = ?
            ORDER BY rowid
            LIMIT 1
            ",
        )
        .bind(folder_type.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_folder).transpose()
    }

    /// List folders: inbox, drafts, sent, trash, spam, then the rest by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn list(&self) -> Result<Vec<CachedFolder>> {
        let rows = sqlx::query(
            r"
            SELECT id, name, type, unread_count, total_count, cached_at
            FROM folders
            ORDER BY
                CASE type
                    WHEN 'inbox' THEN 0
                    WHEN 'drafts' THEN 1
                    WHEN 'sent' THEN 2
                    WHEN 'trash' THEN 3
                    WHEN 'spam' THEN 4
                    ELSE 5
                END,
                name COLLATE NOCASE,
                id
            ",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_folder).collect()
    }

    /// Adjust a folder's unread count by `delta`, never going below zero.
    ///
    /// Returns false when the folder is not cached.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn increment_unread(&self, id: &str, delta: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE folders SET unread_count = MAX(0, unread_count + ?) WHERE id = ?",
        )
        .bind(delta)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Sum of unread counts across all folders.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn total_unread(&self) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COALESCE(SUM(unread_count), 0) FROM folders")
            .fetch_one(&self.pool)
            .await?;
        Ok(count_from(n))
    }

    /// Delete a folder.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM folders WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Number of cached folders.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn count(&self) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM folders")
            .fetch_one(&self.pool)
            .await?;
        Ok(count_from(n))
    }
}

async fn upsert(conn: &mut sqlx::SqliteConnection, folder: &CachedFolder) -> Result<()> {
    // rowid is preserved on conflict, so get_by_type keeps returning the
    // first folder cached for a type.
    sqlx::query(
        r"
        INSERT INTO folders (id, name, type, unread_count, total_count, cached_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            type = excluded.type,
            unread_count = excluded.unread_count,
            total_count = excluded.total_count,
            cached_at = excluded.cached_at
        ",
    )
    .bind(&folder.id)
    .bind(&folder.name)
    .bind(folder.folder_type.as_str())
    .bind(folder.unread_count)
    .bind(folder.total_count)
    .bind(to_unix(Utc::now()))
    .execute(conn)
    .await?;
    Ok(())
}

fn row_to_folder(row: &SqliteRow) -> Result<CachedFolder> {
    let folder_type: String = row.try_get("type")?;
    Ok(CachedFolder {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        folder_type: FolderType::parse(&folder_type),
        unread_count: row.try_get("unread_count")?,
        total_count: row.try_get("total_count")?,
        cached_at: from_unix(row.try_get("cached_at")?),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::memory_pool;

    async fn store() -> FolderStore {
        FolderStore::new(memory_pool().await.unwrap())
    }

    #[test]
    fn test_from_name() {
        assert_eq!(FolderType::from_name("INBOX"), FolderType::Inbox);
        assert_eq!(FolderType::from_name("Sent Items"), FolderType::Sent);
        assert_eq!(FolderType::from_name("Deleted Items"), FolderType::Trash);
        assert_eq!(FolderType::from_name("Junk E-mail"), FolderType::Spam);
        assert_eq!(FolderType::from_name("Receipts"), FolderType::Other);
    }

    #[tokio::test]
    async fn test_list_canonical_order() {
        let store = store().await;
        store
            .put_batch(&[
                CachedFolder::new("f-trash", "Trash"),
                CachedFolder::new("f-inbox", "Inbox"),
                CachedFolder::new("f-sent", "Sent"),
                CachedFolder::new("f-a", "custom-A"),
            ])
            .await
            .unwrap();

        let names: Vec<_> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, vec!["Inbox", "Sent", "Trash", "custom-A"]);
    }

    #[tokio::test]
    async fn test_get_by_type_returns_first_cached() {
        let store = store().await;
        store.put(&CachedFolder::new("inbox-1", "Inbox")).await.unwrap();
        let mut second = CachedFolder::new("inbox-2", "Other inbox");
        second.folder_type = FolderType::Inbox;
        store.put(&second).await.unwrap();
        // re-caching the first one must not change which is canonical
        store.put(&CachedFolder::new("inbox-1", "Inbox")).await.unwrap();

        let inbox = store.get_by_type(FolderType::Inbox).await.unwrap().unwrap();
        assert_eq!(inbox.id, "inbox-1");
        assert!(store.get_by_type(FolderType::Spam).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_increment_unread_clamps_at_zero() {
        let store = store().await;
        let mut inbox = CachedFolder::new("inbox", "Inbox");
        inbox.unread_count = 2;
        store.put(&inbox).await.unwrap();
        store.put(&CachedFolder::new("sent", "Sent")).await.unwrap();

        assert!(store.increment_unread("inbox", 3).await.unwrap());
        assert_eq!(store.get("inbox").await.unwrap().unwrap().unread_count, 5);

        store.increment_unread("inbox", -10).await.unwrap();
        assert_eq!(store.get("inbox").await.unwrap().unwrap().unread_count, 0);

        assert!(!store.increment_unread("missing", 1).await.unwrap());
        store.increment_unread("sent", 4).await.unwrap();
        assert_eq!(store.total_unread().await.unwrap(), 4);
    }
}
