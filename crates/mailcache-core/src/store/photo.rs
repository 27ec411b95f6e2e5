//! Contact photo cache shared by all accounts.
//!
//! Metadata lives in `photos.db`; the image bytes are plain files under
//! `photos/`, one per contact.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::{debug, warn};

use super::{connect_options, count_from, ensure_id, from_unix, sha256_hex, to_unix};
use crate::Result;

/// Default time-to-live for cached photos.
pub const DEFAULT_PHOTO_TTL_DAYS: i64 = 30;

/// File name of the shared photo database inside the cache directory.
pub const PHOTO_DB_FILE: &str = "photos.db";

const PHOTO_DIR: &str = "photos";

/// Metadata of one cached photo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedPhoto {
    /// Contact the photo belongs to.
    pub contact_id: String,
    /// MIME type, e.g. `image/jpeg`.
    pub content_type: String,
    /// Size of the image in bytes.
    pub size: u64,
    /// Where the bytes are stored.
    pub local_path: PathBuf,
    /// When the photo was downloaded.
    pub cached_at: DateTime<Utc>,
    /// When the photo was last read.
    pub accessed_at: DateTime<Utc>,
}

/// Photo cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PhotoStats {
    /// Number of cached photos.
    pub count: u64,
    /// Bytes used by cached photos.
    pub total_size: u64,
    /// Configured time-to-live.
    pub ttl_days: i64,
    /// Oldest cached photo.
    pub oldest: Option<DateTime<Utc>>,
    /// Newest cached photo.
    pub newest: Option<DateTime<Utc>>,
}

/// Contact photo storage.
#[derive(Debug, Clone)]
pub struct PhotoStore {
    pool: SqlitePool,
    dir: PathBuf,
    ttl: Duration,
}

impl PhotoStore {
    /// Open (or create) the photo cache inside `base_path`.
    ///
    /// A non-positive `ttl_days` falls back to [`DEFAULT_PHOTO_TTL_DAYS`].
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or database cannot be created.
    pub async fn open(base_path: &Path, ttl_days: i64) -> Result<Self> {
        let dir = base_path.join(PHOTO_DIR);
        tokio::fs::create_dir_all(&dir).await?;

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(connect_options(&base_path.join(PHOTO_DB_FILE)))
            .await?;

        let ttl_days = if ttl_days > 0 { ttl_days } else { DEFAULT_PHOTO_TTL_DAYS };
        let store = Self {
            pool,
            dir,
            ttl: Duration::days(ttl_days),
        };
        store.initialize().await?;
        Ok(store)
    }

    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS photos (
                contact_id TEXT PRIMARY KEY NOT NULL,
                content_type TEXT NOT NULL,
                size INTEGER NOT NULL,
                local_path TEXT NOT NULL,
                cached_at INTEGER NOT NULL,
                accessed_at INTEGER NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_photos_cached ON photos(cached_at)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// File of a contact's photo, named by the hash of its id so distinct
    /// ids never share a file.
    fn path_for(&self, contact_id: &str) -> PathBuf {
        self.dir.join(sha256_hex(contact_id.as_bytes()))
    }

    fn expired(&self, cached_at: DateTime<Utc>) -> bool {
        Utc::now() - cached_at > self.ttl
    }

    /// Store a contact photo, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns an error if the file or database write fails.
    pub async fn put(&self, contact_id: &str, content_type: &str, data: &[u8]) -> Result<()> {
        ensure_id("photo", contact_id)?;
        let path = self.path_for(contact_id);
        tokio::fs::write(&path, data).await?;

        let now = to_unix(Utc::now());
        sqlx::query(
            r"
            INSERT INTO photos (contact_id, content_type, size, local_path, cached_at, accessed_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(contact_id) DO UPDATE SET
                content_type = excluded.content_type,
                size = excluded.size,
                local_path = excluded.local_path,
                cached_at = excluded.cached_at,
                accessed_at = excluded.accessed_at
            ",
        )
        .bind(contact_id)
        .bind(content_type)
        .bind(i64::try_from(data.len()).unwrap_or(i64::MAX))
        .bind(path.to_string_lossy().into_owned())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        debug!("Cached photo for contact {}", contact_id);
        Ok(())
    }

    async fn metadata(&self, contact_id: &str) -> Result<Option<CachedPhoto>> {
        let row = sqlx::query(
            r"
            SELECT contact_id, content_type, size, local_path, cached_at, accessed_at
            FROM photos WHERE contact_id = ?
            ",
        )
        .bind(contact_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_photo).transpose()
    }

    /// Read a photo and its content type.
    ///
    /// Expired or missing photos are removed and reported as `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get(&self, contact_id: &str) -> Result<Option<(Vec<u8>, String)>> {
        let Some(photo) = self.metadata(contact_id).await? else {
            return Ok(None);
        };

        if self.expired(photo.cached_at) {
            self.delete(contact_id).await?;
            return Ok(None);
        }

        let data = match tokio::fs::read(&photo.local_path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Photo file for contact {} is missing", contact_id);
                self.delete(contact_id).await?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        sqlx::query("UPDATE photos SET accessed_at = ? WHERE contact_id = ?")
            .bind(to_unix(Utc::now()))
            .bind(contact_id)
            .execute(&self.pool)
            .await?;

        Ok(Some((data, photo.content_type)))
    }

    /// Whether a non-expired photo is cached for the contact.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn is_valid(&self, contact_id: &str) -> Result<bool> {
        Ok(self
            .metadata(contact_id)
            .await?
            .is_some_and(|photo| !self.expired(photo.cached_at)))
    }

    /// Delete a contact's photo.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn delete(&self, contact_id: &str) -> Result<()> {
        remove_file_if_exists(&self.path_for(contact_id)).await?;
        sqlx::query("DELETE FROM photos WHERE contact_id = ?")
            .bind(contact_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove every expired photo. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn prune(&self) -> Result<u64> {
        let cutoff = to_unix(Utc::now() - self.ttl);
        let expired: Vec<String> =
            sqlx::query_scalar("SELECT local_path FROM photos WHERE cached_at < ?")
                .bind(cutoff)
                .fetch_all(&self.pool)
                .await?;
        for path in &expired {
            remove_file_if_exists(Path::new(path)).await?;
        }

        let result = sqlx::query("DELETE FROM photos WHERE cached_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() > 0 {
            debug!("Pruned {} expired photos", result.rows_affected());
        }
        Ok(result.rows_affected())
    }

    /// Number of cached photos.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn count(&self) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM photos")
            .fetch_one(&self.pool)
            .await?;
        Ok(count_from(n))
    }

    /// Bytes used by cached photos.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn total_size(&self) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COALESCE(SUM(size), 0) FROM photos")
            .fetch_one(&self.pool)
            .await?;
        Ok(count_from(n))
    }

    /// Delete files in the photo directory that no row refers to.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub async fn remove_orphaned(&self) -> Result<u64> {
        let known: HashSet<String> = sqlx::query_scalar("SELECT local_path FROM photos")
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .collect();

        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let path = entry.path();
            if !known.contains(path.to_string_lossy().as_ref()) {
                remove_file_if_exists(&path).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Photo cache statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn stats(&self) -> Result<PhotoStats> {
        let row = sqlx::query("SELECT MIN(cached_at) AS oldest, MAX(cached_at) AS newest FROM photos")
            .fetch_one(&self.pool)
            .await?;
        let oldest: Option<i64> = row.try_get("oldest")?;
        let newest: Option<i64> = row.try_get("newest")?;

        Ok(PhotoStats {
            count: self.count().await?,
            total_size: self.total_size().await?,
            ttl_days: self.ttl.num_days(),
            oldest: oldest.map(from_unix),
            newest: newest.map(from_unix),
        })
    }

    /// Close the database.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn remove_file_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

fn row_to_photo(row: &SqliteRow) -> Result<CachedPhoto> {
    let local_path: String = row.try_get("local_path")?;
    Ok(CachedPhoto {
        contact_id: row.try_get("contact_id")?,
        content_type: row.try_get("content_type")?,
        size: count_from(row.try_get("size")?),
        local_path: PathBuf::from(local_path),
        cached_at: from_unix(row.try_get("cached_at")?),
        accessed_at: from_unix(row.try_get("accessed_at")?),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = PhotoStore::open(dir.path(), 0).await.unwrap();

        store.put("contact/1", "image/png", b"\x89PNG").await.unwrap();
        assert!(store.is_valid("contact/1").await.unwrap());
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.total_size().await.unwrap(), 4);

        let (data, content_type) = store.get("contact/1").await.unwrap().unwrap();
        assert_eq!(data, b"\x89PNG");
        assert_eq!(content_type, "image/png");

        store.delete("contact/1").await.unwrap();
        assert!(store.get("contact/1").await.unwrap().is_none());
        assert!(!store.is_valid("contact/1").await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_file_drops_row() {
        let dir = tempfile::tempdir().unwrap();
        let store = PhotoStore::open(dir.path(), 30).await.unwrap();
        store.put("c1", "image/jpeg", b"jpeg").await.unwrap();

        std::fs::remove_file(store.path_for("c1")).unwrap();
        assert!(store.get("c1").await.unwrap().is_none());
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_similar_ids_keep_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = PhotoStore::open(dir.path(), 30).await.unwrap();

        store.put("a:b", "image/png", b"ALICE").await.unwrap();
        store.put("a/b", "image/png", b"BOB").await.unwrap();
        store.put("a_b", "image/png", b"CAROL").await.unwrap();

        assert_eq!(store.get("a:b").await.unwrap().unwrap().0, b"ALICE");
        assert_eq!(store.get("a/b").await.unwrap().unwrap().0, b"BOB");

        store.delete("a/b").await.unwrap();
        assert_eq!(store.get("a:b").await.unwrap().unwrap().0, b"ALICE");
        assert_eq!(store.get("a_b").await.unwrap().unwrap().0, b"CAROL");
        assert!(store.get("a/b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_prune_and_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let store = PhotoStore::open(dir.path(), 30).await.unwrap();
        store.put("old", "image/jpeg", b"old").await.unwrap();
        store.put("new", "image/jpeg", b"new").await.unwrap();
        sqlx::query("UPDATE photos SET cached_at = 0 WHERE contact_id = 'old'")
            .execute(&store.pool)
            .await
            .unwrap();

        assert!(!store.is_valid("old").await.unwrap());
        assert_eq!(store.prune().await.unwrap(), 1);
        assert_eq!(store.count().await.unwrap(), 1);

        std::fs::write(dir.path().join("photos").join("stray"), b"x").unwrap();
        assert_eq!(store.remove_orphaned().await.unwrap(), 1);
        assert!(store.get("new").await.unwrap().is_some());

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.count, 1);
        assert_eq!(stats.ttl_days, 30);
        assert!(stats.oldest.is_some());
    }
}
