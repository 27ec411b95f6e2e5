//! Downloaded attachment cache of one account.
//!
//! Rows live in the account database; the bytes are plain files named by
//! their SHA-256 under `attachments/<account>/<hash[..2]>/<hash>`. Identical
//! content is stored once no matter how many attachments carry it.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use tracing::{debug, warn};

use super::{count_from, ensure_id, from_unix, sha256_hex, to_unix};
use crate::Result;

pub(crate) const ATTACHMENT_DIR: &str = "attachments";

/// Share of the size limit a prune shrinks the cache to.
const PRUNE_TARGET_PERCENT: u64 = 80;

const COLUMNS: &str =
    "id, email_id, filename, content_type, size, hash, local_path, cached_at, accessed_at";

/// One cached attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachedAttachment {
    /// Provider attachment id.
    pub id: String,
    /// Email the attachment came with.
    pub email_id: String,
    /// Original file name.
    pub filename: String,
    /// MIME type.
    pub content_type: String,
    /// Size of the content in bytes.
    pub size: u64,
    /// Lowercase hex SHA-256 of the content.
    pub hash: String,
    /// Where the bytes are stored.
    pub local_path: PathBuf,
    /// When the attachment was downloaded.
    pub cached_at: DateTime<Utc>,
    /// When the attachment was last read.
    pub accessed_at: DateTime<Utc>,
}

impl CachedAttachment {
    /// Describe an attachment before it is stored. Content fields are filled
    /// in by [`AttachmentStore::put`].
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        email_id: impl Into<String>,
        filename: impl Into<String>,
        content_type: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            email_id: email_id.into(),
            filename: filename.into(),
            content_type: content_type.into(),
            size: 0,
            hash: String::new(),
            local_path: PathBuf::new(),
            cached_at: now,
            accessed_at: now,
        }
    }
}

/// Attachment cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AttachmentStats {
    /// Number of cached attachments.
    pub count: u64,
    /// Bytes referenced by cached attachments, duplicates counted once each.
    pub total_size: u64,
    /// Size the cache is pruned against.
    pub max_size: u64,
    /// Oldest cached attachment.
    pub oldest: Option<DateTime<Utc>>,
    /// Newest cached attachment.
    pub newest: Option<DateTime<Utc>>,
}

impl AttachmentStats {
    /// Used share of the size limit, in percent.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn usage_percent(&self) -> f64 {
        if self.max_size == 0 {
            return 0.0;
        }
        self.total_size as f64 / self.max_size as f64 * 100.0
    }
}

/// Attachment storage over an account database.
#[derive(Debug, Clone)]
pub struct AttachmentStore {
    pool: SqlitePool,
    dir: PathBuf,
    max_size: u64,
}

impl AttachmentStore {
    /// Create a store keeping files under `dir` and pruning against
    /// `max_size` bytes. The directory is created on the first write.
    #[must_use]
    pub const fn new(pool: SqlitePool, dir: PathBuf, max_size: u64) -> Self {
        Self {
            pool,
            dir,
            max_size,
        }
    }

    /// Directory holding the attachment files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, hash: &str) -> PathBuf {
        self.dir.join(&hash[..2]).join(hash)
    }

    /// Store attachment content and return the stored record.
    ///
    /// Content already on disk under the same hash is reused. Replacing an
    /// attachment whose old content nothing else refers to removes the old
    /// file.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is empty, or the file or database write
    /// fails.
    pub async fn put(
        &self,
        attachment: &CachedAttachment,
        data: &[u8],
    ) -> Result<CachedAttachment> {
        ensure_id("attachment", &attachment.id)?;
        let hash = sha256_hex(data);
        let path = self.path_for(&hash);

        if tokio::fs::metadata(&path).await.is_err() {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let tmp = path.with_extension(format!("{:016x}.tmp", rand::random::<u64>()));
            tokio::fs::write(&tmp, data).await?;
            if let Err(e) = tokio::fs::rename(&tmp, &path).await {
                remove_file_if_exists(&tmp).await?;
                return Err(e.into());
            }
        }

        let previous: Option<String> =
            sqlx::query_scalar("SELECT hash FROM attachments WHERE id = ?")
                .bind(&attachment.id)
                .fetch_optional(&self.pool)
                .await?;

        let now = Utc::now();
        let stored = CachedAttachment {
            size: data.len() as u64,
            hash,
            local_path: path,
            cached_at: now,
            accessed_at: now,
            ..attachment.clone()
        };

        sqlx::query(
            r"
            INSERT INTO attachments (
                id, email_id, filename, content_type, size, hash, local_path,
                cached_at, accessed_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                email_id = excluded.email_id,
                filename = excluded.filename,
                content_type = excluded.content_type,
                size = excluded.size,
                hash = excluded.hash,
                local_path = excluded.local_path,
                cached_at = excluded.cached_at,
                accessed_at = excluded.accessed_at
            ",
        )
        .bind(&stored.id)
        .bind(&stored.email_id)
        .bind(&stored.filename)
        .bind(&stored.content_type)
        .bind(i64::try_from(stored.size).unwrap_or(i64::MAX))
        .bind(&stored.hash)
        .bind(stored.local_path.to_string_lossy().into_owned())
        .bind(to_unix(now))
        .bind(to_unix(now))
        .execute(&self.pool)
        .await?;

        if let Some(old) = previous
            && old != stored.hash
        {
            self.remove_file_if_unreferenced(&old).await?;
        }

        debug!("Cached attachment {} ({} bytes)", stored.id, stored.size);
        Ok(stored)
    }

    /// Attachment metadata, marking it as just accessed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get(&self, id: &str) -> Result<Option<CachedAttachment>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM attachments WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(mut attachment) = row.as_ref().map(row_to_attachment).transpose()? else {
            return Ok(None);
        };

        let now = Utc::now();
        sqlx::query("UPDATE attachments SET accessed_at = ? WHERE id = ?")
            .bind(to_unix(now))
            .bind(id)
            .execute(&self.pool)
            .await?;
        attachment.accessed_at = from_unix(to_unix(now));
        Ok(Some(attachment))
    }

    /// Read an attachment's content.
    ///
    /// A row whose file has gone missing is removed and reported as `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query or file read fails.
    pub async fn read(&self, id: &str) -> Result<Option<Vec<u8>>> {
        let Some(attachment) = self.get(id).await? else {
            return Ok(None);
        };
        match tokio::fs::read(&attachment.local_path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Attachment file for {} is missing", id);
                self.delete(id).await?;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Any attachment with the given content hash.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get_by_hash(&self, hash: &str) -> Result<Option<CachedAttachment>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM attachments WHERE hash = ? ORDER BY id LIMIT 1"
        ))
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_attachment).transpose()
    }

    /// Attachments of one email, ordered by file name.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn list_by_email(&self, email_id: &str) -> Result<Vec<CachedAttachment>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM attachments WHERE email_id = ? ORDER BY filename, id"
        ))
        .bind(email_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_attachment).collect()
    }

    /// Delete an attachment. The file goes too unless another attachment
    /// shares its content. Returns whether a row was removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query or file removal fails.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let hash: Option<String> =
            sqlx::query_scalar("DELETE FROM attachments WHERE id = ? RETURNING hash")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        let Some(hash) = hash else {
            return Ok(false);
        };
        self.remove_file_if_unreferenced(&hash).await?;
        Ok(true)
    }

    /// Delete every attachment of an email. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query or file removal fails.
    pub async fn delete_by_email(&self, email_id: &str) -> Result<u64> {
        let hashes: Vec<String> =
            sqlx::query_scalar("DELETE FROM attachments WHERE email_id = ? RETURNING hash")
                .bind(email_id)
                .fetch_all(&self.pool)
                .await?;

        let unique: HashSet<&str> = hashes.iter().map(String::as_str).collect();
        for hash in unique {
            self.remove_file_if_unreferenced(hash).await?;
        }
        Ok(hashes.len() as u64)
    }

    async fn remove_file_if_unreferenced(&self, hash: &str) -> Result<()> {
        let refs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM attachments WHERE hash = ?")
            .bind(hash)
            .fetch_one(&self.pool)
            .await?;
        if refs == 0 {
            remove_file_if_exists(&self.path_for(hash)).await?;
        }
        Ok(())
    }

    /// Number of cached attachments.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn count(&self) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM attachments")
            .fetch_one(&self.pool)
            .await?;
        Ok(count_from(n))
    }

    /// Bytes referenced by cached attachments.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn total_size(&self) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COALESCE(SUM(size), 0) FROM attachments")
            .fetch_one(&self.pool)
            .await?;
        Ok(count_from(n))
    }

    /// Evict least recently accessed attachments until the cache is back to
    /// 80% of its size limit. Does nothing while under the limit. Returns
    /// how many were evicted.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query or file removal fails.
    pub async fn prune(&self) -> Result<u64> {
        let total = self.total_size().await?;
        if total <= self.max_size {
            return Ok(0);
        }
        let target = self.max_size / 100 * PRUNE_TARGET_PERCENT;
        self.lru_evict(total - target).await
    }

    /// Evict least recently accessed attachments until at least
    /// `bytes_to_free` bytes are released or nothing is left. Returns how
    /// many were evicted.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query or file removal fails.
    pub async fn lru_evict(&self, bytes_to_free: u64) -> Result<u64> {
        if bytes_to_free == 0 {
            return Ok(0);
        }

        let candidates: Vec<(String, i64)> =
            sqlx::query_as("SELECT id, size FROM attachments ORDER BY accessed_at ASC, id ASC")
                .fetch_all(&self.pool)
                .await?;

        let mut freed = 0;
        let mut evicted = 0;
        for (id, size) in candidates {
            if freed >= bytes_to_free {
                break;
            }
            if self.delete(&id).await? {
                freed += count_from(size);
                evicted += 1;
            }
        }

        if evicted > 0 {
            debug!("Evicted {} attachments, {} bytes", evicted, freed);
        }
        Ok(evicted)
    }

    /// Delete files in the attachment directory whose hash no row refers to.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub async fn remove_orphaned(&self) -> Result<u64> {
        let known: HashSet<String> = sqlx::query_scalar("SELECT DISTINCT hash FROM attachments")
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .collect();

        let mut shards = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut files = tokio::fs::read_dir(shard.path()).await?;
            while let Some(entry) = files.next_entry().await? {
                if !entry.file_type().await?.is_file() {
                    continue;
                }
                let name = entry.file_name();
                if !known.contains(name.to_string_lossy().as_ref()) {
                    remove_file_if_exists(&entry.path()).await?;
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            debug!("Removed {} orphaned attachment files", removed);
        }
        Ok(removed)
    }

    /// Attachment cache statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn stats(&self) -> Result<AttachmentStats> {
        let row = sqlx::query(
            "SELECT MIN(cached_at) AS oldest, MAX(cached_at) AS newest FROM attachments",
        )
        .fetch_one(&self.pool)
        .await?;
        let oldest: Option<i64> = row.try_get("oldest")?;
        let newest: Option<i64> = row.try_get("newest")?;

        Ok(AttachmentStats {
            count: self.count().await?,
            total_size: self.total_size().await?,
            max_size: self.max_size,
            oldest: oldest.map(from_unix),
            newest: newest.map(from_unix),
        })
    }
}

async fn remove_file_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

fn row_to_attachment(row: &SqliteRow) -> Result<CachedAttachment> {
    let local_path: String = row.try_get("local_path")?;
    Ok(CachedAttachment {
        id: row.try_get("id")?,
        email_id: row.try_get("email_id")?,
        filename: row.try_get("filename")?,
        content_type: row.try_get("content_type")?,
        size: count_from(row.try_get("size")?),
        hash: row.try_get("hash")?,
        local_path: PathBuf::from(local_path),
        cached_at: from_unix(row.try_get("cached_at")?),
        accessed_at: from_unix(row.try_get("accessed_at")?),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tokio_test::assert_ok;

    use super::*;
    use crate::store::memory_pool;

    async fn store(dir: &Path, max_size: u64) -> AttachmentStore {
        AttachmentStore::new(memory_pool().await.unwrap(), dir.join(ATTACHMENT_DIR), max_size)
    }

    fn attachment(id: &str, email_id: &str, filename: &str) -> CachedAttachment {
        CachedAttachment::new(id, email_id, filename, "text/plain")
    }

    async fn set_accessed(store: &AttachmentStore, id: &str, at: i64) {
        sqlx::query("UPDATE attachments SET accessed_at = ? WHERE id = ?")
            .bind(at)
            .bind(id)
            .execute(&store.pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_put_get_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 1 << 20).await;

        let stored = store
            .put(&attachment("att-1", "email-1", "notes.txt"), b"abc")
            .await
            .unwrap();
        assert_eq!(stored.size, 3);
        assert_eq!(
            stored.hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(
            stored.local_path,
            dir.path().join("attachments").join("ba").join(&stored.hash)
        );
        assert!(stored.local_path.exists());

        let fetched = store.get("att-1").await.unwrap().unwrap();
        assert_eq!(fetched.filename, "notes.txt");
        assert_eq!(fetched.email_id, "email-1");
        assert_eq!(fetched.hash, stored.hash);

        assert_eq!(store.read("att-1").await.unwrap().unwrap(), b"abc");
        assert!(store.get("missing").await.unwrap().is_none());
        assert!(store.put(&attachment("", "email-1", "x"), b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_get_touches_access_time() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 1 << 20).await;
        store.put(&attachment("att-1", "e1", "a.txt"), b"a").await.unwrap();
        set_accessed(&store, "att-1", 0).await;

        let fetched = store.get("att-1").await.unwrap().unwrap();
        assert!(fetched.accessed_at > from_unix(0));
        let again = store.get_by_hash(&fetched.hash).await.unwrap().unwrap();
        assert!(again.accessed_at > from_unix(0));
    }

    #[tokio::test]
    async fn test_identical_content_shares_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 1 << 20).await;
        let content = b"identical content";

        let first = store.put(&attachment("att-1", "email-1", "a.txt"), content).await.unwrap();
        let second = store.put(&attachment("att-2", "email-2", "b.txt"), content).await.unwrap();
        assert_eq!(first.hash, second.hash);
        assert_eq!(first.local_path, second.local_path);

        assert!(store.delete("att-1").await.unwrap());
        assert!(second.local_path.exists());
        assert_eq!(store.read("att-2").await.unwrap().unwrap(), content);

        assert!(store.delete("att-2").await.unwrap());
        assert!(!second.local_path.exists());
        assert!(!store.delete("att-2").await.unwrap());
    }

    #[tokio::test]
    async fn test_replacing_content_drops_unshared_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 1 << 20).await;

        let old = store.put(&attachment("att-1", "e1", "a.txt"), b"v1").await.unwrap();
        let new = store.put(&attachment("att-1", "e1", "a.txt"), b"v2").await.unwrap();
        assert_ne!(old.local_path, new.local_path);
        assert!(!old.local_path.exists());
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.read("att-1").await.unwrap().unwrap(), b"v2");
    }

    #[tokio::test]
    async fn test_list_and_delete_by_email() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 1 << 20).await;
        store.put(&attachment("att-1", "email-1", "zeta.pdf"), b"z").await.unwrap();
        store.put(&attachment("att-2", "email-1", "alpha.pdf"), b"a").await.unwrap();
        store.put(&attachment("att-3", "email-2", "alpha.pdf"), b"a").await.unwrap();

        let names: Vec<_> = store
            .list_by_email("email-1")
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.filename)
            .collect();
        assert_eq!(names, vec!["alpha.pdf", "zeta.pdf"]);

        assert_eq!(store.delete_by_email("email-1").await.unwrap(), 2);
        assert!(store.list_by_email("email-1").await.unwrap().is_empty());
        assert_eq!(store.read("att-3").await.unwrap().unwrap(), b"a");
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_missing_file_drops_row() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 1 << 20).await;
        let stored = store.put(&attachment("att-1", "e1", "a.txt"), b"gone").await.unwrap();

        std::fs::remove_file(&stored.local_path).unwrap();
        assert!(store.read("att-1").await.unwrap().is_none());
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_lru_evict_oldest_access_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 1 << 20).await;
        for i in 0..5 {
            let id = format!("att-{i}");
            let content = format!("content {i}");
            store
                .put(&attachment(&id, "email-1", &format!("file{i}.txt")), content.as_bytes())
                .await
                .unwrap();
            set_accessed(&store, &id, 1_000 + i).await;
        }
        set_accessed(&store, "att-0", 5_000).await;

        // Each file is nine bytes, so freeing ten takes two of them.
        assert_eq!(store.lru_evict(10).await.unwrap(), 2);
        assert!(store.get_by_hash(&sha256_hex(b"content 1")).await.unwrap().is_none());
        assert!(store.get_by_hash(&sha256_hex(b"content 2")).await.unwrap().is_none());
        assert!(store.get_by_hash(&sha256_hex(b"content 0")).await.unwrap().is_some());
        assert_eq!(store.count().await.unwrap(), 3);

        assert_eq!(store.lru_evict(0).await.unwrap(), 0);
        assert_eq!(store.lru_evict(u64::MAX).await.unwrap(), 3);
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_prune_only_when_over_limit() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 100).await;
        store.put(&attachment("small", "e1", "s.txt"), b"small content").await.unwrap();
        assert_eq!(store.prune().await.unwrap(), 0);

        store.put(&attachment("big", "e1", "b.bin"), &[7u8; 90]).await.unwrap();
        set_accessed(&store, "big", 1).await;
        set_accessed(&store, "small", 2).await;

        // 103 bytes against a limit of 100: dropping the stale 90 bytes is enough.
        assert_eq!(store.prune().await.unwrap(), 1);
        assert!(store.get("big").await.unwrap().is_none());
        assert_eq!(store.total_size().await.unwrap(), 13);
    }

    #[tokio::test]
    async fn test_remove_orphaned_and_stats() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 1_000).await;
        let kept = store.put(&attachment("att-1", "e1", "a.txt"), b"keep").await.unwrap();

        let stray_dir = store.dir().join("ff");
        std::fs::create_dir_all(&stray_dir).unwrap();
        std::fs::write(stray_dir.join("ffee"), b"x").unwrap();

        assert_eq!(assert_ok!(store.remove_orphaned().await), 1);
        assert!(kept.local_path.exists());
        assert!(!stray_dir.join("ffee").exists());

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.count, 1);
        assert_eq!(stats.total_size, 4);
        assert_eq!(stats.max_size, 1_000);
        assert!(stats.oldest.is_some());
        assert!((stats.usage_percent() - 0.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_remove_orphaned_without_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path(), 1_000).await;
        assert_eq!(store.remove_orphaned().await.unwrap(), 0);
        assert_eq!(store.stats().await.unwrap(), AttachmentStats {
            max_size: 1_000,
            ..AttachmentStats::default()
        });
    }
}
