//! Per-account cache handles.
//!
//! [`CacheManager`] owns one [`AccountCache`] per account email, opened the
//! first time the account is touched and kept until it is cleared or the
//! manager is closed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::{Mutex, OnceCell, RwLock};
use tracing::{debug, info, warn};

use crate::config::{APP_DIR, CacheConfig, CacheSettings};
use crate::encryption::{KeyStore, KeyringKeyStore, apply_key, is_encrypted};
use crate::error::is_not_a_database;
use crate::queue::OfflineQueue;
use crate::search::{SearchResult, SearchSource, unified_search};
use crate::store::{
    ATTACHMENT_DIR, AttachmentStore, CachedContact, CachedEmail, CachedEvent, ContactStore,
    EmailStore, EventStore, FolderStore, PhotoStore, SyncStateStore, connect_options, memory_pool,
    open_pool,
};
use crate::{Error, Result};

const DB_EXTENSION: &str = "db";
const SIDECAR_SUFFIXES: [&str; 2] = ["-wal", "-shm"];

/// Share of the size limit [`CacheManager::evict_to_fit`] shrinks to.
const EVICTION_TARGET_PERCENT: u64 = 80;

/// Account email made safe for use as a file name.
fn file_stem(email: &str) -> String {
    email
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
        .collect()
}

/// One account's open database and the stores over it.
#[derive(Debug)]
pub struct AccountCache {
    email: String,
    pool: SqlitePool,
    emails: EmailStore,
    folders: FolderStore,
    events: EventStore,
    contacts: ContactStore,
    attachments: AttachmentStore,
    sync_state: SyncStateStore,
    queue: OfflineQueue,
    replay_lock: Mutex<()>,
}

impl AccountCache {
    fn from_pool(
        email: impl Into<String>,
        pool: SqlitePool,
        attachment_dir: PathBuf,
        max_size: u64,
    ) -> Self {
        Self {
            email: email.into(),
            emails: EmailStore::new(pool.clone()),
            folders: FolderStore::new(pool.clone()),
            events: EventStore::new(pool.clone()),
            contacts: ContactStore::new(pool.clone()),
            attachments: AttachmentStore::new(pool.clone(), attachment_dir, max_size),
            sync_state: SyncStateStore::new(pool.clone()),
            queue: OfflineQueue::new(pool.clone()),
            pool,
            replay_lock: Mutex::new(()),
        }
    }

    /// An account cache backed by an in-memory database.
    ///
    /// Attachment files still go to disk, under the system temp directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be created.
    pub async fn in_memory(email: impl Into<String>) -> Result<Self> {
        let email = email.into();
        let dir = std::env::temp_dir()
            .join(APP_DIR)
            .join(ATTACHMENT_DIR)
            .join(file_stem(&email));
        let max_size = CacheSettings::default().max_size_bytes();
        Ok(Self::from_pool(email, memory_pool().await?, dir, max_size))
    }

    /// Account email.
    #[must_use]
    pub fn email(&self) -> &str {
        &self.email
    }

    /// Underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Email store.
    #[must_use]
    pub const fn emails(&self) -> &EmailStore {
        &self.emails
    }

    /// Folder store.
    #[must_use]
    pub const fn folders(&self) -> &FolderStore {
        &self.folders
    }

    /// Event store.
    #[must_use]
    pub const fn events(&self) -> &EventStore {
        &self.events
    }

    /// Contact store.
    #[must_use]
    pub const fn contacts(&self) -> &ContactStore {
        &self.contacts
    }

    /// Downloaded attachments.
    #[must_use]
    pub const fn attachments(&self) -> &AttachmentStore {
        &self.attachments
    }

    /// Sync checkpoints.
    #[must_use]
    pub const fn sync_state(&self) -> &SyncStateStore {
        &self.sync_state
    }

    /// Offline action queue.
    #[must_use]
    pub const fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    /// Serializes queue drains of this account.
    pub(crate) const fn replay_lock(&self) -> &Mutex<()> {
        &self.replay_lock
    }

    /// Search emails, events and contacts at once.
    pub async fn search(&self, query: &str, limit: u32) -> Vec<SearchResult> {
        unified_search(self, query, limit).await
    }

    /// Whether the database has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Close the database. Later operations fail with a closed-pool error.
    pub async fn close(&self) {
        self.pool.close().await;
        debug!("Closed cache for {}", self.email);
    }
}

#[async_trait]
impl SearchSource for AccountCache {
    async fn search_emails(&self, query: &str, limit: u32) -> Result<Vec<CachedEmail>> {
        self.emails.search(query, limit).await
    }

    async fn search_events(&self, query: &str, limit: u32) -> Result<Vec<CachedEvent>> {
        self.events.search(query, limit).await
    }

    async fn search_contacts(&self, query: &str, limit: u32) -> Result<Vec<CachedContact>> {
        self.contacts.search(query, limit).await
    }
}

/// Size and content summary of one account cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Account email.
    pub email: String,
    /// Bytes on disk, database plus write-ahead log.
    pub size_bytes: u64,
    /// Cached emails.
    pub emails: u64,
    /// Unread cached emails.
    pub unread: u64,
    /// Cached folders.
    pub folders: u64,
    /// Cached events.
    pub events: u64,
    /// Cached contacts.
    pub contacts: u64,
    /// Cached attachments.
    pub attachments: u64,
    /// Bytes of cached attachment content.
    pub attachment_bytes: u64,
    /// Actions waiting in the offline queue.
    pub pending_actions: u64,
    /// Most recent successful sync of any resource.
    pub last_sync: Option<DateTime<Utc>>,
    /// Whether the database file is encrypted.
    pub encrypted: bool,
}

/// Opens, tracks and removes account caches under one base directory.
#[derive(Debug)]
pub struct CacheManager {
    config: CacheConfig,
    key_store: Option<Arc<dyn KeyStore>>,
    accounts: RwLock<HashMap<String, Arc<AccountCache>>>,
    photos: OnceCell<PhotoStore>,
}

impl CacheManager {
    /// Create a manager, creating the base directory if needed.
    ///
    /// Encrypted caches keep their keys in the system keyring.
    ///
    /// # Errors
    ///
    /// Returns an error if the base directory cannot be created.
    pub async fn open(config: CacheConfig) -> Result<Self> {
        let key_store: Option<Arc<dyn KeyStore>> = if config.encryption_enabled {
            Some(Arc::new(KeyringKeyStore))
        } else {
            None
        };
        Self::with_key_store(config, key_store).await
    }

    /// Create a manager with an explicit key store. `None` disables
    /// encryption regardless of the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the base directory cannot be created.
    pub async fn with_key_store(
        config: CacheConfig,
        key_store: Option<Arc<dyn KeyStore>>,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(&config.base_path).await?;
        info!("Cache directory: {:?}", config.base_path);
        Ok(Self {
            config,
            key_store,
            accounts: RwLock::new(HashMap::new()),
            photos: OnceCell::new(),
        })
    }

    /// Storage configuration.
    #[must_use]
    pub const fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Whether account databases are opened with a key.
    #[must_use]
    pub const fn encryption_enabled(&self) -> bool {
        self.key_store.is_some()
    }

    /// Database file of an account.
    #[must_use]
    pub fn db_path(&self, email: &str) -> PathBuf {
        self.config
            .base_path
            .join(format!("{}.{DB_EXTENSION}", file_stem(email)))
    }

    /// Directory holding an account's attachment files.
    #[must_use]
    pub fn attachment_dir(&self, email: &str) -> PathBuf {
        self.config
            .base_path
            .join(ATTACHMENT_DIR)
            .join(file_stem(email))
    }

    /// The cache of an account, opening it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CacheLocked`] if an encrypted cache cannot be
    /// unlocked, or another error if the database cannot be opened.
    pub async fn account(&self, email: &str) -> Result<Arc<AccountCache>> {
        if let Some(cache) = self.accounts.read().await.get(email)
            && !cache.is_closed()
        {
            return Ok(Arc::clone(cache));
        }

        let mut accounts = self.accounts.write().await;
        if let Some(cache) = accounts.get(email)
            && !cache.is_closed()
        {
            return Ok(Arc::clone(cache));
        }

        let cache = Arc::new(self.open_account(email).await?);
        accounts.insert(email.to_string(), Arc::clone(&cache));
        Ok(cache)
    }

    async fn open_account(&self, email: &str) -> Result<AccountCache> {
        if email.trim().is_empty() {
            return Err(Error::InvalidEntity {
                kind: "account",
                id: email.to_string(),
                reason: "empty email",
            });
        }

        let path = self.db_path(email);
        let mut options = connect_options(&path);
        if let Some(keys) = &self.key_store {
            let key = keys.get_or_create(email).map_err(|e| Error::CacheLocked {
                email: email.to_string(),
                reason: e.to_string(),
            })?;
            options = apply_key(options, &key);
        }

        let pool = match open_pool(options).await {
            Ok(pool) => pool,
            Err(Error::Database(e)) if self.key_store.is_some() && is_not_a_database(&e) => {
                warn!("Cache for {} could not be unlocked", email);
                return Err(Error::CacheLocked {
                    email: email.to_string(),
                    reason: "database cannot be read with the stored key".to_string(),
                });
            }
            Err(e) => return Err(e),
        };

        info!("Opened cache for {} at {:?}", email, path);
        Ok(AccountCache::from_pool(
            email,
            pool,
            self.attachment_dir(email),
            self.config.max_size_bytes,
        ))
    }

    /// Accounts that have an open handle.
    pub async fn open_accounts(&self) -> Vec<Arc<AccountCache>> {
        self.accounts.read().await.values().cloned().collect()
    }

    /// Accounts with a database file in the base directory, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub async fn list_cached_accounts(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.config.base_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut accounts = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(DB_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str())
                && stem.contains('@')
            {
                accounts.push(stem.to_string());
            }
        }
        accounts.sort();
        Ok(accounts)
    }

    /// Size and row counts of an account cache, opening it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be opened or queried.
    pub async fn stats(&self, email: &str) -> Result<CacheStats> {
        let cache = self.account(email).await?;
        let path = self.db_path(email);

        Ok(CacheStats {
            email: email.to_string(),
            size_bytes: file_size(&path).await + file_size(&sidecar(&path, "-wal")).await,
            emails: cache.emails().count().await?,
            unread: cache.emails().count_unread().await?,
            folders: cache.folders().count().await?,
            events: cache.events().count().await?,
            contacts: cache.contacts().count().await?,
            attachments: cache.attachments().count().await?,
            attachment_bytes: cache.attachments().total_size().await?,
            pending_actions: cache.queue().count().await?,
            last_sync: cache.sync_state().last_sync().await?,
            encrypted: is_encrypted(&path).await?,
        })
    }

    /// Close and delete an account cache, including its queued actions, its
    /// attachment files and its encryption key.
    ///
    /// Syncs still holding the old handle fail with closed-pool errors.
    ///
    /// # Errors
    ///
    /// Returns an error if the files or key cannot be removed.
    pub async fn clear_cache(&self, email: &str) -> Result<()> {
        let removed = self.accounts.write().await.remove(email);
        if let Some(cache) = removed {
            cache.close().await;
        }

        self.remove_files(email).await?;
        info!("Cleared cache for {}", email);
        Ok(())
    }

    /// Clear every account cache, open or only on disk.
    ///
    /// # Errors
    ///
    /// Returns an error if any cache cannot be removed.
    pub async fn clear_all_caches(&self) -> Result<()> {
        let open: Vec<(String, Arc<AccountCache>)> =
            self.accounts.write().await.drain().collect();

        let mut emails: Vec<String> = Vec::with_capacity(open.len());
        for (email, cache) in open {
            cache.close().await;
            emails.push(email);
        }
        for email in self.list_cached_accounts().await? {
            if !emails.contains(&email) {
                emails.push(email);
            }
        }

        for email in &emails {
            self.remove_files(email).await?;
        }
        info!("Cleared {} account caches", emails.len());
        Ok(())
    }

    async fn remove_files(&self, email: &str) -> Result<()> {
        let path = self.db_path(email);
        remove_if_exists(&path).await?;
        for suffix in SIDECAR_SUFFIXES {
            remove_if_exists(&sidecar(&path, suffix)).await?;
        }
        if let Err(e) = tokio::fs::remove_dir_all(self.attachment_dir(email)).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            return Err(e.into());
        }
        if let Some(keys) = &self.key_store {
            keys.delete(email)?;
        }
        Ok(())
    }

    /// Shared contact photo store, opened on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the photo store cannot be opened.
    pub async fn photos(&self) -> Result<&PhotoStore> {
        self.photos
            .get_or_try_init(|| PhotoStore::open(&self.config.base_path, self.config.photo_ttl_days))
            .await
    }

    /// Bytes used by every file under the base directory, photos and
    /// attachments included.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be read.
    pub async fn total_size(&self) -> Result<u64> {
        dir_size(&self.config.base_path).await
    }

    /// Whether the cache has grown past its configured size.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub async fn exceeds_max_size(&self) -> Result<bool> {
        Ok(self.total_size().await? > self.config.max_size_bytes)
    }

    /// Evict least recently accessed attachments until the cache is back to
    /// 80% of its size limit. Accounts are visited in name order; one that
    /// cannot be opened is skipped. Returns how many attachments were
    /// evicted.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read or an eviction fails.
    pub async fn evict_to_fit(&self) -> Result<u64> {
        let total = self.total_size().await?;
        if total <= self.config.max_size_bytes {
            return Ok(0);
        }
        let mut remaining = total - self.config.max_size_bytes / 100 * EVICTION_TARGET_PERCENT;

        let mut emails = self.list_cached_accounts().await?;
        for cache in self.open_accounts().await {
            if !emails.iter().any(|e| e == cache.email()) {
                emails.push(cache.email().to_string());
            }
        }
        emails.sort();

        let mut evicted = 0;
        for email in emails {
            if remaining == 0 {
                break;
            }
            let cache = match self.account(&email).await {
                Ok(cache) => cache,
                Err(e) => {
                    warn!("Skipping attachment eviction for {}: {}", email, e);
                    continue;
                }
            };
            let before = cache.attachments().total_size().await?;
            evicted += cache.attachments().lru_evict(remaining).await?;
            let after = cache.attachments().total_size().await?;
            remaining = remaining.saturating_sub(before.saturating_sub(after));
        }

        if evicted > 0 {
            info!("Evicted {} attachments to fit the cache size limit", evicted);
        }
        Ok(evicted)
    }

    /// Close every open handle.
    pub async fn close(&self) {
        let open: Vec<Arc<AccountCache>> =
            self.accounts.write().await.drain().map(|(_, c)| c).collect();
        for cache in open {
            cache.close().await;
        }
        if let Some(photos) = self.photos.get() {
            photos.close().await;
        }
        debug!("Cache manager closed");
    }
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

async fn file_size(path: &Path) -> u64 {
    tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}

async fn dir_size(root: &Path) -> Result<u64> {
    let mut total = 0;
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if metadata.is_dir() {
                pending.push(entry.path());
            } else if metadata.is_file() {
                total += metadata.len();
            }
        }
    }
    Ok(total)
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}
