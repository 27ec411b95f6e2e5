//! Cache settings persisted as JSON next to the account databases.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{Error, Result};

/// Directory name under the platform config dir.
pub const APP_DIR: &str = "mailcache";

/// File name of the settings file inside the cache directory.
pub const SETTINGS_FILE: &str = "settings.json";

/// Shortest allowed background sync interval.
pub const MIN_SYNC_INTERVAL: Duration = Duration::from_secs(60);

const MIN_MAX_SIZE_MB: u64 = 50;
const MAX_MAX_SIZE_MB: u64 = 10_000;

/// Default cache directory: `<config dir>/mailcache`.
#[must_use]
pub fn default_base_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// User-tunable cache and sync behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Whether the local cache is used at all.
    pub cache_enabled: bool,
    /// Advisory size limit for all account caches together.
    pub cache_max_size_mb: u64,
    /// How long cached emails are kept.
    pub cache_ttl_days: u32,
    /// Background sync interval.
    pub sync_interval_minutes: u32,
    /// Whether writes made offline are queued for replay.
    pub offline_queue_enabled: bool,
    /// Whether account databases are encrypted at rest.
    pub encryption_enabled: bool,
    /// How far back the first sync of an account reaches.
    pub initial_sync_days: u32,
    /// Whether the background sync scheduler runs.
    pub background_sync_enabled: bool,
    /// Failed replays after which an offline action is dropped. `None` keeps
    /// retrying until the action goes stale.
    pub max_action_attempts: Option<u32>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            cache_max_size_mb: 500,
            cache_ttl_days: 30,
            sync_interval_minutes: 5,
            offline_queue_enabled: true,
            encryption_enabled: false,
            initial_sync_days: 30,
            background_sync_enabled: true,
            max_action_attempts: None,
        }
    }
}

impl CacheSettings {
    /// Load settings from `base_path`, writing the defaults if no file exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or created.
    pub async fn load(base_path: &Path) -> Result<Self> {
        let path = base_path.join(SETTINGS_FILE);

        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let settings = Self::default();
                settings.save(base_path).await?;
                return Ok(settings);
            }
            Err(e) => return Err(e.into()),
        };

        let settings: Self = serde_json::from_str(&contents)?;
        debug!("Loaded cache settings from {:?}", path);
        Ok(settings)
    }

    /// Write settings to `base_path` as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be written.
    pub async fn save(&self, base_path: &Path) -> Result<()> {
        tokio::fs::create_dir_all(base_path).await?;
        let path = base_path.join(SETTINGS_FILE);
        let contents = serde_json::to_string_pretty(self)?;
        tokio::fs::write(&path, contents).await?;
        info!("Settings saved to {:?}", path);
        Ok(())
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first out-of-range value.
    pub fn validate(&self) -> Result<()> {
        if self.cache_max_size_mb < MIN_MAX_SIZE_MB {
            return Err(Error::Config(format!(
                "cache_max_size_mb must be at least {MIN_MAX_SIZE_MB}"
            )));
        }
        if self.cache_ttl_days < 1 {
            return Err(Error::Config("cache_ttl_days must be at least 1".to_string()));
        }
        if self.sync_interval_minutes < 1 {
            return Err(Error::Config(
                "sync_interval_minutes must be at least 1".to_string(),
            ));
        }
        if self.initial_sync_days < 1 {
            return Err(Error::Config("initial_sync_days must be at least 1".to_string()));
        }
        if self.max_action_attempts == Some(0) {
            return Err(Error::Config(
                "max_action_attempts must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }

    /// Restore every value to its default.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Set the size limit, clamped to 50 MB ..= 10 GB.
    pub fn set_max_size_mb(&mut self, size_mb: u64) {
        self.cache_max_size_mb = size_mb.clamp(MIN_MAX_SIZE_MB, MAX_MAX_SIZE_MB);
    }

    /// Background sync interval, never shorter than [`MIN_SYNC_INTERVAL`].
    #[must_use]
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.sync_interval_minutes) * 60).max(MIN_SYNC_INTERVAL)
    }

    /// How long cached emails are kept.
    #[must_use]
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.cache_ttl_days))
    }

    /// Size limit in bytes.
    #[must_use]
    pub const fn max_size_bytes(&self) -> u64 {
        self.cache_max_size_mb.saturating_mul(1024 * 1024)
    }

    /// Storage configuration for a [`crate::CacheManager`] rooted at `base_path`.
    #[must_use]
    pub fn cache_config(&self, base_path: impl Into<PathBuf>) -> CacheConfig {
        CacheConfig {
            base_path: base_path.into(),
            encryption_enabled: self.encryption_enabled,
            max_size_bytes: self.max_size_bytes(),
            photo_ttl_days: i64::from(self.cache_ttl_days),
        }
    }
}

/// Storage configuration of a [`crate::CacheManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Directory holding the account databases.
    pub base_path: PathBuf,
    /// Whether databases are opened with an encryption key.
    pub encryption_enabled: bool,
    /// Advisory size limit across all accounts.
    pub max_size_bytes: u64,
    /// Time-to-live of cached contact photos.
    pub photo_ttl_days: i64,
}

impl CacheConfig {
    /// Unencrypted cache rooted at `base_path` with default limits.
    #[must_use]
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        CacheSettings::default().cache_config(base_path)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::new(default_base_path())
    }
}
