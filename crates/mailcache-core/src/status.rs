//! Cache health summary for status endpoints.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::Result;
use crate::config::CacheSettings;
use crate::manager::{CacheManager, CacheStats};
use crate::sync::OnlineStatus;

/// Everything a status page shows about the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStatus {
    /// Whether caching is enabled.
    pub enabled: bool,
    /// Whether the remote provider is believed reachable.
    pub online: bool,
    /// Per-account summaries.
    pub accounts: Vec<CacheStats>,
    /// Bytes used by the whole cache directory.
    pub total_size_bytes: u64,
    /// Configured size limit.
    pub max_size_bytes: u64,
    /// Whether the cache is over its size limit.
    pub size_exceeded: bool,
    /// Offline actions waiting across all accounts.
    pub pending_actions: u64,
    /// Most recent sync of any account.
    pub last_sync: Option<DateTime<Utc>>,
    /// Configured sync interval.
    pub sync_interval_minutes: u32,
    /// Whether account databases are encrypted.
    pub encryption_enabled: bool,
}

impl CacheStatus {
    /// Gather the status of every cached account.
    ///
    /// Accounts whose cache cannot be opened are left out.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache directory cannot be read.
    pub async fn collect(
        manager: &CacheManager,
        online: &OnlineStatus,
        settings: &CacheSettings,
    ) -> Result<Self> {
        let mut accounts = Vec::new();
        if settings.cache_enabled {
            for email in manager.list_cached_accounts().await? {
                match manager.stats(&email).await {
                    Ok(stats) => accounts.push(stats),
                    Err(e) => warn!("No stats for {}: {}", email, e),
                }
            }
        }

        let total_size_bytes = manager.total_size().await?;
        let max_size_bytes = manager.config().max_size_bytes;

        Ok(Self {
            enabled: settings.cache_enabled,
            online: online.is_online(),
            pending_actions: accounts.iter().map(|a| a.pending_actions).sum(),
            last_sync: accounts.iter().filter_map(|a| a.last_sync).max(),
            accounts,
            total_size_bytes,
            max_size_bytes,
            size_exceeded: total_size_bytes > max_size_bytes,
            sync_interval_minutes: settings.sync_interval_minutes,
            encryption_enabled: manager.encryption_enabled(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::queue::ActionPayload;
    use crate::store::{SyncResource, SyncState};

    #[tokio::test]
    async fn test_collect_aggregates_accounts() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CacheManager::open(CacheConfig::new(dir.path())).await.unwrap();

        let alice = manager.account("alice@example.com").await.unwrap();
        alice
            .queue()
            .enqueue(&ActionPayload::Delete {
                email_id: "m1".to_string(),
            })
            .await
            .unwrap();
        let bob = manager.account("bob@example.com").await.unwrap();
        bob.sync_state()
            .set(&SyncState::now(SyncResource::Emails))
            .await
            .unwrap();

        let online = OnlineStatus::new(false);
        let status = CacheStatus::collect(&manager, &online, &CacheSettings::default())
            .await
            .unwrap();

        assert!(status.enabled);
        assert!(!status.online);
        assert_eq!(status.accounts.len(), 2);
        assert_eq!(status.pending_actions, 1);
        assert!(status.last_sync.is_some());
        assert!(status.total_size_bytes > 0);
        assert!(!status.size_exceeded);
        assert_eq!(status.sync_interval_minutes, 5);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["accounts"][0]["email"], "alice@example.com");
    }

    #[tokio::test]
    async fn test_disabled_cache_lists_no_accounts() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CacheManager::open(CacheConfig::new(dir.path())).await.unwrap();
        manager.account("alice@example.com").await.unwrap();

        let settings = CacheSettings {
            cache_enabled: false,
            ..CacheSettings::default()
        };
        let status = CacheStatus::collect(&manager, &OnlineStatus::default(), &settings)
            .await
            .unwrap();
        assert!(!status.enabled);
        assert!(status.accounts.is_empty());
    }
}
