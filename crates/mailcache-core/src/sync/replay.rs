//! Replaying queued offline actions against the remote provider.

use serde::Serialize;
use tracing::{debug, info, warn};

use super::metrics::SyncMetrics;
use super::remote::{MessageUpdate, RemoteError, RemoteProvider, RemoteResult};
use crate::manager::AccountCache;
use crate::queue::ActionPayload;
use crate::{Error, Result};

/// When a repeatedly failing action is given up on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryPolicy {
    /// Failed attempts after which the action is dropped. `None` never drops.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Retry until the action succeeds or is removed as stale.
    #[must_use]
    pub const fn unbounded() -> Self {
        Self { max_attempts: None }
    }

    /// Drop an action once it has failed `attempts` times.
    #[must_use]
    pub const fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: Some(attempts),
        }
    }

    /// Whether an action with `attempts` failures should be dropped.
    #[must_use]
    pub const fn should_abandon(&self, attempts: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempts >= max,
            None => false,
        }
    }
}

/// Outcome of draining one account queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    /// Actions applied and removed.
    pub applied: usize,
    /// Failed attempts recorded.
    pub failed: usize,
    /// Actions dropped by the retry policy or because their target is gone.
    pub abandoned: usize,
    /// Undecodable rows removed.
    pub corrupt: usize,
    /// Error that stopped the drain, if any.
    pub stopped_by: Option<String>,
}

/// Apply one action through the remote provider.
///
/// # Errors
///
/// Returns the provider's error.
pub async fn apply_action(
    remote: &dyn RemoteProvider,
    grant_id: &str,
    payload: &ActionPayload,
) -> RemoteResult<()> {
    let flags = |unread, starred| MessageUpdate {
        unread,
        starred,
        folders: None,
    };

    match payload {
        ActionPayload::MarkRead { email_id } => {
            remote
                .update_message(grant_id, email_id, &flags(Some(false), None))
                .await
        }
        ActionPayload::MarkUnread { email_id } => {
            remote
                .update_message(grant_id, email_id, &flags(Some(true), None))
                .await
        }
        ActionPayload::Star { email_id } => {
            remote
                .update_message(grant_id, email_id, &flags(None, Some(true)))
                .await
        }
        ActionPayload::Unstar { email_id } => {
            remote
                .update_message(grant_id, email_id, &flags(None, Some(false)))
                .await
        }
        ActionPayload::Archive { email_id } => remote.archive_message(grant_id, email_id).await,
        ActionPayload::Delete { email_id } => remote.delete_message(grant_id, email_id).await,
        ActionPayload::Move {
            email_id,
            folder_id,
        } => {
            let update = MessageUpdate {
                folders: Some(vec![folder_id.clone()]),
                ..MessageUpdate::default()
            };
            remote.update_message(grant_id, email_id, &update).await
        }
        ActionPayload::Send(message) => remote.send_message(grant_id, message).await,
        ActionPayload::SaveDraft(draft) => remote.save_draft(grant_id, draft).await,
        ActionPayload::DeleteDraft { draft_id } => remote.delete_draft(grant_id, draft_id).await,
        ActionPayload::CreateEvent(event) => remote.create_event(grant_id, event).await,
        ActionPayload::UpdateEvent(event) => remote.update_event(grant_id, event).await,
        ActionPayload::DeleteEvent {
            calendar_id,
            event_id,
        } => remote.delete_event(grant_id, calendar_id, event_id).await,
        ActionPayload::CreateContact(contact) => remote.create_contact(grant_id, contact).await,
        ActionPayload::UpdateContact(contact) => remote.update_contact(grant_id, contact).await,
        ActionPayload::DeleteContact { contact_id } => {
            remote.delete_contact(grant_id, contact_id).await
        }
    }
}

/// Replay an account's queue oldest-first.
///
/// A successful action is removed. A failed one gets its attempt recorded and
/// stops the drain, so later actions on the same resource keep their order,
/// unless `policy` drops it. Actions whose target no longer exists are
/// dropped. Only one drain per account runs at a time.
///
/// # Errors
///
/// Returns an error if the queue itself cannot be read or updated.
pub async fn drain_queue(
    cache: &AccountCache,
    remote: &dyn RemoteProvider,
    grant_id: &str,
    policy: RetryPolicy,
    metrics: &SyncMetrics,
) -> Result<ReplayReport> {
    let _guard = cache.replay_lock().lock().await;
    let queue = cache.queue();
    let mut report = ReplayReport::default();

    loop {
        let action = match queue.peek().await {
            Ok(Some(action)) => action,
            Ok(None) => break,
            Err(Error::CorruptAction { id, source }) => {
                warn!("Dropping corrupt offline action {}: {}", id, source);
                queue.remove(id).await?;
                report.corrupt += 1;
                continue;
            }
            Err(e) => return Err(e),
        };

        match apply_action(remote, grant_id, &action.payload).await {
            Ok(()) => {
                queue.remove(action.id).await?;
                metrics.record_replayed();
                report.applied += 1;
                debug!("Replayed {} for {}", action.action_type(), action.resource_id);
            }
            Err(RemoteError::NotFound(what)) => {
                warn!(
                    "Dropping {} for {}: {} no longer exists",
                    action.action_type(),
                    action.resource_id,
                    what
                );
                queue.remove(action.id).await?;
                metrics.record_abandoned();
                report.abandoned += 1;
            }
            Err(e) => {
                queue.mark_failed(action.id, &e.to_string()).await?;
                metrics.record_action_failed();
                report.failed += 1;

                if policy.should_abandon(action.attempts + 1) {
                    warn!(
                        "Giving up on {} for {} after {} attempts: {}",
                        action.action_type(),
                        action.resource_id,
                        action.attempts + 1,
                        e
                    );
                    queue.remove(action.id).await?;
                    metrics.record_abandoned();
                    report.abandoned += 1;
                    continue;
                }

                debug!("Replay of {} paused: {}", cache.email(), e);
                report.stopped_by = Some(e.to_string());
                break;
            }
        }
    }

    if report.applied > 0 || report.abandoned > 0 {
        info!(
            "Replayed {} offline actions for {} ({} dropped)",
            report.applied,
            cache.email(),
            report.abandoned
        );
    }
    Ok(report)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::sync::mock::MockRemote;

    fn read(id: &str) -> ActionPayload {
        ActionPayload::MarkRead {
            email_id: id.to_string(),
        }
    }

    async fn cache_with(actions: &[ActionPayload]) -> AccountCache {
        let cache = AccountCache::in_memory("alice@example.com").await.unwrap();
        for action in actions {
            cache.queue().enqueue(action).await.unwrap();
        }
        cache
    }

    #[tokio::test]
    async fn test_drain_applies_in_order() {
        let cache = cache_with(&[
            read("m1"),
            ActionPayload::Star {
                email_id: "m2".to_string(),
            },
            ActionPayload::Move {
                email_id: "m3".to_string(),
                folder_id: "archive".to_string(),
            },
            ActionPayload::DeleteContact {
                contact_id: "c1".to_string(),
            },
        ])
        .await;
        let remote = MockRemote::default();
        let metrics = SyncMetrics::new();

        let report = drain_queue(&cache, &remote, "grant", RetryPolicy::default(), &metrics)
            .await
            .unwrap();

        assert_eq!(report.applied, 4);
        assert_eq!(
            remote.writes(),
            vec!["read:m1", "star:m2", "move:m3", "delete_contact:c1"]
        );
        assert_eq!(cache.queue().count().await.unwrap(), 0);
        assert_eq!(metrics.snapshot().actions_replayed, 4);
    }

    #[tokio::test]
    async fn test_failure_stops_drain_and_keeps_order() {
        let cache = cache_with(&[read("m1"), read("m2"), read("m3")]).await;
        let remote = MockRemote::default();
        remote
            .write_errors
            .lock()
            .unwrap()
            .insert("m2".to_string(), RemoteError::Timeout);
        let metrics = SyncMetrics::new();

        let report = drain_queue(&cache, &remote, "grant", RetryPolicy::default(), &metrics)
            .await
            .unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(report.failed, 1);
        assert!(report.stopped_by.is_some());

        let pending = cache.queue().list().await.unwrap();
        let ids: Vec<_> = pending.iter().map(|a| a.resource_id.as_str()).collect();
        assert_eq!(ids, vec!["m2", "m3"]);
        assert_eq!(pending[0].attempts, 1);
        assert!(pending[0].last_error.is_some());

        remote.write_errors.lock().unwrap().clear();
        let report = drain_queue(&cache, &remote, "grant", RetryPolicy::default(), &metrics)
            .await
            .unwrap();
        assert_eq!(report.applied, 2);
        assert_eq!(remote.writes(), vec!["read:m1", "read:m2", "read:m3"]);
    }

    #[tokio::test]
    async fn test_retry_policy_abandons() {
        let cache = cache_with(&[read("m1"), read("m2")]).await;
        let remote = MockRemote::default();
        remote
            .write_errors
            .lock()
            .unwrap()
            .insert("m1".to_string(), RemoteError::Unauthorized("expired".to_string()));
        let metrics = SyncMetrics::new();
        let policy = RetryPolicy::with_max_attempts(2);

        let report = drain_queue(&cache, &remote, "grant", policy, &metrics)
            .await
            .unwrap();
        assert_eq!(report.abandoned, 0);
        assert_eq!(cache.queue().count().await.unwrap(), 2);

        let report = drain_queue(&cache, &remote, "grant", policy, &metrics)
            .await
            .unwrap();
        assert_eq!(report.abandoned, 1);
        assert_eq!(report.applied, 1);
        assert_eq!(cache.queue().count().await.unwrap(), 0);
        assert_eq!(metrics.snapshot().actions_abandoned, 1);
    }

    #[tokio::test]
    async fn test_missing_target_is_dropped() {
        let cache = cache_with(&[read("gone"), read("m2")]).await;
        let remote = MockRemote::default();
        remote
            .write_errors
            .lock()
            .unwrap()
            .insert("gone".to_string(), RemoteError::NotFound("gone".to_string()));

        let report = drain_queue(
            &cache,
            &remote,
            "grant",
            RetryPolicy::default(),
            &SyncMetrics::new(),
        )
        .await
        .unwrap();
        assert_eq!(report.abandoned, 1);
        assert_eq!(report.applied, 1);
        assert_eq!(cache.queue().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_row_is_removed() {
        let cache = cache_with(&[read("m1")]).await;
        sqlx::query(
            "INSERT INTO offline_queue (type, resource_id, payload, created_at) VALUES ('mark_read', 'x', '{oops', 0)",
        )
        .execute(cache.pool())
        .await
        .unwrap();

        let remote = MockRemote::default();
        let report = drain_queue(
            &cache,
            &remote,
            "grant",
            RetryPolicy::default(),
            &SyncMetrics::new(),
        )
        .await
        .unwrap();
        assert_eq!(report.corrupt, 1);
        assert_eq!(report.applied, 1);
    }

    #[test]
    fn test_retry_policy() {
        assert!(!RetryPolicy::unbounded().should_abandon(1_000));
        assert!(!RetryPolicy::with_max_attempts(3).should_abandon(2));
        assert!(RetryPolicy::with_max_attempts(3).should_abandon(3));
    }
}
