//! Shared fixtures for integration tests.

#![allow(dead_code, clippy::unwrap_used)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use tokio::sync::Notify;

use mailcache_core::queue::{DraftPayload, SendEmailPayload};
use mailcache_core::store::{CachedContact, CachedEmail, CachedEvent, CachedFolder, EventWhen};
use mailcache_core::sync::{MessageUpdate, RemoteCalendar, RemoteError, RemoteResult};
use mailcache_core::{CacheConfig, CacheManager, RemoteProvider};

static TRACING: Once = Once::new();

/// Install a test-friendly subscriber once per test binary.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// A manager over a fresh temp directory.
pub async fn manager() -> (tempfile::TempDir, Arc<CacheManager>) {
    let dir = tempfile::tempdir().unwrap();
    let manager = CacheManager::open(CacheConfig::new(dir.path())).await.unwrap();
    (dir, Arc::new(manager))
}

/// Remote provider serving a fixed mailbox.
#[derive(Default)]
pub struct FakeRemote {
    pub fail_messages: AtomicBool,
    pub message_calls: AtomicUsize,
    pub writes: Mutex<Vec<String>>,
    /// When set, `get_messages` signals `entered` and then waits for `release`.
    pub gate: Option<(Arc<Notify>, Arc<Notify>)>,
}

impl FakeRemote {
    pub fn gated() -> (Self, Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let remote = Self {
            gate: Some((Arc::clone(&entered), Arc::clone(&release))),
            ..Self::default()
        };
        (remote, entered, release)
    }

    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().unwrap().clone()
    }

    fn write(&self, entry: String) -> RemoteResult<()> {
        self.writes.lock().unwrap().push(entry);
        Ok(())
    }
}

#[async_trait]
impl RemoteProvider for FakeRemote {
    async fn get_messages(&self, grant_id: &str, _limit: u32) -> RemoteResult<Vec<CachedEmail>> {
        self.message_calls.fetch_add(1, Ordering::SeqCst);
        if let Some((entered, release)) = &self.gate {
            entered.notify_one();
            release.notified().await;
        }
        if self.fail_messages.load(Ordering::SeqCst) {
            return Err(RemoteError::Network("unreachable".to_string()));
        }
        let now = Utc::now();
        Ok(vec![
            CachedEmail::new(format!("{grant_id}-m1"), "Quarterly budget", now),
            CachedEmail::new(
                format!("{grant_id}-m2"),
                "Team lunch",
                now - TimeDelta::hours(2),
            ),
        ])
    }

    async fn get_folders(&self, _grant_id: &str) -> RemoteResult<Vec<CachedFolder>> {
        Ok(vec![
            CachedFolder::new("inbox", "Inbox"),
            CachedFolder::new("sent", "Sent Items"),
        ])
    }

    async fn get_calendars(&self, _grant_id: &str) -> RemoteResult<Vec<RemoteCalendar>> {
        Ok(vec![RemoteCalendar {
            id: "primary".to_string(),
            name: "Calendar".to_string(),
        }])
    }

    async fn get_events(
        &self,
        _grant_id: &str,
        _calendar_id: &str,
        _limit: u32,
    ) -> RemoteResult<Vec<CachedEvent>> {
        let start = Utc::now() + TimeDelta::hours(1);
        Ok(vec![
            CachedEvent::new(
                "budget-review",
                "Budget review",
                EventWhen::Timespan {
                    start,
                    end: start + TimeDelta::hours(1),
                },
            ),
            CachedEvent::new(
                "one-on-one",
                "One on one",
                EventWhen::Timespan {
                    start: start + TimeDelta::minutes(30),
                    end: start + TimeDelta::minutes(90),
                },
            ),
        ])
    }

    async fn get_contacts(&self, _grant_id: &str, _limit: u32) -> RemoteResult<Vec<CachedContact>> {
        Ok(vec![CachedContact::new(
            "finance",
            "finance@example.com",
            "Budget Office",
        )])
    }

    async fn update_message(
        &self,
        _grant_id: &str,
        message_id: &str,
        update: &MessageUpdate,
    ) -> RemoteResult<()> {
        self.write(format!("update:{message_id}:{:?}", update.unread))
    }

    async fn archive_message(&self, _grant_id: &str, message_id: &str) -> RemoteResult<()> {
        self.write(format!("archive:{message_id}"))
    }

    async fn delete_message(&self, _grant_id: &str, message_id: &str) -> RemoteResult<()> {
        self.write(format!("delete:{message_id}"))
    }

    async fn send_message(&self, _grant_id: &str, message: &SendEmailPayload) -> RemoteResult<()> {
        self.write(format!("send:{}", message.subject))
    }

    async fn save_draft(&self, _grant_id: &str, draft: &DraftPayload) -> RemoteResult<()> {
        self.write(format!("draft:{}", draft.subject))
    }

    async fn delete_draft(&self, _grant_id: &str, draft_id: &str) -> RemoteResult<()> {
        self.write(format!("delete_draft:{draft_id}"))
    }

    async fn create_event(&self, _grant_id: &str, event: &CachedEvent) -> RemoteResult<()> {
        self.write(format!("create_event:{}", event.id))
    }

    async fn update_event(&self, _grant_id: &str, event: &CachedEvent) -> RemoteResult<()> {
        self.write(format!("update_event:{}", event.id))
    }

    async fn delete_event(
        &self,
        _grant_id: &str,
        _calendar_id: &str,
        event_id: &str,
    ) -> RemoteResult<()> {
        self.write(format!("delete_event:{event_id}"))
    }

    async fn create_contact(&self, _grant_id: &str, contact: &CachedContact) -> RemoteResult<()> {
        self.write(format!("create_contact:{}", contact.id))
    }

    async fn update_contact(&self, _grant_id: &str, contact: &CachedContact) -> RemoteResult<()> {
        self.write(format!("update_contact:{}", contact.id))
    }

    async fn delete_contact(&self, _grant_id: &str, contact_id: &str) -> RemoteResult<()> {
        self.write(format!("delete_contact:{contact_id}"))
    }
}

/// Poll `check` until it holds or a few seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
