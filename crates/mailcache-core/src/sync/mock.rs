//! In-memory remote provider for unit tests.

#![allow(clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::remote::{MessageUpdate, RemoteCalendar, RemoteError, RemoteProvider, RemoteResult};
use crate::queue::{DraftPayload, SendEmailPayload};
use crate::store::{CachedContact, CachedEmail, CachedEvent, CachedFolder};

#[derive(Default)]
pub(crate) struct MockRemote {
    pub messages: Mutex<Vec<CachedEmail>>,
    pub folders: Mutex<Vec<CachedFolder>>,
    pub calendars: Mutex<Vec<RemoteCalendar>>,
    pub events: Mutex<HashMap<String, Vec<CachedEvent>>>,
    pub contacts: Mutex<Vec<CachedContact>>,
    pub fail_messages: AtomicBool,
    pub fail_folders: AtomicBool,
    /// Write failures by target id.
    pub write_errors: Mutex<HashMap<String, RemoteError>>,
    /// Successful writes, as `"<call>:<id>"`.
    pub writes: Mutex<Vec<String>>,
    pub message_calls: AtomicUsize,
    pub delay: Mutex<Option<Duration>>,
}

impl MockRemote {
    fn write(&self, call: &str, id: &str) -> RemoteResult<()> {
        if let Some(err) = self.write_errors.lock().unwrap().get(id) {
            return Err(err.clone());
        }
        self.writes.lock().unwrap().push(format!("{call}:{id}"));
        Ok(())
    }

    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().unwrap().clone()
    }

    async fn pause(&self) {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl RemoteProvider for MockRemote {
    async fn get_messages(&self, _grant_id: &str, limit: u32) -> RemoteResult<Vec<CachedEmail>> {
        self.message_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if self.fail_messages.load(Ordering::SeqCst) {
            return Err(RemoteError::Network("connection refused".to_string()));
        }
        let messages = self.messages.lock().unwrap();
        Ok(messages.iter().take(usize::try_from(limit).unwrap()).cloned().collect())
    }

    async fn get_folders(&self, _grant_id: &str) -> RemoteResult<Vec<CachedFolder>> {
        if self.fail_folders.load(Ordering::SeqCst) {
            return Err(RemoteError::RateLimited);
        }
        Ok(self.folders.lock().unwrap().clone())
    }

    async fn get_calendars(&self, _grant_id: &str) -> RemoteResult<Vec<RemoteCalendar>> {
        Ok(self.calendars.lock().unwrap().clone())
    }

    async fn get_events(
        &self,
        _grant_id: &str,
        calendar_id: &str,
        _limit: u32,
    ) -> RemoteResult<Vec<CachedEvent>> {
        self.events
            .lock()
            .unwrap()
            .get(calendar_id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(calendar_id.to_string()))
    }

    async fn get_contacts(&self, _grant_id: &str, _limit: u32) -> RemoteResult<Vec<CachedContact>> {
        Ok(self.contacts.lock().unwrap().clone())
    }

    async fn update_message(
        &self,
        _grant_id: &str,
        message_id: &str,
        update: &MessageUpdate,
    ) -> RemoteResult<()> {
        let call = match (update.unread, update.starred, &update.folders) {
            (Some(true), _, _) => "unread",
            (Some(false), _, _) => "read",
            (_, Some(true), _) => "star",
            (_, Some(false), _) => "unstar",
            _ => "move",
        };
        self.write(call, message_id)
    }

    async fn archive_message(&self, _grant_id: &str, message_id: &str) -> RemoteResult<()> {
        self.write("archive", message_id)
    }

    async fn delete_message(&self, _grant_id: &str, message_id: &str) -> RemoteResult<()> {
        self.write("delete", message_id)
    }

    async fn send_message(&self, _grant_id: &str, message: &SendEmailPayload) -> RemoteResult<()> {
        self.write("send", &message.subject)
    }

    async fn save_draft(&self, _grant_id: &str, draft: &DraftPayload) -> RemoteResult<()> {
        self.write("save_draft", draft.draft_id.as_deref().unwrap_or(""))
    }

    async fn delete_draft(&self, _grant_id: &str, draft_id: &str) -> RemoteResult<()> {
        self.write("delete_draft", draft_id)
    }

    async fn create_event(&self, _grant_id: &str, event: &CachedEvent) -> RemoteResult<()> {
        self.write("create_event", &event.id)
    }

    async fn update_event(&self, _grant_id: &str, event: &CachedEvent) -> RemoteResult<()> {
        self.write("update_event", &event.id)
    }

    async fn delete_event(
        &self,
        _grant_id: &str,
        _calendar_id: &str,
        event_id: &str,
    ) -> RemoteResult<()> {
        self.write("delete_event", event_id)
    }

    async fn create_contact(&self, _grant_id: &str, contact: &CachedContact) -> RemoteResult<()> {
        self.write("create_contact", &contact.id)
    }

    async fn update_contact(&self, _grant_id: &str, contact: &CachedContact) -> RemoteResult<()> {
        self.write("update_contact", &contact.id)
    }

    async fn delete_contact(&self, _grant_id: &str, contact_id: &str) -> RemoteResult<()> {
        self.write("delete_contact", contact_id)
    }
}
