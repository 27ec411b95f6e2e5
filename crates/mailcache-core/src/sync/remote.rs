//! Remote mail/calendar/contacts provider interface.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::queue::{DraftPayload, SendEmailPayload};
use crate::store::{CachedContact, CachedEmail, CachedEvent, CachedFolder};

/// Errors reported by a [`RemoteProvider`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// The provider could not be reached.
    #[error("Network error: {0}")]
    Network(String),

    /// The call did not finish in time.
    #[error("Request timed out")]
    Timeout,

    /// The provider asked us to slow down.
    #[error("Rate limited")]
    RateLimited,

    /// The grant is no longer authorized.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The target resource does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Any other provider failure.
    #[error("{0}")]
    Other(String),
}

impl RemoteError {
    /// Whether retrying later may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout | Self::RateLimited)
    }
}

/// Result of a remote call.
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// An account connected to the remote provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountGrant {
    /// Account email, which names the local cache.
    pub email: String,
    /// Provider grant id used for remote calls.
    pub grant_id: String,
}

impl AccountGrant {
    /// Creates a grant.
    #[must_use]
    pub fn new(email: impl Into<String>, grant_id: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            grant_id: grant_id.into(),
        }
    }
}

/// A calendar on the remote provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCalendar {
    /// Calendar id.
    pub id: String,
    /// Display name.
    pub name: String,
}

/// Partial update of a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageUpdate {
    /// New unread flag.
    pub unread: Option<bool>,
    /// New starred flag.
    pub starred: Option<bool>,
    /// Replacement folder list.
    pub folders: Option<Vec<String>>,
}

/// Remote source of truth the cache syncs from and replays writes to.
///
/// Implementations map provider records into the cached entity types.
#[async_trait]
pub trait RemoteProvider: Send + Sync {
    /// Most recent messages, newest first.
    async fn get_messages(&self, grant_id: &str, limit: u32) -> RemoteResult<Vec<CachedEmail>>;

    /// Every folder.
    async fn get_folders(&self, grant_id: &str) -> RemoteResult<Vec<CachedFolder>>;

    /// Every calendar.
    async fn get_calendars(&self, grant_id: &str) -> RemoteResult<Vec<RemoteCalendar>>;

    /// Events of one calendar.
    async fn get_events(
        &self,
        grant_id: &str,
        calendar_id: &str,
        limit: u32,
    ) -> RemoteResult<Vec<CachedEvent>>;

    /// Contacts.
    async fn get_contacts(&self, grant_id: &str, limit: u32) -> RemoteResult<Vec<CachedContact>>;

    /// Change flags or folders of a message.
    async fn update_message(
        &self,
        grant_id: &str,
        message_id: &str,
        update: &MessageUpdate,
    ) -> RemoteResult<()>;

    /// Move a message to the archive.
    async fn archive_message(&self, grant_id: &str, message_id: &str) -> RemoteResult<()>;

    /// Delete a message.
    async fn delete_message(&self, grant_id: &str, message_id: &str) -> RemoteResult<()>;

    /// Send a new message.
    async fn send_message(&self, grant_id: &str, message: &SendEmailPayload) -> RemoteResult<()>;

    /// Create or update a draft.
    async fn save_draft(&self, grant_id: &str, draft: &DraftPayload) -> RemoteResult<()>;

    /// Delete a draft.
    async fn delete_draft(&self, grant_id: &str, draft_id: &str) -> RemoteResult<()>;

    /// Create an event.
    async fn create_event(&self, grant_id: &str, event: &CachedEvent) -> RemoteResult<()>;

    /// Update an event.
    async fn update_event(&self, grant_id: &str, event: &CachedEvent) -> RemoteResult<()>;

    /// Delete an event.
    async fn delete_event(
        &self,
        grant_id: &str,
        calendar_id: &str,
        event_id: &str,
    ) -> RemoteResult<()>;

    /// Create a contact.
    async fn create_contact(&self, grant_id: &str, contact: &CachedContact) -> RemoteResult<()>;

    /// Update a contact.
    async fn update_contact(&self, grant_id: &str, contact: &CachedContact) -> RemoteResult<()>;

    /// Delete a contact.
    async fn delete_contact(&self, grant_id: &str, contact_id: &str) -> RemoteResult<()>;
}
