//! Offline action models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{CachedContact, CachedEvent};

/// Kind of write a user made while offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Mark an email read.
    MarkRead,
    /// Mark an email unread.
    MarkUnread,
    /// Star an email.
    Star,
    /// Remove the star from an email.
    Unstar,
    /// Archive an email.
    Archive,
    /// Delete an email.
    Delete,
    /// Move an email to another folder.
    Move,
    /// Send a new email.
    Send,
    /// Create or update a draft.
    SaveDraft,
    /// Delete a draft.
    DeleteDraft,
    /// Create a calendar event.
    CreateEvent,
    /// Update a calendar event.
    UpdateEvent,
    /// Delete a calendar event.
    DeleteEvent,
    /// Create a contact.
    CreateContact,
    /// Update a contact.
    UpdateContact,
    /// Delete a contact.
    DeleteContact,
}

impl ActionType {
    /// Convert to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::MarkRead => "mark_read",
            Self::MarkUnread => "mark_unread",
            Self::Star => "star",
            Self::Unstar => "unstar",
            Self::Archive => "archive",
            Self::Delete => "delete",
            Self::Move => "move",
            Self::Send => "send",
            Self::SaveDraft => "save_draft",
            Self::DeleteDraft => "delete_draft",
            Self::CreateEvent => "create_event",
            Self::UpdateEvent => "update_event",
            Self::DeleteEvent => "delete_event",
            Self::CreateContact => "create_contact",
            Self::UpdateContact => "update_contact",
            Self::DeleteContact => "delete_contact",
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A new outgoing message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendEmailPayload {
    /// Recipients.
    pub to: Vec<String>,
    /// Carbon-copy recipients.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    /// Blind carbon-copy recipients.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bcc: Vec<String>,
    /// Subject line.
    pub subject: String,
    /// Message body.
    pub body: String,
    /// Message being replied to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

/// A draft to create or update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftPayload {
    /// Existing draft id, `None` for a new draft.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft_id: Option<String>,
    /// Recipients.
    #[serde(default)]
    pub to: Vec<String>,
    /// Carbon-copy recipients.
    #[serde(default)]
    pub cc: Vec<String>,
    /// Blind carbon-copy recipients.
    #[serde(default)]
    pub bcc: Vec<String>,
    /// Subject line.
    #[serde(default)]
    pub subject: String,
    /// Draft body.
    #[serde(default)]
    pub body: String,
}

/// The write to replay, with its typed arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ActionPayload {
    /// Mark an email read.
    MarkRead {
        /// Target email.
        email_id: String,
    },
    /// Mark an email unread.
    MarkUnread {
        /// Target email.
        email_id: String,
    },
    /// Star an email.
    Star {
        /// Target email.
        email_id: String,
    },
    /// Remove the star from an email.
    Unstar {
        /// Target email.
        email_id: String,
    },
    /// Archive an email.
    Archive {
        /// Target email.
        email_id: String,
    },
    /// Delete an email.
    Delete {
        /// Target email.
        email_id: String,
    },
    /// Move an email to another folder.
    Move {
        /// Target email.
        email_id: String,
        /// Destination folder.
        folder_id: String,
    },
    /// Send a new email.
    Send(SendEmailPayload),
    /// Create or update a draft.
    SaveDraft(DraftPayload),
    /// Delete a draft.
    DeleteDraft {
        /// Draft to delete.
        draft_id: String,
    },
    /// Create a calendar event.
    CreateEvent(CachedEvent),
    /// Update a calendar event.
    UpdateEvent(CachedEvent),
    /// Delete a calendar event.
    DeleteEvent {
        /// Calendar holding the event.
        calendar_id: String,
        /// Event to delete.
        event_id: String,
    },
    /// Create a contact.
    CreateContact(CachedContact),
    /// Update a contact.
    UpdateContact(CachedContact),
    /// Delete a contact.
    DeleteContact {
        /// Contact to delete.
        contact_id: String,
    },
}

impl ActionPayload {
    /// The action type this payload carries.
    #[must_use]
    pub const fn action_type(&self) -> ActionType {
        match self {
            Self::MarkRead { .. } => ActionType::MarkRead,
            Self::MarkUnread { .. } => ActionType::MarkUnread,
            Self::Star { .. } => ActionType::Star,
            Self::Unstar { .. } => ActionType::Unstar,
            Self::Archive { .. } => ActionType::Archive,
            Self::Delete { .. } => ActionType::Delete,
            Self::Move { .. } => ActionType::Move,
            Self::Send(_) => ActionType::Send,
            Self::SaveDraft(_) => ActionType::SaveDraft,
            Self::DeleteDraft { .. } => ActionType::DeleteDraft,
            Self::CreateEvent(_) => ActionType::CreateEvent,
            Self::UpdateEvent(_) => ActionType::UpdateEvent,
            Self::DeleteEvent { .. } => ActionType::DeleteEvent,
            Self::CreateContact(_) => ActionType::CreateContact,
            Self::UpdateContact(_) => ActionType::UpdateContact,
            Self::DeleteContact { .. } => ActionType::DeleteContact,
        }
    }

    /// Id of the resource the action touches, used to cancel pending actions
    /// when the resource goes away. Empty for actions that create something.
    #[must_use]
    pub fn resource_id(&self) -> &str {
        match self {
            Self::MarkRead { email_id }
            | Self::MarkUnread { email_id }
            | Self::Star { email_id }
            | Self::Unstar { email_id }
            | Self::Archive { email_id }
            | Self::Delete { email_id }
            | Self::Move { email_id, .. } => email_id.as_str(),
            Self::Send(_) | Self::CreateEvent(_) | Self::CreateContact(_) => "",
            Self::SaveDraft(draft) => draft.draft_id.as_deref().unwrap_or(""),
            Self::DeleteDraft { draft_id } => draft_id.as_str(),
            Self::UpdateEvent(event) => event.id.as_str(),
            Self::DeleteEvent { event_id, .. } => event_id.as_str(),
            Self::UpdateContact(contact) => contact.id.as_str(),
            Self::DeleteContact { contact_id } => contact_id.as_str(),
        }
    }
}

/// An action waiting to be replayed against the remote provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedAction {
    /// Queue row id.
    pub id: i64,
    /// Resource the action targets.
    pub resource_id: String,
    /// The action itself.
    pub payload: ActionPayload,
    /// When the action was queued.
    pub created_at: DateTime<Utc>,
    /// Failed replay attempts so far.
    pub attempts: u32,
    /// Error from the most recent failed attempt.
    pub last_error: Option<String>,
}

impl QueuedAction {
    /// The kind of action.
    #[must_use]
    pub const fn action_type(&self) -> ActionType {
        self.payload.action_type()
    }
}
