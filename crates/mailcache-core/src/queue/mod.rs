//! Durable queue of writes made while offline.
//!
//! Actions are appended by request handlers when the remote provider is
//! unreachable and drained oldest-first by the sync engine once it is back.

mod model;
mod repository;

pub use model::{ActionPayload, ActionType, DraftPayload, QueuedAction, SendEmailPayload};
pub use repository::OfflineQueue;
