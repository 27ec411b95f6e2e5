//! One query across emails, events and contacts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::Result;
use crate::store::{CachedContact, CachedEmail, CachedEvent};

/// Result limit used when the caller passes zero.
pub const DEFAULT_UNIFIED_LIMIT: u32 = 20;

/// Smallest per-kind budget, so small limits still sample every kind.
const MIN_PER_KIND: u32 = 5;

/// Entity searches a unified search fans out to.
#[async_trait]
pub trait SearchSource: Send + Sync {
    /// Search cached emails.
    async fn search_emails(&self, query: &str, limit: u32) -> Result<Vec<CachedEmail>>;
    /// Search cached events.
    async fn search_events(&self, query: &str, limit: u32) -> Result<Vec<CachedEvent>>;
    /// Search cached contacts.
    async fn search_contacts(&self, query: &str, limit: u32) -> Result<Vec<CachedContact>>;
}

/// Kind of entity a search hit refers to, in display priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    /// An email.
    Email,
    /// A calendar event.
    Event,
    /// A contact.
    Contact,
}

/// One unified search hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchResult {
    /// What the hit is.
    pub kind: ResultKind,
    /// Entity id.
    pub id: String,
    /// Primary display line.
    pub title: String,
    /// Secondary display line.
    pub subtitle: String,
    /// Date used for ordering.
    pub timestamp: DateTime<Utc>,
}

impl From<CachedEmail> for SearchResult {
    fn from(email: CachedEmail) -> Self {
        Self {
            kind: ResultKind::Email,
            subtitle: email.sender(),
            timestamp: email.date,
            title: email.subject,
            id: email.id,
        }
    }
}

impl From<CachedEvent> for SearchResult {
    fn from(event: CachedEvent) -> Self {
        Self {
            kind: ResultKind::Event,
            timestamp: event.when.start_utc(),
            subtitle: event.location,
            title: event.title,
            id: event.id,
        }
    }
}

impl From<CachedContact> for SearchResult {
    fn from(contact: CachedContact) -> Self {
        Self {
            kind: ResultKind::Contact,
            title: contact.name(),
            subtitle: contact.email,
            timestamp: contact.cached_at,
            id: contact.id,
        }
    }
}

/// Per-kind result budget for an overall `limit`.
#[must_use]
pub fn per_kind_limit(limit: u32) -> u32 {
    (limit / 3).max(MIN_PER_KIND)
}

fn collect<T: Into<SearchResult>>(
    kind: ResultKind,
    results: Result<Vec<T>>,
    into: &mut Vec<SearchResult>,
) {
    match results {
        Ok(items) => into.extend(items.into_iter().map(Into::into)),
        Err(e) => warn!("Unified search skipped {:?}: {}", kind, e),
    }
}

/// Search every entity kind of one account.
///
/// A blank query returns nothing without touching storage. Hits are grouped
/// by kind (emails, then events, then contacts), newest first within a kind,
/// and capped at `limit` (zero means [`DEFAULT_UNIFIED_LIMIT`]). A kind whose
/// search fails is left out.
pub async fn unified_search<S>(source: &S, query: &str, limit: u32) -> Vec<SearchResult>
where
    S: SearchSource + ?Sized,
{
    let query = query.trim();
    if query.is_empty() {
        return Vec::new();
    }

    let limit = if limit == 0 { DEFAULT_UNIFIED_LIMIT } else { limit };
    let per_kind = per_kind_limit(limit);

    let (emails, events, contacts) = tokio::join!(
        source.search_emails(query, per_kind),
        source.search_events(query, per_kind),
        source.search_contacts(query, per_kind),
    );

    let mut results = Vec::new();
    collect(ResultKind::Email, emails, &mut results);
    collect(ResultKind::Event, events, &mut results);
    collect(ResultKind::Contact, contacts, &mut results);

    results.sort_by(|a, b| a.kind.cmp(&b.kind).then(b.timestamp.cmp(&a.timestamp)));
    results.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
    results
}
