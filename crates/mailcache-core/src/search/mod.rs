//! Search over cached data.
//!
//! - [`unified_search`] fans one free-text query across emails, events and
//!   contacts of an account.
//! - [`SearchQuery`] parses operator syntax (`from:`, `is:unread`, ...) for
//!   email searches.

mod query;
mod unified;

pub use query::SearchQuery;
pub use unified::{
    DEFAULT_UNIFIED_LIMIT, ResultKind, SearchResult, SearchSource, per_kind_limit, unified_search,
};
