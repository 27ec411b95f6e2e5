//! Cached calendar event storage.

use chrono::{DateTime, Days, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::debug;

use super::email::push_page;
use super::{
    count_from, effective_limit, ensure_id, from_unix, push_token_filter, to_unix, token_patterns,
};
use crate::{Error, Result};

const COLUMNS: &str = "id, calendar_id, title, description, location, start_time, end_time, \
     start_date, end_date, status, busy, participants_json, cached_at";

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Confirmation status of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Event is happening.
    #[default]
    Confirmed,
    /// Event is not yet confirmed.
    Tentative,
    /// Event was cancelled.
    Cancelled,
}

impl EventStatus {
    /// Parse from database string representation.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "tentative" => Self::Tentative,
            "cancelled" | "canceled" => Self::Cancelled,
            _ => Self::Confirmed,
        }
    }

    /// Convert to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Confirmed => "confirmed",
            Self::Tentative => "tentative",
            Self::Cancelled => "cancelled",
        }
    }
}

/// When an event takes place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventWhen {
    /// A timed event between two instants (end exclusive).
    Timespan {
        /// Start instant.
        start: DateTime<Utc>,
        /// End instant.
        end: DateTime<Utc>,
    },
    /// An all-day event on one calendar date.
    Date {
        /// The day.
        date: NaiveDate,
    },
    /// An all-day event spanning several dates, end date inclusive.
    Datespan {
        /// First day.
        start: NaiveDate,
        /// Last day.
        end: NaiveDate,
    },
}

impl Default for EventWhen {
    fn default() -> Self {
        Self::Timespan {
            start: DateTime::default(),
            end: DateTime::default(),
        }
    }
}

impl EventWhen {
    /// Whether the event is date-only.
    #[must_use]
    pub const fn is_all_day(&self) -> bool {
        !matches!(self, Self::Timespan { .. })
    }

    /// Calendar dates covered by a date-only event, end exclusive.
    #[must_use]
    pub fn date_range(&self) -> Option<(NaiveDate, NaiveDate)> {
        match *self {
            Self::Timespan { .. } => None,
            Self::Date { date } => Some((date, next_day(date))),
            Self::Datespan { start, end } => Some((start, next_day(end))),
        }
    }

    /// Start instant, with date-only events anchored at UTC midnight.
    #[must_use]
    pub fn start_utc(&self) -> DateTime<Utc> {
        match *self {
            Self::Timespan { start, .. } => start,
            Self::Date { date } | Self::Datespan { start: date, .. } => utc_midnight(date),
        }
    }

    /// End instant (exclusive), with date-only events anchored at UTC midnight.
    #[must_use]
    pub fn end_utc(&self) -> DateTime<Utc> {
        match *self {
            Self::Timespan { end, .. } => end,
            Self::Date { date } | Self::Datespan { end: date, .. } => utc_midnight(next_day(date)),
        }
    }

    fn is_valid(&self) -> bool {
        match *self {
            Self::Timespan { start, end } => end >= start,
            Self::Date { .. } => true,
            Self::Datespan { start, end } => end >= start,
        }
    }
}

fn next_day(date: NaiveDate) -> NaiveDate {
    date.checked_add_days(Days::new(1)).unwrap_or(date)
}

fn utc_midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::default()).and_utc()
}

/// A calendar event mirrored from the remote provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedEvent {
    /// Remote event id.
    pub id: String,
    /// Calendar holding the event.
    pub calendar_id: String,
    /// Title.
    pub title: String,
    /// Free-form description.
    pub description: String,
    /// Location text.
    pub location: String,
    /// When the event happens.
    pub when: EventWhen,
    /// Confirmation status.
    pub status: EventStatus,
    /// Whether the event blocks time on the calendar.
    pub busy: bool,
    /// Participant addresses.
    pub participants: Vec<String>,
    /// When this row was last written.
    pub cached_at: DateTime<Utc>,
}

impl CachedEvent {
    /// Creates a busy, confirmed event.
    #[must_use]
    pub fn new(id: impl Into<String>, title: impl Into<String>, when: EventWhen) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            when,
            busy: true,
            cached_at: Utc::now(),
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<()> {
        ensure_id("event", &self.id)?;
        if !self.when.is_valid() {
            return Err(Error::InvalidEntity {
                kind: "event",
                id: self.id.clone(),
                reason: "end precedes start",
            });
        }
        Ok(())
    }
}

/// Filters for [`EventStore::list`].
#[derive(Debug, Clone, Default)]
pub struct EventListOptions {
    /// Only events on this calendar.
    pub calendar_id: Option<String>,
    /// Only events ending after this instant.
    pub start: Option<DateTime<Utc>>,
    /// Only events starting before this instant.
    pub end: Option<DateTime<Utc>>,
    /// Maximum number of rows (0 = unbounded).
    pub limit: u32,
    /// Rows to skip.
    pub offset: u32,
}

/// Event storage for one account.
#[derive(Debug, Clone)]
pub struct EventStore {
    pool: SqlitePool,
}

impl EventStore {
    /// Creates a store over an initialized account pool.
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace an event.
    ///
    /// # Errors
    ///
    /// Returns an error if the event is malformed or the database query fails.
    pub async fn put(&self, event: &CachedEvent) -> Result<()> {
        event.validate()?;
        let mut conn = self.pool.acquire().await?;
        upsert(&mut conn, event).await
    }

    /// Insert or replace many events in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BatchItem`] naming the first failing event.
    pub async fn put_batch(&self, events: &[CachedEvent]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (index, event) in events.iter().enumerate() {
            let written = match event.validate() {
                Ok(()) => upsert(&mut tx, event).await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                return Err(Error::BatchItem {
                    index,
                    id: event.id.clone(),
                    source: Box::new(e),
                });
            }
        }
        tx.commit().await?;
        debug!("Cached {} events", events.len());
        Ok(())
    }

    /// Get an event by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get(&self, id: &str) -> Result<Option<CachedEvent>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM events WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_event).transpose()
    }

    /// List events by start time.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn list(&self, opts: &EventListOptions) -> Result<Vec<CachedEvent>> {
        let mut qb: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new(format!("SELECT {COLUMNS} FROM events WHERE 1 = 1"));
        if let Some(calendar_id) = &opts.calendar_id {
            qb.push(" AND calendar_id = ").push_bind(calendar_id.clone());
        }
        if let Some(start) = opts.start {
            qb.push(" AND end_time > ").push_bind(to_unix(start));
        }
        if let Some(end) = opts.end {
            qb.push(" AND start_time < ").push_bind(to_unix(end));
        }
        qb.push(" ORDER BY start_time, id");
        push_page(&mut qb, opts.limit, opts.offset);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_event).collect()
    }

    /// Events overlapping `[start, end)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn list_by_date_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CachedEvent>> {
        self.list(&EventListOptions {
            start: Some(start),
            end: Some(end),
            ..EventListOptions::default()
        })
        .await
    }

    /// Next events that have not ended yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn upcoming(&self, limit: u32) -> Result<Vec<CachedEvent>> {
        self.list(&EventListOptions {
            start: Some(Utc::now()),
            limit: effective_limit(limit),
            ..EventListOptions::default()
        })
        .await
    }

    /// Free-text search over title, description, location and participants.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn search(&self, query: &str, limit: u32) -> Result<Vec<CachedEvent>> {
        let mut qb: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new(format!("SELECT {COLUMNS} FROM events WHERE 1 = 1"));
        push_token_filter(
            &mut qb,
            &["title", "description", "location", "participants_json"],
            token_patterns(query),
        );
        qb.push(" ORDER BY start_time DESC LIMIT ")
            .push_bind(effective_limit(limit));

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_event).collect()
    }

    /// Delete an event.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM events WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete every event of a calendar. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn delete_by_calendar(&self, calendar_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM events WHERE calendar_id = ?")
            .bind(calendar_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Number of cached events.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn count(&self) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(count_from(n))
    }
}

async fn upsert(conn: &mut sqlx::SqliteConnection, event: &CachedEvent) -> Result<()> {
    let (start_date, end_date) = match event.when {
        EventWhen::Timespan { .. } => (None, None),
        EventWhen::Date { date } => (Some(date), Some(date)),
        EventWhen::Datespan { start, end } => (Some(start), Some(end)),
    };

    sqlx::query(
        r"
        INSERT INTO events
            (id, calendar_id, title, description, location, start_time, end_time,
             start_date, end_date, status, busy, participants_json, cached_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            calendar_id = excluded.calendar_id,
            title = excluded.title,
            description = excluded.description,
            location = excluded.location,
            start_time = excluded.start_time,
            end_time = excluded.end_time,
            start_date = excluded.start_date,
            end_date = excluded.end_date,
            status = excluded.status,
            busy = excluded.busy,
            participants_json = excluded.participants_json,
            cached_at = excluded.cached_at
        ",
    )
    .bind(&event.id)
    .bind(&event.calendar_id)
    .bind(&event.title)
    .bind(&event.description)
    .bind(&event.location)
    .bind(to_unix(event.when.start_utc()))
    .bind(to_unix(event.when.end_utc()))
    .bind(start_date.map(|d| d.format(DATE_FORMAT).to_string()))
    .bind(end_date.map(|d| d.format(DATE_FORMAT).to_string()))
    .bind(event.status.as_str())
    .bind(event.busy)
    .bind(serde_json::to_string(&event.participants)?)
    .bind(to_unix(Utc::now()))
    .execute(conn)
    .await?;
    Ok(())
}

fn parse_date(value: Option<String>) -> Option<NaiveDate> {
    value.and_then(|s| NaiveDate::parse_from_str(&s, DATE_FORMAT).ok())
}

fn row_to_event(row: &SqliteRow) -> Result<CachedEvent> {
    let start_date = parse_date(row.try_get("start_date")?);
    let end_date = parse_date(row.try_get("end_date")?);
    let when = match (start_date, end_date) {
        (Some(start), Some(end)) if start == end => EventWhen::Date { date: start },
        (Some(start), Some(end)) => EventWhen::Datespan { start, end },
        (Some(date), None) | (None, Some(date)) => EventWhen::Date { date },
        (None, None) => EventWhen::Timespan {
            start: from_unix(row.try_get("start_time")?),
            end: from_unix(row.try_get("end_time")?),
        },
    };
    let status: String = row.try_get("status")?;
    let participants: String = row.try_get("participants_json")?;

    Ok(CachedEvent {
        id: row.try_get("id")?,
        calendar_id: row.try_get("calendar_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        location: row.try_get("location")?,
        when,
        status: EventStatus::parse(&status),
        busy: row.try_get("busy")?,
        participants: serde_json::from_str(&participants)?,
        cached_at: from_unix(row.try_get("cached_at")?),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::store::memory_pool;

    fn timed(id: &str, start: i64, end: i64) -> CachedEvent {
        let mut e = CachedEvent::new(
            id,
            format!("Event {id}"),
            EventWhen::Timespan {
                start: from_unix(start),
                end: from_unix(end),
            },
        );
        e.calendar_id = "primary".to_string();
        e
    }

    async fn store() -> EventStore {
        EventStore::new(memory_pool().await.unwrap())
    }

    #[tokio::test]
    async fn test_put_and_get_all_day_event() {
        let store = store().await;
        let date = NaiveDate::from_ymd_opt(2024, 12, 25).unwrap();
        let mut event = CachedEvent::new("xmas", "Holiday", EventWhen::Date { date });
        event.participants = vec!["family@example.com".to_string()];
        store.put(&event).await.unwrap();

        let stored = store.get("xmas").await.unwrap().unwrap();
        assert_eq!(stored.when, EventWhen::Date { date });
        assert_eq!(stored.participants, event.participants);
        assert!(stored.when.is_all_day());
    }

    #[tokio::test]
    async fn test_datespan_round_trips_through_columns() {
        let store = store().await;
        let when = EventWhen::Datespan {
            start: NaiveDate::from_ymd_opt(2024, 7, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2024, 7, 5).unwrap(),
        };
        store.put(&CachedEvent::new("trip", "Trip", when)).await.unwrap();
        assert_eq!(store.get("trip").await.unwrap().unwrap().when, when);
    }

    #[tokio::test]
    async fn test_batch_rejects_inverted_event() {
        let store = store().await;
        let batch = vec![timed("evt-1", 100, 200), timed("evt-2", 500, 400), timed("evt-3", 600, 700)];

        let err = store.put_batch(&batch).await.unwrap_err();
        match err {
            Error::BatchItem { index, id, .. } => {
                assert_eq!(index, 1);
                assert_eq!(id, "evt-2");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_orders_by_start_and_filters_window() {
        let store = store().await;
        let mut other_cal = timed("c", 1_500, 1_600);
        other_cal.calendar_id = "work".to_string();
        store
            .put_batch(&[timed("b", 3_000, 4_000), timed("a", 1_000, 2_000), other_cal])
            .await
            .unwrap();

        let ids: Vec<_> = store
            .list(&EventListOptions::default())
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["a", "c", "b"]);

        let window = store
            .list_by_date_range(from_unix(1_900), from_unix(3_500))
            .await
            .unwrap();
        let ids: Vec<_> = window.into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["a", "b"]);

        assert_eq!(store.delete_by_calendar("work").await.unwrap(), 1);
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_upcoming_skips_finished_events() {
        let store = store().await;
        let now = Utc::now();
        let past = timed("past", to_unix(now - Duration::hours(3)), to_unix(now - Duration::hours(2)));
        let soon = timed("soon", to_unix(now + Duration::hours(1)), to_unix(now + Duration::hours(2)));
        store.put_batch(&[past, soon]).await.unwrap();

        let upcoming = store.upcoming(10).await.unwrap();
        assert_eq!(upcoming.len(), 1);
        assert_eq!(upcoming[0].id, "soon");
    }

    #[tokio::test]
    async fn test_search_matches_location() {
        let store = store().await;
        let mut standup = timed("s", 0, 60);
        standup.location = "Room 4B".to_string();
        store.put_batch(&[standup, timed("t", 100, 200)]).await.unwrap();

        let hits = store.search("room", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "s");
    }

    #[test]
    fn test_all_day_utc_bounds() {
        let when = EventWhen::Date {
            date: NaiveDate::from_ymd_opt(2024, 12, 25).unwrap(),
        };
        assert_eq!(when.start_utc(), Utc.with_ymd_and_hms(2024, 12, 25, 0, 0, 0).unwrap());
        assert_eq!(when.end_utc(), Utc.with_ymd_and_hms(2024, 12, 26, 0, 0, 0).unwrap());
    }
}
