//! Calendar conflict detection.

use chrono::{DateTime, Local, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::Serialize;

use crate::store::{CachedEvent, EventStatus, EventWhen};

/// Two events whose busy time overlaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EventConflict<'a> {
    /// The event that comes first in the input.
    pub first: &'a CachedEvent,
    /// The event that comes later in the input.
    pub second: &'a CachedEvent,
}

/// Find every pair of overlapping busy events, treating all-day events as
/// whole days in the local time zone.
#[must_use]
pub fn find_conflicts(events: &[CachedEvent]) -> Vec<EventConflict<'_>> {
    find_conflicts_in(events, &Local)
}

/// Find every pair of overlapping busy events, treating all-day events as
/// whole days in `tz`.
///
/// Cancelled and free events never conflict. Intervals are half-open, so
/// back-to-back events do not conflict. Pairs are reported once, in input
/// order.
#[must_use]
pub fn find_conflicts_in<'a, Tz: TimeZone>(
    events: &'a [CachedEvent],
    tz: &Tz,
) -> Vec<EventConflict<'a>> {
    let busy: Vec<(&CachedEvent, DateTime<Utc>, DateTime<Utc>)> = events
        .iter()
        .filter(|e| e.busy && e.status != EventStatus::Cancelled)
        .map(|e| {
            let (start, end) = interval(e, tz);
            (e, start, end)
        })
        .collect();

    let mut conflicts = Vec::new();
    for (i, &(first, s1, e1)) in busy.iter().enumerate() {
        for &(second, s2, e2) in &busy[i + 1..] {
            if s1 < e2 && s2 < e1 {
                conflicts.push(EventConflict { first, second });
            }
        }
    }
    conflicts
}

fn interval<Tz: TimeZone>(event: &CachedEvent, tz: &Tz) -> (DateTime<Utc>, DateTime<Utc>) {
    match event.when {
        EventWhen::Timespan { start, end } => (start, end),
        EventWhen::Date { .. } | EventWhen::Datespan { .. } => match event.when.date_range() {
            Some((first, after_last)) => (midnight_in(first, tz), midnight_in(after_last, tz)),
            None => (event.when.start_utc(), event.when.end_utc()),
        },
    }
}

/// Start of `date` in `tz`. A midnight skipped by a DST change falls back to
/// UTC midnight.
fn midnight_in<Tz: TimeZone>(date: NaiveDate, tz: &Tz) -> DateTime<Utc> {
    let naive = date.and_time(NaiveTime::default());
    tz.from_local_datetime(&naive)
        .earliest()
        .map_or_else(|| naive.and_utc(), |dt| dt.with_timezone(&Utc))
}
