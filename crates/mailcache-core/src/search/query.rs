//! Gmail-style search operators.
//!
//! `SearchQuery::parse("from:alice is:unread after:7d budget")` splits a
//! search box string into structured filters plus the remaining free text.
//! Unknown operators are kept as free text.

use chrono::{DateTime, Datelike, Days, Months, NaiveDate, NaiveTime, Utc};

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%b %d, %Y", "%B %d, %Y"];

/// A parsed search string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchQuery {
    /// Free text left after removing operators.
    pub text: String,
    /// `from:` sender filter.
    pub from: Option<String>,
    /// `to:` recipient filter.
    pub to: Option<String>,
    /// `subject:` filter.
    pub subject: Option<String>,
    /// `in:` folder id, name or type.
    pub folder: Option<String>,
    /// `has:attachment`.
    pub has_attachment: bool,
    /// `is:unread` (`Some(true)`) or `is:read` (`Some(false)`).
    pub unread: Option<bool>,
    /// `is:starred`.
    pub starred: bool,
    /// `after:` lower bound on the message date.
    pub after: Option<DateTime<Utc>>,
    /// `before:` upper bound on the message date.
    pub before: Option<DateTime<Utc>>,
}

impl SearchQuery {
    /// Parse a search string, resolving relative dates against now.
    #[must_use]
    pub fn parse(input: &str) -> Self {
        Self::parse_at(input, Utc::now())
    }

    /// Parse a search string, resolving relative dates against `now`.
    #[must_use]
    pub fn parse_at(input: &str, now: DateTime<Utc>) -> Self {
        let mut query = Self::default();
        let mut words = Vec::new();

        for token in tokenize(input) {
            if !query.apply_operator(&token, now) {
                words.push(token);
            }
        }

        query.text = words.join(" ");
        query
    }

    /// Whether the query has no free text and no filters.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn apply_operator(&mut self, token: &str, now: DateTime<Utc>) -> bool {
        let Some((op, value)) = token.split_once(':') else {
            return false;
        };
        if value.is_empty() {
            return false;
        }

        match op.to_lowercase().as_str() {
            "from" => self.from = Some(value.to_string()),
            "to" => self.to = Some(value.to_string()),
            "subject" => self.subject = Some(value.to_string()),
            "in" => self.folder = Some(value.to_string()),
            "has" if value.eq_ignore_ascii_case("attachment")
                || value.eq_ignore_ascii_case("attachments") =>
            {
                self.has_attachment = true;
            }
            "is" => match value.to_lowercase().as_str() {
                "unread" => self.unread = Some(true),
                "read" => self.unread = Some(false),
                "starred" => self.starred = true,
                _ => return false,
            },
            "after" => match parse_date(value, now) {
                Some(date) => self.after = Some(date),
                None => return false,
            },
            "before" => match parse_date(value, now) {
                Some(date) => self.before = Some(date),
                None => return false,
            },
            _ => return false,
        }
        true
    }
}

/// Split on whitespace, keeping double-quoted runs together and dropping the
/// quote characters.
fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in input.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::default()).and_utc()
}

/// Absolute dates in a few common formats, or relative ones: `today`,
/// `yesterday`, `week`, `month`, `Nd`, `Nw`, `Nm`.
fn parse_date(value: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            return Some(midnight(date));
        }
    }

    let today = now.date_naive();
    let lower = value.to_lowercase();
    match lower.as_str() {
        "today" => return Some(midnight(today)),
        "yesterday" => return today.checked_sub_days(Days::new(1)).map(midnight),
        "week" | "thisweek" | "this-week" => {
            let since_sunday = u64::from(today.weekday().num_days_from_sunday());
            return today.checked_sub_days(Days::new(since_sunday)).map(midnight);
        }
        "month" | "thismonth" | "this-month" => return today.with_day(1).map(midnight),
        _ => {}
    }

    let unit = lower.chars().last()?;
    let amount: u32 = lower[..lower.len() - unit.len_utf8()].parse().ok()?;
    match unit {
        'd' => now.checked_sub_days(Days::new(u64::from(amount))),
        'w' => now.checked_sub_days(Days::new(u64::from(amount) * 7)),
        'm' => now.checked_sub_months(Months::new(amount)),
        _ => None,
    }
}
