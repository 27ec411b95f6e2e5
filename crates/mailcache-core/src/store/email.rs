//! Cached email storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::debug;

use super::{
    count_from, effective_limit, ensure_id, from_unix, push_token_filter, to_unix, token_patterns,
};
use crate::search::SearchQuery;
use crate::{Error, Result};

const COLUMNS: &str = "id, thread_id, folder_id, subject, snippet, from_name, from_email, \
     to_json, cc_json, bcc_json, date, unread, starred, has_attachments, body_html, body_text, \
     cached_at";

const SEARCH_COLUMNS: &[&str] = &["subject", "snippet", "body_text", "from_name", "from_email"];

/// An email message mirrored from the remote provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedEmail {
    /// Remote message id.
    pub id: String,
    /// Conversation the message belongs to.
    pub thread_id: String,
    /// Folder holding the message.
    pub folder_id: String,
    /// Subject line.
    pub subject: String,
    /// Short preview of the body.
    pub snippet: String,
    /// Sender display name.
    pub from_name: String,
    /// Sender address.
    pub from_email: String,
    /// Recipients.
    pub to: Vec<String>,
    /// Carbon-copy recipients.
    pub cc: Vec<String>,
    /// Blind carbon-copy recipients.
    pub bcc: Vec<String>,
    /// When the message was sent.
    pub date: DateTime<Utc>,
    /// Unread flag.
    pub unread: bool,
    /// Starred flag.
    pub starred: bool,
    /// Whether the message carries attachments.
    pub has_attachments: bool,
    /// HTML body, empty when not fetched.
    pub body_html: String,
    /// Plain text body, empty when not fetched.
    pub body_text: String,
    /// When this row was last written.
    pub cached_at: DateTime<Utc>,
}

impl CachedEmail {
    /// Creates an email with the given id, subject and date.
    #[must_use]
    pub fn new(id: impl Into<String>, subject: impl Into<String>, date: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            subject: subject.into(),
            date,
            cached_at: Utc::now(),
            ..Self::default()
        }
    }

    /// Returns "Name <email>" for the sender, or just the address.
    #[must_use]
    pub fn sender(&self) -> String {
        if self.from_name.is_empty() {
            self.from_email.clone()
        } else {
            format!("{} <{}>", self.from_name, self.from_email)
        }
    }

    fn validate(&self) -> Result<()> {
        ensure_id("email", &self.id)
    }
}

/// Filters for [`EmailStore::list`].
#[derive(Debug, Clone, Default)]
pub struct EmailListOptions {
    /// Only messages in this folder.
    pub folder_id: Option<String>,
    /// Only messages in this thread.
    pub thread_id: Option<String>,
    /// Only unread messages.
    pub unread_only: bool,
    /// Only starred messages.
    pub starred_only: bool,
    /// Only messages sent at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Only messages sent before this instant.
    pub before: Option<DateTime<Utc>>,
    /// Maximum number of rows (0 = unbounded).
    pub limit: u32,
    /// Rows to skip.
    pub offset: u32,
}

/// Email storage for one account.
#[derive(Debug, Clone)]
pub struct EmailStore {
    pool: SqlitePool,
}

impl EmailStore {
    /// Creates a store over an initialized account pool.
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace an email.
    ///
    /// # Errors
    ///
    /// Returns an error if the email is malformed or the database query fails.
    pub async fn put(&self, email: &CachedEmail) -> Result<()> {
        email.validate()?;
        let mut conn = self.pool.acquire().await?;
        upsert(&mut conn, email).await
    }

    /// Insert or replace many emails in one transaction.
    ///
    /// Nothing is written if any email fails.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BatchItem`] naming the first failing email.
    pub async fn put_batch(&self, emails: &[CachedEmail]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (index, email) in emails.iter().enumerate() {
            let written = match email.validate() {
                Ok(()) => upsert(&mut tx, email).await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                return Err(Error::BatchItem {
                    index,
                    id: email.id.clone(),
                    source: Box::new(e),
                });
            }
        }
        tx.commit().await?;
        debug!("Cached {} emails", emails.len());
        Ok(())
    }

    /// Get an email by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get(&self, id: &str) -> Result<Option<CachedEmail>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM emails WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_email).transpose()
    }

    /// List emails newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn list(&self, opts: &EmailListOptions) -> Result<Vec<CachedEmail>> {
        let mut qb: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new(format!("SELECT {COLUMNS} FROM emails WHERE 1 = 1"));
        if let Some(folder_id) = &opts.folder_id {
            qb.push(" AND folder_id = ").push_bind(folder_id.clone());
        }
        if let Some(thread_id) = &opts.thread_id {
            qb.push(" AND thread_id = ").push_bind(thread_id.clone());
        }
        if opts.unread_only {
            qb.push(" AND unread = 1");
        }
        if opts.starred_only {
            qb.push(" AND starred = 1");
        }
        if let Some(since) = opts.since {
            qb.push(" AND date >= ").push_bind(to_unix(since));
        }
        if let Some(before) = opts.before {
            qb.push(" AND date < ").push_bind(to_unix(before));
        }
        qb.push(" ORDER BY date DESC, id");
        push_page(&mut qb, opts.limit, opts.offset);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_email).collect()
    }

    /// Free-text search over subject, snippet, body and sender.
    ///
    /// Every whitespace-separated token must match at least one field.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn search(&self, query: &str, limit: u32) -> Result<Vec<CachedEmail>> {
        let mut qb: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new(format!("SELECT {COLUMNS} FROM emails WHERE 1 = 1"));
        push_token_filter(&mut qb, SEARCH_COLUMNS, token_patterns(query));
        qb.push(" ORDER BY date DESC LIMIT ")
            .push_bind(effective_limit(limit));

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_email).collect()
    }

    /// Search using a parsed operator query (`from:`, `is:unread`, ...).
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn search_with_query(
        &self,
        query: &SearchQuery,
        limit: u32,
    ) -> Result<Vec<CachedEmail>> {
        let mut qb: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new(format!("SELECT {COLUMNS} FROM emails WHERE 1 = 1"));
        push_token_filter(&mut qb, SEARCH_COLUMNS, token_patterns(&query.text));
        if let Some(from) = &query.from {
            push_token_filter(&mut qb, &["from_name", "from_email"], token_patterns(from));
        }
        if let Some(to) = &query.to {
            push_token_filter(&mut qb, &["to_json", "cc_json"], token_patterns(to));
        }
        if let Some(subject) = &query.subject {
            push_token_filter(&mut qb, &["subject"], token_patterns(subject));
        }
        if let Some(folder) = &query.folder {
            qb.push(" AND (folder_id = ")
                .push_bind(folder.clone())
                .push(" OR folder_id IN (SELECT id FROM folders WHERE LOWER(name) = ")
                .push_bind(folder.to_lowercase())
                .push(" OR type = ")
                .push_bind(folder.to_lowercase())
                .push("))");
        }
        if query.has_attachment {
            qb.push(" AND has_attachments = 1");
        }
        if let Some(unread) = query.unread {
            qb.push(" AND unread = ").push_bind(unread);
        }
        if query.starred {
            qb.push(" AND starred = 1");
        }
        if let Some(after) = query.after {
            qb.push(" AND date >= ").push_bind(to_unix(after));
        }
        if let Some(before) = query.before {
            qb.push(" AND date < ").push_bind(to_unix(before));
        }
        qb.push(" ORDER BY date DESC LIMIT ")
            .push_bind(effective_limit(limit));

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_email).collect()
    }

    /// Update the unread and/or starred flags of an email.
    ///
    /// Returns false when the email is not cached.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn update_flags(
        &self,
        id: &str,
        unread: Option<bool>,
        starred: Option<bool>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE emails SET
                unread = COALESCE(?, unread),
                starred = COALESCE(?, starred)
            WHERE id = ?
            ",
        )
        .bind(unread)
        .bind(starred)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete an email.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM emails WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove emails sent before `cutoff`. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM emails WHERE date < ?")
            .bind(to_unix(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Number of cached emails.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn count(&self) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM emails")
            .fetch_one(&self.pool)
            .await?;
        Ok(count_from(n))
    }

    /// Number of unread cached emails.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn count_unread(&self) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM emails WHERE unread = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(count_from(n))
    }
}

/// Append `LIMIT`/`OFFSET` when a limit is set.
pub(super) fn push_page(qb: &mut QueryBuilder<'_, Sqlite>, limit: u32, offset: u32) {
    if limit > 0 {
        qb.push(" LIMIT ").push_bind(limit);
        if offset > 0 {
            qb.push(" OFFSET ").push_bind(offset);
        }
    }
}

async fn upsert(conn: &mut sqlx::SqliteConnection, email: &CachedEmail) -> Result<()> {
    sqlx::query(
        r"
        INSERT INTO emails
            (id, thread_id, folder_id, subject, snippet, from_name, from_email,
             to_json, cc_json, bcc_json, date, unread, starred, has_attachments,
             body_html, body_text, cached_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            thread_id = excluded.thread_id,
            folder_id = excluded.folder_id,
            subject = excluded.subject,
            snippet = excluded.snippet,
            from_name = excluded.from_name,
            from_email = excluded.from_email,
            to_json = excluded.to_json,
            cc_json = excluded.cc_json,
            bcc_json = excluded.bcc_json,
            date = excluded.date,
            unread = excluded.unread,
            starred = excluded.starred,
            has_attachments = excluded.has_attachments,
            body_html = excluded.body_html,
            body_text = excluded.body_text,
            cached_at = excluded.cached_at
        ",
    )
    .bind(&email.id)
    .bind(&email.thread_id)
    .bind(&email.folder_id)
    .bind(&email.subject)
    .bind(&email.snippet)
    .bind(&email.from_name)
    .bind(&email.from_email)
    .bind(serde_json::to_string(&email.to)?)
    .bind(serde_json::to_string(&email.cc)?)
    .bind(serde_json::to_string(&email.bcc)?)
    .bind(to_unix(email.date))
    .bind(email.unread)
    .bind(email.starred)
    .bind(email.has_attachments)
    .bind(&email.body_html)
    .bind(&email.body_text)
    .bind(to_unix(Utc::now()))
    .execute(conn)
    .await?;

    Ok(())
}

fn row_to_email(row: &SqliteRow) -> Result<CachedEmail> {
    let to_json: String = row.try_get("to_json")?;
    let cc_json: String = row.try_get("cc_json")?;
    let bcc_json: String = row.try_get("bcc_json")?;

    Ok(CachedEmail {
        id: row.try_get("id")?,
        thread_id: row.try_get("thread_id")?,
        folder_id: row.try_get("folder_id")?,
        subject: row.try_get("subject")?,
        snippet: row.try_get("snippet")?,
        from_name: row.try_get("from_name")?,
        from_email: row.try_get("from_email")?,
        to: serde_json::from_str(&to_json)?,
        cc: serde_json::from_str(&cc_json)?,
        bcc: serde_json::from_str(&bcc_json)?,
        date: from_unix(row.try_get("date")?),
        unread: row.try_get("unread")?,
        starred: row.try_get("starred")?,
        has_attachments: row.try_get("has_attachments")?,
        body_html: row.try_get("body_html")?,
        body_text: row.try_get("body_text")?,
        cached_at: from_unix(row.try_get("cached_at")?),
    })
}
