//! Cached contact storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use super::email::push_page;
use super::{
    count_from, effective_limit, ensure_id, from_unix, push_token_filter, to_unix, token_patterns,
};
use crate::{Error, Result};

const COLUMNS: &str = "id, given_name, surname, display_name, email, phone, company, job_title, \
     notes, cached_at";

/// An address book entry mirrored from the remote provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedContact {
    /// Remote contact id.
    pub id: String,
    /// First name.
    pub given_name: String,
    /// Last name.
    pub surname: String,
    /// Preferred display name (may be empty).
    pub display_name: String,
    /// Primary email address.
    pub email: String,
    /// Primary phone number.
    pub phone: String,
    /// Employer.
    pub company: String,
    /// Role at the employer.
    pub job_title: String,
    /// Free-form notes.
    pub notes: String,
    /// When this row was last written.
    pub cached_at: DateTime<Utc>,
}

impl CachedContact {
    /// Creates a contact with an email address and display name.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        email: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            display_name: display_name.into(),
            cached_at: Utc::now(),
            ..Self::default()
        }
    }

    /// Best available human name: display name, then given name and surname,
    /// then the email address.
    #[must_use]
    pub fn name(&self) -> String {
        if !self.display_name.is_empty() {
            return self.display_name.clone();
        }
        let full = format!("{} {}", self.given_name, self.surname);
        let full = full.trim();
        if full.is_empty() {
            self.email.clone()
        } else {
            full.to_string()
        }
    }
}

/// Contact storage for one account.
#[derive(Debug, Clone)]
pub struct ContactStore {
    pool: SqlitePool,
}

impl ContactStore {
    /// Creates a store over an initialized account pool.
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace a contact.
    ///
    /// # Errors
    ///
    /// Returns an error if the contact is malformed or the database query fails.
    pub async fn put(&self, contact: &CachedContact) -> Result<()> {
        ensure_id("contact", &contact.id)?;
        let mut conn = self.pool.acquire().await?;
        upsert(&mut conn, contact).await
    }

    /// Insert or replace many contacts in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BatchItem`] naming the first failing contact.
    pub async fn put_batch(&self, contacts: &[CachedContact]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (index, contact) in contacts.iter().enumerate() {
            let written = match ensure_id("contact", &contact.id) {
                Ok(()) => upsert(&mut tx, contact).await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                return Err(Error::BatchItem {
                    index,
                    id: contact.id.clone(),
                    source: Box::new(e),
                });
            }
        }
        tx.commit().await?;
        Ok(())
    }

    /// Get a contact by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get(&self, id: &str) -> Result<Option<CachedContact>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM contacts WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_contact).transpose()
    }

    /// Get a contact by email address (case-insensitive).
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get_by_email(&self, email: &str) -> Result<Option<CachedContact>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM contacts WHERE email = ? COLLATE NOCASE LIMIT 1"
        ))
        .bind(email.trim())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_contact).transpose()
    }

    /// List contacts by display name, then given name.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn list(&self, limit: u32, offset: u32) -> Result<Vec<CachedContact>> {
        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new(format!(
            "SELECT {COLUMNS} FROM contacts \
             ORDER BY display_name COLLATE NOCASE, given_name COLLATE NOCASE, id"
        ));
        push_page(&mut qb, limit, offset);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_contact).collect()
    }

    /// Free-text search over names, email, company and notes.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn search(&self, query: &str, limit: u32) -> Result<Vec<CachedContact>> {
        let mut qb: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new(format!("SELECT {COLUMNS} FROM contacts WHERE 1 = 1"));
        push_token_filter(
            &mut qb,
            &["display_name", "given_name", "surname", "email", "company", "notes"],
            token_patterns(query),
        );
        qb.push(" ORDER BY display_name COLLATE NOCASE, given_name COLLATE NOCASE LIMIT ")
            .push_bind(effective_limit(limit));

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_contact).collect()
    }

    /// Delete a contact.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM contacts WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Number of cached contacts.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn count(&self) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM contacts")
            .fetch_one(&self.pool)
            .await?;
        Ok(count_from(n))
    }

    /// Ids of every cached contact.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn ids(&self) -> Result<Vec<String>> {
        Ok(sqlx::query_scalar("SELECT id FROM contacts")
            .fetch_all(&self.pool)
            .await?)
    }
}

async fn upsert(conn: &mut sqlx::SqliteConnection, contact: &CachedContact) -> Result<()> {
    sqlx::query(
        r"
        INSERT INTO contacts
            (id, given_name, surname, display_name, email, phone, company, job_title,
             notes, cached_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            given_name = excluded.given_name,
            surname = excluded.surname,
            display_name = excluded.display_name,
            email = excluded.email,
            phone = excluded.phone,
            company = excluded.company,
            job_title = excluded.job_title,
            notes = excluded.notes,
            cached_at = excluded.cached_at
        ",
    )
    .bind(&contact.id)
    .bind(&contact.given_name)
    .bind(&contact.surname)
    .bind(&contact.display_name)
    .bind(contact.email.trim())
    .bind(&contact.phone)
    .bind(&contact.company)
    .bind(&contact.job_title)
    .bind(&contact.notes)
    .bind(to_unix(Utc::now()))
    .execute(conn)
    .await?;
    Ok(())
}

fn row_to_contact(row: &SqliteRow) -> Result<CachedContact> {
    Ok(CachedContact {
        id: row.try_get("id")?,
        given_name: row.try_get("given_name")?,
        surname: row.try_get("surname")?,
        display_name: row.try_get("display_name")?,
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
        company: row.try_get("company")?,
        job_title: row.try_get("job_title")?,
        notes: row.try_get("notes")?,
        cached_at: from_unix(row.try_get("cached_at")?),
    })
}
