//! Account database schema.
//!
//! Entity timestamps are unix seconds; sync checkpoints and queue timestamps
//! are unix milliseconds.

use sqlx::SqlitePool;
use tracing::debug;

use crate::Result;

/// Bumped whenever a table is added or changed. Every statement is
/// `IF NOT EXISTS`, so older databases pick up new tables on open.
const SCHEMA_VERSION: i64 = 2;

const TABLES: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS emails (
        id TEXT PRIMARY KEY NOT NULL,
        thread_id TEXT NOT NULL DEFAULT '',
        folder_id TEXT NOT NULL DEFAULT '',
        subject TEXT NOT NULL DEFAULT '',
        snippet TEXT NOT NULL DEFAULT '',
        from_name TEXT NOT NULL DEFAULT '',
        from_email TEXT NOT NULL DEFAULT '',
        to_json TEXT NOT NULL DEFAULT '[]',
        cc_json TEXT NOT NULL DEFAULT '[]',
        bcc_json TEXT NOT NULL DEFAULT '[]',
        date INTEGER NOT NULL,
        unread INTEGER NOT NULL DEFAULT 0,
        starred INTEGER NOT NULL DEFAULT 0,
        has_attachments INTEGER NOT NULL DEFAULT 0,
        body_html TEXT NOT NULL DEFAULT '',
        body_text TEXT NOT NULL DEFAULT '',
        cached_at INTEGER NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS folders (
        id TEXT PRIMARY KEY NOT NULL,
        name TEXT NOT NULL DEFAULT '',
        type TEXT NOT NULL DEFAULT 'other',
        unread_count INTEGER NOT NULL DEFAULT 0,
        total_count INTEGER NOT NULL DEFAULT 0,
        cached_at INTEGER NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS events (
        id TEXT PRIMARY KEY NOT NULL,
        calendar_id TEXT NOT NULL DEFAULT '',
        title TEXT NOT NULL DEFAULT '',
        description TEXT NOT NULL DEFAULT '',
        location TEXT NOT NULL DEFAULT '',
        start_time INTEGER NOT NULL,
        end_time INTEGER NOT NULL,
        start_date TEXT,
        end_date TEXT,
        status TEXT NOT NULL DEFAULT 'confirmed',
        busy INTEGER NOT NULL DEFAULT 1,
        participants_json TEXT NOT NULL DEFAULT '[]',
        cached_at INTEGER NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS contacts (
        id TEXT PRIMARY KEY NOT NULL,
        given_name TEXT NOT NULL DEFAULT '',
        surname TEXT NOT NULL DEFAULT '',
        display_name TEXT NOT NULL DEFAULT '',
        email TEXT NOT NULL DEFAULT '',
        phone TEXT NOT NULL DEFAULT '',
        company TEXT NOT NULL DEFAULT '',
        job_title TEXT NOT NULL DEFAULT '',
        notes TEXT NOT NULL DEFAULT '',
        cached_at INTEGER NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS sync_state (
        resource TEXT PRIMARY KEY NOT NULL,
        last_sync INTEGER NOT NULL,
        cursor TEXT
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS offline_queue (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        type TEXT NOT NULL,
        resource_id TEXT NOT NULL DEFAULT '',
        payload TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS attachments (
        id TEXT PRIMARY KEY NOT NULL,
        email_id TEXT NOT NULL DEFAULT '',
        filename TEXT NOT NULL DEFAULT '',
        content_type TEXT NOT NULL DEFAULT '',
        size INTEGER NOT NULL DEFAULT 0,
        hash TEXT NOT NULL,
        local_path TEXT NOT NULL,
        cached_at INTEGER NOT NULL,
        accessed_at INTEGER NOT NULL
    )
    ",
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_emails_folder ON emails(folder_id)",
    "CREATE INDEX IF NOT EXISTS idx_emails_thread ON emails(thread_id)",
    "CREATE INDEX IF NOT EXISTS idx_emails_date ON emails(date DESC)",
    "CREATE INDEX IF NOT EXISTS idx_emails_unread ON emails(unread) WHERE unread = 1",
    "CREATE INDEX IF NOT EXISTS idx_emails_starred ON emails(starred) WHERE starred = 1",
    "CREATE INDEX IF NOT EXISTS idx_folders_type ON folders(type)",
    "CREATE INDEX IF NOT EXISTS idx_events_calendar ON events(calendar_id)",
    "CREATE INDEX IF NOT EXISTS idx_events_time ON events(start_time, end_time)",
    "CREATE INDEX IF NOT EXISTS idx_contacts_email ON contacts(email COLLATE NOCASE)",
    "CREATE INDEX IF NOT EXISTS idx_contacts_name ON contacts(display_name COLLATE NOCASE)",
    "CREATE INDEX IF NOT EXISTS idx_queue_created ON offline_queue(created_at, id)",
    "CREATE INDEX IF NOT EXISTS idx_attachments_email ON attachments(email_id)",
    "CREATE INDEX IF NOT EXISTS idx_attachments_hash ON attachments(hash)",
    "CREATE INDEX IF NOT EXISTS idx_attachments_accessed ON attachments(accessed_at)",
];

/// Create the account tables if they don't exist.
pub async fn initialize(pool: &SqlitePool) -> Result<()> {
    let version: i64 = sqlx::query_scalar("PRAGMA user_version")
        .fetch_one(pool)
        .await?;
    if version >= SCHEMA_VERSION {
        return Ok(());
    }

    let mut tx = pool.begin().await?;
    for statement in TABLES.iter().chain(INDEXES) {
        sqlx::query(statement).execute(&mut *tx).await?;
    }
    sqlx::query(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    debug!("Initialized cache schema version {}", SCHEMA_VERSION);
    Ok(())
}
