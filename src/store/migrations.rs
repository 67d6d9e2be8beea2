//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "initial_schema",
    sql: r#"
        CREATE TABLE IF NOT EXISTS leads (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            email TEXT NOT NULL UNIQUE,
            first_name TEXT,
            last_name TEXT,
            company TEXT,
            status TEXT NOT NULL DEFAULT 'new',
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_leads_status ON leads(status);

        CREATE TABLE IF NOT EXISTS inboxes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE,
            smtp_host TEXT NOT NULL,
            smtp_port INTEGER NOT NULL DEFAULT 587,
            imap_host TEXT NOT NULL,
            imap_port INTEGER NOT NULL DEFAULT 993,
            username TEXT NOT NULL,
            password TEXT NOT NULL,
            max_per_hour INTEGER NOT NULL DEFAULT 5,
            active INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS campaigns (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            inbox_id INTEGER NOT NULL REFERENCES inboxes(id),
            status TEXT NOT NULL DEFAULT 'draft',
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_campaigns_status ON campaigns(status);

        CREATE TABLE IF NOT EXISTS steps (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            campaign_id INTEGER NOT NULL REFERENCES campaigns(id),
            position INTEGER NOT NULL,
            delay_days INTEGER NOT NULL DEFAULT 0,
            subject_template TEXT NOT NULL,
            body_template TEXT NOT NULL,
            UNIQUE (campaign_id, position)
        );

        CREATE TABLE IF NOT EXISTS enrollments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            lead_id INTEGER NOT NULL REFERENCES leads(id),
            campaign_id INTEGER NOT NULL REFERENCES campaigns(id),
            current_step INTEGER NOT NULL DEFAULT -1,
            created_at TEXT NOT NULL,
            last_sent_at TEXT,
            halted INTEGER NOT NULL DEFAULT 0,
            halted_reason TEXT,
            UNIQUE (lead_id, campaign_id)
        );
        CREATE INDEX IF NOT EXISTS idx_enrollments_campaign ON enrollments(campaign_id);
        CREATE INDEX IF NOT EXISTS idx_enrollments_lead ON enrollments(lead_id);

        CREATE TABLE IF NOT EXISTS sent_emails (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            enrollment_id INTEGER NOT NULL REFERENCES enrollments(id),
            lead_id INTEGER NOT NULL REFERENCES leads(id),
            campaign_id INTEGER NOT NULL REFERENCES campaigns(id),
            inbox_id INTEGER NOT NULL REFERENCES inboxes(id),
            step_index INTEGER NOT NULL,
            tracking_id TEXT NOT NULL UNIQUE,
            subject TEXT NOT NULL,
            sent_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_sent_emails_inbox_time ON sent_emails(inbox_id, sent_at);
        CREATE INDEX IF NOT EXISTS idx_sent_emails_tracking ON sent_emails(tracking_id);
        CREATE INDEX IF NOT EXISTS idx_sent_emails_campaign ON sent_emails(campaign_id);

        CREATE TABLE IF NOT EXISTS responses (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            lead_id INTEGER REFERENCES leads(id),
            enrollment_id INTEGER REFERENCES enrollments(id),
            sent_email_id INTEGER REFERENCES sent_emails(id),
            message_id TEXT NOT NULL UNIQUE,
            subject TEXT NOT NULL DEFAULT '',
            body TEXT NOT NULL DEFAULT '',
            received_at TEXT NOT NULL,
            intent TEXT,
            confidence REAL,
            draft_reply TEXT,
            reply_sent INTEGER NOT NULL DEFAULT 0,
            needs_review INTEGER NOT NULL DEFAULT 0,
            reviewed INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_responses_reviewed ON responses(reviewed);
        CREATE INDEX IF NOT EXISTS idx_responses_lead ON responses(lead_id);
        CREATE INDEX IF NOT EXISTS idx_responses_message_id ON responses(message_id);

        CREATE TABLE IF NOT EXISTS poll_checkpoints (
            inbox_id INTEGER PRIMARY KEY REFERENCES inboxes(id),
            last_received_at TEXT NOT NULL
        );
    "#,
}];

/// Apply all migrations newer than the stored schema version.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current = current_version(conn).await?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applying migration"
        );

        conn.execute_batch(migration.sql)
            .await
            .map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration {} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;

        conn.execute(
            "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
            libsql::params![migration.version, migration.name],
        )
        .await
        .map_err(|e| {
            DatabaseError::Migration(format!(
                "Failed to record migration {}: {e}",
                migration.version
            ))
        })?;
    }

    Ok(())
}

async fn current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read schema version: {e}")))?;

    match rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(e.to_string()))?
    {
        Some(row) => row
            .get::<i64>(0)
            .map_err(|e| DatabaseError::Migration(e.to_string())),
        None => Ok(0),
    }
}
