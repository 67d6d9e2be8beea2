//! libSQL backend — async `Store` trait implementation.
//!
//! Supports local file and in-memory databases. A single connection is
//! reused for all operations; `libsql::Connection` is `Send + Sync` and
//! safe for concurrent async use.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use libsql::{params, Connection, Database as LibSqlDatabase};
use secrecy::{ExposeSecret, SecretString};
use tracing::info;

use crate::error::DatabaseError;
use crate::model::{
    Campaign, CampaignStatus, Enrollment, HaltReason, Inbox, Intent, Lead, LeadStatus, NewLead,
    NewResponse, NewSentEmail, ResponseRecord, SentEmail, Step,
};
use crate::store::migrations;
use crate::store::traits::{InsertOutcome, Store};

/// libSQL store backend.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Open(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Open(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Open(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(&store.conn).await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| DatabaseError::Open(format!("Failed to create in-memory database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Open(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(&store.conn).await?;
        Ok(store)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn query_err(e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(e.to_string())
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn fmt_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

const LEAD_COLUMNS: &str = "id, email, first_name, last_name, company, status, created_at";

fn row_to_lead(row: &libsql::Row) -> Result<Lead, libsql::Error> {
    Ok(Lead {
        id: row.get(0)?,
        email: row.get(1)?,
        first_name: row.get::<String>(2).ok().filter(|s| !s.is_empty()),
        last_name: row.get::<String>(3).ok().filter(|s| !s.is_empty()),
        company: row.get::<String>(4).ok().filter(|s| !s.is_empty()),
        status: LeadStatus::parse(&row.get::<String>(5)?),
        created_at: parse_datetime(&row.get::<String>(6)?),
    })
}

const INBOX_COLUMNS: &str =
    "id, name, email, smtp_host, smtp_port, imap_host, imap_port, username, password, \
     max_per_hour, active";

fn row_to_inbox(row: &libsql::Row) -> Result<Inbox, libsql::Error> {
    Ok(Inbox {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        smtp_host: row.get(3)?,
        smtp_port: row.get::<i64>(4)? as u16,
        imap_host: row.get(5)?,
        imap_port: row.get::<i64>(6)? as u16,
        username: row.get(7)?,
        password: SecretString::from(row.get::<String>(8)?),
        max_per_hour: row.get::<i64>(9)? as u32,
        active: row.get::<i64>(10)? != 0,
    })
}

const CAMPAIGN_COLUMNS: &str = "id, name, inbox_id, status, created_at";

fn row_to_campaign(row: &libsql::Row) -> Result<Campaign, libsql::Error> {
    Ok(Campaign {
        id: row.get(0)?,
        name: row.get(1)?,
        inbox_id: row.get(2)?,
        status: CampaignStatus::parse(&row.get::<String>(3)?),
        created_at: parse_datetime(&row.get::<String>(4)?),
    })
}

const STEP_COLUMNS: &str =
    "id, campaign_id, position, delay_days, subject_template, body_template";

fn row_to_step(row: &libsql::Row) -> Result<Step, libsql::Error> {
    Ok(Step {
        id: row.get(0)?,
        campaign_id: row.get(1)?,
        position: row.get(2)?,
        delay_days: row.get(3)?,
        subject_template: row.get(4)?,
        body_template: row.get(5)?,
    })
}

const ENROLLMENT_COLUMNS: &str =
    "id, lead_id, campaign_id, current_step, created_at, last_sent_at, halted, halted_reason";

fn row_to_enrollment(row: &libsql::Row) -> Result<Enrollment, libsql::Error> {
    Ok(Enrollment {
        id: row.get(0)?,
        lead_id: row.get(1)?,
        campaign_id: row.get(2)?,
        current_step: row.get(3)?,
        created_at: parse_datetime(&row.get::<String>(4)?),
        last_sent_at: row.get::<String>(5).ok().map(|s| parse_datetime(&s)),
        halted: row.get::<i64>(6)? != 0,
        halted_reason: row
            .get::<String>(7)
            .ok()
            .as_deref()
            .and_then(HaltReason::parse),
    })
}

const SENT_COLUMNS: &str =
    "id, enrollment_id, lead_id, campaign_id, inbox_id, step_index, tracking_id, subject, sent_at";

fn row_to_sent(row: &libsql::Row) -> Result<SentEmail, libsql::Error> {
    Ok(SentEmail {
        id: row.get(0)?,
        enrollment_id: row.get(1)?,
        lead_id: row.get(2)?,
        campaign_id: row.get(3)?,
        inbox_id: row.get(4)?,
        step_index: row.get(5)?,
        tracking_id: row.get(6)?,
        subject: row.get(7)?,
        sent_at: parse_datetime(&row.get::<String>(8)?),
    })
}

const RESPONSE_COLUMNS: &str =
    "id, lead_id, enrollment_id, sent_email_id, message_id, subject, body, received_at, \
     intent, confidence, draft_reply, reply_sent, needs_review, reviewed";

fn row_to_response(row: &libsql::Row) -> Result<ResponseRecord, libsql::Error> {
    Ok(ResponseRecord {
        id: row.get(0)?,
        lead_id: row.get::<i64>(1).ok(),
        enrollment_id: row.get::<i64>(2).ok(),
        sent_email_id: row.get::<i64>(3).ok(),
        message_id: row.get(4)?,
        subject: row.get(5)?,
        body: row.get(6)?,
        received_at: parse_datetime(&row.get::<String>(7)?),
        intent: row.get::<String>(8).ok().as_deref().and_then(Intent::parse),
        confidence: row.get::<f64>(9).ok(),
        draft_reply: row.get::<String>(10).ok(),
        reply_sent: row.get::<i64>(11)? != 0,
        needs_review: row.get::<i64>(12)? != 0,
        reviewed: row.get::<i64>(13)? != 0,
    })
}

// ── Store impl ──────────────────────────────────────────────────────

#[async_trait]
impl Store for LibSqlStore {
    // ── Leads ───────────────────────────────────────────────────────

    async fn insert_lead(&self, lead: &NewLead) -> Result<Lead, DatabaseError> {
        let created_at = Utc::now();
        self.conn()
            .execute(
                "INSERT INTO leads (email, first_name, last_name, company, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, 'new', ?5)",
                params![
                    lead.email.clone(),
                    lead.first_name.clone(),
                    lead.last_name.clone(),
                    lead.company.clone(),
                    fmt_datetime(created_at)
                ],
            )
            .await
            .map_err(|e| match e {
                libsql::Error::SqliteFailure(_, ref msg) if msg.contains("UNIQUE") => {
                    DatabaseError::Constraint(format!("lead {} already exists", lead.email))
                }
                other => query_err(other),
            })?;

        self.get_lead(self.conn().last_insert_rowid()).await
    }

    async fn get_lead(&self, id: i64) -> Result<Lead, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => row_to_lead(&row).map_err(query_err),
            None => Err(DatabaseError::NotFound {
                entity: "lead",
                id: id.to_string(),
            }),
        }
    }

    async fn get_lead_by_email(&self, email: &str) -> Result<Option<Lead>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE email = ?1"),
                params![email],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_lead(&row).map_err(query_err)?)),
            None => Ok(None),
        }
    }

    async fn set_lead_status(&self, id: i64, status: LeadStatus) -> Result<(), DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE leads SET status = ?2 WHERE id = ?1",
                params![id, status.as_str()],
            )
            .await
            .map_err(query_err)?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "lead",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn mark_lead_responded(&self, id: i64) -> Result<(), DatabaseError> {
        // Single guarded UPDATE keeps the read-then-write atomic.
        self.conn()
            .execute(
                "UPDATE leads SET status = 'responded'
                 WHERE id = ?1 AND status NOT IN ('meeting_booked', 'unsubscribed')",
                params![id],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn lead_counts_by_status(&self) -> Result<Vec<(LeadStatus, i64)>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT status, COUNT(*) FROM leads GROUP BY status",
                (),
            )
            .await
            .map_err(query_err)?;
        let mut counts = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            let status: String = row.get(0).map_err(query_err)?;
            let count: i64 = row.get(1).map_err(query_err)?;
            counts.push((LeadStatus::parse(&status), count));
        }
        Ok(counts)
    }

    // ── Inboxes ─────────────────────────────────────────────────────

    async fn insert_inbox(&self, inbox: &Inbox) -> Result<Inbox, DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO inboxes
                   (name, email, smtp_host, smtp_port, imap_host, imap_port,
                    username, password, max_per_hour, active)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    inbox.name.clone(),
                    inbox.email.clone(),
                    inbox.smtp_host.clone(),
                    i64::from(inbox.smtp_port),
                    inbox.imap_host.clone(),
                    i64::from(inbox.imap_port),
                    inbox.username.clone(),
                    inbox.password.expose_secret().to_string(),
                    i64::from(inbox.max_per_hour),
                    i64::from(inbox.active)
                ],
            )
            .await
            .map_err(query_err)?;
        self.get_inbox(self.conn().last_insert_rowid()).await
    }

    async fn get_inbox(&self, id: i64) -> Result<Inbox, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {INBOX_COLUMNS} FROM inboxes WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => row_to_inbox(&row).map_err(query_err),
            None => Err(DatabaseError::NotFound {
                entity: "inbox",
                id: id.to_string(),
            }),
        }
    }

    async fn active_inboxes(&self) -> Result<Vec<Inbox>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {INBOX_COLUMNS} FROM inboxes WHERE active = 1 ORDER BY id"),
                (),
            )
            .await
            .map_err(query_err)?;
        let mut inboxes = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            inboxes.push(row_to_inbox(&row).map_err(query_err)?);
        }
        Ok(inboxes)
    }

    // ── Campaigns & steps ───────────────────────────────────────────

    async fn insert_campaign(&self, name: &str, inbox_id: i64) -> Result<Campaign, DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO campaigns (name, inbox_id, status, created_at)
                 VALUES (?1, ?2, 'draft', ?3)",
                params![name, inbox_id, fmt_datetime(Utc::now())],
            )
            .await
            .map_err(query_err)?;
        self.get_campaign(self.conn().last_insert_rowid()).await
    }

    async fn get_campaign(&self, id: i64) -> Result<Campaign, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => row_to_campaign(&row).map_err(query_err),
            None => Err(DatabaseError::NotFound {
                entity: "campaign",
                id: id.to_string(),
            }),
        }
    }

    async fn set_campaign_status(
        &self,
        id: i64,
        status: CampaignStatus,
    ) -> Result<(), DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE campaigns SET status = ?2 WHERE id = ?1",
                params![id, status.as_str()],
            )
            .await
            .map_err(query_err)?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "campaign",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn campaigns(&self) -> Result<Vec<Campaign>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns ORDER BY id"),
                (),
            )
            .await
            .map_err(query_err)?;
        let mut campaigns = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            campaigns.push(row_to_campaign(&row).map_err(query_err)?);
        }
        Ok(campaigns)
    }

    async fn active_campaigns(&self) -> Result<Vec<Campaign>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE status = 'active' ORDER BY id"
                ),
                (),
            )
            .await
            .map_err(query_err)?;
        let mut campaigns = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            campaigns.push(row_to_campaign(&row).map_err(query_err)?);
        }
        Ok(campaigns)
    }

    async fn append_step(
        &self,
        campaign_id: i64,
        delay_days: i64,
        subject_template: &str,
        body_template: &str,
    ) -> Result<Step, DatabaseError> {
        // Position is derived from the current tail so steps stay append-only.
        self.get_campaign(campaign_id).await?;
        self.conn()
            .execute(
                "INSERT INTO steps (campaign_id, position, delay_days, subject_template, body_template)
                 SELECT ?1, COALESCE(MAX(position) + 1, 0), ?2, ?3, ?4
                 FROM steps WHERE campaign_id = ?1",
                params![campaign_id, delay_days, subject_template, body_template],
            )
            .await
            .map_err(query_err)?;

        let id = self.conn().last_insert_rowid();
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {STEP_COLUMNS} FROM steps WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => row_to_step(&row).map_err(query_err),
            None => Err(DatabaseError::NotFound {
                entity: "step",
                id: id.to_string(),
            }),
        }
    }

    async fn campaign_steps(&self, campaign_id: i64) -> Result<Vec<Step>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {STEP_COLUMNS} FROM steps WHERE campaign_id = ?1 ORDER BY position"
                ),
                params![campaign_id],
            )
            .await
            .map_err(query_err)?;
        let mut steps = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            steps.push(row_to_step(&row).map_err(query_err)?);
        }
        Ok(steps)
    }

    // ── Enrollments ─────────────────────────────────────────────────

    async fn enroll(&self, lead_id: i64, campaign_id: i64) -> Result<Enrollment, DatabaseError> {
        self.get_lead(lead_id).await?;
        self.get_campaign(campaign_id).await?;
        self.conn()
            .execute(
                "INSERT INTO enrollments (lead_id, campaign_id, current_step, created_at)
                 VALUES (?1, ?2, -1, ?3)",
                params![lead_id, campaign_id, fmt_datetime(Utc::now())],
            )
            .await
            .map_err(|e| match e {
                libsql::Error::SqliteFailure(_, ref msg) if msg.contains("UNIQUE") => {
                    DatabaseError::Constraint(format!(
                        "lead {lead_id} already enrolled in campaign {campaign_id}"
                    ))
                }
                other => query_err(other),
            })?;
        self.get_enrollment(self.conn().last_insert_rowid()).await
    }

    async fn get_enrollment(&self, id: i64) -> Result<Enrollment, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {ENROLLMENT_COLUMNS} FROM enrollments WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => row_to_enrollment(&row).map_err(query_err),
            None => Err(DatabaseError::NotFound {
                entity: "enrollment",
                id: id.to_string(),
            }),
        }
    }

    async fn enrollments_for_campaign(
        &self,
        campaign_id: i64,
    ) -> Result<Vec<Enrollment>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ENROLLMENT_COLUMNS} FROM enrollments
                     WHERE campaign_id = ?1 ORDER BY id"
                ),
                params![campaign_id],
            )
            .await
            .map_err(query_err)?;
        let mut enrollments = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            enrollments.push(row_to_enrollment(&row).map_err(query_err)?);
        }
        Ok(enrollments)
    }

    async fn enrollments_for_lead(&self, lead_id: i64) -> Result<Vec<Enrollment>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ENROLLMENT_COLUMNS} FROM enrollments WHERE lead_id = ?1 ORDER BY id"
                ),
                params![lead_id],
            )
            .await
            .map_err(query_err)?;
        let mut enrollments = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            enrollments.push(row_to_enrollment(&row).map_err(query_err)?);
        }
        Ok(enrollments)
    }

    async fn due_enrollments(
        &self,
        campaign_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<Enrollment>, DatabaseError> {
        let steps = self.campaign_steps(campaign_id).await?;
        if steps.is_empty() {
            // Distinguish "no steps" from "no such campaign".
            self.get_campaign(campaign_id).await?;
            return Ok(Vec::new());
        }
        let step_count = steps.len() as i64;

        let enrollments = self.enrollments_for_campaign(campaign_id).await?;
        let due = enrollments
            .into_iter()
            .filter(|e| {
                if e.halted || e.current_step + 1 >= step_count {
                    return false;
                }
                let next = &steps[(e.current_step + 1) as usize];
                now >= e.created_at + Duration::days(next.delay_days)
            })
            .collect();
        Ok(due)
    }

    async fn halt_enrollment(&self, id: i64, reason: HaltReason) -> Result<(), DatabaseError> {
        self.get_enrollment(id).await?;
        // No-op when already halted; the original reason wins.
        self.conn()
            .execute(
                "UPDATE enrollments SET halted = 1, halted_reason = ?2
                 WHERE id = ?1 AND halted = 0",
                params![id, reason.as_str()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn halt_enrollments_for_lead(
        &self,
        lead_id: i64,
        reason: HaltReason,
    ) -> Result<usize, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE enrollments SET halted = 1, halted_reason = ?2
                 WHERE lead_id = ?1 AND halted = 0",
                params![lead_id, reason.as_str()],
            )
            .await
            .map_err(query_err)?;
        Ok(changed as usize)
    }

    // ── Sent mail ───────────────────────────────────────────────────

    async fn record_send(&self, sent: &NewSentEmail) -> Result<SentEmail, DatabaseError> {
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(query_err)?;

        tx.execute(
            "INSERT INTO sent_emails
               (enrollment_id, lead_id, campaign_id, inbox_id, step_index,
                tracking_id, subject, sent_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                sent.enrollment_id,
                sent.lead_id,
                sent.campaign_id,
                sent.inbox_id,
                sent.step_index,
                sent.tracking_id.clone(),
                sent.subject.clone(),
                fmt_datetime(sent.sent_at)
            ],
        )
        .await
        .map_err(query_err)?;
        let id = tx.last_insert_rowid();

        // Forward-only advancement; a stale or repeated commit cannot move
        // the step backwards.
        let advanced = tx
            .execute(
                "UPDATE enrollments SET current_step = ?2, last_sent_at = ?3
                 WHERE id = ?1 AND current_step < ?2",
                params![
                    sent.enrollment_id,
                    sent.step_index,
                    fmt_datetime(sent.sent_at)
                ],
            )
            .await
            .map_err(query_err)?;
        if advanced == 0 {
            tx.rollback().await.map_err(query_err)?;
            return Err(DatabaseError::Constraint(format!(
                "enrollment {} already at or past step {}",
                sent.enrollment_id, sent.step_index
            )));
        }

        tx.commit().await.map_err(query_err)?;

        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SENT_COLUMNS} FROM sent_emails WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => row_to_sent(&row).map_err(query_err),
            None => Err(DatabaseError::NotFound {
                entity: "sent_email",
                id: id.to_string(),
            }),
        }
    }

    async fn record_reply_send(&self, sent: &NewSentEmail) -> Result<SentEmail, DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO sent_emails
                   (enrollment_id, lead_id, campaign_id, inbox_id, step_index,
                    tracking_id, subject, sent_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    sent.enrollment_id,
                    sent.lead_id,
                    sent.campaign_id,
                    sent.inbox_id,
                    sent.step_index,
                    sent.tracking_id.clone(),
                    sent.subject.clone(),
                    fmt_datetime(sent.sent_at)
                ],
            )
            .await
            .map_err(query_err)?;

        let id = self.conn().last_insert_rowid();
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SENT_COLUMNS} FROM sent_emails WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => row_to_sent(&row).map_err(query_err),
            None => Err(DatabaseError::NotFound {
                entity: "sent_email",
                id: id.to_string(),
            }),
        }
    }

    async fn get_sent_email(&self, id: i64) -> Result<SentEmail, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SENT_COLUMNS} FROM sent_emails WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => row_to_sent(&row).map_err(query_err),
            None => Err(DatabaseError::NotFound {
                entity: "sent_email",
                id: id.to_string(),
            }),
        }
    }

    async fn find_sent_by_tracking_id(
        &self,
        tracking_id: &str,
    ) -> Result<Option<SentEmail>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SENT_COLUMNS} FROM sent_emails WHERE tracking_id = ?1"),
                params![tracking_id],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_sent(&row).map_err(query_err)?)),
            None => Ok(None),
        }
    }

    async fn sent_count_since(
        &self,
        inbox_id: i64,
        since: DateTime<Utc>,
    ) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM sent_emails WHERE inbox_id = ?1 AND sent_at >= ?2",
                params![inbox_id, fmt_datetime(since)],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => row.get(0).map_err(query_err),
            None => Ok(0),
        }
    }

    async fn total_sent_since(&self, since: DateTime<Utc>) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM sent_emails WHERE sent_at >= ?1",
                params![fmt_datetime(since)],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => row.get(0).map_err(query_err),
            None => Ok(0),
        }
    }

    // ── Responses ───────────────────────────────────────────────────

    async fn insert_response(&self, resp: &NewResponse) -> Result<InsertOutcome, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO responses
                   (lead_id, enrollment_id, sent_email_id, message_id, subject, body, received_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    resp.lead_id,
                    resp.enrollment_id,
                    resp.sent_email_id,
                    resp.message_id.clone(),
                    resp.subject.clone(),
                    resp.body.clone(),
                    fmt_datetime(resp.received_at)
                ],
            )
            .await
            .map_err(query_err)?;

        if changed == 0 {
            Ok(InsertOutcome::Duplicate)
        } else {
            Ok(InsertOutcome::Inserted(self.conn().last_insert_rowid()))
        }
    }

    async fn get_response(&self, id: i64) -> Result<ResponseRecord, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {RESPONSE_COLUMNS} FROM responses WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => row_to_response(&row).map_err(query_err),
            None => Err(DatabaseError::NotFound {
                entity: "response",
                id: id.to_string(),
            }),
        }
    }

    async fn pending_responses(&self) -> Result<Vec<ResponseRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RESPONSE_COLUMNS} FROM responses
                     WHERE reviewed = 0 AND lead_id IS NOT NULL ORDER BY id"
                ),
                (),
            )
            .await
            .map_err(query_err)?;
        let mut responses = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            responses.push(row_to_response(&row).map_err(query_err)?);
        }
        Ok(responses)
    }

    async fn set_classification(
        &self,
        id: i64,
        intent: Intent,
        confidence: f64,
    ) -> Result<(), DatabaseError> {
        // Write-once: an existing classification is never overwritten.
        let changed = self
            .conn()
            .execute(
                "UPDATE responses SET intent = ?2, confidence = ?3
                 WHERE id = ?1 AND intent IS NULL",
                params![id, intent.as_str(), confidence],
            )
            .await
            .map_err(query_err)?;
        if changed == 0 {
            self.get_response(id).await?;
        }
        Ok(())
    }

    async fn finish_review(
        &self,
        id: i64,
        draft_reply: Option<&str>,
        reply_sent: bool,
        needs_review: bool,
    ) -> Result<(), DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE responses
                 SET draft_reply = COALESCE(?2, draft_reply),
                     reply_sent = ?3,
                     needs_review = ?4,
                     reviewed = 1
                 WHERE id = ?1",
                params![
                    id,
                    draft_reply.map(str::to_string),
                    i64::from(reply_sent),
                    i64::from(needs_review)
                ],
            )
            .await
            .map_err(query_err)?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "response",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn list_responses(
        &self,
        needs_review: Option<bool>,
        unmatched: Option<bool>,
        limit: i64,
    ) -> Result<Vec<ResponseRecord>, DatabaseError> {
        let mut sql = format!("SELECT {RESPONSE_COLUMNS} FROM responses WHERE 1 = 1");
        if let Some(flag) = needs_review {
            sql.push_str(if flag {
                " AND needs_review = 1"
            } else {
                " AND needs_review = 0"
            });
        }
        if let Some(flag) = unmatched {
            sql.push_str(if flag {
                " AND lead_id IS NULL"
            } else {
                " AND lead_id IS NOT NULL"
            });
        }
        sql.push_str(" ORDER BY received_at DESC LIMIT ?1");

        let mut rows = self
            .conn()
            .query(&sql, params![limit])
            .await
            .map_err(query_err)?;
        let mut responses = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            responses.push(row_to_response(&row).map_err(query_err)?);
        }
        Ok(responses)
    }

    async fn response_count(&self) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT COUNT(*) FROM responses", ())
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => row.get(0).map_err(query_err),
            None => Ok(0),
        }
    }

    async fn response_count_for_campaign(&self, campaign_id: i64) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM responses r
                 JOIN enrollments e ON r.enrollment_id = e.id
                 WHERE e.campaign_id = ?1",
                params![campaign_id],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => row.get(0).map_err(query_err),
            None => Ok(0),
        }
    }

    async fn sent_count_for_campaign(&self, campaign_id: i64) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM sent_emails WHERE campaign_id = ?1",
                params![campaign_id],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => row.get(0).map_err(query_err),
            None => Ok(0),
        }
    }

    // ── Poll checkpoints ────────────────────────────────────────────

    async fn get_checkpoint(&self, inbox_id: i64) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT last_received_at FROM poll_checkpoints WHERE inbox_id = ?1",
                params![inbox_id],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => {
                let raw: String = row.get(0).map_err(query_err)?;
                Ok(Some(parse_datetime(&raw)))
            }
            None => Ok(None),
        }
    }

    async fn advance_checkpoint(
        &self,
        inbox_id: i64,
        up_to: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        // MAX on RFC 3339 strings is chronological because the format is
        // fixed-width UTC.
        self.conn()
            .execute(
                "INSERT INTO poll_checkpoints (inbox_id, last_received_at) VALUES (?1, ?2)
                 ON CONFLICT (inbox_id) DO UPDATE
                 SET last_received_at = MAX(last_received_at, excluded.last_received_at)",
                params![inbox_id, fmt_datetime(up_to)],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_fixtures::{sample_inbox, sample_lead};

    async fn store() -> LibSqlStore {
        LibSqlStore::new_memory().await.expect("in-memory store")
    }

    async fn seed_campaign(store: &LibSqlStore) -> (Lead, Campaign, Enrollment) {
        let inbox = store.insert_inbox(&sample_inbox()).await.unwrap();
        let lead = store.insert_lead(&sample_lead("katie@example.com")).await.unwrap();
        let campaign = store.insert_campaign("Spring outreach", inbox.id).await.unwrap();
        store
            .append_step(campaign.id, 0, "Intro {firstName}", "Hello {firstName|there}")
            .await
            .unwrap();
        store
            .append_step(campaign.id, 3, "Following up", "Bumping this {firstName}")
            .await
            .unwrap();
        let enrollment = store.enroll(lead.id, campaign.id).await.unwrap();
        (lead, campaign, enrollment)
    }

    #[tokio::test]
    async fn local_database_persists_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("crm.db");
        {
            let store = LibSqlStore::new_local(&path).await.unwrap();
            store.insert_lead(&sample_lead("a@b.com")).await.unwrap();
        }
        let store = LibSqlStore::new_local(&path).await.unwrap();
        assert!(store.get_lead_by_email("a@b.com").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn lead_round_trip() {
        let store = store().await;
        let lead = store.insert_lead(&sample_lead("a@b.com")).await.unwrap();
        assert_eq!(lead.status, LeadStatus::New);
        let fetched = store.get_lead(lead.id).await.unwrap();
        assert_eq!(fetched.email, "a@b.com");
        assert!(store.get_lead_by_email("missing@b.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_lead_email_is_a_constraint_error() {
        let store = store().await;
        store.insert_lead(&sample_lead("a@b.com")).await.unwrap();
        let err = store.insert_lead(&sample_lead("a@b.com")).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));
    }

    #[tokio::test]
    async fn get_missing_lead_is_not_found() {
        let store = store().await;
        let err = store.get_lead(999).await.unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { entity: "lead", .. }));
    }

    #[tokio::test]
    async fn responded_does_not_overwrite_terminal_status() {
        let store = store().await;
        let lead = store.insert_lead(&sample_lead("a@b.com")).await.unwrap();
        store
            .set_lead_status(lead.id, LeadStatus::MeetingBooked)
            .await
            .unwrap();
        store.mark_lead_responded(lead.id).await.unwrap();
        let fetched = store.get_lead(lead.id).await.unwrap();
        assert_eq!(fetched.status, LeadStatus::MeetingBooked);
    }

    #[tokio::test]
    async fn steps_append_with_increasing_positions() {
        let store = store().await;
        let (_, campaign, _) = seed_campaign(&store).await;
        let steps = store.campaign_steps(campaign.id).await.unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].position, 0);
        assert_eq!(steps[1].position, 1);
        assert_eq!(steps[1].delay_days, 3);
    }

    #[tokio::test]
    async fn fresh_enrollment_is_immediately_due_for_step_zero() {
        let store = store().await;
        let (_, campaign, enrollment) = seed_campaign(&store).await;
        let due = store.due_enrollments(campaign.id, Utc::now()).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, enrollment.id);
        assert_eq!(due[0].current_step, -1);
    }

    #[tokio::test]
    async fn delayed_step_not_due_until_offset_from_enrollment() {
        let store = store().await;
        let (lead, campaign, enrollment) = seed_campaign(&store).await;

        store
            .record_send(&NewSentEmail {
                enrollment_id: enrollment.id,
                lead_id: lead.id,
                campaign_id: campaign.id,
                inbox_id: 1,
                step_index: 0,
                tracking_id: "<t0@x>".into(),
                subject: "Intro".into(),
                sent_at: Utc::now(),
            })
            .await
            .unwrap();

        // Step 1 has delay_days = 3 from enrollment creation.
        let due_now = store.due_enrollments(campaign.id, Utc::now()).await.unwrap();
        assert!(due_now.is_empty());

        let due_later = store
            .due_enrollments(campaign.id, Utc::now() + Duration::days(3))
            .await
            .unwrap();
        assert_eq!(due_later.len(), 1);
    }

    #[tokio::test]
    async fn due_enrollments_for_missing_campaign_is_not_found() {
        let store = store().await;
        let err = store.due_enrollments(42, Utc::now()).await.unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { entity: "campaign", .. }));
    }

    #[tokio::test]
    async fn record_send_advances_step_atomically() {
        let store = store().await;
        let (lead, campaign, enrollment) = seed_campaign(&store).await;

        let sent = store
            .record_send(&NewSentEmail {
                enrollment_id: enrollment.id,
                lead_id: lead.id,
                campaign_id: campaign.id,
                inbox_id: 1,
                step_index: 0,
                tracking_id: "<t0@x>".into(),
                subject: "Intro".into(),
                sent_at: Utc::now(),
            })
            .await
            .unwrap();

        let after = store.get_enrollment(enrollment.id).await.unwrap();
        assert_eq!(after.current_step, 0);
        assert!(after.last_sent_at.is_some());
        assert_eq!(
            store
                .find_sent_by_tracking_id(&sent.tracking_id)
                .await
                .unwrap()
                .unwrap()
                .id,
            sent.id
        );
    }

    #[tokio::test]
    async fn record_send_refuses_backwards_step() {
        let store = store().await;
        let (lead, campaign, enrollment) = seed_campaign(&store).await;
        let mk = |step: i64, tid: &str| NewSentEmail {
            enrollment_id: enrollment.id,
            lead_id: lead.id,
            campaign_id: campaign.id,
            inbox_id: 1,
            step_index: step,
            tracking_id: tid.into(),
            subject: "s".into(),
            sent_at: Utc::now(),
        };
        store.record_send(&mk(1, "<t1@x>")).await.unwrap();
        let err = store.record_send(&mk(0, "<t0@x>")).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));
        // Rolled back: the duplicate send row is gone too.
        assert!(store.find_sent_by_tracking_id("<t0@x>").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn halt_is_idempotent_and_keeps_first_reason() {
        let store = store().await;
        let (_, campaign, enrollment) = seed_campaign(&store).await;
        store
            .halt_enrollment(enrollment.id, HaltReason::Replied)
            .await
            .unwrap();
        store
            .halt_enrollment(enrollment.id, HaltReason::Manual)
            .await
            .unwrap();
        let after = store.get_enrollment(enrollment.id).await.unwrap();
        assert!(after.halted);
        assert_eq!(after.halted_reason, Some(HaltReason::Replied));

        let due = store.due_enrollments(campaign.id, Utc::now()).await.unwrap();
        assert!(due.is_empty());
    }

    #[tokio::test]
    async fn duplicate_response_message_id_is_ignored() {
        let store = store().await;
        let resp = NewResponse {
            lead_id: None,
            enrollment_id: None,
            sent_email_id: None,
            message_id: "<m1@remote>".into(),
            subject: "Re: hi".into(),
            body: "hello".into(),
            received_at: Utc::now(),
        };
        assert!(matches!(
            store.insert_response(&resp).await.unwrap(),
            InsertOutcome::Inserted(_)
        ));
        assert_eq!(
            store.insert_response(&resp).await.unwrap(),
            InsertOutcome::Duplicate
        );
        assert_eq!(store.response_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn classification_is_write_once() {
        let store = store().await;
        let (lead, _, _) = seed_campaign(&store).await;
        let id = match store
            .insert_response(&NewResponse {
                lead_id: Some(lead.id),
                enrollment_id: None,
                sent_email_id: None,
                message_id: "<m1@remote>".into(),
                subject: "Re: hi".into(),
                body: "tell me more".into(),
                received_at: Utc::now(),
            })
            .await
            .unwrap()
        {
            InsertOutcome::Inserted(id) => id,
            InsertOutcome::Duplicate => unreachable!(),
        };

        store
            .set_classification(id, Intent::Interested, 0.9)
            .await
            .unwrap();
        store
            .set_classification(id, Intent::Spam, 0.1)
            .await
            .unwrap();
        let resp = store.get_response(id).await.unwrap();
        assert_eq!(resp.intent, Some(Intent::Interested));
        assert_eq!(resp.confidence, Some(0.9));
    }

    #[tokio::test]
    async fn checkpoint_only_moves_forward() {
        let store = store().await;
        let inbox = store.insert_inbox(&sample_inbox()).await.unwrap();
        let later = Utc::now();
        let earlier = later - Duration::hours(2);

        assert!(store.get_checkpoint(inbox.id).await.unwrap().is_none());
        store.advance_checkpoint(inbox.id, later).await.unwrap();
        store.advance_checkpoint(inbox.id, earlier).await.unwrap();

        let stored = store.get_checkpoint(inbox.id).await.unwrap().unwrap();
        assert_eq!(stored.timestamp(), later.timestamp());
    }
}
