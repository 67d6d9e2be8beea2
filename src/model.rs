//! Core data model — leads, campaigns, enrollments, sent mail, responses.
//!
//! Rows come back from the store as explicit tagged records with enumerated
//! status fields; shape is validated on read, never trusted.

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

// ── Leads ───────────────────────────────────────────────────────────

/// Lifecycle status of a lead. Leads are never deleted, only transitioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    New,
    Contacted,
    Responded,
    MeetingBooked,
    NotInterested,
    Unsubscribed,
}

impl LeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadStatus::New => "new",
            LeadStatus::Contacted => "contacted",
            LeadStatus::Responded => "responded",
            LeadStatus::MeetingBooked => "meeting_booked",
            LeadStatus::NotInterested => "not_interested",
            LeadStatus::Unsubscribed => "unsubscribed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "contacted" => LeadStatus::Contacted,
            "responded" => LeadStatus::Responded,
            "meeting_booked" => LeadStatus::MeetingBooked,
            "not_interested" => LeadStatus::NotInterested,
            "unsubscribed" => LeadStatus::Unsubscribed,
            _ => LeadStatus::New,
        }
    }

    /// Terminal with respect to automatic overwrite: the ingestor never
    /// downgrades these to `responded`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LeadStatus::MeetingBooked | LeadStatus::Unsubscribed)
    }

    pub const ALL: [LeadStatus; 6] = [
        LeadStatus::New,
        LeadStatus::Contacted,
        LeadStatus::Responded,
        LeadStatus::MeetingBooked,
        LeadStatus::NotInterested,
        LeadStatus::Unsubscribed,
    ];
}

/// A lead/contact. Identity is the unique email address.
#[derive(Debug, Clone)]
pub struct Lead {
    pub id: i64,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub company: Option<String>,
    pub status: LeadStatus,
    pub created_at: DateTime<Utc>,
}

impl Lead {
    /// Display name: "First Last", either half, or the email address.
    pub fn full_name(&self) -> String {
        match (&self.first_name, &self.last_name) {
            (Some(f), Some(l)) => format!("{f} {l}"),
            (Some(f), None) => f.clone(),
            (None, Some(l)) => l.clone(),
            (None, None) => self.email.clone(),
        }
    }
}

/// Fields for creating a lead.
#[derive(Debug, Clone)]
pub struct NewLead {
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub company: Option<String>,
}

// ── Inboxes ─────────────────────────────────────────────────────────

/// A sending identity: SMTP/IMAP endpoints plus credentials and a per-hour
/// send budget.
#[derive(Debug, Clone)]
pub struct Inbox {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub imap_host: String,
    pub imap_port: u16,
    pub username: String,
    pub password: SecretString,
    pub max_per_hour: u32,
    pub active: bool,
}

impl Inbox {
    /// Hourly send budget. A row with 0 falls back to the configured
    /// deployment default.
    pub fn hourly_budget(&self, default: u32) -> u32 {
        if self.max_per_hour > 0 {
            self.max_per_hour
        } else {
            default
        }
    }
}

// ── Campaigns ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Active,
    Paused,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Active => "active",
            CampaignStatus::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "active" => CampaignStatus::Active,
            "paused" => CampaignStatus::Paused,
            _ => CampaignStatus::Draft,
        }
    }
}

/// An email campaign: an inbox plus an ordered sequence of steps.
#[derive(Debug, Clone)]
pub struct Campaign {
    pub id: i64,
    pub name: String,
    pub inbox_id: i64,
    pub status: CampaignStatus,
    pub created_at: DateTime<Utc>,
}

/// One templated message at a fixed delay offset within a campaign.
/// Step order is fixed once leads are enrolled; only append is allowed.
#[derive(Debug, Clone)]
pub struct Step {
    pub id: i64,
    pub campaign_id: i64,
    /// 0-based position within the sequence.
    pub position: i64,
    /// Days after enrollment creation at which this step becomes due.
    pub delay_days: i64,
    pub subject_template: String,
    pub body_template: String,
}

// ── Enrollments ─────────────────────────────────────────────────────

/// Why an enrollment was halted. Halting is permanent as far as automated
/// logic is concerned; only a manual un-halt (out of scope) may reverse it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltReason {
    Replied,
    Unsubscribed,
    MeetingBooked,
    Manual,
}

impl HaltReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            HaltReason::Replied => "replied",
            HaltReason::Unsubscribed => "unsubscribed",
            HaltReason::MeetingBooked => "meeting_booked",
            HaltReason::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "replied" => Some(HaltReason::Replied),
            "unsubscribed" => Some(HaltReason::Unsubscribed),
            "meeting_booked" => Some(HaltReason::MeetingBooked),
            "manual" => Some(HaltReason::Manual),
            _ => None,
        }
    }
}

/// State of one lead progressing through one campaign's sequence.
#[derive(Debug, Clone)]
pub struct Enrollment {
    pub id: i64,
    pub lead_id: i64,
    pub campaign_id: i64,
    /// Index of the last step sent. −1 means nothing sent yet.
    pub current_step: i64,
    pub created_at: DateTime<Utc>,
    pub last_sent_at: Option<DateTime<Utc>>,
    pub halted: bool,
    pub halted_reason: Option<HaltReason>,
}

impl Enrollment {
    /// Completed is a derived state: every step sent and not halted.
    pub fn is_complete(&self, step_count: i64) -> bool {
        !self.halted && self.current_step + 1 >= step_count
    }
}

// ── Sent mail ───────────────────────────────────────────────────────

/// Immutable record of one send. Append-only; one row per send.
#[derive(Debug, Clone)]
pub struct SentEmail {
    pub id: i64,
    pub enrollment_id: i64,
    pub lead_id: i64,
    pub campaign_id: i64,
    pub inbox_id: i64,
    /// Step index this send corresponds to. Replies composed by the AI
    /// layer reuse the enrollment's current step index.
    pub step_index: i64,
    /// Message-ID embedded in the outgoing mail; inbound replies echo it
    /// in In-Reply-To/References, which is how we correlate them.
    pub tracking_id: String,
    pub subject: String,
    pub sent_at: DateTime<Utc>,
}

/// Fields for recording a send.
#[derive(Debug, Clone)]
pub struct NewSentEmail {
    pub enrollment_id: i64,
    pub lead_id: i64,
    pub campaign_id: i64,
    pub inbox_id: i64,
    pub step_index: i64,
    pub tracking_id: String,
    pub subject: String,
    pub sent_at: DateTime<Utc>,
}

// ── Responses ───────────────────────────────────────────────────────

/// Classified purpose of an inbound reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Interested,
    MeetingRequest,
    Question,
    NotInterested,
    Unsubscribe,
    OutOfOffice,
    Spam,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Interested => "interested",
            Intent::MeetingRequest => "meeting_request",
            Intent::Question => "question",
            Intent::NotInterested => "not_interested",
            Intent::Unsubscribe => "unsubscribe",
            Intent::OutOfOffice => "out_of_office",
            Intent::Spam => "spam",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "interested" => Some(Intent::Interested),
            "meeting_request" => Some(Intent::MeetingRequest),
            "question" => Some(Intent::Question),
            "not_interested" => Some(Intent::NotInterested),
            "unsubscribe" => Some(Intent::Unsubscribe),
            "out_of_office" => Some(Intent::OutOfOffice),
            "spam" => Some(Intent::Spam),
            _ => None,
        }
    }

    /// Intents that never get a drafted reply.
    pub fn skips_reply(&self) -> bool {
        matches!(self, Intent::OutOfOffice | Intent::Spam)
    }
}

/// An inbound reply. Created by the ingestor; the classifier/composer fill
/// in the nullable fields once, then the record is frozen.
///
/// `lead_id` is None for orphans: messages whose tracking identifier matched
/// no known send. Orphans are kept (never silently dropped) but never used
/// to halt anything.
#[derive(Debug, Clone)]
pub struct ResponseRecord {
    pub id: i64,
    pub lead_id: Option<i64>,
    pub enrollment_id: Option<i64>,
    pub sent_email_id: Option<i64>,
    /// Message-ID of the inbound mail; unique, used for dedup.
    pub message_id: String,
    pub subject: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
    pub intent: Option<Intent>,
    pub confidence: Option<f64>,
    pub draft_reply: Option<String>,
    pub reply_sent: bool,
    /// Set when an AI draft fell below the auto-send threshold, or when
    /// classification failed and a human needs to look.
    pub needs_review: bool,
    /// Set once the respond cycle has finished with this record.
    pub reviewed: bool,
}

/// Fields for recording an inbound response.
#[derive(Debug, Clone)]
pub struct NewResponse {
    pub lead_id: Option<i64>,
    pub enrollment_id: Option<i64>,
    pub sent_email_id: Option<i64>,
    pub message_id: String,
    pub subject: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}
