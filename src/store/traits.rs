//! `Store` trait — single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::model::{
    Campaign, CampaignStatus, Enrollment, HaltReason, Inbox, Intent, Lead, LeadStatus, NewLead,
    NewResponse, NewSentEmail, ResponseRecord, SentEmail, Step,
};

/// Outcome of inserting an inbound response, keyed on message id uniqueness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Row created with this id.
    Inserted(i64),
    /// A response with the same message id already exists; no state change.
    Duplicate,
}

/// Backend-agnostic persistence trait covering the whole CRM core.
///
/// Write methods enforce the sequencing invariants: `current_step` only
/// moves forward, and `halted` once true is never reset by automated logic.
#[async_trait]
pub trait Store: Send + Sync {
    // ── Leads ───────────────────────────────────────────────────────

    async fn insert_lead(&self, lead: &NewLead) -> Result<Lead, DatabaseError>;

    async fn get_lead(&self, id: i64) -> Result<Lead, DatabaseError>;

    async fn get_lead_by_email(&self, email: &str) -> Result<Option<Lead>, DatabaseError>;

    /// Unconditional status write. Callers apply the terminal-status guard;
    /// see `mark_lead_responded` for the guarded transition.
    async fn set_lead_status(&self, id: i64, status: LeadStatus) -> Result<(), DatabaseError>;

    /// Transition a lead to `responded` unless its current status is
    /// terminal (`meeting_booked`, `unsubscribed`). Atomic read-then-write.
    async fn mark_lead_responded(&self, id: i64) -> Result<(), DatabaseError>;

    async fn lead_counts_by_status(&self) -> Result<Vec<(LeadStatus, i64)>, DatabaseError>;

    // ── Inboxes ─────────────────────────────────────────────────────

    async fn insert_inbox(&self, inbox: &Inbox) -> Result<Inbox, DatabaseError>;

    async fn get_inbox(&self, id: i64) -> Result<Inbox, DatabaseError>;

    async fn active_inboxes(&self) -> Result<Vec<Inbox>, DatabaseError>;

    // ── Campaigns & steps ───────────────────────────────────────────

    async fn insert_campaign(&self, name: &str, inbox_id: i64) -> Result<Campaign, DatabaseError>;

    async fn get_campaign(&self, id: i64) -> Result<Campaign, DatabaseError>;

    async fn set_campaign_status(
        &self,
        id: i64,
        status: CampaignStatus,
    ) -> Result<(), DatabaseError>;

    async fn campaigns(&self) -> Result<Vec<Campaign>, DatabaseError>;

    async fn active_campaigns(&self) -> Result<Vec<Campaign>, DatabaseError>;

    /// Append a step at the end of a campaign's sequence. Steps are never
    /// inserted mid-sequence once leads are enrolled.
    async fn append_step(
        &self,
        campaign_id: i64,
        delay_days: i64,
        subject_template: &str,
        body_template: &str,
    ) -> Result<Step, DatabaseError>;

    /// Steps for a campaign, ordered by position.
    async fn campaign_steps(&self, campaign_id: i64) -> Result<Vec<Step>, DatabaseError>;

    // ── Enrollments ─────────────────────────────────────────────────

    async fn enroll(&self, lead_id: i64, campaign_id: i64) -> Result<Enrollment, DatabaseError>;

    async fn get_enrollment(&self, id: i64) -> Result<Enrollment, DatabaseError>;

    async fn enrollments_for_campaign(
        &self,
        campaign_id: i64,
    ) -> Result<Vec<Enrollment>, DatabaseError>;

    async fn enrollments_for_lead(&self, lead_id: i64) -> Result<Vec<Enrollment>, DatabaseError>;

    /// Enrollments due for their next step at `now`, ascending enrollment id.
    ///
    /// Due means: not halted, a next step exists, and
    /// `now >= created_at + next_step.delay_days`. Delays are relative to
    /// enrollment creation, so dispatch jitter never compounds.
    async fn due_enrollments(
        &self,
        campaign_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<Enrollment>, DatabaseError>;

    /// Halt an enrollment. Idempotent: an already-halted enrollment keeps
    /// its original reason.
    async fn halt_enrollment(&self, id: i64, reason: HaltReason) -> Result<(), DatabaseError>;

    /// Halt every non-halted enrollment for a lead across all campaigns.
    /// Returns the number of enrollments newly halted.
    async fn halt_enrollments_for_lead(
        &self,
        lead_id: i64,
        reason: HaltReason,
    ) -> Result<usize, DatabaseError>;

    // ── Sent mail ───────────────────────────────────────────────────

    /// Record a sequence send and advance the enrollment, as one atomic
    /// unit: append the SentEmail row, set `current_step` to
    /// `sent.step_index`, and update `last_sent_at`. A crash between send
    /// and commit leaves the enrollment untouched, so the step is retried
    /// rather than double-recorded.
    async fn record_send(&self, sent: &NewSentEmail) -> Result<SentEmail, DatabaseError>;

    /// Record a non-sequence send (an AI-composed reply). Appends the row
    /// without advancing any enrollment.
    async fn record_reply_send(&self, sent: &NewSentEmail) -> Result<SentEmail, DatabaseError>;

    async fn get_sent_email(&self, id: i64) -> Result<SentEmail, DatabaseError>;

    async fn find_sent_by_tracking_id(
        &self,
        tracking_id: &str,
    ) -> Result<Option<SentEmail>, DatabaseError>;

    /// Number of sends attributed to an inbox since `since`.
    async fn sent_count_since(
        &self,
        inbox_id: i64,
        since: DateTime<Utc>,
    ) -> Result<i64, DatabaseError>;

    /// Total sends since `since` across all inboxes.
    async fn total_sent_since(&self, since: DateTime<Utc>) -> Result<i64, DatabaseError>;

    // ── Responses ───────────────────────────────────────────────────

    /// Insert an inbound response; `Duplicate` when the message id was
    /// already recorded, which makes re-processing a no-op.
    async fn insert_response(&self, resp: &NewResponse) -> Result<InsertOutcome, DatabaseError>;

    async fn get_response(&self, id: i64) -> Result<ResponseRecord, DatabaseError>;

    /// Responses awaiting the respond cycle: matched to a lead and not yet
    /// reviewed. Ascending id.
    async fn pending_responses(&self) -> Result<Vec<ResponseRecord>, DatabaseError>;

    /// Cache a classification on a response. Called at most once per record.
    async fn set_classification(
        &self,
        id: i64,
        intent: Intent,
        confidence: f64,
    ) -> Result<(), DatabaseError>;

    /// Finish the respond cycle for a record: store any draft, whether it
    /// was sent, and whether a human needs to look at it.
    async fn finish_review(
        &self,
        id: i64,
        draft_reply: Option<&str>,
        reply_sent: bool,
        needs_review: bool,
    ) -> Result<(), DatabaseError>;

    /// Responses for the dashboard, newest first. `needs_review` filters to
    /// flagged rows; `unmatched` filters to orphans.
    async fn list_responses(
        &self,
        needs_review: Option<bool>,
        unmatched: Option<bool>,
        limit: i64,
    ) -> Result<Vec<ResponseRecord>, DatabaseError>;

    async fn response_count(&self) -> Result<i64, DatabaseError>;

    /// Responses attributed to a campaign (via enrollment), for stats.
    async fn response_count_for_campaign(&self, campaign_id: i64) -> Result<i64, DatabaseError>;

    async fn sent_count_for_campaign(&self, campaign_id: i64) -> Result<i64, DatabaseError>;

    // ── Poll checkpoints ────────────────────────────────────────────

    async fn get_checkpoint(&self, inbox_id: i64) -> Result<Option<DateTime<Utc>>, DatabaseError>;

    /// Advance an inbox's poll checkpoint. Monotonic: a timestamp earlier
    /// than the stored one is ignored.
    async fn advance_checkpoint(
        &self,
        inbox_id: i64,
        up_to: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;
}
