//! Dispatch cycle — sends due sequence steps for active campaigns.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::limiter::RateLimiter;
use crate::model::{Inbox, NewSentEmail};
use crate::store::Store;
use crate::template;
use crate::transport::{MailTransport, OutboundEmail};

/// Counts for one dispatch cycle. Per-item failures never abort the cycle;
/// they show up in `errors` and the same work is retried next cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Cycle ran inside the sending-hour window.
    pub window_open: bool,
    pub sent: usize,
    /// Due enrollments left for a later cycle because an inbox's hourly
    /// budget ran out.
    pub deferred: usize,
    pub errors: usize,
}

/// Sends due campaign steps, honoring the sending window and per-inbox
/// hourly budgets.
pub struct Dispatcher {
    store: Arc<dyn Store>,
    transport: Arc<dyn MailTransport>,
    limiter: Arc<RateLimiter>,
    timezone: Tz,
    send_start_hour: u32,
    send_end_hour: u32,
    default_max_per_hour: u32,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn MailTransport>,
        limiter: Arc<RateLimiter>,
        timezone: Tz,
        send_start_hour: u32,
        send_end_hour: u32,
        default_max_per_hour: u32,
    ) -> Self {
        Self {
            store,
            transport,
            limiter,
            timezone,
            send_start_hour,
            send_end_hour,
            default_max_per_hour,
        }
    }

    /// Inclusive start, exclusive end, evaluated in the configured timezone.
    fn in_sending_window(&self, now: DateTime<Utc>) -> bool {
        let hour = now.with_timezone(&self.timezone).hour();
        hour >= self.send_start_hour && hour < self.send_end_hour
    }

    /// Run one dispatch cycle. Idempotent: a second invocation with no time
    /// elapsed finds nothing due and sends nothing.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<DispatchSummary, Error> {
        let mut summary = DispatchSummary::default();

        if !self.in_sending_window(now) {
            debug!(
                tz = %self.timezone,
                start = self.send_start_hour,
                end = self.send_end_hour,
                "Outside sending window, skipping dispatch"
            );
            return Ok(summary);
        }
        summary.window_open = true;

        let campaigns = self.store.active_campaigns().await?;
        // Inboxes whose hourly budget ran out this cycle. Campaigns sharing
        // an exhausted inbox are skipped; others keep going.
        let mut exhausted: HashSet<i64> = HashSet::new();
        let mut inboxes: HashMap<i64, Inbox> = HashMap::new();

        for campaign in campaigns {
            if exhausted.contains(&campaign.inbox_id) {
                let remaining = self.store.due_enrollments(campaign.id, now).await?.len();
                summary.deferred += remaining;
                continue;
            }

            let inbox = match inboxes.get(&campaign.inbox_id) {
                Some(inbox) => inbox.clone(),
                None => {
                    let inbox = self.store.get_inbox(campaign.inbox_id).await?;
                    inboxes.insert(inbox.id, inbox.clone());
                    inbox
                }
            };
            if !inbox.active {
                warn!(campaign = campaign.id, inbox = inbox.id, "Inbox inactive, skipping campaign");
                continue;
            }

            let steps = self.store.campaign_steps(campaign.id).await?;
            let due = self.store.due_enrollments(campaign.id, now).await?;
            debug!(campaign = campaign.id, due = due.len(), "Dispatching campaign");

            for (index, enrollment) in due.iter().enumerate() {
                let budget = inbox.hourly_budget(self.default_max_per_hour);
                if !self.limiter.reserve(inbox.id, budget, now) {
                    info!(
                        inbox = inbox.id,
                        "Hourly budget exhausted, deferring remaining enrollments"
                    );
                    exhausted.insert(inbox.id);
                    summary.deferred += due.len() - index;
                    break;
                }

                let step_index = enrollment.current_step + 1;
                let Some(step) = steps.get(step_index as usize) else {
                    // due_enrollments guarantees a next step; a mismatch
                    // means the sequence changed mid-cycle.
                    warn!(enrollment = enrollment.id, step_index, "Due step disappeared");
                    summary.errors += 1;
                    continue;
                };

                let lead = match self.store.get_lead(enrollment.lead_id).await {
                    Ok(lead) => lead,
                    Err(e) => {
                        warn!(enrollment = enrollment.id, error = %e, "Lead lookup failed");
                        summary.errors += 1;
                        continue;
                    }
                };
                if lead.status.is_terminal() {
                    // Enrollment should already be halted when the lead went
                    // terminal; reconcile rather than send.
                    warn!(lead = lead.id, status = lead.status.as_str(), "Terminal lead still enrolled");
                    let _ = self
                        .store
                        .halt_enrollment(enrollment.id, crate::model::HaltReason::Manual)
                        .await;
                    continue;
                }

                let subject = template::render(&step.subject_template, &lead);
                let body = template::render(&step.body_template, &lead);
                let mail = OutboundEmail {
                    to: lead.email.clone(),
                    subject: subject.clone(),
                    body,
                    in_reply_to: None,
                };

                let tracking_id = match self.transport.send(&inbox, &mail).await {
                    Ok(id) => id,
                    Err(e) => {
                        // State untouched; the same enrollment is due again
                        // next cycle.
                        warn!(enrollment = enrollment.id, error = %e, "Send failed");
                        summary.errors += 1;
                        continue;
                    }
                };

                self.store
                    .record_send(&NewSentEmail {
                        enrollment_id: enrollment.id,
                        lead_id: lead.id,
                        campaign_id: campaign.id,
                        inbox_id: inbox.id,
                        step_index,
                        tracking_id,
                        subject,
                        sent_at: now,
                    })
                    .await?;

                if lead.status == crate::model::LeadStatus::New {
                    self.store
                        .set_lead_status(lead.id, crate::model::LeadStatus::Contacted)
                        .await?;
                }

                info!(
                    campaign = campaign.id,
                    lead = lead.id,
                    step = step_index,
                    "Sequence step sent"
                );
                summary.sent += 1;
            }
        }

        info!(
            sent = summary.sent,
            deferred = summary.deferred,
            errors = summary.errors,
            "Dispatch cycle complete"
        );
        Ok(summary)
    }
}
