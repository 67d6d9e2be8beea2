//! Respond cycle — classifies matched responses and drafts/sends replies.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::ai::{Classification, IntentClassifier, ReplyComposer};
use crate::error::Error;
use crate::limiter::RateLimiter;
use crate::model::{
    HaltReason, Inbox, Intent, Lead, LeadStatus, NewSentEmail, ResponseRecord, SentEmail,
};
use crate::store::Store;
use crate::transport::{MailTransport, OutboundEmail};

/// Counts for one respond cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RespondSummary {
    pub processed: usize,
    pub replies_sent: usize,
    /// Drafts or failures parked for a human.
    pub queued_for_review: usize,
    /// out_of_office / spam / unsubscribe: handled without a reply.
    pub skipped: usize,
    /// Left pending for the next cycle (rate limit or transport failure).
    pub deferred: usize,
    pub errors: usize,
}

/// Drives pending responses through classify → route → compose → send.
pub struct ReplyEngine {
    store: Arc<dyn Store>,
    transport: Arc<dyn MailTransport>,
    limiter: Arc<RateLimiter>,
    classifier: Option<Arc<dyn IntentClassifier>>,
    composer: Option<Arc<dyn ReplyComposer>>,
    auto_send_threshold: f64,
    default_max_per_hour: u32,
}

impl ReplyEngine {
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn MailTransport>,
        limiter: Arc<RateLimiter>,
        classifier: Option<Arc<dyn IntentClassifier>>,
        composer: Option<Arc<dyn ReplyComposer>>,
        auto_send_threshold: f64,
        default_max_per_hour: u32,
    ) -> Self {
        Self {
            store,
            transport,
            limiter,
            classifier,
            composer,
            auto_send_threshold,
            default_max_per_hour,
        }
    }

    /// Run one respond cycle over all pending (matched, unreviewed)
    /// responses. Errors on one response never block the rest.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<RespondSummary, Error> {
        let mut summary = RespondSummary::default();

        for response in self.store.pending_responses().await? {
            summary.processed += 1;
            if let Err(e) = self.process_response(&response, now, &mut summary).await {
                warn!(response = response.id, error = %e, "Respond failed");
                summary.errors += 1;
            }
        }

        info!(
            processed = summary.processed,
            replies_sent = summary.replies_sent,
            queued_for_review = summary.queued_for_review,
            skipped = summary.skipped,
            deferred = summary.deferred,
            errors = summary.errors,
            "Respond cycle complete"
        );
        Ok(summary)
    }

    async fn process_response(
        &self,
        response: &ResponseRecord,
        now: DateTime<Utc>,
        summary: &mut RespondSummary,
    ) -> Result<(), Error> {
        let Some(lead_id) = response.lead_id else {
            // pending_responses filters orphans out; reconcile defensively.
            self.store.finish_review(response.id, None, false, true).await?;
            summary.queued_for_review += 1;
            return Ok(());
        };
        let lead = self.store.get_lead(lead_id).await?;

        let classification = match self.classification_for(&lead, response).await? {
            Some(c) => c,
            None => {
                // Unclassifiable. Park for a human; the classifier is never
                // retried for this record.
                self.store.finish_review(response.id, None, false, true).await?;
                summary.queued_for_review += 1;
                return Ok(());
            }
        };
        debug!(
            response = response.id,
            intent = classification.intent.as_str(),
            confidence = classification.confidence,
            "Response classified"
        );

        match classification.intent {
            intent if intent.skips_reply() => {
                self.store.finish_review(response.id, None, false, false).await?;
                summary.skipped += 1;
                Ok(())
            }
            Intent::Unsubscribe => {
                // Never drafted, never replied. Lead is done everywhere.
                self.store
                    .set_lead_status(lead.id, LeadStatus::Unsubscribed)
                    .await?;
                let halted = self
                    .store
                    .halt_enrollments_for_lead(lead.id, HaltReason::Unsubscribed)
                    .await?;
                self.store.finish_review(response.id, None, false, false).await?;
                info!(lead = lead.id, halted, "Lead unsubscribed");
                summary.skipped += 1;
                Ok(())
            }
            intent => {
                if intent == Intent::MeetingRequest {
                    self.store
                        .set_lead_status(lead.id, LeadStatus::MeetingBooked)
                        .await?;
                    self.store
                        .halt_enrollments_for_lead(lead.id, HaltReason::MeetingBooked)
                        .await?;
                } else if intent == Intent::NotInterested {
                    self.store
                        .set_lead_status(lead.id, LeadStatus::NotInterested)
                        .await?;
                }
                self.reply(&lead, response, classification, now, summary).await
            }
        }
    }

    /// Cached classification if present, otherwise at most one provider
    /// call. Returns None when the response cannot be classified.
    async fn classification_for(
        &self,
        lead: &Lead,
        response: &ResponseRecord,
    ) -> Result<Option<Classification>, Error> {
        if let (Some(intent), Some(confidence)) = (response.intent, response.confidence) {
            return Ok(Some(Classification { intent, confidence }));
        }
        let Some(classifier) = &self.classifier else {
            return Ok(None);
        };
        match classifier.classify(lead, response).await {
            Ok(c) => {
                self.store
                    .set_classification(response.id, c.intent, c.confidence)
                    .await?;
                Ok(Some(c))
            }
            Err(e) => {
                warn!(response = response.id, error = %e, "Classification failed");
                Ok(None)
            }
        }
    }

    async fn reply(
        &self,
        lead: &Lead,
        response: &ResponseRecord,
        classification: Classification,
        now: DateTime<Utc>,
        summary: &mut RespondSummary,
    ) -> Result<(), Error> {
        let Some(composer) = &self.composer else {
            self.store.finish_review(response.id, None, false, true).await?;
            summary.queued_for_review += 1;
            return Ok(());
        };

        let previous = match response.sent_email_id {
            Some(id) => Some(self.store.get_sent_email(id).await?),
            None => None,
        };

        let draft = match composer
            .compose(lead, response, classification.intent, previous.as_ref())
            .await
        {
            Ok(draft) => draft,
            Err(e) => {
                warn!(response = response.id, error = %e, "Draft failed");
                self.store.finish_review(response.id, None, false, true).await?;
                summary.queued_for_review += 1;
                return Ok(());
            }
        };

        if classification.confidence < self.auto_send_threshold {
            self.store
                .finish_review(response.id, Some(&draft), false, true)
                .await?;
            info!(
                response = response.id,
                confidence = classification.confidence,
                "Draft below auto-send threshold, queued for review"
            );
            summary.queued_for_review += 1;
            return Ok(());
        }

        let inbox = self.reply_inbox(previous.as_ref()).await?;
        let Some(inbox) = inbox else {
            warn!(response = response.id, "No active inbox for reply");
            summary.deferred += 1;
            return Ok(());
        };

        // Replies share the sequence sends' hourly budget.
        let budget = inbox.hourly_budget(self.default_max_per_hour);
        if !self.limiter.reserve(inbox.id, budget, now) {
            debug!(inbox = inbox.id, "Budget exhausted, reply deferred");
            summary.deferred += 1;
            return Ok(());
        }

        let subject = reply_subject(&response.subject);
        let mail = OutboundEmail {
            to: lead.email.clone(),
            subject: subject.clone(),
            body: draft.clone(),
            in_reply_to: Some(response.message_id.clone()),
        };
        let tracking_id = match self.transport.send(&inbox, &mail).await {
            Ok(id) => id,
            Err(e) => {
                // Classification is cached; only the send is retried.
                warn!(response = response.id, error = %e, "Reply send failed");
                summary.errors += 1;
                return Ok(());
            }
        };

        if let (Some(enrollment_id), Some(previous)) = (response.enrollment_id, previous.as_ref()) {
            self.store
                .record_reply_send(&NewSentEmail {
                    enrollment_id,
                    lead_id: lead.id,
                    campaign_id: previous.campaign_id,
                    inbox_id: inbox.id,
                    step_index: previous.step_index,
                    tracking_id,
                    subject,
                    sent_at: now,
                })
                .await?;
        }

        self.store
            .finish_review(response.id, Some(&draft), true, false)
            .await?;
        info!(
            lead = lead.id,
            intent = classification.intent.as_str(),
            "Auto-reply sent"
        );
        summary.replies_sent += 1;
        Ok(())
    }

    /// Reply from the inbox that sent the original mail; fall back to the
    /// first active inbox.
    async fn reply_inbox(&self, previous: Option<&SentEmail>) -> Result<Option<Inbox>, Error> {
        if let Some(previous) = previous {
            let inbox = self.store.get_inbox(previous.inbox_id).await?;
            if inbox.active {
                return Ok(Some(inbox));
            }
        }
        Ok(self.store.active_inboxes().await?.into_iter().next())
    }
}

/// "Re: " prefix unless the subject already carries one.
fn reply_subject(original: &str) -> String {
    let trimmed = original.trim();
    if trimmed.is_empty() {
        return "Re: Your inquiry".to_string();
    }
    if trimmed.to_lowercase().starts_with("re:") {
        trimmed.to_string()
    } else {
        format!("Re: {trimmed}")
    }
}
