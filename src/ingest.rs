//! Ingest cycle — polls inboxes and correlates inbound replies.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::model::{HaltReason, NewResponse, SentEmail};
use crate::store::{InsertOutcome, Store};
use crate::transport::{InboundEmail, MailTransport};

/// Counts for one ingest cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestSummary {
    pub inboxes_polled: usize,
    /// Matched responses stored.
    pub matched: usize,
    /// Messages whose tracking id resolved to no known send. Stored, never
    /// used to halt anything.
    pub orphans: usize,
    /// Already-seen message ids; no state change.
    pub duplicates: usize,
    pub errors: usize,
}

/// Pulls new inbound mail and turns it into Response records.
pub struct ResponseIngestor {
    store: Arc<dyn Store>,
    transport: Arc<dyn MailTransport>,
}

impl ResponseIngestor {
    pub fn new(store: Arc<dyn Store>, transport: Arc<dyn MailTransport>) -> Self {
        Self { store, transport }
    }

    /// Run one ingest cycle across all active inboxes. Re-running over the
    /// same mailbox contents is a no-op: dedup is by message id.
    pub async fn run_cycle(&self, _now: DateTime<Utc>) -> Result<IngestSummary, Error> {
        let mut summary = IngestSummary::default();

        for inbox in self.store.active_inboxes().await? {
            let since = self.store.get_checkpoint(inbox.id).await?;
            let messages = match self.transport.poll(&inbox, since).await {
                Ok(messages) => messages,
                Err(e) => {
                    warn!(inbox = inbox.id, error = %e, "Poll failed");
                    summary.errors += 1;
                    continue;
                }
            };
            summary.inboxes_polled += 1;
            debug!(inbox = inbox.id, count = messages.len(), "Polled inbox");

            let mut max_received: Option<DateTime<Utc>> = since;
            for mail in &messages {
                match self.ingest_message(mail).await {
                    Ok(Ingested::Matched) => summary.matched += 1,
                    Ok(Ingested::Orphan) => summary.orphans += 1,
                    Ok(Ingested::Duplicate) => summary.duplicates += 1,
                    Err(e) => {
                        warn!(message_id = %mail.message_id, error = %e, "Ingest failed");
                        summary.errors += 1;
                        continue;
                    }
                }
                if max_received.is_none_or(|m| mail.received_at > m) {
                    max_received = Some(mail.received_at);
                }
            }

            if let Some(up_to) = max_received {
                self.store.advance_checkpoint(inbox.id, up_to).await?;
            }
        }

        info!(
            matched = summary.matched,
            orphans = summary.orphans,
            duplicates = summary.duplicates,
            errors = summary.errors,
            "Ingest cycle complete"
        );
        Ok(summary)
    }

    async fn ingest_message(&self, mail: &InboundEmail) -> Result<Ingested, Error> {
        let origin = self.resolve_origin(mail).await?;

        let new_response = match &origin {
            Some(sent) => NewResponse {
                lead_id: Some(sent.lead_id),
                enrollment_id: Some(sent.enrollment_id),
                sent_email_id: Some(sent.id),
                message_id: mail.message_id.clone(),
                subject: mail.subject.clone(),
                body: mail.body.clone(),
                received_at: mail.received_at,
            },
            None => NewResponse {
                lead_id: None,
                enrollment_id: None,
                sent_email_id: None,
                message_id: mail.message_id.clone(),
                subject: mail.subject.clone(),
                body: mail.body.clone(),
                received_at: mail.received_at,
            },
        };

        match self.store.insert_response(&new_response).await? {
            InsertOutcome::Duplicate => Ok(Ingested::Duplicate),
            InsertOutcome::Inserted(_) => match origin {
                Some(sent) => {
                    self.store
                        .halt_enrollment(sent.enrollment_id, HaltReason::Replied)
                        .await?;
                    self.store.mark_lead_responded(sent.lead_id).await?;
                    info!(
                        lead = sent.lead_id,
                        enrollment = sent.enrollment_id,
                        "Reply ingested, enrollment halted"
                    );
                    Ok(Ingested::Matched)
                }
                None => {
                    debug!(message_id = %mail.message_id, from = %mail.from, "Orphan response stored");
                    Ok(Ingested::Orphan)
                }
            },
        }
    }

    /// Resolve the originating send: In-Reply-To first, then each References
    /// token in order. First match wins; no match means orphan.
    async fn resolve_origin(&self, mail: &InboundEmail) -> Result<Option<SentEmail>, Error> {
        for candidate in mail.in_reply_to.iter().chain(mail.references.iter()) {
            if let Some(sent) = self.store.find_sent_by_tracking_id(candidate).await? {
                return Ok(Some(sent));
            }
        }
        Ok(None)
    }
}

enum Ingested {
    Matched,
    Orphan,
    Duplicate,
}
