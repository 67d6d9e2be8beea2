//! End-to-end cycle tests: dispatch, ingest, and respond against an
//! in-memory store with a recording mock transport and stub AI.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use outreach::ai::{Classification, IntentClassifier, ReplyComposer};
use outreach::dispatch::Dispatcher;
use outreach::error::{ClassifierError, TransportError};
use outreach::ingest::ResponseIngestor;
use outreach::limiter::RateLimiter;
use outreach::model::{
    Campaign, CampaignStatus, HaltReason, Inbox, Intent, Lead, LeadStatus, NewLead,
    ResponseRecord, SentEmail,
};
use outreach::respond::ReplyEngine;
use outreach::store::{LibSqlStore, Store};
use outreach::transport::{InboundEmail, MailTransport, OutboundEmail};

// ── Test doubles ────────────────────────────────────────────────────

#[derive(Default)]
struct MockTransport {
    sent: Mutex<Vec<(i64, OutboundEmail)>>,
    inbound: Mutex<Vec<InboundEmail>>,
    counter: AtomicUsize,
    fail_sends: AtomicBool,
}

impl MockTransport {
    fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    fn last_sent(&self) -> (i64, OutboundEmail) {
        self.sent.lock().unwrap().last().cloned().expect("a sent mail")
    }

    fn push_inbound(&self, mail: InboundEmail) {
        self.inbound.lock().unwrap().push(mail);
    }
}

#[async_trait]
impl MailTransport for MockTransport {
    async fn send(&self, inbox: &Inbox, mail: &OutboundEmail) -> Result<String, TransportError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Send("mock transport down".into()));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        self.sent.lock().unwrap().push((inbox.id, mail.clone()));
        Ok(format!("track-{n}@test.local"))
    }

    async fn poll(
        &self,
        _inbox: &Inbox,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<InboundEmail>, TransportError> {
        let mails = self.inbound.lock().unwrap().clone();
        Ok(mails
            .into_iter()
            .filter(|m| since.is_none_or(|s| m.received_at > s))
            .collect())
    }
}

struct StubClassifier {
    result: Classification,
    fail: bool,
    calls: AtomicUsize,
}

impl StubClassifier {
    fn new(intent: Intent, confidence: f64) -> Arc<Self> {
        Arc::new(Self {
            result: Classification { intent, confidence },
            fail: false,
            calls: AtomicUsize::new(0),
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            result: Classification {
                intent: Intent::Question,
                confidence: 0.0,
            },
            fail: true,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl IntentClassifier for StubClassifier {
    async fn classify(
        &self,
        _lead: &Lead,
        _response: &ResponseRecord,
    ) -> Result<Classification, ClassifierError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            Err(ClassifierError::Provider("stub provider down".into()))
        } else {
            Ok(self.result)
        }
    }
}

struct StubComposer;

#[async_trait]
impl ReplyComposer for StubComposer {
    async fn compose(
        &self,
        lead: &Lead,
        _response: &ResponseRecord,
        _intent: Intent,
        _previous: Option<&SentEmail>,
    ) -> Result<String, ClassifierError> {
        Ok(format!("Thanks for getting back to us, {}!", lead.full_name()))
    }
}

// ── Harness ─────────────────────────────────────────────────────────

struct Harness {
    store: Arc<dyn Store>,
    transport: Arc<MockTransport>,
    limiter: Arc<RateLimiter>,
    dispatcher: Dispatcher,
    ingestor: ResponseIngestor,
}

impl Harness {
    async fn new() -> Self {
        let store: Arc<dyn Store> =
            Arc::new(LibSqlStore::new_memory().await.expect("in-memory store"));
        let transport = Arc::new(MockTransport::default());
        let limiter = Arc::new(RateLimiter::new());
        let dispatcher = Dispatcher::new(
            Arc::clone(&store),
            Arc::clone(&transport) as Arc<dyn MailTransport>,
            Arc::clone(&limiter),
            chrono_tz::UTC,
            9,
            17,
            5,
        );
        let ingestor = ResponseIngestor::new(
            Arc::clone(&store),
            Arc::clone(&transport) as Arc<dyn MailTransport>,
        );
        Self {
            store,
            transport,
            limiter,
            dispatcher,
            ingestor,
        }
    }

    fn engine(
        &self,
        classifier: Arc<dyn IntentClassifier>,
        threshold: f64,
    ) -> ReplyEngine {
        ReplyEngine::new(
            Arc::clone(&self.store),
            Arc::clone(&self.transport) as Arc<dyn MailTransport>,
            Arc::clone(&self.limiter),
            Some(classifier),
            Some(Arc::new(StubComposer)),
            threshold,
            5,
        )
    }

    async fn inbox(&self, max_per_hour: u32) -> Inbox {
        self.store
            .insert_inbox(&Inbox {
                id: 0,
                name: "Outbound One".into(),
                email: "sender@ourcompany.com".into(),
                smtp_host: "smtp.example.com".into(),
                smtp_port: 587,
                imap_host: "imap.example.com".into(),
                imap_port: 993,
                username: "sender@ourcompany.com".into(),
                password: secrecy::SecretString::from("hunter2".to_string()),
                max_per_hour,
                active: true,
            })
            .await
            .expect("inbox")
    }

    /// Campaign with the canonical 0/3/7-day three-step sequence, activated.
    async fn three_step_campaign(&self, inbox_id: i64) -> Campaign {
        let campaign = self
            .store
            .insert_campaign("Directory outreach", inbox_id)
            .await
            .expect("campaign");
        for (delay, subject) in [(0, "Intro"), (3, "Following up"), (7, "Last check-in")] {
            self.store
                .append_step(
                    campaign.id,
                    delay,
                    &format!("{subject} {{firstName|there}}"),
                    "Hi {firstName|there}, quick note about our directory.",
                )
                .await
                .expect("step");
        }
        self.store
            .set_campaign_status(campaign.id, CampaignStatus::Active)
            .await
            .expect("activate");
        campaign
    }

    async fn lead(&self, email: &str) -> Lead {
        self.store
            .insert_lead(&NewLead {
                email: email.into(),
                first_name: Some("Katie".into()),
                last_name: Some("Ramos".into()),
                company: Some("Acme".into()),
            })
            .await
            .expect("lead")
    }
}

/// 10:00 UTC on June `day` — inside the 9..17 window.
fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, day, hour, 0, 0).unwrap()
}

fn reply(tracking: &str, message_id: &str, received_at: DateTime<Utc>) -> InboundEmail {
    InboundEmail {
        message_id: message_id.into(),
        in_reply_to: vec![tracking.into()],
        references: vec![tracking.into()],
        from: "katie@example.com".into(),
        subject: "Re: Intro".into(),
        body: "Interesting, tell me more.".into(),
        received_at,
    }
}

// ── Dispatch ────────────────────────────────────────────────────────

#[tokio::test]
async fn three_step_timeline_with_mid_sequence_reply() {
    let h = Harness::new().await;
    let inbox = h.inbox(5).await;
    let campaign = h.three_step_campaign(inbox.id).await;
    let lead = h.lead("katie@example.com").await;
    h.store.enroll(lead.id, campaign.id).await.unwrap();

    // T0: step 0 is due and sent.
    let summary = h.dispatcher.run_cycle(at(1, 10)).await.unwrap();
    assert_eq!(summary.sent, 1);
    let (_, mail) = h.transport.last_sent();
    assert_eq!(mail.subject, "Intro Katie");

    // Immediate re-run: nothing due, nothing sent.
    let summary = h.dispatcher.run_cycle(at(1, 10)).await.unwrap();
    assert_eq!(summary.sent, 0);

    // T0+1 day: still nothing.
    let summary = h.dispatcher.run_cycle(at(2, 10)).await.unwrap();
    assert_eq!(summary.sent, 0);

    // T0+3 days: step 1.
    let summary = h.dispatcher.run_cycle(at(4, 10)).await.unwrap();
    assert_eq!(summary.sent, 1);
    assert_eq!(h.transport.sent_count(), 2);

    // Reply arrives at T0+4 days.
    let step1 = h
        .store
        .find_sent_by_tracking_id("track-1@test.local")
        .await
        .unwrap()
        .expect("step 1 send");
    h.transport
        .push_inbound(reply("track-1@test.local", "reply-1@remote", at(5, 14)));
    let summary = h.ingestor.run_cycle(at(5, 15)).await.unwrap();
    assert_eq!(summary.matched, 1);

    let enrollment = h.store.get_enrollment(step1.enrollment_id).await.unwrap();
    assert!(enrollment.halted);
    assert_eq!(enrollment.halted_reason, Some(HaltReason::Replied));

    // T0+7 days: step 2 must never go out.
    let summary = h.dispatcher.run_cycle(at(8, 10)).await.unwrap();
    assert_eq!(summary.sent, 0);
    assert_eq!(h.transport.sent_count(), 2);
}

#[tokio::test]
async fn lead_transitions_to_contacted_on_first_send() {
    let h = Harness::new().await;
    let inbox = h.inbox(5).await;
    let campaign = h.three_step_campaign(inbox.id).await;
    let lead = h.lead("katie@example.com").await;
    h.store.enroll(lead.id, campaign.id).await.unwrap();

    h.dispatcher.run_cycle(at(1, 10)).await.unwrap();
    let lead = h.store.get_lead(lead.id).await.unwrap();
    assert_eq!(lead.status, LeadStatus::Contacted);
}

#[tokio::test]
async fn hourly_budget_caps_each_cycle() {
    let h = Harness::new().await;
    let inbox = h.inbox(5).await;
    let campaign = h.three_step_campaign(inbox.id).await;
    for i in 0..8 {
        let lead = h.lead(&format!("lead{i}@example.com")).await;
        h.store.enroll(lead.id, campaign.id).await.unwrap();
    }

    let summary = h.dispatcher.run_cycle(at(1, 10)).await.unwrap();
    assert_eq!(summary.sent, 5);
    assert_eq!(summary.deferred, 3);

    // Same hour: budget still exhausted.
    let summary = h.dispatcher.run_cycle(at(1, 10)).await.unwrap();
    assert_eq!(summary.sent, 0);
    assert_eq!(summary.deferred, 3);

    // Next hour bucket: the remaining three go out.
    let summary = h.dispatcher.run_cycle(at(1, 11)).await.unwrap();
    assert_eq!(summary.sent, 3);
    assert_eq!(summary.deferred, 0);
    assert_eq!(h.transport.sent_count(), 8);
}

#[tokio::test]
async fn nothing_sent_outside_sending_window() {
    let h = Harness::new().await;
    let inbox = h.inbox(5).await;
    let campaign = h.three_step_campaign(inbox.id).await;
    let lead = h.lead("katie@example.com").await;
    h.store.enroll(lead.id, campaign.id).await.unwrap();

    let summary = h.dispatcher.run_cycle(at(1, 20)).await.unwrap();
    assert!(!summary.window_open);
    assert_eq!(summary.sent, 0);
    assert_eq!(h.transport.sent_count(), 0);
}

#[tokio::test]
async fn transport_failure_leaves_enrollment_retryable() {
    let h = Harness::new().await;
    let inbox = h.inbox(5).await;
    let campaign = h.three_step_campaign(inbox.id).await;
    let lead = h.lead("katie@example.com").await;
    let enrollment = h.store.enroll(lead.id, campaign.id).await.unwrap();

    h.transport.fail_sends.store(true, Ordering::SeqCst);
    let summary = h.dispatcher.run_cycle(at(1, 10)).await.unwrap();
    assert_eq!(summary.sent, 0);
    assert_eq!(summary.errors, 1);
    let after = h.store.get_enrollment(enrollment.id).await.unwrap();
    assert_eq!(after.current_step, -1);

    h.transport.fail_sends.store(false, Ordering::SeqCst);
    let summary = h.dispatcher.run_cycle(at(1, 11)).await.unwrap();
    assert_eq!(summary.sent, 1);
    let after = h.store.get_enrollment(enrollment.id).await.unwrap();
    assert_eq!(after.current_step, 0);
}

#[tokio::test]
async fn paused_campaign_is_skipped() {
    let h = Harness::new().await;
    let inbox = h.inbox(5).await;
    let campaign = h.three_step_campaign(inbox.id).await;
    let lead = h.lead("katie@example.com").await;
    h.store.enroll(lead.id, campaign.id).await.unwrap();
    h.store
        .set_campaign_status(campaign.id, CampaignStatus::Paused)
        .await
        .unwrap();

    let summary = h.dispatcher.run_cycle(at(1, 10)).await.unwrap();
    assert_eq!(summary.sent, 0);
    assert_eq!(h.transport.sent_count(), 0);
}

// ── Ingest ──────────────────────────────────────────────────────────

#[tokio::test]
async fn tracking_id_round_trips_to_originating_lead() {
    let h = Harness::new().await;
    let inbox = h.inbox(5).await;
    let campaign = h.three_step_campaign(inbox.id).await;
    let lead = h.lead("katie@example.com").await;
    let enrollment = h.store.enroll(lead.id, campaign.id).await.unwrap();

    h.dispatcher.run_cycle(at(1, 10)).await.unwrap();
    h.transport
        .push_inbound(reply("track-0@test.local", "reply-0@remote", at(1, 14)));
    let summary = h.ingestor.run_cycle(at(1, 15)).await.unwrap();
    assert_eq!(summary.matched, 1);
    assert_eq!(summary.orphans, 0);

    let responses = h.store.list_responses(None, Some(false), 10).await.unwrap();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].lead_id, Some(lead.id));
    assert_eq!(responses[0].enrollment_id, Some(enrollment.id));
    assert_eq!(
        h.store.get_lead(lead.id).await.unwrap().status,
        LeadStatus::Responded
    );
}

#[tokio::test]
async fn unknown_tracking_id_stored_as_orphan_and_halts_nothing() {
    let h = Harness::new().await;
    let inbox = h.inbox(5).await;
    let campaign = h.three_step_campaign(inbox.id).await;
    let lead = h.lead("katie@example.com").await;
    let enrollment = h.store.enroll(lead.id, campaign.id).await.unwrap();

    h.transport
        .push_inbound(reply("nonexistent@test.local", "stray-1@remote", at(1, 14)));
    let summary = h.ingestor.run_cycle(at(1, 15)).await.unwrap();
    assert_eq!(summary.orphans, 1);
    assert_eq!(summary.matched, 0);

    let orphans = h.store.list_responses(None, Some(true), 10).await.unwrap();
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].lead_id, None);
    assert!(!h.store.get_enrollment(enrollment.id).await.unwrap().halted);
}

#[tokio::test]
async fn reprocessing_same_message_is_a_no_op() {
    let h = Harness::new().await;
    let inbox = h.inbox(5).await;
    let campaign = h.three_step_campaign(inbox.id).await;
    let lead = h.lead("katie@example.com").await;
    h.store.enroll(lead.id, campaign.id).await.unwrap();

    h.dispatcher.run_cycle(at(1, 10)).await.unwrap();
    h.transport
        .push_inbound(reply("track-0@test.local", "reply-0@remote", at(1, 14)));

    let first = h.ingestor.run_cycle(at(1, 15)).await.unwrap();
    assert_eq!(first.matched, 1);

    // Same mailbox contents again: checkpoint filters it; even with the
    // checkpoint reset the message id dedup makes it a no-op.
    let second = h.ingestor.run_cycle(at(1, 16)).await.unwrap();
    assert_eq!(second.matched, 0);
    h.store
        .advance_checkpoint(inbox.id, at(1, 13))
        .await
        .unwrap();
    let third = h.ingestor.run_cycle(at(1, 17)).await.unwrap();
    assert_eq!(third.matched, 0);
    assert!(third.duplicates <= 1);

    assert_eq!(h.store.response_count().await.unwrap(), 1);
}

// ── Respond ─────────────────────────────────────────────────────────

async fn ingest_one_reply(h: &Harness) -> (Lead, Campaign) {
    let inbox = h.inbox(5).await;
    let campaign = h.three_step_campaign(inbox.id).await;
    let lead = h.lead("katie@example.com").await;
    h.store.enroll(lead.id, campaign.id).await.unwrap();
    h.dispatcher.run_cycle(at(1, 10)).await.unwrap();
    h.transport
        .push_inbound(reply("track-0@test.local", "reply-0@remote", at(1, 14)));
    h.ingestor.run_cycle(at(1, 15)).await.unwrap();
    (lead, campaign)
}

#[tokio::test]
async fn confident_question_gets_an_auto_reply() {
    let h = Harness::new().await;
    let (lead, _) = ingest_one_reply(&h).await;
    let engine = h.engine(StubClassifier::new(Intent::Question, 0.9), 0.5);

    let summary = engine.run_cycle(at(1, 16)).await.unwrap();
    assert_eq!(summary.replies_sent, 1);

    let (_, mail) = h.transport.last_sent();
    assert_eq!(mail.to, "katie@example.com");
    assert_eq!(mail.subject, "Re: Intro");
    assert_eq!(mail.in_reply_to.as_deref(), Some("reply-0@remote"));

    let record = h.store.get_response(1).await.unwrap();
    assert!(record.reviewed);
    assert!(record.reply_sent);
    assert!(!record.needs_review);
    assert_eq!(record.intent, Some(Intent::Question));

    // The reply is a send, not a sequence advance.
    let enrollment = h.store.enrollments_for_lead(lead.id).await.unwrap();
    assert_eq!(enrollment[0].current_step, 0);
}

#[tokio::test]
async fn below_threshold_draft_is_queued_for_review() {
    let h = Harness::new().await;
    ingest_one_reply(&h).await;
    let engine = h.engine(StubClassifier::new(Intent::Question, 0.3), 0.5);
    let sends_before = h.transport.sent_count();

    let summary = engine.run_cycle(at(1, 16)).await.unwrap();
    assert_eq!(summary.queued_for_review, 1);
    assert_eq!(summary.replies_sent, 0);
    assert_eq!(h.transport.sent_count(), sends_before);

    let record = h.store.get_response(1).await.unwrap();
    assert!(record.needs_review);
    assert!(record.reviewed);
    assert!(record.draft_reply.is_some());
    assert!(!record.reply_sent);
}

#[tokio::test]
async fn unsubscribe_halts_every_enrollment_and_never_replies() {
    let h = Harness::new().await;
    let inbox = h.inbox(5).await;
    let campaign_a = h.three_step_campaign(inbox.id).await;
    let campaign_b = h.three_step_campaign(inbox.id).await;
    let lead = h.lead("katie@example.com").await;
    h.store.enroll(lead.id, campaign_a.id).await.unwrap();
    h.store.enroll(lead.id, campaign_b.id).await.unwrap();

    h.dispatcher.run_cycle(at(1, 10)).await.unwrap();
    h.transport
        .push_inbound(reply("track-0@test.local", "reply-0@remote", at(1, 14)));
    h.ingestor.run_cycle(at(1, 15)).await.unwrap();

    let engine = h.engine(StubClassifier::new(Intent::Unsubscribe, 0.99), 0.5);
    let sends_before = h.transport.sent_count();
    let summary = engine.run_cycle(at(1, 16)).await.unwrap();
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.replies_sent, 0);
    assert_eq!(h.transport.sent_count(), sends_before);

    let lead = h.store.get_lead(lead.id).await.unwrap();
    assert_eq!(lead.status, LeadStatus::Unsubscribed);
    for enrollment in h.store.enrollments_for_lead(lead.id).await.unwrap() {
        assert!(enrollment.halted);
    }

    // Once unsubscribed, dispatch never sends again.
    let summary = h.dispatcher.run_cycle(at(8, 10)).await.unwrap();
    assert_eq!(summary.sent, 0);
}

#[tokio::test]
async fn meeting_request_books_the_lead_and_replies() {
    let h = Harness::new().await;
    let (lead, _) = ingest_one_reply(&h).await;
    let engine = h.engine(StubClassifier::new(Intent::MeetingRequest, 0.95), 0.5);

    let summary = engine.run_cycle(at(1, 16)).await.unwrap();
    assert_eq!(summary.replies_sent, 1);

    let lead = h.store.get_lead(lead.id).await.unwrap();
    assert_eq!(lead.status, LeadStatus::MeetingBooked);
    // The ingestor already halted this enrollment with `Replied`; the first
    // reason sticks.
    for enrollment in h.store.enrollments_for_lead(lead.id).await.unwrap() {
        assert!(enrollment.halted);
        assert_eq!(enrollment.halted_reason, Some(HaltReason::Replied));
    }
}

#[tokio::test]
async fn out_of_office_is_skipped_without_a_reply() {
    let h = Harness::new().await;
    ingest_one_reply(&h).await;
    let engine = h.engine(StubClassifier::new(Intent::OutOfOffice, 0.9), 0.5);
    let sends_before = h.transport.sent_count();

    let summary = engine.run_cycle(at(1, 16)).await.unwrap();
    assert_eq!(summary.skipped, 1);
    assert_eq!(h.transport.sent_count(), sends_before);

    let record = h.store.get_response(1).await.unwrap();
    assert!(record.reviewed);
    assert!(!record.needs_review);
}

#[tokio::test]
async fn classification_failure_parks_response_without_retry() {
    let h = Harness::new().await;
    ingest_one_reply(&h).await;
    let classifier = StubClassifier::failing();
    let engine = h.engine(Arc::clone(&classifier) as Arc<dyn IntentClassifier>, 0.5);

    let summary = engine.run_cycle(at(1, 16)).await.unwrap();
    assert_eq!(summary.queued_for_review, 1);
    assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);

    let record = h.store.get_response(1).await.unwrap();
    assert!(record.reviewed);
    assert!(record.needs_review);
    assert_eq!(record.intent, None);

    // Parked records are not revisited.
    let summary = engine.run_cycle(at(1, 17)).await.unwrap();
    assert_eq!(summary.processed, 0);
    assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn reply_sends_share_the_hourly_budget() {
    let h = Harness::new().await;
    let inbox = h.inbox(1).await;
    let campaign = h.three_step_campaign(inbox.id).await;
    let lead = h.lead("katie@example.com").await;
    h.store.enroll(lead.id, campaign.id).await.unwrap();

    // The single slot this hour goes to the sequence send.
    h.dispatcher.run_cycle(at(1, 10)).await.unwrap();
    h.transport
        .push_inbound(reply("track-0@test.local", "reply-0@remote", at(1, 10)));
    h.ingestor.run_cycle(at(1, 10)).await.unwrap();

    let engine = h.engine(StubClassifier::new(Intent::Question, 0.9), 0.5);
    let summary = engine.run_cycle(at(1, 10)).await.unwrap();
    assert_eq!(summary.deferred, 1);
    assert_eq!(summary.replies_sent, 0);

    // Next hour the reply goes out, using the cached classification.
    let summary = engine.run_cycle(at(1, 11)).await.unwrap();
    assert_eq!(summary.replies_sent, 1);
}
