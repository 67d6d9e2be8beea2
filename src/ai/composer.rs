//! Reply drafting for classified responses.

use std::sync::Arc;

use async_trait::async_trait;

use crate::ai::LlmProvider;
use crate::error::ClassifierError;
use crate::model::{Intent, Lead, ResponseRecord, SentEmail};

/// Drafts a reply for a classified inbound response.
#[async_trait]
pub trait ReplyComposer: Send + Sync {
    async fn compose(
        &self,
        lead: &Lead,
        response: &ResponseRecord,
        intent: Intent,
        previous: Option<&SentEmail>,
    ) -> Result<String, ClassifierError>;
}

const COMPOSE_SYSTEM: &str = "You are a friendly, professional sales assistant. \
Respond with ONLY the email body (no subject line, no JSON, just the reply text).";

static COMPOSE_PROMPT: &str = r#"Generate a personalized email reply to this lead.

What we offer (the only product facts you may use):
{fact_sheet}

Lead info:
- Name: {full_name}
- Company: {company}
- Email: {email}

Their message:
Subject: {subject}
{body}

Their intent: {intent}

Our previous outreach:
{previous}

Guidelines:
1. Be warm, professional, and conversational (not salesy)
2. Address their specific points/questions directly
3. Keep it concise (3-5 short paragraphs max)
4. If they're interested: propose next steps (call/demo)
5. If they have questions: answer them helpfully
6. If not interested: thank them graciously, leave door open

DO NOT:
- Be pushy or aggressive
- Use excessive exclamation marks
- Make up information beyond the facts above
"#;

/// LLM-backed reply composer, constrained to a fact sheet.
pub struct LlmComposer {
    provider: Arc<dyn LlmProvider>,
    fact_sheet: String,
}

impl LlmComposer {
    pub fn new(provider: Arc<dyn LlmProvider>, fact_sheet: String) -> Self {
        Self {
            provider,
            fact_sheet,
        }
    }

    fn build_prompt(
        &self,
        lead: &Lead,
        response: &ResponseRecord,
        intent: Intent,
        previous: Option<&SentEmail>,
    ) -> String {
        let previous = previous
            .map(|s| format!("Subject: {}", s.subject))
            .unwrap_or_else(|| "(initial outreach)".to_string());

        COMPOSE_PROMPT
            .replace("{fact_sheet}", &self.fact_sheet)
            .replace("{full_name}", &lead.full_name())
            .replace("{company}", lead.company.as_deref().unwrap_or(""))
            .replace("{email}", &lead.email)
            .replace("{subject}", &response.subject)
            .replace("{body}", &response.body)
            .replace("{intent}", intent.as_str())
            .replace("{previous}", &previous)
    }
}

#[async_trait]
impl ReplyComposer for LlmComposer {
    async fn compose(
        &self,
        lead: &Lead,
        response: &ResponseRecord,
        intent: Intent,
        previous: Option<&SentEmail>,
    ) -> Result<String, ClassifierError> {
        let prompt = self.build_prompt(lead, response, intent, previous);
        let draft = self.provider.complete(COMPOSE_SYSTEM, &prompt).await?;
        let draft = draft.trim();
        if draft.is_empty() {
            return Err(ClassifierError::Malformed("Empty reply draft".into()));
        }
        Ok(draft.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LeadStatus;
    use chrono::Utc;

    struct EchoProvider;

    #[async_trait]
    impl LlmProvider for EchoProvider {
        async fn complete(
            &self,
            _system: &str,
            prompt: &str,
        ) -> Result<String, ClassifierError> {
            Ok(format!("  draft for: {}  ", prompt.len()))
        }
    }

    struct BlankProvider;

    #[async_trait]
    impl LlmProvider for BlankProvider {
        async fn complete(
            &self,
            _system: &str,
            _prompt: &str,
        ) -> Result<String, ClassifierError> {
            Ok("   ".into())
        }
    }

    fn lead() -> Lead {
        Lead {
            id: 1,
            email: "katie@example.com".into(),
            first_name: Some("Katie".into()),
            last_name: None,
            company: Some("Acme".into()),
            status: LeadStatus::Responded,
            created_at: Utc::now(),
        }
    }

    fn response() -> ResponseRecord {
        ResponseRecord {
            id: 1,
            lead_id: Some(1),
            enrollment_id: Some(1),
            sent_email_id: Some(1),
            message_id: "m@remote".into(),
            subject: "Re: Intro".into(),
            body: "What does it cost?".into(),
            received_at: Utc::now(),
            intent: Some(Intent::Question),
            confidence: Some(0.8),
            draft_reply: None,
            reply_sent: false,
            needs_review: false,
            reviewed: false,
        }
    }

    #[tokio::test]
    async fn compose_trims_draft() {
        let composer = LlmComposer::new(Arc::new(EchoProvider), "facts".into());
        let draft = composer
            .compose(&lead(), &response(), Intent::Question, None)
            .await
            .unwrap();
        assert!(draft.starts_with("draft for:"));
        assert!(!draft.ends_with(' '));
    }

    #[tokio::test]
    async fn empty_draft_is_malformed() {
        let composer = LlmComposer::new(Arc::new(BlankProvider), "facts".into());
        let err = composer
            .compose(&lead(), &response(), Intent::Question, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ClassifierError::Malformed(_)));
    }
}
