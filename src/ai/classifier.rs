//! Intent classification for inbound replies.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;

use crate::ai::LlmProvider;
use crate::error::ClassifierError;
use crate::model::{Intent, Lead, ResponseRecord};

/// Classification result: what the sender wants and how sure the model is.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub intent: Intent,
    pub confidence: f64,
}

/// Classifies an inbound reply against the lead it came from.
#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify(
        &self,
        lead: &Lead,
        response: &ResponseRecord,
    ) -> Result<Classification, ClassifierError>;
}

const CLASSIFY_SYSTEM: &str =
    "You classify replies to cold outreach emails. Respond with JSON only.";

static CLASSIFY_PROMPT: &str = r#"Analyze this email response and determine the sender's intent.

Email from: {from_name} ({from_email})
Company: {company}
Subject: {subject}

Email body:
{body}

---
Original outreach context:
{context}

Classify the intent as ONE of:
- interested: They want to learn more or seem open to conversation
- meeting_request: They explicitly want to schedule a meeting/call
- question: They have specific questions about our offering
- not_interested: They politely declined or said not now
- unsubscribe: They want to be removed from emails
- out_of_office: This is an auto-reply or out of office message
- spam: Irrelevant response or spam

Respond in JSON format:
{
    "intent": "category",
    "confidence": 0.0-1.0
}
"#;

// Model output may wrap the JSON in prose or a markdown fence.
static JSON_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{[\s\S]*\}").expect("json extraction regex"));

#[derive(Debug, Deserialize)]
struct RawClassification {
    intent: String,
    confidence: f64,
}

/// LLM-backed classifier.
pub struct LlmClassifier {
    provider: Arc<dyn LlmProvider>,
    context: String,
}

impl LlmClassifier {
    /// `context` is the fact sheet describing what the outreach was about.
    pub fn new(provider: Arc<dyn LlmProvider>, context: String) -> Self {
        Self { provider, context }
    }

    fn build_prompt(&self, lead: &Lead, response: &ResponseRecord) -> String {
        CLASSIFY_PROMPT
            .replace("{from_name}", &lead.full_name())
            .replace("{from_email}", &lead.email)
            .replace("{company}", lead.company.as_deref().unwrap_or("Unknown"))
            .replace("{subject}", &response.subject)
            .replace("{body}", &response.body)
            .replace("{context}", &self.context)
    }
}

#[async_trait]
impl IntentClassifier for LlmClassifier {
    async fn classify(
        &self,
        lead: &Lead,
        response: &ResponseRecord,
    ) -> Result<Classification, ClassifierError> {
        let prompt = self.build_prompt(lead, response);
        let raw = self.provider.complete(CLASSIFY_SYSTEM, &prompt).await?;
        parse_classification(&raw)
    }
}

/// Extract and validate the classification JSON from model output.
pub fn parse_classification(raw: &str) -> Result<Classification, ClassifierError> {
    let json = JSON_RE
        .find(raw)
        .ok_or_else(|| ClassifierError::Malformed(format!("No JSON in output: {raw:.80}")))?;

    let parsed: RawClassification = serde_json::from_str(json.as_str())
        .map_err(|e| ClassifierError::Malformed(format!("Bad classification JSON: {e}")))?;

    let intent = Intent::parse(&parsed.intent).ok_or_else(|| {
        ClassifierError::Malformed(format!("Unknown intent {:?}", parsed.intent))
    })?;

    if !(0.0..=1.0).contains(&parsed.confidence) {
        return Err(ClassifierError::Malformed(format!(
            "Confidence out of range: {}",
            parsed.confidence
        )));
    }

    Ok(Classification {
        intent,
        confidence: parsed.confidence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_json() {
        let c = parse_classification(r#"{"intent": "interested", "confidence": 0.92}"#).unwrap();
        assert_eq!(c.intent, Intent::Interested);
        assert!((c.confidence - 0.92).abs() < f64::EPSILON);
    }

    #[test]
    fn parses_json_inside_markdown_fence() {
        let raw = "Here is the analysis:\n```json\n{\"intent\": \"unsubscribe\", \"confidence\": 0.99}\n```";
        let c = parse_classification(raw).unwrap();
        assert_eq!(c.intent, Intent::Unsubscribe);
    }

    #[test]
    fn unknown_intent_is_malformed() {
        let err = parse_classification(r#"{"intent": "unclear", "confidence": 0.3}"#).unwrap_err();
        assert!(matches!(err, ClassifierError::Malformed(_)));
    }

    #[test]
    fn missing_json_is_malformed() {
        let err = parse_classification("I think they are interested.").unwrap_err();
        assert!(matches!(err, ClassifierError::Malformed(_)));
    }

    #[test]
    fn confidence_out_of_range_is_malformed() {
        let err = parse_classification(r#"{"intent": "spam", "confidence": 1.7}"#).unwrap_err();
        assert!(matches!(err, ClassifierError::Malformed(_)));
    }
}
