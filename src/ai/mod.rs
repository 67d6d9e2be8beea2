//! AI layer — intent classification and reply drafting via rig-core.
//!
//! `LlmProvider` is the thin seam over the model API; the classifier and
//! composer build prompts on top of it and tests stub it out.

pub mod classifier;
pub mod composer;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rig::client::CompletionClient;
use rig::completion::Prompt;
use rig::providers::anthropic;
use secrecy::{ExposeSecret, SecretString};

use crate::error::ClassifierError;

pub use classifier::{Classification, IntentClassifier, LlmClassifier};
pub use composer::{LlmComposer, ReplyComposer};

/// One-shot completion against a model.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, ClassifierError>;
}

/// rig-core backed provider for the Anthropic API.
pub struct RigProvider {
    client: rig::client::Client<anthropic::client::AnthropicExt>,
    model: String,
    timeout: Duration,
}

impl RigProvider {
    pub fn new(
        api_key: &SecretString,
        model: &str,
        timeout: Duration,
    ) -> Result<Self, ClassifierError> {
        let client: rig::client::Client<anthropic::client::AnthropicExt> =
            anthropic::Client::new(api_key.expose_secret()).map_err(|e| {
                ClassifierError::Provider(format!("Failed to create Anthropic client: {e}"))
            })?;
        tracing::info!(model, "Using Anthropic");
        Ok(Self {
            client,
            model: model.to_string(),
            timeout,
        })
    }
}

#[async_trait]
impl LlmProvider for RigProvider {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, ClassifierError> {
        let agent = self.client.agent(&self.model).preamble(system).build();
        let request = async { agent.prompt(prompt).await };
        match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(e)) => Err(ClassifierError::Provider(e.to_string())),
            Err(_) => Err(ClassifierError::Timeout(self.timeout)),
        }
    }
}

/// Build the provider from configuration, or None when no API key is set
/// (the respond cycle then routes everything to manual review).
pub fn provider_from_config(
    config: &crate::config::Config,
) -> Result<Option<Arc<dyn LlmProvider>>, ClassifierError> {
    match &config.api_key {
        Some(key) => Ok(Some(Arc::new(RigProvider::new(
            key,
            &config.model,
            config.llm_timeout,
        )?))),
        None => {
            tracing::warn!("No API key configured; AI replies disabled");
            Ok(None)
        }
    }
}
