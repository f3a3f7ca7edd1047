// Language model module
// This module talks to an OpenAI-compatible chat completions API


use anyhow::{Context, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::config::LlmConfig;
use crate::{AmenityError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    #[inline]
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    #[inline]
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    #[inline]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    #[inline]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Produces a reply for an ordered list of chat messages.
///
/// Treated as opaque and possibly slow; failures surface as
/// [`AmenityError::LanguageModel`].
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate(&self, messages: &[ChatMessage]) -> Result<String>;

    fn model_name(&self) -> &str;
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Client for `POST {base_url}/chat/completions`
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    endpoint: Url,
    model: String,
    temperature: f32,
    api_key: Option<String>,
    agent: ureq::Agent,
    timeout: Duration,
}

impl OpenAiClient {
    #[inline]
    pub fn new(config: &LlmConfig) -> anyhow::Result<Self> {
        let mut base = Url::parse(&config.base_url)
            .with_context(|| format!("Invalid language model URL: {}", config.base_url))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let endpoint = base
            .join("chat/completions")
            .context("Failed to build chat completions URL")?;
        let timeout = Duration::from_secs(config.timeout_seconds);

        Ok(Self {
            endpoint,
            model: config.model.clone(),
            temperature: config.temperature,
            api_key: config.api_key.clone(),
            agent: ureq::Agent::config_builder()
                .timeout_global(Some(timeout))
                .build()
                .into(),
            timeout,
        })
    }

    #[inline]
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn complete(&self, messages: &[ChatMessage]) -> anyhow::Result<String> {
        let request = CompletionRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
        };
        let body =
            serde_json::to_string(&request).context("Failed to serialize completion request")?;

        debug!(
            "Requesting completion from {} with {} messages",
            self.model,
            messages.len()
        );

        let mut builder = self
            .agent
            .post(self.endpoint.as_str())
            .header("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response_text = match builder.send(&body) {
            Ok(mut response) => response
                .body_mut()
                .read_to_string()
                .context("Failed to read completion response")?,
            Err(ureq::Error::StatusCode(code)) => {
                return Err(anyhow!("Completion request failed with HTTP {}", code));
            }
            Err(e) => {
                return Err(anyhow::Error::from(e)).context("Completion request failed");
            }
        };

        let response: CompletionResponse = serde_json::from_str(&response_text)
            .context("Failed to parse completion response")?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| anyhow!("Completion response contained no message"))
    }
}

#[async_trait]
impl LanguageModel for OpenAiClient {
    async fn generate(&self, messages: &[ChatMessage]) -> Result<String> {
        let client = self.clone();
        let messages = messages.to_vec();
        let budget = self.timeout + Duration::from_secs(1);

        match tokio::time::timeout(
            budget,
            tokio::task::spawn_blocking(move || client.complete(&messages)),
        )
        .await
        {
            Err(_) => {
                warn!("Language model call timed out after {:?}", budget);
                Err(AmenityError::LanguageModel(format!(
                    "timed out after {}ms",
                    budget.as_millis()
                )))
            }
            Ok(Err(join_error)) => Err(AmenityError::LanguageModel(format!(
                "completion task failed: {}",
                join_error
            ))),
            Ok(Ok(result)) => result.map_err(|e| AmenityError::LanguageModel(format!("{:#}", e))),
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
