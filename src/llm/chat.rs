use crate::config::LlmConfig;
use crate::error::{RagevalError, Result};
use crate::llm::retry::{AttemptError, RetryError, RetryPolicy};
use crate::llm::CompletionClient;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Attribution headers sent with every completion request.
const REFERER: &str = "https://rag-evaluation.com";
const TITLE: &str = "RAG Evaluation Tool";

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<ResponseMessage>,
    /// Legacy completion-style providers put the text here
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Pull the first choice's text out of a response, if any.
fn first_choice_text(response: ChatResponse) -> Option<String> {
    let choice = response.choices.into_iter().next()?;
    choice
        .message
        .and_then(|m| m.content)
        .or(choice.text)
        .filter(|text| !text.trim().is_empty())
}

/// OpenAI-compatible `/chat/completions` client
///
/// Every request is bounded by the configured timeout; transient failures are
/// retried per [`RetryPolicy`] until the client's cancellation token fires.
pub struct ChatCompletionClient {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl ChatCompletionClient {
    /// Create a new client
    ///
    /// # Arguments
    ///
    /// * `base_url` - API root, e.g. `https://openrouter.ai/api/v1`
    /// * `model` - Model identifier sent with each request
    /// * `api_key` - Bearer token
    /// * `timeout` - Per-request timeout
    /// * `retry` - Backoff policy for transient failures
    pub fn new(
        base_url: &str,
        model: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RagevalError::Completion(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key: api_key.into(),
            model: model.into(),
            retry,
            cancel: CancellationToken::new(),
        })
    }

    /// Stop retrying once `cancel` fires. A request already on the wire is
    /// allowed to finish.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn from_config(llm: &LlmConfig, api_key: String) -> Result<Self> {
        Self::new(
            &llm.base_url,
            llm.model.clone(),
            api_key,
            llm.timeout(),
            RetryPolicy::from_config(llm),
        )
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn attempt(&self, prompt: &str) -> std::result::Result<String, AttemptError> {
        let request = ChatRequest {
            model: &self.model,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .header("HTTP-Referer", REFERER)
            .header("X-Title", TITLE)
            .json(&request)
            .send()
            .await
            .map_err(|e| AttemptError::from_reqwest(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            return Err(AttemptError::from_status(status, &body));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| AttemptError::from_reqwest(&e))?;

        first_choice_text(parsed).ok_or_else(|| AttemptError::Transient("Empty choices in completion response".to_string()))
    }
}

#[async_trait]
impl CompletionClient for ChatCompletionClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        self.retry
            .run_until_cancelled("Completion", &self.cancel, || self.attempt(prompt))
            .await
            .map_err(|e| match e {
                RetryError::Cancelled { .. } => RagevalError::Cancelled(format!("{} {}", self.model, e)),
                RetryError::Failed { .. } => RagevalError::Completion(format!("{} {}", self.model, e)),
            })
    }

    fn model(&self) -> &str {
        &self.model
    }
}
