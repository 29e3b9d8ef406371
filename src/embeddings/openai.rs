use crate::cache::EmbeddingCache;
use crate::config::{EmbeddingsConfig, LlmConfig};
use crate::embeddings::Embedder;
use crate::error::{RagevalError, Result};
use crate::llm::retry::{AttemptError, RetryPolicy};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Request body for an OpenAI-compatible `/embeddings` endpoint
#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

/// Response body from an OpenAI-compatible `/embeddings` endpoint
#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

/// OpenAI-compatible embeddings client
///
/// Splits large inputs into batches, retries transient failures with the same
/// backoff policy as completion calls, and caches query embeddings.
pub struct OpenAIEmbedder {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
    dimensions: usize,
    batch_size: usize,
    retry: RetryPolicy,
    cache: Option<Arc<EmbeddingCache>>,
}

impl OpenAIEmbedder {
    /// Create an embedder from configuration
    ///
    /// # Arguments
    ///
    /// * `embeddings` - Endpoint, model, dimensions and batch size
    /// * `llm` - Timeout and retry settings, shared with completion calls
    /// * `api_key` - Bearer token
    /// * `cache` - Optional query embedding cache
    pub fn from_config(
        embeddings: &EmbeddingsConfig,
        llm: &LlmConfig,
        api_key: String,
        cache: Option<Arc<EmbeddingCache>>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(llm.timeout())
            .build()
            .map_err(|e| RagevalError::Embedding(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", embeddings.base_url.trim_end_matches('/')),
            api_key,
            model: embeddings.model.clone(),
            dimensions: embeddings.dimensions,
            // OpenAI rejects more than 2048 inputs per request
            batch_size: embeddings.batch_size.clamp(1, 2048),
            retry: RetryPolicy::from_config(llm),
            cache,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Make a single API request for one batch
    async fn request_batch(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, AttemptError> {
        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
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

        let result: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| AttemptError::from_reqwest(&e))?;

        let embeddings = order_embeddings(result.data);
        if embeddings.len() != texts.len() {
            return Err(AttemptError::Transient(format!(
                "Expected {} embeddings, got {}",
                texts.len(),
                embeddings.len()
            )));
        }
        Ok(embeddings)
    }
}

/// Restore input order when the server reports `index`.
fn order_embeddings(mut data: Vec<EmbeddingData>) -> Vec<Vec<f32>> {
    if data.iter().all(|d| d.index.is_some()) {
        data.sort_by_key(|d| d.index);
    }
    data.into_iter().map(|d| d.embedding).collect()
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut all_embeddings = Vec::with_capacity(texts.len());
        let batches = texts.len().div_ceil(self.batch_size);

        for (i, batch) in texts.chunks(self.batch_size).enumerate() {
            let label = format!("Embedding batch {}/{}", i + 1, batches);
            let embeddings = self
                .retry
                .run(&label, || self.request_batch(batch))
                .await
                .map_err(|e| RagevalError::Embedding(e.to_string()))?;
            all_embeddings.extend(embeddings);

            // Small pause between full batches to stay under rate limits
            if i + 1 < batches {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }

        Ok(all_embeddings)
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(cache) = &self.cache {
            if let Some(cached) = cache.get(&self.model, text) {
                log::debug!("Query embedding cache hit");
                return Ok(cached);
            }
        }

        let embedding = self
            .retry
            .run("Query embedding", || {
                let input = [text.to_string()];
                async move {
                    let mut vectors = self.request_batch(&input).await?;
                    vectors
                        .pop()
                        .ok_or_else(|| AttemptError::Transient("Empty embedding response".to_string()))
                }
            })
            .await
            .map_err(|e| RagevalError::Embedding(e.to_string()))?;

        if let Some(cache) = &self.cache {
            cache.put(&self.model, text, embedding.clone());
        }

        Ok(embedding)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn provider_name(&self) -> &'static str {
        "openai"
    }
}
