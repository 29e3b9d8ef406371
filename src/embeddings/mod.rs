//! Embedding providers for the vector retriever.

pub mod local;
pub mod openai;

use crate::error::Result;
use async_trait::async_trait;

pub use local::LocalEmbedder;
pub use openai::OpenAIEmbedder;

/// Maps text to fixed-dimension vectors.
///
/// Chunks and queries must go through the same embedder so their vectors are
/// comparable.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed texts, one vector per input, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single query.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| crate::error::RagevalError::Embedding("Empty embedding response".to_string()))
    }

    fn dimensions(&self) -> usize;

    fn provider_name(&self) -> &'static str;
}
