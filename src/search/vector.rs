use crate::corpus::Chunk;
use crate::embeddings::Embedder;
use crate::error::{RagevalError, Result};
use crate::search::{rank_scores, RetrievalResult, Retriever};
use async_trait::async_trait;
use std::sync::Arc;

/// Dense retriever: cosine similarity between the query embedding and
/// chunk embeddings computed once at index time.
pub struct VectorRetriever {
    embedder: Arc<dyn Embedder>,
    chunk_ids: Vec<String>,
    /// One embedding per chunk, corpus order
    embeddings: Vec<Vec<f32>>,
}

impl VectorRetriever {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            chunk_ids: Vec::new(),
            embeddings: Vec::new(),
        }
    }
}

#[async_trait]
impl Retriever for VectorRetriever {
    fn name(&self) -> &'static str {
        "vector"
    }

    async fn index(&mut self, chunks: &[Chunk]) -> Result<()> {
        if chunks.is_empty() {
            return Err(RagevalError::EmptyCorpus);
        }
        let start = std::time::Instant::now();
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = self.embedder.embed_batch(&texts).await?;

        if embeddings.len() != chunks.len() {
            return Err(RagevalError::Embedding(format!(
                "Expected {} chunk embeddings, got {}",
                chunks.len(),
                embeddings.len()
            )));
        }
        let dims = self.embedder.dimensions();
        if let Some((position, bad)) = embeddings.iter().enumerate().find(|(_, e)| e.len() != dims) {
            return Err(RagevalError::Embedding(format!(
                "Chunk {} embedding has dimension {}, expected {}",
                chunks[position].id,
                bad.len(),
                dims
            )));
        }

        self.chunk_ids = chunks.iter().map(|c| c.id.clone()).collect();
        self.embeddings = embeddings;
        log::info!(
            "Vector index built with {}: {} chunks x {} dims ({:?})",
            self.embedder.provider_name(),
            self.chunk_ids.len(),
            dims,
            start.elapsed()
        );
        Ok(())
    }

    fn is_indexed(&self) -> bool {
        !self.embeddings.is_empty()
    }

    async fn retrieve(&self, query: &str, top_k: usize) -> Result<RetrievalResult> {
        if !self.is_indexed() {
            return Err(RagevalError::NotIndexed);
        }
        if query.trim().is_empty() || top_k == 0 {
            return Ok(RetrievalResult::default());
        }

        let embed_start = std::time::Instant::now();
        let query_vec = self.embedder.embed_query(query).await?;
        log::debug!("Vector search: query embedding took {:?}", embed_start.elapsed());

        if query_vec.len() != self.embedder.dimensions() {
            return Err(RagevalError::Embedding(format!(
                "Unexpected query embedding dimension: expected {}, got {}",
                self.embedder.dimensions(),
                query_vec.len()
            )));
        }

        let scored = self
            .embeddings
            .iter()
            .enumerate()
            .map(|(position, embedding)| (position, f64::from(cosine_similarity(&query_vec, embedding))))
            .collect();

        Ok(rank_scores(scored, &self.chunk_ids, top_k))
    }
}

/// Compute cosine similarity between two vectors of equal length
///
/// # Returns
///
/// Cosine similarity in [-1.0, 1.0], or 0.0 if either vector has zero magnitude
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }

    dot / (mag_a * mag_b)
}
