//! Retrieval over the chunk store: BM25 and dense-vector variants behind one trait.

pub mod bm25;
pub mod tokenizer;
pub mod vector;

use crate::config::{Config, EmbeddingProvider, RetrievalMethod};
use crate::corpus::Chunk;
use crate::embeddings::{Embedder, LocalEmbedder, OpenAIEmbedder};
use crate::cache::EmbeddingCache;
use crate::error::{RagevalError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use bm25::Bm25Retriever;
pub use tokenizer::{tokenize, TOKENIZER_VERSION};
pub use vector::VectorRetriever;

/// One ranked hit: chunk identity, retriever score, and 1-indexed rank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub score: f64,
    pub rank: usize,
}

/// Ranked retrieval output, descending by score, at most `top_k` long.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RetrievalResult {
    pub hits: Vec<RetrievedChunk>,
}

impl RetrievalResult {
    /// Chunk ids in rank order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.hits.iter().map(|h| h.chunk_id.as_str())
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }
}

/// A ranking function over an indexed corpus.
///
/// `index` is called once per run; `retrieve` is then shared read-only across
/// workers, so implementations must be deterministic for identical inputs.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Short name used in logs and run metadata.
    fn name(&self) -> &'static str;

    /// Build the index. Fails with `EmptyCorpus` when `chunks` is empty.
    async fn index(&mut self, chunks: &[Chunk]) -> Result<()>;

    fn is_indexed(&self) -> bool;

    /// Rank chunks for `query`. Fails with `NotIndexed` before `index`.
    async fn retrieve(&self, query: &str, top_k: usize) -> Result<RetrievalResult>;
}

/// Turn per-chunk scores (in corpus order) into a ranked result.
///
/// The sort is stable, so equal scores keep corpus order.
pub(crate) fn rank_scores(
    scored: Vec<(usize, f64)>,
    chunk_ids: &[String],
    top_k: usize,
) -> RetrievalResult {
    let mut scored = scored;
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));

    let hits = scored
        .into_iter()
        .take(top_k)
        .enumerate()
        .map(|(idx, (position, score))| RetrievedChunk {
            chunk_id: chunk_ids[position].clone(),
            score,
            rank: idx + 1,
        })
        .collect();

    RetrievalResult { hits }
}

/// Build the retriever selected by `retrieval.method`.
///
/// The returned retriever is not indexed yet.
pub fn build_retriever(config: &Config) -> Result<Box<dyn Retriever>> {
    match config.retrieval.method {
        RetrievalMethod::Bm25 => Ok(Box::new(Bm25Retriever::new(config.retrieval.bm25))),
        RetrievalMethod::Vector => {
            let embedder: Arc<dyn Embedder> = match config.embeddings.provider {
                EmbeddingProvider::Local => {
                    Arc::new(LocalEmbedder::new(config.embeddings.dimensions))
                }
                EmbeddingProvider::Openai => {
                    let api_key = config
                        .embeddings_api_key()
                        .map_err(|e| RagevalError::Config(e.to_string()))?;
                    let cache = if config.embeddings.cache_capacity > 0 {
                        Some(Arc::new(EmbeddingCache::new(config.embeddings.cache_capacity)))
                    } else {
                        None
                    };
                    Arc::new(OpenAIEmbedder::from_config(&config.embeddings, &config.llm, api_key, cache)?)
                }
            };
            Ok(Box::new(VectorRetriever::new(embedder)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("c{}", i)).collect()
    }

    #[test]
    fn test_rank_scores_orders_descending_with_ranks() {
        let result = rank_scores(vec![(0, 0.5), (1, 2.0), (2, 1.0)], &ids(3), 10);
        let order: Vec<&str> = result.ids().collect();
        assert_eq!(order, vec!["c1", "c2", "c0"]);
        for (idx, hit) in result.hits.iter().enumerate() {
            assert_eq!(hit.rank, idx + 1);
        }
    }

    #[test]
    fn test_rank_scores_ties_keep_corpus_order() {
        let result = rank_scores(vec![(0, 1.0), (1, 3.0), (2, 1.0), (3, 1.0)], &ids(4), 10);
        let order: Vec<&str> = result.ids().collect();
        assert_eq!(order, vec!["c1", "c0", "c2", "c3"]);
    }

    #[test]
    fn test_rank_scores_truncates_to_top_k() {
        let result = rank_scores(vec![(0, 1.0), (1, 2.0), (2, 3.0)], &ids(3), 2);
        assert_eq!(result.len(), 2);
        assert_eq!(result.hits[0].chunk_id, "c2");

        let empty = rank_scores(vec![(0, 1.0)], &ids(1), 0);
        assert!(empty.is_empty());
    }

    #[test]
    fn test_retrieval_result_serializes_as_list() {
        let result = rank_scores(vec![(0, 1.5)], &ids(1), 5);
        let json = serde_json::to_value(&result).unwrap();
        assert!(json.is_array());
        assert_eq!(json[0]["chunk_id"], "c0");
        assert_eq!(json[0]["rank"], 1);
    }
}
