use crate::config::Bm25Config;
use crate::corpus::Chunk;
use crate::error::{RagevalError, Result};
use crate::search::tokenizer::tokenize;
use crate::search::{rank_scores, RetrievalResult, Retriever};
use async_trait::async_trait;
use std::collections::HashMap;

/// In-memory Okapi BM25 index over the chunk store.
///
/// Statistics are computed once in [`Retriever::index`]; queries walk the
/// postings of each query term, so chunks that share no term with the query
/// are never touched.
#[derive(Debug)]
pub struct Bm25Retriever {
    params: Bm25Config,
    index: Option<Bm25Index>,
}

#[derive(Debug)]
struct Bm25Index {
    /// Chunk ids in corpus order
    chunk_ids: Vec<String>,
    /// Token count per chunk
    doc_lens: Vec<usize>,
    avg_doc_len: f64,
    /// term -> (chunk position, term frequency), ascending by position
    postings: HashMap<String, Vec<(usize, u32)>>,
    /// term -> idf
    idf: HashMap<String, f64>,
}

impl Bm25Retriever {
    pub fn new(params: Bm25Config) -> Self {
        Self { params, index: None }
    }

    /// Compute BM25 score for every chunk containing at least one query term
    ///
    /// # Returns
    ///
    /// `(chunk position, score)` pairs in corpus order, positive scores only
    fn score(&self, index: &Bm25Index, query_tokens: &[String]) -> Vec<(usize, f64)> {
        let k1 = self.params.k1;
        let b = self.params.b;
        let mut scores = vec![0.0f64; index.chunk_ids.len()];

        // Repeated query terms contribute once per occurrence.
        for token in query_tokens {
            let (Some(postings), Some(idf)) = (index.postings.get(token), index.idf.get(token)) else {
                continue;
            };
            for &(position, tf) in postings {
                let doc_len = index.doc_lens[position];
                if doc_len == 0 {
                    continue;
                }
                let tf = f64::from(tf);
                let norm = 1.0 - b + b * doc_len as f64 / index.avg_doc_len;
                scores[position] += idf * tf * (k1 + 1.0) / (tf + k1 * norm);
            }
        }

        scores
            .into_iter()
            .enumerate()
            .filter(|(_, score)| *score > 0.0)
            .collect()
    }
}

fn build_index(chunks: &[Chunk]) -> Bm25Index {
    let mut postings: HashMap<String, Vec<(usize, u32)>> = HashMap::new();
    let mut doc_lens = Vec::with_capacity(chunks.len());
    let mut total_len = 0usize;

    for (position, chunk) in chunks.iter().enumerate() {
        let tokens = tokenize(&chunk.text);
        if tokens.is_empty() {
            log::warn!("Chunk {} has no indexable tokens", chunk.id);
        }
        doc_lens.push(tokens.len());
        total_len += tokens.len();

        let mut term_freqs: HashMap<String, u32> = HashMap::new();
        for token in tokens {
            *term_freqs.entry(token).or_insert(0) += 1;
        }
        for (term, tf) in term_freqs {
            postings.entry(term).or_default().push((position, tf));
        }
    }

    let n = chunks.len() as f64;
    let idf = postings
        .iter()
        .map(|(term, list)| {
            let df = list.len() as f64;
            (term.clone(), ((n - df + 0.5) / (df + 0.5) + 1.0).ln())
        })
        .collect();

    Bm25Index {
        chunk_ids: chunks.iter().map(|c| c.id.clone()).collect(),
        doc_lens,
        avg_doc_len: total_len as f64 / n,
        postings,
        idf,
    }
}

#[async_trait]
impl Retriever for Bm25Retriever {
    fn name(&self) -> &'static str {
        "bm25"
    }

    async fn index(&mut self, chunks: &[Chunk]) -> Result<()> {
        if chunks.is_empty() {
            return Err(RagevalError::EmptyCorpus);
        }
        let start = std::time::Instant::now();
        let index = build_index(chunks);
        log::info!(
            "BM25 index built: {} chunks, {} terms, avg length {:.1} tokens ({:?})",
            index.chunk_ids.len(),
            index.postings.len(),
            index.avg_doc_len,
            start.elapsed()
        );
        self.index = Some(index);
        Ok(())
    }

    fn is_indexed(&self) -> bool {
        self.index.is_some()
    }

    async fn retrieve(&self, query: &str, top_k: usize) -> Result<RetrievalResult> {
        let index = self.index.as_ref().ok_or(RagevalError::NotIndexed)?;

        let query_tokens = tokenize(query);
        if query_tokens.is_empty() || top_k == 0 {
            return Ok(RetrievalResult::default());
        }

        let scored = self.score(index, &query_tokens);
        Ok(rank_scores(scored, &index.chunk_ids, top_k))
    }
}
