//! Corpus chunks and the read-only store that owns them.

pub mod dataset;

use crate::error::{RagevalError, Result};
use crate::search::RetrievalResult;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::path::Path;

pub use dataset::{load_dataset, Example};

/// One addressable unit of corpus text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    #[serde(alias = "page_id", deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(alias = "content")]
    pub text: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Chunk {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            metadata: serde_json::Map::new(),
        }
    }
}

/// Ids in corpus and dataset files may be strings or integers.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Str(String),
    Int(i64),
}

impl From<RawId> for String {
    fn from(raw: RawId) -> Self {
        match raw {
            RawId::Str(s) => s,
            RawId::Int(n) => n.to_string(),
        }
    }
}

pub(crate) fn deserialize_id<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    RawId::deserialize(deserializer).map(String::from)
}

pub(crate) fn deserialize_id_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<Vec<RawId>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(String::from)
        .collect())
}

/// Ordered, immutable collection of chunks addressable by id.
///
/// There is no mutation API: once loaded, the store is shared read-only by
/// every worker of a run.
#[derive(Debug, Clone, Default)]
pub struct ChunkStore {
    chunks: Vec<Chunk>,
    positions: HashMap<String, usize>,
}

impl ChunkStore {
    /// Build a store from chunks in ingestion order
    ///
    /// # Errors
    ///
    /// `InvalidInput` if two chunks share an id.
    pub fn load(chunks: Vec<Chunk>) -> Result<Self> {
        let mut positions = HashMap::with_capacity(chunks.len());
        for (position, chunk) in chunks.iter().enumerate() {
            if positions.insert(chunk.id.clone(), position).is_some() {
                return Err(RagevalError::InvalidInput(format!(
                    "Duplicate chunk id in corpus: {}",
                    chunk.id
                )));
            }
        }
        Ok(Self { chunks, positions })
    }

    /// Read a JSON array of chunks from disk.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        log::info!("Loading corpus from {}", path.display());
        let content = std::fs::read_to_string(path)?;
        let chunks: Vec<Chunk> = serde_json::from_str(&content)?;
        let store = Self::load(chunks)?;
        log::info!("Loaded {} chunks", store.len());
        Ok(store)
    }

    /// Look up a chunk by id; fails with `NotFound` if absent.
    pub fn get(&self, id: &str) -> Result<&Chunk> {
        self.positions
            .get(id)
            .map(|&position| &self.chunks[position])
            .ok_or_else(|| RagevalError::NotFound(id.to_string()))
    }

    /// All chunks in ingestion order.
    pub fn all(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Corpus position of `id`, used for tie-breaking.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.positions.get(id).copied()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.positions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Resolve retrieved ids to chunks, in rank order.
    pub fn resolve(&self, result: &RetrievalResult) -> Result<Vec<Chunk>> {
        result.ids().map(|id| self.get(id).cloned()).collect()
    }
}
