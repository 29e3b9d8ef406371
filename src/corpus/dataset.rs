//! QA dataset examples.

use crate::corpus::{deserialize_id_list, ChunkStore};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Single evaluation example with its gold answer and gold chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    pub question: String,
    /// Reference answer; `answer` is accepted for older datasets.
    #[serde(alias = "answer", default)]
    pub reference_answer: String,
    /// Gold-relevant chunk ids. Treated as a set: duplicates are dropped on load.
    #[serde(default, deserialize_with = "deserialize_id_list")]
    pub relevant_chunk_ids: Vec<String>,
}

impl Example {
    pub fn new(
        question: impl Into<String>,
        reference_answer: impl Into<String>,
        relevant_chunk_ids: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let mut example = Self {
            question: question.into(),
            reference_answer: reference_answer.into(),
            relevant_chunk_ids: relevant_chunk_ids.into_iter().map(Into::into).collect(),
        };
        example.dedup_relevant();
        example
    }

    fn dedup_relevant(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.relevant_chunk_ids.retain(|id| seen.insert(id.clone()));
    }

    /// Relevant ids that do not exist in `store`.
    pub fn unknown_relevant_ids<'a>(&'a self, store: &ChunkStore) -> Vec<&'a str> {
        self.relevant_chunk_ids
            .iter()
            .filter(|id| !store.contains(id))
            .map(String::as_str)
            .collect()
    }
}

/// Load a JSON array of examples
///
/// # Arguments
///
/// * `path` - Dataset file
/// * `store` - When given, relevant ids missing from the corpus are logged
///
/// # Returns
///
/// Examples in file order
pub fn load_dataset(path: &Path, store: Option<&ChunkStore>) -> Result<Vec<Example>> {
    log::info!("Loading dataset from {}", path.display());
    let content = std::fs::read_to_string(path)?;
    let mut examples: Vec<Example> = serde_json::from_str(&content)?;
    for example in &mut examples {
        example.dedup_relevant();
    }

    if let Some(store) = store {
        for (index, example) in examples.iter().enumerate() {
            let unknown = example.unknown_relevant_ids(store);
            if !unknown.is_empty() {
                log::warn!(
                    "Example {} lists relevant chunk ids not in the corpus: {}",
                    index,
                    unknown.join(", ")
                );
            }
        }
    }

    log::info!("Loaded {} examples", examples.len());
    Ok(examples)
}
