//! Run record types and the on-disk artifact formats.

use crate::corpus::Example;
use crate::eval::{Metric, MetricRecord, MetricSummary};
use crate::generation::GenerationResult;
use crate::search::RetrievalResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Version of both artifact files.
pub const FORMAT_VERSION: u32 = 1;

pub const RAG_RESULTS_FILE: &str = "rag_results.json";
pub const EVALUATION_METRICS_FILE: &str = "evaluation_metrics.json";

/// Why part of an example could not be scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    RetrievalFailed,
    GenerationFailed,
    FactualityUnscored,
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::RetrievalFailed => "RETRIEVAL_FAILED",
            FailureKind::GenerationFailed => "GENERATION_FAILED",
            FailureKind::FactualityUnscored => "FACTUALITY_UNSCORED",
            FailureKind::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExampleFailure {
    pub kind: FailureKind,
    pub reason: String,
}

/// Everything recorded for one dataset example.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExampleResult {
    /// Position in the dataset
    pub index: usize,
    pub example: Example,
    pub retrieval: RetrievalResult,
    /// `None` when generation failed
    pub generation: Option<GenerationResult>,
    pub metrics: MetricRecord,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<ExampleFailure>,
}

impl ExampleResult {
    pub fn has_failure(&self, kind: FailureKind) -> bool {
        self.failures.iter().any(|f| f.kind == kind)
    }
}

/// Per-category failure counts for a finalized run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCounts {
    /// Examples that were started and persisted
    pub examples_processed: usize,
    /// Examples never started because the run was cancelled
    pub examples_skipped: usize,
    pub retrieval_failed: usize,
    pub generation_failed: usize,
    pub factuality_unscored: usize,
    pub cancelled: usize,
}

impl FailureCounts {
    pub fn tally(results: &[ExampleResult], skipped: usize) -> Self {
        let count = |kind| results.iter().filter(|r| r.has_failure(kind)).count();
        Self {
            examples_processed: results.len(),
            examples_skipped: skipped,
            retrieval_failed: count(FailureKind::RetrievalFailed),
            generation_failed: count(FailureKind::GenerationFailed),
            factuality_unscored: count(FailureKind::FactualityUnscored),
            cancelled: count(FailureKind::Cancelled),
        }
    }
}

/// Settings that identify how a run was produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    /// SHA-256 of the scoring-relevant configuration
    pub config_fingerprint: String,
    pub retrieval_method: String,
    pub top_k: usize,
    pub model: String,
    pub metrics: Vec<Metric>,
    pub tokenizer_version: String,
    pub f1_normalization_version: String,
    pub dataset_size: usize,
}

/// A finalized evaluation run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub run_name: String,
    pub created_at: DateTime<Utc>,
    pub finalized_at: DateTime<Utc>,
    pub metadata: RunMetadata,
    pub per_example: Vec<ExampleResult>,
    pub aggregate: BTreeMap<String, MetricSummary>,
    pub failures: FailureCounts,
    pub cancelled: bool,
}

impl RunRecord {
    /// Aggregate means keyed by report name.
    pub fn means(&self) -> BTreeMap<&str, f64> {
        self.aggregate
            .iter()
            .map(|(name, summary)| (name.as_str(), summary.mean))
            .collect()
    }
}

/// `rag_results.json`: raw retrieval and generation output.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RagResultsFile {
    pub format_version: u32,
    pub run_name: String,
    pub created_at: DateTime<Utc>,
    pub metadata: RunMetadata,
    pub results: Vec<RagEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RagEntry {
    pub index: usize,
    pub example: Example,
    pub retrieval: RetrievalResult,
    pub generation: Option<GenerationResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<ExampleFailure>,
}

/// `evaluation_metrics.json`: per-example metric records and the aggregate.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct EvaluationMetricsFile {
    pub format_version: u32,
    pub run_name: String,
    pub created_at: DateTime<Utc>,
    pub finalized_at: DateTime<Utc>,
    pub cancelled: bool,
    pub failures: FailureCounts,
    pub aggregate: BTreeMap<String, MetricSummary>,
    pub per_example: Vec<MetricEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct MetricEntry {
    pub index: usize,
    pub metrics: MetricRecord,
    /// Same markers as the results file, so this file reads on its own
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<ExampleFailure>,
}

impl RunRecord {
    pub(crate) fn to_files(&self) -> (RagResultsFile, EvaluationMetricsFile) {
        let rag = RagResultsFile {
            format_version: FORMAT_VERSION,
            run_name: self.run_name.clone(),
            created_at: self.created_at,
            metadata: self.metadata.clone(),
            results: self
                .per_example
                .iter()
                .map(|r| RagEntry {
                    index: r.index,
                    example: r.example.clone(),
                    retrieval: r.retrieval.clone(),
                    generation: r.generation.clone(),
                    failures: r.failures.clone(),
                })
                .collect(),
        };
        let metrics = EvaluationMetricsFile {
            format_version: FORMAT_VERSION,
            run_name: self.run_name.clone(),
            created_at: self.created_at,
            finalized_at: self.finalized_at,
            cancelled: self.cancelled,
            failures: self.failures,
            aggregate: self.aggregate.clone(),
            per_example: self
                .per_example
                .iter()
                .map(|r| MetricEntry {
                    index: r.index,
                    metrics: r.metrics.clone(),
                    failures: r.failures.clone(),
                })
                .collect(),
        };
        (rag, metrics)
    }

    /// Rebuild a record from both artifacts
    ///
    /// # Errors
    ///
    /// Returns the inconsistency as a message; the caller wraps it in
    /// `CorruptRun`.
    pub(crate) fn from_files(rag: RagResultsFile, metrics: EvaluationMetricsFile) -> Result<Self, String> {
        for (file, version) in [
            (RAG_RESULTS_FILE, rag.format_version),
            (EVALUATION_METRICS_FILE, metrics.format_version),
        ] {
            if version != FORMAT_VERSION {
                return Err(format!(
                    "{} has format_version {}, expected {}",
                    file, version, FORMAT_VERSION
                ));
            }
        }
        if rag.run_name != metrics.run_name {
            return Err(format!(
                "run name mismatch between artifacts: {} vs {}",
                rag.run_name, metrics.run_name
            ));
        }
        if rag.results.len() != metrics.per_example.len() {
            return Err(format!(
                "{} has {} examples but {} has {}",
                RAG_RESULTS_FILE,
                rag.results.len(),
                EVALUATION_METRICS_FILE,
                metrics.per_example.len()
            ));
        }

        let per_example = rag
            .results
            .into_iter()
            .zip(metrics.per_example)
            .map(|(entry, metric)| {
                if entry.index != metric.index {
                    return Err(format!(
                        "example index mismatch: {} vs {}",
                        entry.index, metric.index
                    ));
                }
                Ok(ExampleResult {
                    index: entry.index,
                    example: entry.example,
                    retrieval: entry.retrieval,
                    generation: entry.generation,
                    metrics: metric.metrics,
                    failures: entry.failures,
                })
            })
            .collect::<Result<Vec<_>, String>>()?;

        Ok(RunRecord {
            run_name: rag.run_name,
            created_at: rag.created_at,
            finalized_at: metrics.finalized_at,
            metadata: rag.metadata,
            per_example,
            aggregate: metrics.aggregate,
            failures: metrics.failures,
            cancelled: metrics.cancelled,
        })
    }
}
