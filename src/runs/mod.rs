//! RunStore: persists finalized evaluation runs under a named directory and
//! loads them back for inspection and comparison.

pub mod compare;
pub mod record;

use crate::error::{RagevalError, Result};
use crate::eval::aggregate;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};

pub use compare::{compare_runs, MetricDelta, RunComparison};
pub use record::{
    ExampleFailure, ExampleResult, FailureCounts, FailureKind, RunMetadata, RunRecord,
    EVALUATION_METRICS_FILE, FORMAT_VERSION, RAG_RESULTS_FILE,
};

use record::{EvaluationMetricsFile, RagResultsFile};

/// An open, not yet finalized run.
///
/// Results are buffered in memory and only written by [`RunStore::finalize`],
/// which consumes the handle, so a finalized run can never be appended to.
#[derive(Debug)]
pub struct RunHandle {
    run_name: String,
    created_at: DateTime<Utc>,
    metadata: RunMetadata,
    results: Vec<ExampleResult>,
    skipped: usize,
    cancelled: bool,
}

impl RunHandle {
    pub fn run_name(&self) -> &str {
        &self.run_name
    }

    pub fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Append one example result
    ///
    /// # Errors
    ///
    /// `InvalidInput` if `result.index` is out of range or not greater than
    /// the last appended index.
    ///
    /// A result carrying a `CANCELLED` failure marks the run cancelled.
    pub fn append(&mut self, result: ExampleResult) -> Result<()> {
        if result.index >= self.metadata.dataset_size {
            return Err(RagevalError::InvalidInput(format!(
                "Example index {} out of range for dataset of {}",
                result.index, self.metadata.dataset_size
            )));
        }
        if let Some(last) = self.results.last() {
            if result.index <= last.index {
                return Err(RagevalError::InvalidInput(format!(
                    "Example {} appended after example {}",
                    result.index, last.index
                )));
            }
        }
        log::debug!("Run {}: persisted example {}", self.run_name, result.index);
        if result.has_failure(FailureKind::Cancelled) {
            self.cancelled = true;
        }
        self.results.push(result);
        Ok(())
    }

    /// Note an example that was never started because the run was cancelled.
    pub fn record_skipped(&mut self) {
        self.cancelled = true;
        self.skipped += 1;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

/// Filesystem-backed run storage rooted at `runs_dir`.
#[derive(Debug, Clone)]
pub struct RunStore {
    root: PathBuf,
}

impl RunStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_name: &str) -> PathBuf {
        self.root.join(run_name)
    }

    /// True if a run directory holds either artifact.
    pub fn exists(&self, run_name: &str) -> bool {
        let dir = self.run_dir(run_name);
        dir.join(RAG_RESULTS_FILE).is_file() || dir.join(EVALUATION_METRICS_FILE).is_file()
    }

    /// Open a new run
    ///
    /// Nothing is written until [`RunStore::finalize`]. With `overwrite`, an
    /// existing run keeps its artifacts until the new run replaces them.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for an unusable name, `DuplicateRun` if the run exists
    /// and `overwrite` is false.
    pub fn create(&self, run_name: &str, overwrite: bool, metadata: RunMetadata) -> Result<RunHandle> {
        validate_run_name(run_name)?;
        if self.exists(run_name) {
            if !overwrite {
                return Err(RagevalError::DuplicateRun(run_name.to_string()));
            }
            log::warn!("Run {} exists and will be replaced on finalize", run_name);
        }

        log::info!(
            "Created run {} ({} examples, {} retrieval, model {})",
            run_name,
            metadata.dataset_size,
            metadata.retrieval_method,
            metadata.model
        );
        Ok(RunHandle {
            run_name: run_name.to_string(),
            created_at: Utc::now(),
            metadata,
            results: Vec::new(),
            skipped: 0,
            cancelled: false,
        })
    }

    /// Compute the aggregate and write both artifacts atomically
    ///
    /// # Errors
    ///
    /// `InvalidInput` if a run that was not cancelled is missing examples;
    /// `Io`/`Json` on write failure.
    pub fn finalize(&self, handle: RunHandle) -> Result<RunRecord> {
        let expected = handle.metadata.dataset_size;
        if !handle.cancelled && handle.results.len() != expected {
            return Err(RagevalError::InvalidInput(format!(
                "Run {} has {} of {} examples; only a cancelled run may finalize early",
                handle.run_name,
                handle.results.len(),
                expected
            )));
        }

        let metric_records: Vec<_> = handle.results.iter().map(|r| r.metrics.clone()).collect();
        let record = RunRecord {
            aggregate: aggregate(&handle.metadata.metrics, &metric_records),
            failures: FailureCounts::tally(&handle.results, handle.skipped),
            run_name: handle.run_name,
            created_at: handle.created_at,
            finalized_at: Utc::now(),
            metadata: handle.metadata,
            per_example: handle.results,
            cancelled: handle.cancelled,
        };

        let dir = self.run_dir(&record.run_name);
        std::fs::create_dir_all(&dir)?;
        let (rag, metrics) = record.to_files();
        write_json_atomic(&dir.join(RAG_RESULTS_FILE), &rag)?;
        write_json_atomic(&dir.join(EVALUATION_METRICS_FILE), &metrics)?;

        log::info!(
            "Finalized run {}: {} processed, {} skipped, failures: retrieval {}, generation {}, factuality {}",
            record.run_name,
            record.failures.examples_processed,
            record.failures.examples_skipped,
            record.failures.retrieval_failed,
            record.failures.generation_failed,
            record.failures.factuality_unscored
        );
        Ok(record)
    }

    /// Load a finalized run by name.
    pub fn load(&self, run_name: &str) -> Result<RunRecord> {
        validate_run_name(run_name)?;
        let dir = self.run_dir(run_name);
        let rag_path = dir.join(RAG_RESULTS_FILE);
        let metrics_path = dir.join(EVALUATION_METRICS_FILE);

        if !rag_path.is_file() && !metrics_path.is_file() {
            return Err(RagevalError::RunNotFound(run_name.to_string()));
        }

        let corrupt = |reason: String| RagevalError::CorruptRun {
            run: run_name.to_string(),
            reason,
        };
        let rag: RagResultsFile = read_json(&rag_path).map_err(|e| corrupt(e.to_string()))?;
        let metrics: EvaluationMetricsFile = read_json(&metrics_path).map_err(|e| corrupt(e.to_string()))?;

        RunRecord::from_files(rag, metrics).map_err(corrupt)
    }

    /// Names of finalized runs, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if self.exists(name) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Load two runs and diff their aggregates.
    pub fn compare(&self, left: &str, right: &str) -> Result<RunComparison> {
        let left = self.load(left)?;
        let right = self.load(right)?;
        Ok(compare_runs(&left, &right))
    }
}

/// Run names become directory names: non-empty, no separators, not `.`/`..`.
pub fn validate_run_name(run_name: &str) -> Result<()> {
    let invalid = |why: &str| Err(RagevalError::InvalidInput(format!("Invalid run name '{}': {}", run_name, why)));
    if run_name.trim().is_empty() {
        return invalid("must not be empty");
    }
    if run_name == "." || run_name == ".." {
        return invalid("reserved name");
    }
    if run_name.contains(['/', '\\']) || run_name.contains('\0') {
        return invalid("must not contain path separators");
    }
    Ok(())
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| RagevalError::InvalidInput(format!("Bad artifact path: {}", path.display())))?;
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));

    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::{Chunk, Example};
    use crate::eval::{Metric, MetricEngine, MetricRecord};
    use crate::generation::GenerationResult;
    use crate::search::{RetrievalResult, RetrievedChunk};
    use tempfile::TempDir;

    fn metadata(dataset_size: usize) -> RunMetadata {
        RunMetadata {
            config_fingerprint: "abc".to_string(),
            retrieval_method: "bm25".to_string(),
            top_k: 5,
            model: "test-model".to_string(),
            metrics: vec![Metric::Recall(1), Metric::Mrr, Metric::F1, Metric::Factuality],
            tokenizer_version: crate::search::TOKENIZER_VERSION.to_string(),
            f1_normalization_version: crate::eval::F1_NORMALIZATION_VERSION.to_string(),
            dataset_size,
        }
    }

    fn example_result(index: usize, mrr: f64) -> ExampleResult {
        let engine = MetricEngine::new(metadata(0).metrics);
        let mut metrics: MetricRecord = engine.begin();
        metrics.set(Metric::Recall(1), mrr);
        metrics.set(Metric::Mrr, mrr);
        metrics.set(Metric::F1, 1.0 / 3.0);
        metrics.mark_unscored(Metric::Factuality, "judge returned garbage");

        ExampleResult {
            index,
            example: Example::new(format!("question {}", index), "answer", ["2"]),
            retrieval: RetrievalResult {
                hits: vec![RetrievedChunk { chunk_id: "2".into(), score: 0.1 + 0.2, rank: 1 }],
            },
            generation: Some(GenerationResult {
                answer_text: "generated".into(),
                raw_context: vec![Chunk::new("2", "chunk two")],
            }),
            metrics,
            failures: vec![ExampleFailure {
                kind: FailureKind::FactualityUnscored,
                reason: "judge returned garbage".into(),
            }],
        }
    }

    #[test]
    fn test_finalize_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = RunStore::new(dir.path());

        let mut handle = store.create("baseline", false, metadata(2)).unwrap();
        handle.append(example_result(0, 1.0)).unwrap();
        handle.append(example_result(1, 0.5)).unwrap();
        let record = store.finalize(handle).unwrap();

        assert!(dir.path().join("baseline").join(RAG_RESULTS_FILE).is_file());
        assert!(dir.path().join("baseline").join(EVALUATION_METRICS_FILE).is_file());
        assert!((record.aggregate["Retrieval_MRR"].mean - 0.75).abs() < 1e-12);
        assert_eq!(record.aggregate["Answer_Factuality"].computable, 0);
        assert_eq!(record.aggregate["Answer_Factuality"].unscored, 2);
        assert_eq!(record.failures.factuality_unscored, 2);

        let loaded = store.load("baseline").unwrap();
        assert_eq!(loaded, record);
    }

    #[test]
    fn test_artifacts_carry_format_version() {
        let dir = TempDir::new().unwrap();
        let store = RunStore::new(dir.path());
        let mut handle = store.create("v", false, metadata(1)).unwrap();
        handle.append(example_result(0, 1.0)).unwrap();
        store.finalize(handle).unwrap();

        for file in [RAG_RESULTS_FILE, EVALUATION_METRICS_FILE] {
            let text = std::fs::read_to_string(dir.path().join("v").join(file)).unwrap();
            let json: serde_json::Value = serde_json::from_str(&text).unwrap();
            assert_eq!(json["format_version"], FORMAT_VERSION);
            assert_eq!(json["run_name"], "v");
        }
    }

    #[test]
    fn test_metrics_file_carries_failure_markers() {
        let dir = TempDir::new().unwrap();
        let store = RunStore::new(dir.path());
        let mut handle = store.create("markers", false, metadata(2)).unwrap();

        let mut failed = example_result(0, 1.0);
        failed.generation = None;
        failed.metrics.mark_unscored(Metric::F1, "Generation failed: HTTP 503");
        failed.failures = vec![
            ExampleFailure {
                kind: FailureKind::GenerationFailed,
                reason: "Generation failed: HTTP 503".into(),
            },
        ];
        handle.append(failed).unwrap();
        let mut clean = example_result(1, 1.0);
        clean.failures.clear();
        handle.append(clean).unwrap();
        store.finalize(handle).unwrap();

        let text = std::fs::read_to_string(dir.path().join("markers").join(EVALUATION_METRICS_FILE)).unwrap();
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        let entries = json["per_example"].as_array().unwrap();
        assert_eq!(entries[0]["failures"][0]["kind"], "GENERATION_FAILED");
        assert!(entries[0]["metrics"]["unscored"]["Answer_F1"].is_string());
        assert!(entries[1].get("failures").is_none());
    }

    #[test]
    fn test_cancelled_result_marks_run_cancelled() {
        let dir = TempDir::new().unwrap();
        let store = RunStore::new(dir.path());

        let mut handle = store.create("complete", false, metadata(1)).unwrap();
        handle.append(example_result(0, 1.0)).unwrap();
        assert!(!handle.is_cancelled());

        let mut handle = store.create("interrupted", false, metadata(1)).unwrap();
        let mut result = example_result(0, 1.0);
        result.failures = vec![ExampleFailure {
            kind: FailureKind::Cancelled,
            reason: "run cancelled".into(),
        }];
        handle.append(result).unwrap();
        assert!(handle.is_cancelled());
        let record = store.finalize(handle).unwrap();
        assert!(record.cancelled);
        assert_eq!(record.failures.cancelled, 1);
    }

    #[test]
    fn test_duplicate_run_requires_overwrite() {
        let dir = TempDir::new().unwrap();
        let store = RunStore::new(dir.path());
        let mut handle = store.create("dup", false, metadata(1)).unwrap();
        handle.append(example_result(0, 1.0)).unwrap();
        store.finalize(handle).unwrap();

        let err = store.create("dup", false, metadata(1)).unwrap_err();
        assert!(matches!(err, RagevalError::DuplicateRun(_)));

        let mut handle = store.create("dup", true, metadata(1)).unwrap();
        // Old run still loadable until the new one is finalized
        assert!((store.load("dup").unwrap().aggregate["Retrieval_MRR"].mean - 1.0).abs() < 1e-12);
        handle.append(example_result(0, 0.25)).unwrap();
        store.finalize(handle).unwrap();
        assert!((store.load("dup").unwrap().aggregate["Retrieval_MRR"].mean - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_append_rejects_out_of_order_and_out_of_range() {
        let dir = TempDir::new().unwrap();
        let store = RunStore::new(dir.path());
        let mut handle = store.create("order", false, metadata(3)).unwrap();
        handle.append(example_result(1, 1.0)).unwrap();
        assert!(handle.append(example_result(0, 1.0)).is_err());
        assert!(handle.append(example_result(1, 1.0)).is_err());
        assert!(handle.append(example_result(3, 1.0)).is_err());
        assert_eq!(handle.len(), 1);
    }

    #[test]
    fn test_finalize_requires_all_examples_unless_cancelled() {
        let dir = TempDir::new().unwrap();
        let store = RunStore::new(dir.path());

        let mut handle = store.create("partial", false, metadata(2)).unwrap();
        handle.append(example_result(0, 1.0)).unwrap();
        assert!(matches!(store.finalize(handle).unwrap_err(), RagevalError::InvalidInput(_)));
        assert!(!store.exists("partial"));

        let mut handle = store.create("partial", false, metadata(2)).unwrap();
        handle.append(example_result(0, 1.0)).unwrap();
        handle.record_skipped();
        let record = store.finalize(handle).unwrap();
        assert!(record.cancelled);
        assert_eq!(record.failures.examples_processed, 1);
        assert_eq!(record.failures.examples_skipped, 1);
        assert_eq!(store.load("partial").unwrap(), record);
    }

    #[test]
    fn test_load_missing_and_corrupt() {
        let dir = TempDir::new().unwrap();
        let store = RunStore::new(dir.path());
        assert!(matches!(store.load("nope").unwrap_err(), RagevalError::RunNotFound(_)));

        let run_dir = dir.path().join("broken");
        std::fs::create_dir_all(&run_dir).unwrap();
        std::fs::write(run_dir.join(RAG_RESULTS_FILE), "{}").unwrap();
        assert!(matches!(store.load("broken").unwrap_err(), RagevalError::CorruptRun { .. }));
    }

    #[test]
    fn test_list_only_finalized_runs() {
        let dir = TempDir::new().unwrap();
        let store = RunStore::new(dir.path());
        assert!(store.list().unwrap().is_empty());

        for name in ["b-run", "a-run"] {
            let mut handle = store.create(name, false, metadata(1)).unwrap();
            handle.append(example_result(0, 1.0)).unwrap();
            store.finalize(handle).unwrap();
        }
        std::fs::create_dir_all(dir.path().join("empty-dir")).unwrap();
        assert_eq!(store.list().unwrap(), vec!["a-run", "b-run"]);
    }

    #[test]
    fn test_run_name_validation() {
        assert!(validate_run_name("exp-1_bm25").is_ok());
        assert!(validate_run_name("").is_err());
        assert!(validate_run_name("  ").is_err());
        assert!(validate_run_name("..").is_err());
        assert!(validate_run_name("a/b").is_err());
        assert!(validate_run_name("a\\b").is_err());

        let dir = TempDir::new().unwrap();
        let store = RunStore::new(dir.path());
        assert!(store.create("../escape", false, metadata(1)).is_err());
    }
}
