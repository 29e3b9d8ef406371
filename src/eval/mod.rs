//! MetricEngine: per-example metric records and dataset aggregation.

pub mod aggregate;
pub mod factuality;
pub mod metrics;

use crate::search::RetrievalResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use aggregate::{aggregate, MetricSummary};
pub use factuality::{parse_factuality_response, FactualityJudge, FactualityVerdict};
pub use metrics::{
    normalize_answer_tokens, precision_at_k, recall_at_k, reciprocal_rank, token_f1, Metric,
    F1_NORMALIZATION_VERSION,
};

/// Per-example scores for every requested metric.
///
/// A metric that could not be computed keeps the 0.0 sentinel in `scores` and
/// gets an entry in `unscored` with the reason. Keys are report names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub scores: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub unscored: BTreeMap<String, String>,
}

impl MetricRecord {
    /// Record with every metric present at 0.0.
    pub fn new(metrics: &[Metric]) -> Self {
        Self {
            scores: metrics.iter().map(|m| (m.name(), 0.0)).collect(),
            unscored: BTreeMap::new(),
        }
    }

    pub fn set(&mut self, metric: Metric, value: f64) {
        let name = metric.name();
        self.unscored.remove(&name);
        self.scores.insert(name, value);
    }

    pub fn mark_unscored(&mut self, metric: Metric, reason: impl Into<String>) {
        let name = metric.name();
        self.scores.insert(name.clone(), 0.0);
        self.unscored.insert(name, reason.into());
    }

    pub fn get(&self, metric: Metric) -> Option<f64> {
        self.scores.get(&metric.name()).copied()
    }

    pub fn is_unscored(&self, name: &str) -> bool {
        self.unscored.contains_key(name)
    }
}

/// Computes the configured metrics for one example at a time.
///
/// Local metrics are pure; the factuality value is computed by
/// [`FactualityJudge`] and handed in.
#[derive(Debug, Clone)]
pub struct MetricEngine {
    metrics: Vec<Metric>,
}

impl MetricEngine {
    pub fn new(metrics: Vec<Metric>) -> Self {
        Self { metrics }
    }

    pub fn metrics(&self) -> &[Metric] {
        &self.metrics
    }

    pub fn wants(&self, metric: Metric) -> bool {
        self.metrics.contains(&metric)
    }

    pub fn begin(&self) -> MetricRecord {
        MetricRecord::new(&self.metrics)
    }

    /// Score retrieval metrics, or mark them unscored with `Err(reason)`.
    pub fn score_retrieval(
        &self,
        record: &mut MetricRecord,
        retrieval: std::result::Result<&RetrievalResult, &str>,
        relevant_chunk_ids: &[String],
    ) {
        for &metric in self.metrics.iter().filter(|m| m.is_retrieval()) {
            match retrieval {
                Ok(result) => {
                    let value = match metric {
                        Metric::Recall(k) => recall_at_k(result, relevant_chunk_ids, k),
                        Metric::Precision(k) => precision_at_k(result, relevant_chunk_ids, k),
                        Metric::Mrr => reciprocal_rank(result, relevant_chunk_ids),
                        Metric::F1 | Metric::Factuality => continue,
                    };
                    record.set(metric, value);
                }
                Err(reason) => record.mark_unscored(metric, reason),
            }
        }
    }

    /// Score token F1, or mark it unscored with `Err(reason)`.
    pub fn score_f1(
        &self,
        record: &mut MetricRecord,
        generated: std::result::Result<&str, &str>,
        reference_answer: &str,
    ) {
        if !self.wants(Metric::F1) {
            return;
        }
        match generated {
            Ok(answer) => record.set(Metric::F1, token_f1(answer, reference_answer)),
            Err(reason) => record.mark_unscored(Metric::F1, reason),
        }
    }

    /// Record the judge's verdict, or mark factuality unscored with `Err(reason)`.
    pub fn score_factuality(
        &self,
        record: &mut MetricRecord,
        verdict: std::result::Result<&FactualityVerdict, &str>,
    ) {
        if !self.wants(Metric::Factuality) {
            return;
        }
        match verdict {
            Ok(verdict) => record.set(Metric::Factuality, verdict.score()),
            Err(reason) => record.mark_unscored(Metric::Factuality, reason),
        }
    }

    pub fn aggregate(&self, records: &[MetricRecord]) -> BTreeMap<String, MetricSummary> {
        aggregate(&self.metrics, records)
    }
}
