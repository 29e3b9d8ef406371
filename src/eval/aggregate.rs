use crate::eval::{Metric, MetricRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Dataset-level result for one metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    /// Mean over computable examples; 0.0 when none were computable
    pub mean: f64,
    /// Examples that contributed to the mean
    pub computable: usize,
    /// Examples where the metric could not be computed
    pub unscored: usize,
}

/// Aggregate per-example records, keyed by report name
///
/// Unscored entries are excluded from the mean but counted, so a low mean can
/// be told apart from a metric that was rarely measurable.
pub fn aggregate(metrics: &[Metric], records: &[MetricRecord]) -> BTreeMap<String, MetricSummary> {
    metrics
        .iter()
        .map(|metric| {
            let name = metric.name();
            let mut sum = 0.0;
            let mut computable = 0usize;
            let mut unscored = 0usize;

            for record in records {
                if record.is_unscored(&name) {
                    unscored += 1;
                } else if let Some(value) = record.scores.get(&name) {
                    sum += value;
                    computable += 1;
                }
            }

            let mean = if computable > 0 { sum / computable as f64 } else { 0.0 };
            (name, MetricSummary { mean, computable, unscored })
        })
        .collect()
}
