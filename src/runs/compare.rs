//! Side-by-side comparison of two finalized runs.

use crate::runs::RunRecord;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

/// One metric's aggregate in both runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricDelta {
    pub metric: String,
    pub left: Option<f64>,
    pub right: Option<f64>,
    /// `right - left`, when both runs report the metric
    pub delta: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunComparison {
    pub left: String,
    pub right: String,
    pub rows: Vec<MetricDelta>,
}

/// Diff the aggregate means of two runs over the union of their metrics.
pub fn compare_runs(left: &RunRecord, right: &RunRecord) -> RunComparison {
    let left_means = left.means();
    let right_means = right.means();
    let names: BTreeSet<&str> = left_means.keys().chain(right_means.keys()).copied().collect();

    let rows = names
        .into_iter()
        .map(|name| {
            let l = left_means.get(name).copied();
            let r = right_means.get(name).copied();
            MetricDelta {
                metric: name.to_string(),
                left: l,
                right: r,
                delta: l.zip(r).map(|(l, r)| r - l),
            }
        })
        .collect();

    RunComparison {
        left: left.run_name.clone(),
        right: right.run_name.clone(),
        rows,
    }
}

fn cell(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{:.4}", v))
}

impl fmt::Display for RunComparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self.rows.iter().map(|r| r.metric.len()).max().unwrap_or(6).max(6);
        writeln!(f, "{:<width$}  {:>12}  {:>12}  {:>10}", "Metric", self.left, self.right, "Delta")?;
        for row in &self.rows {
            let delta = row
                .delta
                .map_or_else(|| "-".to_string(), |d| format!("{:+.4}", d));
            writeln!(
                f,
                "{:<width$}  {:>12}  {:>12}  {:>10}",
                row.metric,
                cell(row.left),
                cell(row.right),
                delta
            )?;
        }
        Ok(())
    }
}
