//! Metric identifiers and the pure per-example metrics: Recall@K, Precision@K,
//! reciprocal rank, and token F1.

use crate::search::RetrievalResult;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// Version tag for [`normalize_answer_tokens`]; bump whenever it changes.
pub const F1_NORMALIZATION_VERSION: &str = "f1-norm-v1";

/// A metric that can be requested in `evaluation.metrics`.
///
/// Configured as `recall@K`, `precision@K`, `mrr`, `f1`, `factuality`;
/// reported under [`Metric::name`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Metric {
    Recall(usize),
    Precision(usize),
    Mrr,
    F1,
    Factuality,
}

impl Metric {
    /// Name used in reports and run artifacts.
    pub fn name(&self) -> String {
        match self {
            Metric::Recall(k) => format!("Retrieval_Recall@{}", k),
            Metric::Precision(k) => format!("Retrieval_Precision@{}", k),
            Metric::Mrr => "Retrieval_MRR".to_string(),
            Metric::F1 => "Answer_F1".to_string(),
            Metric::Factuality => "Answer_Factuality".to_string(),
        }
    }

    /// Retrieval metrics depend only on the ranking.
    pub fn is_retrieval(&self) -> bool {
        matches!(self, Metric::Recall(_) | Metric::Precision(_) | Metric::Mrr)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Metric::Recall(k) => write!(f, "recall@{}", k),
            Metric::Precision(k) => write!(f, "precision@{}", k),
            Metric::Mrr => f.write_str("mrr"),
            Metric::F1 => f.write_str("f1"),
            Metric::Factuality => f.write_str("factuality"),
        }
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        let parse_k = |k: &str| -> Result<usize, String> {
            match k.parse::<usize>() {
                Ok(k) if k > 0 => Ok(k),
                _ => Err(format!("Invalid cutoff in metric '{}': must be a positive integer", s)),
            }
        };

        if let Some(k) = lower.strip_prefix("recall@") {
            return Ok(Metric::Recall(parse_k(k)?));
        }
        if let Some(k) = lower.strip_prefix("precision@") {
            return Ok(Metric::Precision(parse_k(k)?));
        }
        match lower.as_str() {
            "mrr" => Ok(Metric::Mrr),
            "f1" => Ok(Metric::F1),
            "factuality" => Ok(Metric::Factuality),
            _ => Err(format!(
                "Unknown metric '{}'. Valid: recall@K, precision@K, mrr, f1, factuality",
                s
            )),
        }
    }
}

impl TryFrom<String> for Metric {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Metric> for String {
    fn from(metric: Metric) -> Self {
        metric.to_string()
    }
}

/// Precision at K: proportion of top-K results that are relevant.
/// Returns (relevant count in top-K) / K. If k is 0, returns 0.0.
pub fn precision_at_k(results: &RetrievalResult, relevant_chunk_ids: &[String], k: usize) -> f64 {
    if k == 0 {
        return 0.0;
    }
    let relevant: HashSet<&str> = relevant_chunk_ids.iter().map(String::as_str).collect();
    let hits = results.ids().take(k).filter(|id| relevant.contains(id)).count();
    hits as f64 / k as f64
}

/// Recall at K: proportion of all relevant chunks that appear in top-K.
///
/// An empty gold set yields 0.0, not "undefined".
pub fn recall_at_k(results: &RetrievalResult, relevant_chunk_ids: &[String], k: usize) -> f64 {
    let relevant: HashSet<&str> = relevant_chunk_ids.iter().map(String::as_str).collect();
    if relevant.is_empty() {
        return 0.0;
    }
    let retrieved_relevant = results
        .ids()
        .take(k)
        .filter(|id| relevant.contains(id))
        .count();
    retrieved_relevant as f64 / relevant.len() as f64
}

/// 1 / (1-indexed rank of the first relevant result) over the full ranking;
/// 0.0 when nothing relevant is retrieved. Averaged across examples this is MRR.
pub fn reciprocal_rank(results: &RetrievalResult, relevant_chunk_ids: &[String]) -> f64 {
    let relevant: HashSet<&str> = relevant_chunk_ids.iter().map(String::as_str).collect();
    results
        .ids()
        .position(|id| relevant.contains(id))
        .map(|i| 1.0 / (i + 1) as f64)
        .unwrap_or(0.0)
}

fn punctuation_regex() -> &'static Regex {
    static PUNCT: OnceLock<Regex> = OnceLock::new();
    PUNCT.get_or_init(|| Regex::new(r"[^\w\s]").expect("valid punctuation regex"))
}

/// Answer normalization for token F1.
///
/// Lowercase, replace every character that is neither a word character nor
/// whitespace with a space, split on whitespace. Stop words are kept.
pub fn normalize_answer_tokens(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    punctuation_regex()
        .replace_all(&lowered, " ")
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Token-level F1 between a generated and a reference answer
///
/// Overlap counts each shared token min(count_generated, count_reference)
/// times. Either side empty after normalization gives 0.0.
pub fn token_f1(generated: &str, reference: &str) -> f64 {
    let gen_tokens = normalize_answer_tokens(generated);
    let ref_tokens = normalize_answer_tokens(reference);

    if gen_tokens.is_empty() || ref_tokens.is_empty() {
        log::debug!("Empty token list in F1 calculation");
        return 0.0;
    }

    let mut ref_counts: HashMap<&str, usize> = HashMap::new();
    for token in &ref_tokens {
        *ref_counts.entry(token.as_str()).or_insert(0) += 1;
    }
    let mut common = 0usize;
    for token in &gen_tokens {
        if let Some(count) = ref_counts.get_mut(token.as_str()) {
            if *count > 0 {
                *count -= 1;
                common += 1;
            }
        }
    }

    if common == 0 {
        return 0.0;
    }
    let precision = common as f64 / gen_tokens.len() as f64;
    let recall = common as f64 / ref_tokens.len() as f64;
    2.0 * precision * recall / (precision + recall)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::RetrievedChunk;

    fn ranking(ids: &[&str]) -> RetrievalResult {
        RetrievalResult {
            hits: ids
                .iter()
                .enumerate()
                .map(|(i, id)| RetrievedChunk {
                    chunk_id: id.to_string(),
                    score: (ids.len() - i) as f64,
                    rank: i + 1,
                })
                .collect(),
        }
    }

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn precision_at_k_all_relevant() {
        let results = ranking(&["a", "b", "c"]);
        assert!((precision_at_k(&results, &ids(&["a", "b", "c"]), 3) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn precision_at_k_partial() {
        let results = ranking(&["a", "b", "x"]);
        assert!((precision_at_k(&results, &ids(&["a", "b"]), 3) - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn precision_at_k_zero_k() {
        assert_eq!(precision_at_k(&ranking(&["a"]), &ids(&["a"]), 0), 0.0);
    }

    #[test]
    fn recall_at_k_all_retrieved() {
        let results = ranking(&["a", "b"]);
        assert!((recall_at_k(&results, &ids(&["a", "b"]), 10) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn recall_at_k_partial() {
        let results = ranking(&["a", "x"]);
        assert!((recall_at_k(&results, &ids(&["a", "b"]), 10) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn recall_at_k_empty_relevant() {
        assert_eq!(recall_at_k(&ranking(&["a"]), &[], 10), 0.0);
        assert_eq!(reciprocal_rank(&ranking(&["a"]), &[]), 0.0);
    }

    #[test]
    fn recall_at_k_monotonic_in_k() {
        let results = ranking(&["x", "a", "y", "b", "z", "c"]);
        let relevant = ids(&["a", "b", "c", "d"]);
        let mut previous = 0.0;
        for k in 0..=8 {
            let recall = recall_at_k(&results, &relevant, k);
            assert!(recall >= previous, "recall dropped at k={}", k);
            previous = recall;
        }
        assert!((previous - 0.75).abs() < 1e-12);
    }

    #[test]
    fn recall_duplicate_gold_ids_count_once() {
        let results = ranking(&["a"]);
        assert!((recall_at_k(&results, &ids(&["a", "a"]), 1) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn mrr_first_rank() {
        let rr = reciprocal_rank(&ranking(&["x", "y"]), &ids(&["x"]));
        assert!((rr - 1.0).abs() < 1e-12, "RR should be 1.0 when first result relevant");
    }

    #[test]
    fn mrr_fourth_rank() {
        let rr = reciprocal_rank(&ranking(&["a", "b", "c", "d", "e"]), &ids(&["d", "e"]));
        assert!((rr - 0.25).abs() < 1e-12);
    }

    #[test]
    fn mrr_no_relevant_result() {
        assert_eq!(reciprocal_rank(&ranking(&["a", "b"]), &ids(&["z"])), 0.0);
        assert_eq!(reciprocal_rank(&ranking(&[]), &ids(&["z"])), 0.0);
    }

    #[test]
    fn normalize_strips_punctuation_and_case() {
        assert_eq!(
            normalize_answer_tokens("The Eiffel-Tower, in PARIS!"),
            vec!["the", "eiffel", "tower", "in", "paris"]
        );
        assert!(normalize_answer_tokens(" ... ").is_empty());
    }

    #[test]
    fn token_f1_identical_is_one() {
        assert!((token_f1("Paris is the capital", "paris is THE capital.") - 1.0).abs() < 1e-12);
        assert!((token_f1("the the cat", "the the cat") - 1.0).abs() < 1e-12);
    }

    #[test]
    fn token_f1_disjoint_is_zero() {
        assert_eq!(token_f1("red apple", "blue sky"), 0.0);
    }

    #[test]
    fn token_f1_partial_overlap() {
        // common = {paris}; p = 1/2, r = 1/3 -> f1 = 0.4
        assert!((token_f1("in paris", "paris france europe") - 0.4).abs() < 1e-12);
    }

    #[test]
    fn token_f1_bag_overlap() {
        // generated has "the" twice, reference once: only one counts
        // common = 2 (the, cat); p = 2/3, r = 2/2 -> f1 = 0.8
        assert!((token_f1("the the cat", "the cat") - 0.8).abs() < 1e-12);
    }

    #[test]
    fn token_f1_empty_side_is_zero() {
        assert_eq!(token_f1("", "something"), 0.0);
        assert_eq!(token_f1("something", "!!!"), 0.0);
        assert_eq!(token_f1("", ""), 0.0);
    }

    #[test]
    fn metric_parse_and_names() {
        assert_eq!("recall@5".parse::<Metric>().unwrap(), Metric::Recall(5));
        assert_eq!("Precision@3".parse::<Metric>().unwrap(), Metric::Precision(3));
        assert_eq!("MRR".parse::<Metric>().unwrap(), Metric::Mrr);
        assert_eq!(Metric::Recall(10).name(), "Retrieval_Recall@10");
        assert_eq!(Metric::Mrr.name(), "Retrieval_MRR");
        assert_eq!(Metric::F1.name(), "Answer_F1");
        assert_eq!(Metric::Factuality.name(), "Answer_Factuality");
        assert!("recall@0".parse::<Metric>().is_err());
        assert!("recall@x".parse::<Metric>().is_err());
        assert!("bleu".parse::<Metric>().is_err());
    }

    #[test]
    fn metric_serde_uses_config_identifier() {
        let json = serde_json::to_string(&vec![Metric::Recall(1), Metric::Factuality]).unwrap();
        assert_eq!(json, r#"["recall@1","factuality"]"#);
        let back: Vec<Metric> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, vec![Metric::Recall(1), Metric::Factuality]);
    }
}
