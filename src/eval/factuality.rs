//! LLM-judged factuality: prompt the judge to count reference facts present
//! in the generated answer, then extract the counts from its reply.

use crate::error::{RagevalError, Result};
use crate::llm::{render_template, CompletionClient};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::{Arc, OnceLock};

/// Default judge prompt. Placeholders: `{question}`, `{reference_answer}`,
/// `{generated_answer}`. The JSON example braces are left as-is by rendering.
pub const DEFAULT_FACTUALITY_PROMPT: &str = r#"You are evaluating the factual content of an answer.

Question: {question}

Reference answer: {reference_answer}

Generated answer: {generated_answer}

Step 1: Break the reference answer into its atomic facts.
Step 2: Count how many of those facts are stated or clearly implied by the generated answer.

Respond with only a JSON object of the form:
{"total_reference_facts": <integer>, "facts_included_in_generated": <integer>}"#;

pub const TOTAL_KEY: &str = "total_reference_facts";
pub const INCLUDED_KEY: &str = "facts_included_in_generated";

/// Fact counts returned by the judge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactualityVerdict {
    pub total_reference_facts: u64,
    pub facts_included_in_generated: u64,
}

impl FactualityVerdict {
    /// included / total, with included clamped to total; 0.0 when total is 0.
    pub fn score(&self) -> f64 {
        if self.total_reference_facts == 0 {
            return 0.0;
        }
        let included = self.facts_included_in_generated.min(self.total_reference_facts);
        included as f64 / self.total_reference_facts as f64
    }
}

fn fence_regex() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\r?\n?(.*?)```").expect("valid fence regex"))
}

/// Non-negative integer count; integral floats and numeric strings accepted.
fn as_count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && *f >= 0.0 && f.fract() == 0.0 && *f <= u64::MAX as f64)
                .map(|f| f as u64)
        }),
        Value::String(s) => as_count(&serde_json::from_str::<Value>(s.trim()).ok()?),
        _ => None,
    }
}

/// Outcome of inspecting one JSON object.
enum Candidate {
    Verdict(FactualityVerdict),
    /// Both keys present but values unusable
    Invalid(String),
    /// Keys missing
    Absent,
}

fn inspect_object(object: &Map<String, Value>) -> Candidate {
    let (Some(total), Some(included)) = (object.get(TOTAL_KEY), object.get(INCLUDED_KEY)) else {
        return Candidate::Absent;
    };
    match (as_count(total), as_count(included)) {
        (Some(total), Some(included)) => Candidate::Verdict(FactualityVerdict {
            total_reference_facts: total,
            facts_included_in_generated: included,
        }),
        _ => Candidate::Invalid(format!(
            "{} = {}, {} = {} are not non-negative integers",
            TOTAL_KEY, total, INCLUDED_KEY, included
        )),
    }
}

/// Try every `{` in `text` as the start of a JSON object, in order.
///
/// Nested objects are reached because their own `{` is also tried.
fn scan_objects(text: &str, invalid: &mut Option<String>) -> Option<FactualityVerdict> {
    for (start, _) in text.match_indices('{') {
        let mut stream = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
        let Some(Ok(Value::Object(object))) = stream.next() else {
            continue;
        };
        match inspect_object(&object) {
            Candidate::Verdict(verdict) => return Some(verdict),
            Candidate::Invalid(reason) => {
                invalid.get_or_insert(reason);
            }
            Candidate::Absent => {}
        }
    }
    None
}

/// Extract fact counts from a judge reply
///
/// Fenced code blocks are searched first, then the whole text. Surrounding
/// prose, code fences, and extra keys are tolerated.
///
/// # Errors
///
/// `FactualityParse` if no JSON object carrying both count keys with
/// non-negative integer values is found.
pub fn parse_factuality_response(text: &str) -> Result<FactualityVerdict> {
    let mut invalid = None;

    for block in fence_regex().captures_iter(text).filter_map(|c| c.get(1)) {
        if let Some(verdict) = scan_objects(block.as_str(), &mut invalid) {
            return Ok(checked(verdict));
        }
    }
    if let Some(verdict) = scan_objects(text, &mut invalid) {
        return Ok(checked(verdict));
    }

    let reason = invalid.unwrap_or_else(|| {
        format!("no JSON object with \"{}\" and \"{}\" found", TOTAL_KEY, INCLUDED_KEY)
    });
    Err(RagevalError::FactualityParse(format!("{} in response: {}", reason, preview(text))))
}

fn checked(verdict: FactualityVerdict) -> FactualityVerdict {
    if verdict.facts_included_in_generated > verdict.total_reference_facts {
        log::warn!(
            "Judge reported {} included facts out of {}; clamping",
            verdict.facts_included_in_generated,
            verdict.total_reference_facts
        );
    }
    verdict
}

fn preview(text: &str) -> String {
    const MAX: usize = 200;
    let trimmed = text.trim();
    match trimmed.char_indices().nth(MAX) {
        Some((cut, _)) => format!("{:?}...", &trimmed[..cut]),
        None => format!("{:?}", trimmed),
    }
}

/// Runs the factuality protocol against a completion endpoint.
#[derive(Clone)]
pub struct FactualityJudge {
    client: Arc<dyn CompletionClient>,
}

impl FactualityJudge {
    pub fn new(client: Arc<dyn CompletionClient>) -> Self {
        Self { client }
    }

    pub fn model(&self) -> &str {
        self.client.model()
    }

    /// Ask the judge and parse its counts
    ///
    /// # Errors
    ///
    /// `Completion` if the call fails after retries, `FactualityParse` if the
    /// reply is unusable. Both are per-example.
    pub async fn judge(
        &self,
        question: &str,
        reference_answer: &str,
        generated_answer: &str,
        template: &str,
    ) -> Result<FactualityVerdict> {
        let prompt = render_template(
            template,
            &[
                ("question", question),
                ("reference_answer", reference_answer),
                ("generated_answer", generated_answer),
            ],
        );
        let reply = self.client.complete(&prompt).await?;
        parse_factuality_response(&reply)
    }
}
