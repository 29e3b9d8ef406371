//! Remote text completion: client trait, OpenAI-compatible implementation,
//! retry policy, and prompt template rendering.

pub mod chat;
pub mod retry;

use crate::error::Result;
use async_trait::async_trait;

pub use chat::ChatCompletionClient;
pub use retry::{AttemptError, RetryError, RetryPolicy};

/// A remote text-completion endpoint.
///
/// Implementations own timeout and retry handling; an `Err` means retries are
/// exhausted or the failure was permanent.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Send `prompt` as a single user message and return the reply text.
    async fn complete(&self, prompt: &str) -> Result<String>;

    /// Model identifier, recorded in run metadata.
    fn model(&self) -> &str;
}

/// Substitute `{name}` placeholders in a single left-to-right pass.
///
/// Only the listed names are replaced; any other braces (for example a JSON
/// schema shown to the model) are copied through. Substituted values are
/// never re-scanned, so a question containing `{context}` stays literal.
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len() + vars.iter().map(|(_, v)| v.len()).sum::<usize>());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let candidate = &rest[open..];
        let matched = vars.iter().find(|(name, _)| {
            candidate.len() > name.len() + 1
                && candidate[1..].starts_with(name)
                && candidate[1 + name.len()..].starts_with('}')
        });
        match matched {
            Some((name, value)) => {
                out.push_str(value);
                rest = &candidate[name.len() + 2..];
            }
            None => {
                out.push('{');
                rest = &candidate[1..];
            }
        }
    }
    out.push_str(rest);
    out
}
