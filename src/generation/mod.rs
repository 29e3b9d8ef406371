//! Answer generation conditioned on retrieved chunks.

use crate::corpus::Chunk;
use crate::error::{RagevalError, Result};
use crate::llm::{render_template, CompletionClient};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Default answer prompt. Placeholders: `{question}`, `{context}`.
pub const DEFAULT_GENERATION_PROMPT: &str = "\
You are a helpful assistant answering questions using only the documents below.
If the documents do not contain the answer, say that you do not know.

Documents:
{context}

Question: {question}

Answer:";

/// Separator between serialized chunks in `{context}`.
pub const CONTEXT_SEPARATOR: &str = "\n\n";

/// Serialize chunks for the prompt, keeping each chunk id visible.
pub fn format_context(chunks: &[Chunk]) -> String {
    chunks
        .iter()
        .map(|chunk| format!("Document (ID: {}):\n{}", chunk.id, chunk.text))
        .collect::<Vec<_>>()
        .join(CONTEXT_SEPARATOR)
}

/// Generated answer and the exact context it was conditioned on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub answer_text: String,
    pub raw_context: Vec<Chunk>,
}

/// Renders the generation prompt and calls the completion endpoint.
///
/// Stateless apart from the shared client.
#[derive(Clone)]
pub struct AnswerGenerator {
    client: Arc<dyn CompletionClient>,
}

impl AnswerGenerator {
    pub fn new(client: Arc<dyn CompletionClient>) -> Self {
        Self { client }
    }

    pub fn model(&self) -> &str {
        self.client.model()
    }

    /// Generate an answer for `question` from `context`
    ///
    /// # Arguments
    ///
    /// * `question` - The example question
    /// * `context` - Retrieved chunks, rank order
    /// * `template` - Prompt with `{question}` and `{context}` placeholders
    ///
    /// # Errors
    ///
    /// `Generation` once the client has exhausted its retries. The call is not
    /// repeated here. `Cancelled` passes through unchanged.
    pub async fn generate(&self, question: &str, context: &[Chunk], template: &str) -> Result<GenerationResult> {
        let serialized = format_context(context);
        let prompt = render_template(template, &[("question", question), ("context", &serialized)]);

        let answer_text = self
            .client
            .complete(&prompt)
            .await
            .map_err(|e| match e {
                RagevalError::Cancelled(_) => e,
                e => RagevalError::Generation(e.to_string()),
            })?;

        Ok(GenerationResult {
            answer_text: answer_text.trim().to_string(),
            raw_context: context.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records prompts and replies with a fixed answer, or fails.
    struct EchoClient {
        reply: Option<String>,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CompletionClient for EchoClient {
        async fn complete(&self, prompt: &str) -> Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.reply
                .clone()
                .ok_or_else(|| RagevalError::Completion("HTTP 503".to_string()))
        }

        fn model(&self) -> &str {
            "echo"
        }
    }

    fn chunks() -> Vec<Chunk> {
        vec![Chunk::new("2", "Paris is the capital of France."), Chunk::new("1", "Berlin is in Germany.")]
    }

    #[test]
    fn test_format_context_keeps_ids_and_order() {
        let context = format_context(&chunks());
        assert_eq!(
            context,
            "Document (ID: 2):\nParis is the capital of France.\n\nDocument (ID: 1):\nBerlin is in Germany."
        );
        assert_eq!(format_context(&[]), "");
    }

    #[tokio::test]
    async fn test_generate_renders_prompt_and_trims_answer() {
        let client = Arc::new(EchoClient {
            reply: Some("  Paris.\n".to_string()),
            prompts: Mutex::new(Vec::new()),
        });
        let generator = AnswerGenerator::new(client.clone());
        let result = generator
            .generate("Capital of France?", &chunks(), DEFAULT_GENERATION_PROMPT)
            .await
            .unwrap();

        assert_eq!(result.answer_text, "Paris.");
        assert_eq!(result.raw_context, chunks());
        let prompts = client.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("Question: Capital of France?"));
        assert!(prompts[0].contains("Document (ID: 2):"));
    }

    #[tokio::test]
    async fn test_generate_failure_maps_to_generation_error() {
        let client = Arc::new(EchoClient {
            reply: None,
            prompts: Mutex::new(Vec::new()),
        });
        let err = AnswerGenerator::new(client.clone())
            .generate("q", &[], "{question} {context}")
            .await
            .unwrap_err();
        assert!(matches!(err, RagevalError::Generation(ref m) if m.contains("503")));
        assert!(!err.is_fatal());
        assert_eq!(client.prompts.lock().unwrap().len(), 1);
    }
}
