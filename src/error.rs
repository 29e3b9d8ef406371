use thiserror::Error;

/// Main error type for RAGEval
#[derive(Error, Debug)]
pub enum RagevalError {
    /// Chunk id not present in the store
    #[error("Chunk not found: {0}")]
    NotFound(String),

    /// Retriever used before `index()` was called
    #[error("Retriever has not been indexed")]
    NotIndexed,

    /// `index()` called with no chunks
    #[error("Cannot index an empty corpus")]
    EmptyCorpus,

    /// Answer generation failed after exhausting retries
    #[error("Generation failed: {0}")]
    Generation(String),

    /// Judge response did not contain a usable fact-count object
    #[error("Factuality parse error: {0}")]
    FactualityParse(String),

    /// A finalized run with this name already exists
    #[error("Run already exists: {0} (pass overwrite to replace it)")]
    DuplicateRun(String),

    /// No finalized run with this name
    #[error("Run not found: {0}")]
    RunNotFound(String),

    /// Run artifacts exist but are inconsistent
    #[error("Corrupt run {run}: {reason}")]
    CorruptRun { run: String, reason: String },

    /// A worker task panicked or was aborted
    #[error("Worker error: {0}")]
    Worker(String),

    /// Remote completion endpoint errors
    #[error("Completion API error: {0}")]
    Completion(String),

    /// Remote call abandoned because the run was cancelled
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Embedding API errors
    #[error("Embedding API error: {0}")]
    Embedding(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// File system I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RagevalError {
    /// Whether this error must abort the whole run.
    ///
    /// Per-example errors (remote calls, generation, factuality parsing) are
    /// recorded on the example and the run continues; everything else is a
    /// configuration or usage error.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            RagevalError::Generation(_)
                | RagevalError::FactualityParse(_)
                | RagevalError::Completion(_)
                | RagevalError::Cancelled(_)
                | RagevalError::Embedding(_)
        )
    }
}

/// Convenient Result type using RagevalError
pub type Result<T> = std::result::Result<T, RagevalError>;
