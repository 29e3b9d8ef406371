use crate::eval::Metric;
use crate::eval::factuality::DEFAULT_FACTUALITY_PROMPT;
use crate::generation::DEFAULT_GENERATION_PROMPT;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub rageval: RagevalConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embeddings: EmbeddingsConfig,
    pub llm: LlmConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub prompts: PromptsConfig,
}

/// Storage and logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagevalConfig {
    /// Root directory holding one sub-directory per evaluation run.
    #[serde(default = "default_runs_dir")]
    pub runs_dir: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for RagevalConfig {
    fn default() -> Self {
        Self {
            runs_dir: default_runs_dir(),
            log_level: default_log_level(),
        }
    }
}

/// Retrieval method selected for a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMethod {
    Bm25,
    Vector,
}

impl FromStr for RetrievalMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "bm25" => Ok(RetrievalMethod::Bm25),
            "vector" => Ok(RetrievalMethod::Vector),
            other => Err(format!("unknown retrieval method '{}' (expected bm25 or vector)", other)),
        }
    }
}

impl fmt::Display for RetrievalMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetrievalMethod::Bm25 => write!(f, "bm25"),
            RetrievalMethod::Vector => write!(f, "vector"),
        }
    }
}

/// Retrieval configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_method")]
    pub method: RetrievalMethod,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub bm25: Bm25Config,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            method: default_method(),
            top_k: default_top_k(),
            bm25: Bm25Config::default(),
        }
    }
}

/// BM25 saturation (`k1`) and length-normalization (`b`) parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bm25Config {
    #[serde(default = "default_k1")]
    pub k1: f64,
    #[serde(default = "default_b")]
    pub b: f64,
}

impl Default for Bm25Config {
    fn default() -> Self {
        Self {
            k1: default_k1(),
            b: default_b(),
        }
    }
}

/// Embedding backend used by the vector retriever
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    /// Feature-hashing embedder, runs offline
    Local,
    /// OpenAI-compatible `/embeddings` endpoint
    Openai,
}

/// Embeddings configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingsConfig {
    #[serde(default = "default_provider")]
    pub provider: EmbeddingProvider,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_embedding_base_url")]
    pub base_url: String,
    #[serde(default = "default_embedding_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_embedding_model(),
            base_url: default_embedding_base_url(),
            api_key_env: default_embedding_api_key_env(),
            dimensions: default_dimensions(),
            batch_size: default_batch_size(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

/// Remote completion endpoint used for generation and factuality judging
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    #[serde(default = "default_llm_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Total attempts per completion call, including the first.
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_initial_retry_delay_ms")]
    pub initial_retry_delay_ms: u64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    /// Ceiling on in-flight completion calls across the worker pool.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Metrics computed for each example
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    #[serde(default = "default_metrics")]
    pub metrics: Vec<Metric>,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            metrics: default_metrics(),
        }
    }
}

impl EvaluationConfig {
    /// True if any configured metric needs the remote judge.
    pub fn needs_judge(&self) -> bool {
        self.metrics.contains(&Metric::Factuality)
    }
}

/// Prompt templates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptsConfig {
    #[serde(default = "default_generation_prompt")]
    pub generation: String,
    #[serde(default = "default_factuality_prompt")]
    pub factuality: String,
}

impl Default for PromptsConfig {
    fn default() -> Self {
        Self {
            generation: default_generation_prompt(),
            factuality: default_factuality_prompt(),
        }
    }
}

fn default_runs_dir() -> PathBuf {
    PathBuf::from("outputs/runs")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_method() -> RetrievalMethod {
    RetrievalMethod::Bm25
}

fn default_top_k() -> usize {
    10
}

fn default_k1() -> f64 {
    1.5
}

fn default_b() -> f64 {
    0.75
}

fn default_provider() -> EmbeddingProvider {
    EmbeddingProvider::Local
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_embedding_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_embedding_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_dimensions() -> usize {
    384
}

fn default_batch_size() -> usize {
    100
}

fn default_cache_capacity() -> usize {
    1000
}

fn default_llm_api_key_env() -> String {
    "RAG_API_KEY".to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_max_retries() -> usize {
    3
}

fn default_initial_retry_delay_ms() -> u64 {
    2000
}

fn default_max_retry_delay_ms() -> u64 {
    30_000
}

fn default_max_concurrency() -> usize {
    4
}

fn default_metrics() -> Vec<Metric> {
    vec![
        Metric::Recall(1),
        Metric::Recall(5),
        Metric::Recall(10),
        Metric::Mrr,
        Metric::F1,
        Metric::Factuality,
    ]
}

fn default_generation_prompt() -> String {
    DEFAULT_GENERATION_PROMPT.to_string()
}

fn default_factuality_prompt() -> String {
    DEFAULT_FACTUALITY_PROMPT.to_string()
}

/// Environment variable overriding `llm.base_url`.
pub const BASE_URL_ENV: &str = "RAG_BASE_URL";

impl Config {
    /// Load configuration from file
    ///
    /// Loads environment variables from .env file (if present) before loading config.
    /// Looks for config file in this order:
    /// 1. Path specified in RAGEVAL_CONFIG environment variable
    /// 2. ./config.toml in current directory
    ///
    /// The result is not validated yet: callers apply CLI overrides first and
    /// then call [`Config::validate`].
    pub fn load() -> Result<Self> {
        // .env is optional
        let _ = dotenv::dotenv();

        let config_path = std::env::var("RAGEVAL_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.toml"));

        Self::from_path(&config_path)
    }

    /// Load configuration from an explicit path, applying environment overrides.
    pub fn from_path(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config: Config = toml::from_str(&config_str)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(base_url) = std::env::var(BASE_URL_ENV) {
            if !base_url.trim().is_empty() {
                log::debug!("llm.base_url overridden by {}", BASE_URL_ENV);
                self.llm.base_url = base_url;
            }
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        self.validate_retrieval()?;

        if self.llm.model.trim().is_empty() {
            anyhow::bail!("llm.model must be set");
        }
        validate_http_url("llm.base_url", &self.llm.base_url)?;

        if self.llm.timeout_secs == 0 || self.llm.timeout_secs > 600 {
            anyhow::bail!("llm.timeout_secs must be between 1 and 600");
        }
        if self.llm.max_retries == 0 {
            anyhow::bail!("llm.max_retries must be at least 1");
        }
        if self.llm.max_concurrency == 0 {
            anyhow::bail!("llm.max_concurrency must be at least 1");
        }
        if self.llm.initial_retry_delay_ms > self.llm.max_retry_delay_ms {
            anyhow::bail!("llm.initial_retry_delay_ms must not exceed llm.max_retry_delay_ms");
        }

        if self.evaluation.metrics.is_empty() {
            anyhow::bail!("evaluation.metrics must list at least one metric");
        }
        for metric in self.recall_beyond_top_k() {
            log::warn!(
                "{} exceeds retrieval.top_k = {}; it will equal Retrieval_Recall@{}",
                metric.name(),
                self.retrieval.top_k,
                self.retrieval.top_k
            );
        }

        for placeholder in ["{question}", "{context}"] {
            if !self.prompts.generation.contains(placeholder) {
                anyhow::bail!("prompts.generation must contain {}", placeholder);
            }
        }
        if self.evaluation.needs_judge() {
            for placeholder in ["{reference_answer}", "{generated_answer}"] {
                if !self.prompts.factuality.contains(placeholder) {
                    anyhow::bail!("prompts.factuality must contain {}", placeholder);
                }
            }
        }

        self.llm_api_key()?;

        Ok(())
    }

    /// Recall cutoffs deeper than the retrieved list; they can only repeat
    /// recall at `top_k`.
    pub fn recall_beyond_top_k(&self) -> Vec<Metric> {
        self.evaluation
            .metrics
            .iter()
            .copied()
            .filter(|metric| matches!(metric, Metric::Recall(k) if *k > self.retrieval.top_k))
            .collect()
    }

    /// Validate only what the retriever needs (used by the `retrieve` command,
    /// which never calls the completion endpoint).
    pub fn validate_retrieval(&self) -> Result<()> {
        if self.retrieval.top_k == 0 {
            anyhow::bail!("retrieval.top_k must be greater than 0");
        }

        let bm25 = &self.retrieval.bm25;
        if !bm25.k1.is_finite() || bm25.k1 < 0.0 {
            anyhow::bail!("retrieval.bm25.k1 must be a non-negative number");
        }
        if !(0.0..=1.0).contains(&bm25.b) {
            anyhow::bail!("retrieval.bm25.b must be between 0.0 and 1.0");
        }

        if self.retrieval.method == RetrievalMethod::Vector {
            if self.embeddings.dimensions == 0 {
                anyhow::bail!("embeddings.dimensions must be greater than 0");
            }
            if self.embeddings.provider == EmbeddingProvider::Openai {
                validate_http_url("embeddings.base_url", &self.embeddings.base_url)?;
                if self.embeddings.batch_size == 0 {
                    anyhow::bail!("embeddings.batch_size must be greater than 0");
                }
                self.embeddings_api_key()?;
            }
        }

        Ok(())
    }

    /// Read the completion API key from the environment variable named in config.
    pub fn llm_api_key(&self) -> Result<String> {
        read_key(&self.llm.api_key_env)
    }

    /// Read the embeddings API key from the environment variable named in config.
    pub fn embeddings_api_key(&self) -> Result<String> {
        read_key(&self.embeddings.api_key_env)
    }

    /// Get the run storage root
    pub fn runs_dir(&self) -> &Path {
        &self.rageval.runs_dir
    }

    /// SHA-256 over every setting that can change scores.
    ///
    /// Storage paths, log level, and credentials are excluded so two runs with
    /// identical engine settings share a fingerprint.
    pub fn fingerprint(&self) -> String {
        let scoring_settings = serde_json::json!({
            "retrieval": self.retrieval,
            "embeddings": {
                "provider": self.embeddings.provider,
                "model": self.embeddings.model,
                "dimensions": self.embeddings.dimensions,
            },
            "llm": {
                "base_url": self.llm.base_url,
                "model": self.llm.model,
            },
            "evaluation": self.evaluation,
            "prompts": self.prompts,
            "tokenizer": crate::search::TOKENIZER_VERSION,
            "f1_normalization": crate::eval::F1_NORMALIZATION_VERSION,
        });
        let mut hasher = Sha256::new();
        hasher.update(scoring_settings.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

fn read_key(env_name: &str) -> Result<String> {
    let key = std::env::var(env_name).with_context(|| {
        format!(
            "Environment variable {} not set. Set it in your .env file or as an environment variable.",
            env_name
        )
    })?;
    if key.trim().is_empty() {
        anyhow::bail!("Environment variable {} is empty", env_name);
    }
    Ok(key)
}

fn validate_http_url(field: &str, value: &str) -> Result<()> {
    let parsed = url::Url::parse(value)
        .with_context(|| format!("{} is not a valid URL: {}", field, value))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        anyhow::bail!("{} must use http or https, got {}", field, parsed.scheme());
    }
    Ok(())
}
