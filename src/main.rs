//! RAGEval CLI: run evaluations, try single queries, inspect and compare runs.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use rageval::config::RetrievalMethod;
use rageval::corpus::load_dataset;
use rageval::eval::FactualityJudge;
use rageval::generation::AnswerGenerator;
use rageval::llm::{ChatCompletionClient, CompletionClient};
use rageval::search::{build_retriever, Retriever};
use rageval::{ChunkStore, Config, Pipeline, RunRecord, RunStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Retrieval and answer-quality evaluation for RAG pipelines.
#[derive(Parser, Debug)]
#[command(name = "rageval", version)]
struct Cli {
    /// Config file (default: $RAGEVAL_CONFIG or ./config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level; overrides rageval.log_level.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Evaluate a dataset and store the run.
    Run(RunArgs),
    /// Retrieve chunks for a single query and print the ranking.
    Retrieve(RetrieveArgs),
    /// Print the summary of a stored run.
    Show {
        #[arg(long)]
        run_name: String,
    },
    /// Compare aggregate metrics of two stored runs.
    Compare {
        #[arg(long)]
        run1: String,
        #[arg(long)]
        run2: String,
    },
    /// List stored runs.
    List,
}

/// Flags that override the `[retrieval]` section.
#[derive(Args, Debug)]
struct RetrievalOverrides {
    #[arg(long)]
    method: Option<RetrievalMethod>,

    #[arg(long)]
    top_k: Option<usize>,
}

impl RetrievalOverrides {
    fn apply(&self, config: &mut Config) {
        if let Some(method) = self.method {
            config.retrieval.method = method;
        }
        if let Some(top_k) = self.top_k {
            config.retrieval.top_k = top_k;
        }
    }
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Corpus JSON: array of {id, text, metadata}.
    #[arg(long)]
    corpus: PathBuf,

    /// Dataset JSON: array of {question, reference_answer, relevant_chunk_ids}.
    #[arg(long)]
    dataset: PathBuf,

    /// Run name (default: <method>-<timestamp>-<id>).
    #[arg(long)]
    run_name: Option<String>,

    /// Replace an existing run with the same name.
    #[arg(long)]
    overwrite: bool,

    #[command(flatten)]
    retrieval: RetrievalOverrides,

    /// Completion model; overrides llm.model.
    #[arg(long)]
    model: Option<String>,

    /// Completion endpoint; overrides llm.base_url.
    #[arg(long)]
    base_url: Option<String>,

    /// Only evaluate the first N examples.
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Args, Debug)]
struct RetrieveArgs {
    #[arg(long)]
    corpus: PathBuf,

    #[arg(long)]
    query: String,

    #[command(flatten)]
    retrieval: RetrievalOverrides,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    let level = cli.log_level.as_deref().unwrap_or(&config.rageval.log_level);
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("RUST_LOG", level)).init();

    match cli.command {
        Command::Run(args) => run_evaluation(config, args).await,
        Command::Retrieve(args) => run_retrieve(config, args).await,
        Command::Show { run_name } => {
            let record = RunStore::new(config.runs_dir()).load(&run_name)?;
            print_summary(&record);
            Ok(())
        }
        Command::Compare { run1, run2 } => {
            let comparison = RunStore::new(config.runs_dir()).compare(&run1, &run2)?;
            print!("{}", comparison);
            Ok(())
        }
        Command::List => {
            let runs = RunStore::new(config.runs_dir());
            let names = runs.list()?;
            if names.is_empty() {
                println!("No runs in {}", runs.root().display());
            }
            for name in names {
                println!("{}", name);
            }
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => {
            // .env is optional
            let _ = dotenv::dotenv();
            Config::from_path(path)
        }
        None => Config::load(),
    }
}

async fn run_evaluation(mut config: Config, args: RunArgs) -> Result<()> {
    args.retrieval.apply(&mut config);
    if let Some(model) = args.model {
        config.llm.model = model;
    }
    if let Some(base_url) = args.base_url {
        config.llm.base_url = base_url;
    }
    config.validate()?;
    let config = Arc::new(config);

    let store = Arc::new(ChunkStore::from_json_file(&args.corpus)?);
    let mut examples = load_dataset(&args.dataset, Some(&store))?;
    if let Some(limit) = args.limit {
        examples.truncate(limit);
    }
    if examples.is_empty() {
        anyhow::bail!("No examples to evaluate in {}", args.dataset.display());
    }
    log::info!("Loaded {} chunks and {} examples", store.len(), examples.len());

    let start = Instant::now();
    let mut retriever = build_retriever(&config)?;
    retriever.index(store.all()).await?;
    log::info!(
        "Indexed {} chunks ({}) in {:.2}s",
        store.len(),
        retriever.name(),
        start.elapsed().as_secs_f64()
    );
    let retriever: Arc<dyn Retriever> = Arc::from(retriever);

    let cancel = CancellationToken::new();
    let client: Arc<dyn CompletionClient> = Arc::new(
        ChatCompletionClient::from_config(&config.llm, config.llm_api_key()?)?.with_cancellation(cancel.clone()),
    );
    let judge = config
        .evaluation
        .needs_judge()
        .then(|| FactualityJudge::new(Arc::clone(&client)));
    let pipeline = Pipeline::new(
        Arc::clone(&config),
        store,
        retriever,
        AnswerGenerator::new(client),
        judge,
    )?;

    let runs = RunStore::new(config.runs_dir());
    let run_name = args
        .run_name
        .unwrap_or_else(|| default_run_name(config.retrieval.method));
    let handle = runs.create(&run_name, args.overwrite, pipeline.metadata(examples.len()))?;

    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupt received; letting in-flight examples finish");
            on_interrupt.cancel();
        }
    });

    let record = pipeline
        .run(&examples, handle, &runs, cancel)
        .await
        .with_context(|| format!("Run {} failed", run_name))?;

    print_summary(&record);
    println!("\nResults saved to {}", runs.run_dir(&record.run_name).display());
    Ok(())
}

async fn run_retrieve(mut config: Config, args: RetrieveArgs) -> Result<()> {
    args.retrieval.apply(&mut config);
    config.validate_retrieval()?;

    let store = ChunkStore::from_json_file(&args.corpus)?;
    let mut retriever = build_retriever(&config)?;
    retriever.index(store.all()).await?;

    let start = Instant::now();
    let result = retriever.retrieve(&args.query, config.retrieval.top_k).await?;
    let latency = start.elapsed();

    println!(
        "Query: {}\nMethod: {} | top_k: {} | {} result(s) in {:.1}ms\n",
        args.query,
        retriever.name(),
        config.retrieval.top_k,
        result.len(),
        latency.as_secs_f64() * 1000.0
    );
    for hit in &result.hits {
        let chunk = store.get(&hit.chunk_id)?;
        let preview: String = chunk.text.chars().take(100).collect();
        println!("{:>3}. [{}] score {:.4}", hit.rank, hit.chunk_id, hit.score);
        println!("     {}", preview.replace('\n', " "));
    }
    Ok(())
}

fn default_run_name(method: RetrievalMethod) -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", method, Utc::now().format("%Y%m%d-%H%M%S"), &id[..8])
}

fn print_summary(record: &RunRecord) {
    let meta = &record.metadata;
    println!("Run: {}{}", record.run_name, if record.cancelled { " (cancelled)" } else { "" });
    println!("Finalized: {}", record.finalized_at.to_rfc3339());
    println!(
        "Retrieval: {} (top_k {}) | Model: {} | Config: {}",
        meta.retrieval_method,
        meta.top_k,
        meta.model,
        &meta.config_fingerprint[..meta.config_fingerprint.len().min(12)]
    );

    let failures = &record.failures;
    println!(
        "Examples: {} processed, {} skipped of {}",
        failures.examples_processed, failures.examples_skipped, meta.dataset_size
    );
    println!(
        "Failures: retrieval {}, generation {}, factuality {}, cancelled {}\n",
        failures.retrieval_failed,
        failures.generation_failed,
        failures.factuality_unscored,
        failures.cancelled
    );

    println!("{:<28} {:>8} {:>11} {:>9}", "Metric", "Mean", "Computable", "Unscored");
    for (name, summary) in &record.aggregate {
        println!(
            "{:<28} {:>8.4} {:>11} {:>9}",
            name, summary.mean, summary.computable, summary.unscored
        );
    }
}
