//! Orchestrator: drives retrieve → generate → score for every example on a
//! bounded worker pool and hands results to the run store in dataset order.

pub mod state;

use crate::config::Config;
use crate::corpus::{ChunkStore, Example};
use crate::error::{RagevalError, Result};
use crate::eval::{FactualityJudge, Metric, MetricEngine, MetricRecord, F1_NORMALIZATION_VERSION};
use crate::generation::{AnswerGenerator, GenerationResult};
use crate::runs::{ExampleFailure, ExampleResult, FailureKind, RunHandle, RunMetadata, RunRecord, RunStore};
use crate::search::{RetrievalResult, Retriever, TOKENIZER_VERSION};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub use state::{ExampleProgress, ExampleState};

const CANCELLED_REASON: &str = "run cancelled";

/// What a worker task reports back to the writer.
enum Outcome {
    Done(Box<ExampleResult>, ExampleProgress),
    Skipped(usize),
    Fatal(usize, RagevalError),
}

/// Reorder buffer entry.
enum Slot {
    Done(Box<ExampleResult>, ExampleProgress),
    Skipped,
}

/// Evaluation pipeline over an indexed retriever.
///
/// Cheap to clone: every worker task holds its own clone.
#[derive(Clone)]
pub struct Pipeline {
    config: Arc<Config>,
    store: Arc<ChunkStore>,
    retriever: Arc<dyn Retriever>,
    generator: AnswerGenerator,
    judge: Option<FactualityJudge>,
    engine: MetricEngine,
}

impl Pipeline {
    /// Assemble a pipeline
    ///
    /// # Errors
    ///
    /// `NotIndexed` if the retriever has not been indexed, `Config` if
    /// factuality is requested without a judge.
    pub fn new(
        config: Arc<Config>,
        store: Arc<ChunkStore>,
        retriever: Arc<dyn Retriever>,
        generator: AnswerGenerator,
        judge: Option<FactualityJudge>,
    ) -> Result<Self> {
        if !retriever.is_indexed() {
            return Err(RagevalError::NotIndexed);
        }
        if config.evaluation.needs_judge() && judge.is_none() {
            return Err(RagevalError::Config(
                "factuality metric requested but no judge configured".to_string(),
            ));
        }

        let engine = MetricEngine::new(config.evaluation.metrics.clone());
        Ok(Self {
            config,
            store,
            retriever,
            generator,
            judge,
            engine,
        })
    }

    /// Metadata describing a run of this pipeline over `dataset_size` examples.
    pub fn metadata(&self, dataset_size: usize) -> RunMetadata {
        RunMetadata {
            config_fingerprint: self.config.fingerprint(),
            retrieval_method: self.retriever.name().to_string(),
            top_k: self.config.retrieval.top_k,
            model: self.generator.model().to_string(),
            metrics: self.engine.metrics().to_vec(),
            tokenizer_version: TOKENIZER_VERSION.to_string(),
            f1_normalization_version: F1_NORMALIZATION_VERSION.to_string(),
            dataset_size,
        }
    }

    /// Evaluate `examples` and finalize the run
    ///
    /// # Arguments
    ///
    /// * `examples` - The dataset, in order; its length must match the handle
    /// * `handle` - Open run from [`RunStore::create`]
    /// * `runs` - Store that finalizes the run
    /// * `cancel` - Cooperative stop; examples not yet started are skipped
    ///
    /// # Returns
    ///
    /// The finalized record. Per-example failures are recorded, not returned;
    /// a fatal error aborts the run before anything is written.
    pub async fn run(
        &self,
        examples: &[Example],
        mut handle: RunHandle,
        runs: &RunStore,
        cancel: CancellationToken,
    ) -> Result<RunRecord> {
        let total = examples.len();
        if handle.metadata().dataset_size != total {
            return Err(RagevalError::InvalidInput(format!(
                "Run {} expects {} examples, got {}",
                handle.run_name(),
                handle.metadata().dataset_size,
                total
            )));
        }

        let start = Instant::now();
        let concurrency = self.config.llm.max_concurrency.max(1);
        log::info!(
            "Starting run {}: {} examples, {} retrieval, top_k {}, concurrency {}",
            handle.run_name(),
            total,
            self.retriever.name(),
            self.config.retrieval.top_k,
            concurrency
        );

        // Child token: a fatal error stops our workers without cancelling the caller.
        let cancel = cancel.child_token();
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let (tx, mut rx) = mpsc::channel::<Outcome>(total.max(1));
        let mut tasks = JoinSet::new();

        for (index, example) in examples.iter().cloned().enumerate() {
            let pipeline = self.clone();
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let tx = tx.clone();

            tasks.spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };
                let outcome = match permit {
                    Some(_permit) if !cancel.is_cancelled() => {
                        match pipeline.process_example(index, example, &cancel).await {
                            Ok((result, progress)) => Outcome::Done(Box::new(result), progress),
                            Err(e) => Outcome::Fatal(index, e),
                        }
                    }
                    _ => Outcome::Skipped(index),
                };
                let _ = tx.send(outcome).await;
            });
        }
        drop(tx);

        let mut pending: BTreeMap<usize, Slot> = BTreeMap::new();
        let mut next = 0;
        while let Some(outcome) = rx.recv().await {
            let step = match outcome {
                Outcome::Done(result, progress) => {
                    pending.insert(result.index, Slot::Done(result, progress));
                    flush_in_order(&mut pending, &mut next, &mut handle)
                }
                Outcome::Skipped(index) => {
                    pending.insert(index, Slot::Skipped);
                    flush_in_order(&mut pending, &mut next, &mut handle)
                }
                Outcome::Fatal(index, e) => {
                    log::error!("Example {}: fatal error, aborting run: {}", index, e);
                    Err(e)
                }
            };

            if let Err(e) = step {
                cancel.cancel();
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
                return Err(e);
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                return Err(RagevalError::Worker(format!("example task failed: {}", e)));
            }
        }
        if next != total {
            return Err(RagevalError::Worker(format!(
                "example {} never reported a result",
                next
            )));
        }

        if handle.is_cancelled() {
            log::warn!("Run {} cancelled; finalizing partial results", handle.run_name());
        } else if cancel.is_cancelled() {
            log::info!("Run {}: stop requested after every example finished", handle.run_name());
        }

        let record = runs.finalize(handle)?;
        log::info!(
            "Run {} finished in {:.2}s",
            record.run_name,
            start.elapsed().as_secs_f64()
        );
        Ok(record)
    }

    /// Retrieve, generate and score one example.
    ///
    /// Only fatal errors are returned; everything else lands in the result.
    async fn process_example(
        &self,
        index: usize,
        example: Example,
        cancel: &CancellationToken,
    ) -> Result<(ExampleResult, ExampleProgress)> {
        let mut progress = ExampleProgress::new(index);
        let mut metrics = self.engine.begin();
        let mut failures = Vec::new();

        let retrieved = self
            .retriever
            .retrieve(&example.question, self.config.retrieval.top_k)
            .await;
        let (retrieval, context) = match retrieved {
            Ok(result) => {
                let context = self.store.resolve(&result)?;
                self.engine
                    .score_retrieval(&mut metrics, Ok(&result), &example.relevant_chunk_ids);
                (result, context)
            }
            Err(e) if !e.is_fatal() => {
                let reason = e.to_string();
                log::warn!("Example {}: retrieval failed: {}", index, reason);
                self.engine
                    .score_retrieval(&mut metrics, Err(reason.as_str()), &example.relevant_chunk_ids);
                failures.push(failure(FailureKind::RetrievalFailed, reason));
                (RetrievalResult::default(), Vec::new())
            }
            Err(e) => return Err(e),
        };
        progress.advance(ExampleState::Retrieved)?;

        let generation = if cancel.is_cancelled() {
            failures.push(failure(FailureKind::Cancelled, CANCELLED_REASON));
            Err(CANCELLED_REASON.to_string())
        } else {
            match self
                .generator
                .generate(&example.question, &context, &self.config.prompts.generation)
                .await
            {
                Ok(generation) => Ok(generation),
                Err(RagevalError::Cancelled(reason)) => {
                    log::debug!("Example {}: generation abandoned: {}", index, reason);
                    failures.push(failure(FailureKind::Cancelled, reason.clone()));
                    Err(reason)
                }
                Err(e) if !e.is_fatal() => {
                    let reason = e.to_string();
                    log::warn!("Example {}: generation failed: {}", index, reason);
                    failures.push(failure(FailureKind::GenerationFailed, reason.clone()));
                    Err(reason)
                }
                Err(e) => return Err(e),
            }
        };
        progress.advance(ExampleState::Generated)?;

        let generation = match generation {
            Ok(generation) => generation,
            Err(reason) => {
                self.engine
                    .score_f1(&mut metrics, Err(reason.as_str()), &example.reference_answer);
                self.engine.score_factuality(&mut metrics, Err(reason.as_str()));
                progress.fail(reason)?;
                return Ok((
                    ExampleResult {
                        index,
                        example,
                        retrieval,
                        generation: None,
                        metrics,
                        failures,
                    },
                    progress,
                ));
            }
        };

        self.engine.score_f1(
            &mut metrics,
            Ok(&generation.answer_text),
            &example.reference_answer,
        );
        let unscored = self
            .score_factuality(index, &example, &generation, &mut metrics, cancel)
            .await?;
        progress.advance(ExampleState::Scored)?;

        if let Some(unscored) = unscored {
            progress.fail(unscored.kind.to_string())?;
            failures.push(unscored);
        }

        Ok((
            ExampleResult {
                index,
                example,
                retrieval,
                generation: Some(generation),
                metrics,
                failures,
            },
            progress,
        ))
    }

    /// Run the judge if factuality is requested; returns the failure to
    /// record when it could not be scored.
    async fn score_factuality(
        &self,
        index: usize,
        example: &Example,
        generation: &GenerationResult,
        metrics: &mut MetricRecord,
        cancel: &CancellationToken,
    ) -> Result<Option<ExampleFailure>> {
        if !self.engine.wants(Metric::Factuality) {
            return Ok(None);
        }
        let Some(judge) = &self.judge else {
            return Ok(None);
        };

        if cancel.is_cancelled() {
            self.engine.score_factuality(metrics, Err(CANCELLED_REASON));
            return Ok(Some(failure(FailureKind::Cancelled, CANCELLED_REASON)));
        }

        let verdict = judge
            .judge(
                &example.question,
                &example.reference_answer,
                &generation.answer_text,
                &self.config.prompts.factuality,
            )
            .await;

        match verdict {
            Ok(verdict) => {
                self.engine.score_factuality(metrics, Ok(&verdict));
                Ok(None)
            }
            Err(RagevalError::Cancelled(reason)) => {
                self.engine.score_factuality(metrics, Err(CANCELLED_REASON));
                Ok(Some(failure(FailureKind::Cancelled, reason)))
            }
            Err(e) if !e.is_fatal() => {
                let reason = e.to_string();
                log::warn!("Example {}: factuality unscored: {}", index, reason);
                self.engine.score_factuality(metrics, Err(reason.as_str()));
                Ok(Some(failure(FailureKind::FactualityUnscored, reason)))
            }
            Err(e) => Err(e),
        }
    }
}

fn failure(kind: FailureKind, reason: impl Into<String>) -> ExampleFailure {
    ExampleFailure {
        kind,
        reason: reason.into(),
    }
}

/// Append every result that is next in dataset order.
fn flush_in_order(
    pending: &mut BTreeMap<usize, Slot>,
    next: &mut usize,
    handle: &mut RunHandle,
) -> Result<()> {
    while let Some(slot) = pending.remove(&*next) {
        match slot {
            Slot::Done(result, mut progress) => {
                handle.append(*result)?;
                progress.advance(ExampleState::Persisted)?;
            }
            Slot::Skipped => {
                log::debug!("Example {}: skipped (cancelled before start)", next);
                handle.record_skipped();
            }
        }
        *next += 1;
    }
    Ok(())
}
