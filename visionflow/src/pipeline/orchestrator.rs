//! The stage state machine.
//!
//! Drives the four analysis stages in fixed order for each run. Every remote
//! call goes through the retry executor and the circuit breaker registry;
//! stage results are memoized in the TTL cache keyed by `(stage, input
//! hash)`. A stage that asks for clarification suspends the run under a
//! resume token instead of failing it. Cancellation is checked at stage
//! boundaries and before retry sleeps.

use crate::breaker::CircuitBreakerRegistry;
use crate::cache::TtlCache;
use crate::cancellation::CancellationToken;
use crate::config::VisionflowConfig;
use crate::core::{
    ClarificationQuestion, PipelineReport, PipelineRun, RunStatus, RunStatusView, Stage,
    StageOutput,
};
use crate::errors::PipelineError;
use crate::events::ProgressSink;
use crate::health::HealthMonitor;
use crate::ports::{AnalysisProvider, AnalysisRequest, ContextPayload, DataStore};
use crate::resume::ResumptionManager;
use crate::retry::RetryExecutor;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The result of driving a pipeline run as far as it can go.
#[derive(Debug, Clone)]
pub enum PipelineOutcome {
    /// All stages completed.
    Completed(PipelineReport),
    /// The run suspended pending clarification answers.
    AwaitingClarification {
        /// The suspended run's id.
        run_id: String,
        /// Token to pass to `resume`.
        resume_token: String,
        /// The questions the caller must answer.
        questions: Vec<ClarificationQuestion>,
    },
}

/// Per-run state owned by the orchestrator.
#[derive(Debug)]
struct RunSlot {
    run: Mutex<PipelineRun>,
    request: Mutex<AnalysisRequest>,
    cancel: CancellationToken,
    /// Serializes drives of this run. Held for the duration of a drive so a
    /// run never executes more than one stage at a time, even under
    /// concurrent resumption with the same token.
    gate: tokio::sync::Mutex<()>,
}

/// Drives analysis runs through the stage state machine.
///
/// One orchestrator serves many concurrent runs; each run executes its
/// stages sequentially. All collaborators are explicit constructor inputs -
/// there is no hidden global state.
pub struct StageOrchestrator {
    provider: Arc<dyn AnalysisProvider>,
    store: Option<Arc<dyn DataStore>>,
    retry: RetryExecutor,
    cache: Arc<TtlCache>,
    resumption: Arc<ResumptionManager>,
    health: Arc<HealthMonitor>,
    config: VisionflowConfig,
    runs: DashMap<String, Arc<RunSlot>>,
}

impl StageOrchestrator {
    /// Creates an orchestrator around a provider, wiring default instances
    /// of the shared primitives from the config.
    #[must_use]
    pub fn new(provider: Arc<dyn AnalysisProvider>, config: VisionflowConfig) -> Self {
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.breaker.clone()));
        Self {
            provider,
            store: None,
            retry: RetryExecutor::new(breakers),
            cache: Arc::new(TtlCache::new(config.cache.clone())),
            resumption: Arc::new(ResumptionManager::new(config.resume_token_ttl())),
            health: Arc::new(HealthMonitor::new()),
            config,
            runs: DashMap::new(),
        }
    }

    /// Attaches a data store for run persistence.
    #[must_use]
    pub fn with_data_store(mut self, store: Arc<dyn DataStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// The shared circuit breaker registry.
    #[must_use]
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        self.retry.breakers()
    }

    /// The shared stage-result cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<TtlCache> {
        &self.cache
    }

    /// The shared retry executor.
    #[must_use]
    pub fn retry_executor(&self) -> &RetryExecutor {
        &self.retry
    }

    /// The resume token manager.
    #[must_use]
    pub fn resumption(&self) -> &Arc<ResumptionManager> {
        &self.resumption
    }

    /// The health monitor consulted before stage attempts.
    #[must_use]
    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// Executes the pipeline for a fresh request.
    ///
    /// Returns a completed report, or an awaiting-clarification outcome
    /// carrying a resume token. Terminal failures surface as
    /// [`PipelineError::StageFailure`] with partial results preserved on the
    /// run for later inspection.
    pub async fn execute(
        &self,
        request: AnalysisRequest,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<PipelineOutcome, PipelineError> {
        let run = PipelineRun::new();
        let run_id = run.run_id.clone();
        info!(run_id = %run_id, "Starting analysis run");

        let slot = Arc::new(RunSlot {
            run: Mutex::new(run),
            request: Mutex::new(request),
            cancel: CancellationToken::new(),
            gate: tokio::sync::Mutex::new(()),
        });
        self.runs.insert(run_id.clone(), slot.clone());

        let _gate = slot.gate.lock().await;
        self.drive(&slot, progress).await
    }

    /// Resumes a suspended run with clarification answers.
    ///
    /// The token resolves to the snapshot taken at suspension; resuming is
    /// idempotent against that snapshot, so repeated resumptions with the
    /// same token replay the same downstream stages. Concurrent resumes of
    /// the same run are serialized: the later caller re-drives from the
    /// snapshot once the earlier drive finishes, replaying settled stages
    /// from the stage cache.
    pub async fn resume(
        &self,
        token: &str,
        answers: std::collections::HashMap<String, String>,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<PipelineOutcome, PipelineError> {
        let snapshot = self.resumption.resolve(token)?;
        let slot = self
            .runs
            .get(&snapshot.run_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| PipelineError::RunNotFound(snapshot.run_id.clone()))?;

        // Taken before touching the slot, so a drive already in flight
        // finishes (and settles its outputs) before this one resets state.
        let _gate = slot.gate.lock().await;

        info!(run_id = %snapshot.run_id, "Resuming analysis run");
        {
            let mut run = slot.run.lock();
            // Restart from the snapshot, not whatever the slot drifted to.
            run.partial_results = snapshot.partial_results;
            run.status = RunStatus::Running;
            run.resume_token = None;
            run.failure = None;
            run.touch();
        }
        {
            let mut request = slot.request.lock();
            request.clarification_answers.extend(answers);
        }

        self.drive(&slot, progress).await
    }

    /// Requests cooperative cancellation of a run.
    ///
    /// A run between stages observes the flag at the next boundary; a
    /// suspended or idle run is finalized immediately.
    pub fn cancel(&self, run_id: &str) -> Result<(), PipelineError> {
        let slot = self
            .runs
            .get(run_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| PipelineError::RunNotFound(run_id.to_string()))?;

        slot.cancel.cancel("cancelled by caller");
        let mut run = slot.run.lock();
        if !run.status.is_terminal() && run.status != RunStatus::Running {
            run.set_status(RunStatus::Cancelled);
        }
        info!(run_id = %run_id, "Cancellation requested");
        Ok(())
    }

    /// A status snapshot of a run, if it exists.
    #[must_use]
    pub fn run_status(&self, run_id: &str) -> Option<RunStatusView> {
        self.runs
            .get(run_id)
            .map(|entry| entry.value().run.lock().status_view())
    }

    /// Partial results recorded so far for a run.
    #[must_use]
    pub fn partial_results(&self, run_id: &str) -> Option<BTreeMap<Stage, StageOutput>> {
        self.runs
            .get(run_id)
            .map(|entry| entry.value().run.lock().partial_results.clone())
    }

    /// All currently known run ids.
    #[must_use]
    pub fn run_ids(&self) -> Vec<String> {
        self.runs.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Removes runs whose last activity predates the inactivity TTL.
    /// Returns the count removed.
    pub fn sweep_idle_runs(&self) -> usize {
        let ttl = chrono::Duration::from_std(self.config.run_inactivity_ttl())
            .unwrap_or_else(|_| chrono::Duration::seconds(600));
        let cutoff = Utc::now() - ttl;
        let stale: Vec<String> = self
            .runs
            .iter()
            .filter(|entry| {
                let run = entry.value().run.lock();
                run.last_activity_at < cutoff
            })
            .map(|entry| entry.key().clone())
            .collect();
        for run_id in &stale {
            self.runs.remove(run_id);
        }
        stale.len()
    }

    /// Drives a run forward until it completes, suspends, fails, or is
    /// cancelled.
    async fn drive(
        &self,
        slot: &Arc<RunSlot>,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<PipelineOutcome, PipelineError> {
        let run_id = slot.run.lock().run_id.clone();
        slot.run.lock().set_status(RunStatus::Running);

        loop {
            let pending = slot.run.lock().next_pending_stage();
            let Some(stage) = pending else {
                break;
            };

            if let Err(err) = slot.cancel.ensure_active() {
                slot.run.lock().set_status(RunStatus::Cancelled);
                info!(run_id = %run_id, stage = %stage, "Run cancelled at stage boundary");
                return Err(err);
            }

            let output = match self.execute_stage(slot, stage, &run_id).await {
                Ok(output) => output,
                Err(err) if err.is_cancellation() => {
                    slot.run.lock().set_status(RunStatus::Cancelled);
                    return Err(err);
                }
                Err(err) => {
                    let cause = err.to_string();
                    {
                        let mut run = slot.run.lock();
                        run.failure = Some(cause.clone());
                        run.stage = stage;
                        run.set_status(RunStatus::Failed);
                    }
                    warn!(run_id = %run_id, stage = %stage, error = %cause, "Stage failed terminally");
                    self.persist(slot).await;
                    return Err(PipelineError::stage_failure(stage, cause));
                }
            };

            let suspend = output.requires_clarification();
            slot.run.lock().record_output(output);
            self.persist(slot).await;
            progress.on_progress(&run_id, stage, stage.progress_on_complete());

            if suspend {
                let (partials, questions) = {
                    let run = slot.run.lock();
                    let questions = run
                        .partial_results
                        .get(&stage)
                        .and_then(|output| output.clarification.clone())
                        .map(|request| request.questions)
                        .unwrap_or_default();
                    (run.partial_results.clone(), questions)
                };
                let token = self
                    .resumption
                    .create_token(run_id.clone(), partials, questions.clone());
                {
                    let mut run = slot.run.lock();
                    run.resume_token = Some(token.clone());
                    run.set_status(RunStatus::AwaitingClarification);
                }
                self.persist(slot).await;
                info!(run_id = %run_id, stage = %stage, "Run suspended for clarification");
                return Ok(PipelineOutcome::AwaitingClarification {
                    run_id,
                    resume_token: token,
                    questions,
                });
            }
        }

        let report = {
            let mut run = slot.run.lock();
            run.set_status(RunStatus::Completed);
            run.progress_percent = 100;
            PipelineReport {
                run_id: run.run_id.clone(),
                stages: run.partial_results.clone(),
                completed_at: Utc::now(),
            }
        };
        self.persist(slot).await;
        info!(run_id = %run_id, "Analysis run completed");
        Ok(PipelineOutcome::Completed(report))
    }

    /// Executes one stage, consulting the memo cache first.
    async fn execute_stage(
        &self,
        slot: &Arc<RunSlot>,
        stage: Stage,
        run_id: &str,
    ) -> Result<StageOutput, PipelineError> {
        let (payload, image_ref, cache_key, image_dep) = {
            let request = slot.request.lock();
            let run = slot.run.lock();
            let payload = ContextPayload {
                user_context: request.user_context.clone(),
                prior_outputs: completed_outputs(&run.partial_results),
                clarification_answers: request.clarification_answers.clone(),
            };
            let input_hash = stage_input_hash(stage, &request, &payload);
            let image_dep = format!("image:{}", image_fingerprint_hash(&request));
            (
                payload,
                request.image_ref.clone(),
                format!("stage:{stage}:{input_hash}"),
                image_dep,
            )
        };

        if let Some(cached) = self.cache.get::<StageOutput>(&cache_key) {
            debug!(run_id = %run_id, stage = %stage, "Stage result served from cache");
            return Ok(cached);
        }

        let operation = stage.operation_name();
        let provider = self.provider.clone();
        let health = self.health.clone();
        let output = self
            .retry
            .run(operation, &self.config.retry, Some(&slot.cancel), || {
                let provider = provider.clone();
                let health = health.clone();
                let image_ref = image_ref.clone();
                let payload = payload.clone();
                async move {
                    // Soft pre-check: a known-unhealthy dependency fails the
                    // attempt before the call, flowing through the normal
                    // retry budget rather than hard-blocking the run.
                    if health.is_unhealthy(operation) {
                        return Err(PipelineError::transient(
                            operation,
                            "dependency reported unhealthy",
                        ));
                    }
                    provider.analyze(stage, &image_ref, &payload).await
                }
            })
            .await?;

        if output.stage() != stage {
            return Err(PipelineError::validation(format!(
                "provider returned output for stage '{}', expected '{stage}'",
                output.stage()
            )));
        }

        // Only settled results are memoized; a clarification round-trip must
        // re-run the stage with the answers.
        if !output.requires_clarification() {
            self.cache.set(
                &cache_key,
                &output,
                self.config.stage_cache_ttl(),
                &["stage_results".to_string(), image_dep],
            );
        }
        Ok(output)
    }

    /// Persists the run snapshot if a data store is attached.
    async fn persist(&self, slot: &Arc<RunSlot>) {
        let Some(store) = &self.store else {
            return;
        };
        let run = slot.run.lock().clone();
        if let Err(err) = store.save_run(&run).await {
            warn!(run_id = %run.run_id, error = %err, "Failed to persist run snapshot");
        }
    }
}

impl std::fmt::Debug for StageOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageOrchestrator")
            .field("runs", &self.runs.len())
            .finish()
    }
}

/// Prior outputs visible to a stage: completed results only, never pending
/// clarification placeholders.
fn completed_outputs(
    partials: &BTreeMap<Stage, StageOutput>,
) -> BTreeMap<Stage, StageOutput> {
    partials
        .iter()
        .filter(|(_, output)| !output.requires_clarification())
        .map(|(stage, output)| (*stage, output.clone()))
        .collect()
}

/// Hash of everything that determines a stage's result.
fn stage_input_hash(stage: Stage, request: &AnalysisRequest, payload: &ContextPayload) -> String {
    let mut hasher = Sha256::new();
    hasher.update(stage.operation_name().as_bytes());
    hasher.update(request.image_ref.fingerprint());
    hasher.update(payload.user_context.as_bytes());

    // Sorted answers for deterministic hashing.
    let answers: BTreeMap<&String, &String> = payload.clarification_answers.iter().collect();
    hasher.update(serde_json::to_string(&answers).unwrap_or_default());
    hasher.update(serde_json::to_string(&payload.prior_outputs).unwrap_or_default());

    hex::encode(&hasher.finalize()[..16])
}

fn image_fingerprint_hash(request: &AnalysisRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request.image_ref.fingerprint());
    hex::encode(&hasher.finalize()[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageData;
    use crate::events::CollectingProgressSink;
    use crate::ports::ImageRef;
    use crate::retry::RetryPolicy;
    use crate::testing::{sample_output, ScriptedProvider};

    fn fast_config() -> VisionflowConfig {
        let mut config = VisionflowConfig::default();
        config.retry = RetryPolicy::new()
            .with_max_attempts(3)
            .with_base_delay_ms(1)
            .with_jitter(false);
        config
    }

    fn request() -> AnalysisRequest {
        AnalysisRequest::new(
            ImageRef::Url("https://example.com/photo.jpg".to_string()),
            "inspect the roof",
        )
    }

    #[tokio::test]
    async fn test_happy_path_runs_all_stages() {
        let provider = ScriptedProvider::new();
        let orchestrator = StageOrchestrator::new(provider.clone(), fast_config());
        let sink = Arc::new(CollectingProgressSink::new());

        let outcome = orchestrator.execute(request(), sink.clone()).await.unwrap();

        let PipelineOutcome::Completed(report) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(report.stages.len(), 4);
        assert_eq!(provider.calls(), 4);

        // Progress strictly ordered by stage sequence.
        let events = sink.events_for_run(&report.run_id);
        let stages: Vec<Stage> = events.iter().map(|(stage, _)| *stage).collect();
        assert_eq!(stages, Stage::ALL.to_vec());
    }

    #[tokio::test]
    async fn test_partial_results_ordered() {
        let provider = ScriptedProvider::new();
        let orchestrator = StageOrchestrator::new(provider, fast_config());

        let outcome = orchestrator
            .execute(request(), Arc::new(CollectingProgressSink::new()))
            .await
            .unwrap();
        let PipelineOutcome::Completed(report) = outcome else {
            panic!("expected completion");
        };

        let keys: Vec<Stage> = report.stages.keys().copied().collect();
        assert_eq!(keys, Stage::ALL.to_vec());
    }

    #[tokio::test]
    async fn test_transient_failures_hidden_by_retry() {
        let provider = ScriptedProvider::new();
        provider.push_error(Stage::Vision, PipelineError::transient("vision_analysis", "blip"));
        let orchestrator = StageOrchestrator::new(provider.clone(), fast_config());

        let outcome = orchestrator
            .execute(request(), Arc::new(CollectingProgressSink::new()))
            .await
            .unwrap();

        assert!(matches!(outcome, PipelineOutcome::Completed(_)));
        // One extra call for the retried Vision attempt.
        assert_eq!(provider.calls(), 5);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_fails_run() {
        let provider = ScriptedProvider::new();
        for _ in 0..3 {
            provider.push_error(Stage::Vision, PipelineError::transient("vision_analysis", "down"));
        }
        let orchestrator = StageOrchestrator::new(provider, fast_config());

        let err = orchestrator
            .execute(request(), Arc::new(CollectingProgressSink::new()))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PipelineError::StageFailure {
                stage: Stage::Vision,
                ..
            }
        ));

        let run_id = &orchestrator.run_ids()[0];
        let view = orchestrator.run_status(run_id).unwrap();
        assert_eq!(view.status, RunStatus::Failed);

        // Context completed before the failure and is preserved.
        let partials = orchestrator.partial_results(run_id).unwrap();
        assert!(partials.contains_key(&Stage::Context));
        assert!(!partials.contains_key(&Stage::Vision));
    }

    #[tokio::test]
    async fn test_validation_error_fails_without_retry() {
        let provider = ScriptedProvider::new();
        provider.push_error(Stage::Context, PipelineError::validation("bad payload"));
        let orchestrator = StageOrchestrator::new(provider.clone(), fast_config());

        let err = orchestrator
            .execute(request(), Arc::new(CollectingProgressSink::new()))
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::StageFailure { .. }));
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_mismatched_stage_output_is_validation_failure() {
        let provider = ScriptedProvider::new();
        // Provider returns a Vision-shaped output for the Context stage.
        provider.push_output(Stage::Context, sample_output(Stage::Vision));
        let orchestrator = StageOrchestrator::new(provider, fast_config());

        let err = orchestrator
            .execute(request(), Arc::new(CollectingProgressSink::new()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::StageFailure {
                stage: Stage::Context,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_clarification_suspends_and_resumes() {
        let provider = ScriptedProvider::new();
        provider.push_output(
            Stage::Vision,
            StageOutput::needs_clarification(
                match sample_output(Stage::Vision).data {
                    data @ StageData::Vision(_) => data,
                    _ => unreachable!(),
                },
                crate::core::ClarificationRequest::new(vec![ClarificationQuestion::new(
                    "area",
                    "Which area should be inspected?",
                )]),
            ),
        );
        let orchestrator = StageOrchestrator::new(provider.clone(), fast_config());
        let sink = Arc::new(CollectingProgressSink::new());

        let outcome = orchestrator.execute(request(), sink.clone()).await.unwrap();
        let PipelineOutcome::AwaitingClarification {
            run_id,
            resume_token,
            questions,
        } = outcome
        else {
            panic!("expected suspension");
        };
        assert_eq!(questions.len(), 1);
        assert_eq!(
            orchestrator.run_status(&run_id).unwrap().status,
            RunStatus::AwaitingClarification
        );

        let answers = std::collections::HashMap::from([(
            "area".to_string(),
            "the chimney".to_string(),
        )]);
        let outcome = orchestrator
            .resume(&resume_token, answers, sink)
            .await
            .unwrap();

        let PipelineOutcome::Completed(report) = outcome else {
            panic!("expected completion after resume");
        };
        assert_eq!(report.run_id, run_id);
        assert_eq!(report.stages.len(), 4);
        // Context ran once; Vision ran twice (suspend + resume); Analysis
        // and Synthesis once each.
        assert_eq!(provider.calls(), 5);
    }

    #[tokio::test]
    async fn test_cancel_mid_pipeline_stops_downstream() {
        let provider = ScriptedProvider::new();
        let orchestrator = Arc::new(StageOrchestrator::new(provider.clone(), fast_config()));

        // Cancel the run from within the Vision stage itself: the flag is
        // observed at the next stage boundary.
        let orch = orchestrator.clone();
        provider.set_on_call(move |stage, calls| {
            if stage == Stage::Vision && calls == 2 {
                for run_id in orch.run_ids() {
                    let _ = orch.cancel(&run_id);
                }
            }
        });

        let err = orchestrator
            .execute(request(), Arc::new(CollectingProgressSink::new()))
            .await
            .unwrap_err();

        assert!(err.is_cancellation());
        let run_id = &orchestrator.run_ids()[0];
        assert_eq!(
            orchestrator.run_status(run_id).unwrap().status,
            RunStatus::Cancelled
        );
        // Analysis and Synthesis never executed.
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_cached_stage_result_skips_provider() {
        let provider = ScriptedProvider::new();
        let orchestrator = StageOrchestrator::new(provider.clone(), fast_config());

        let first = orchestrator
            .execute(request(), Arc::new(CollectingProgressSink::new()))
            .await
            .unwrap();
        assert!(matches!(first, PipelineOutcome::Completed(_)));
        assert_eq!(provider.calls(), 4);

        // Identical input: every stage is served from the memo cache.
        let second = orchestrator
            .execute(request(), Arc::new(CollectingProgressSink::new()))
            .await
            .unwrap();
        assert!(matches!(second, PipelineOutcome::Completed(_)));
        assert_eq!(provider.calls(), 4);
    }

    #[tokio::test]
    async fn test_unhealthy_dependency_soft_check() {
        let provider = ScriptedProvider::new();
        let orchestrator = StageOrchestrator::new(provider.clone(), fast_config());

        // Mark the context dependency unhealthy so the pre-check trips.
        orchestrator.health().register(
            Stage::Context.operation_name(),
            Arc::new(crate::testing::FlakyProbe::always_failing()),
            std::time::Duration::from_secs(3600),
            1,
        );
        orchestrator
            .health()
            .record_outcome(Stage::Context.operation_name(), false);

        let err = orchestrator
            .execute(request(), Arc::new(CollectingProgressSink::new()))
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::StageFailure { .. }));
        // Provider was never called; the pre-check consumed the budget.
        assert_eq!(provider.calls(), 0);
    }
}
