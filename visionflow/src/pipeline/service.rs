//! Caller-facing service surface.
//!
//! [`AnalysisService`] is what an API layer embeds: start, resume, cancel,
//! and inspect runs, plus dependency-graph preloading of supporting
//! entities. It owns one orchestrator and shares its resilience primitives
//! (breakers, cache, resumption) across all runs.

use super::orchestrator::{PipelineOutcome, StageOrchestrator};
use crate::cache::TtlCache;
use crate::config::VisionflowConfig;
use crate::core::{ClarificationQuestion, PipelineReport, RunStatus, RunStatusView};
use crate::errors::PipelineError;
use crate::events::{ProgressSink, TracingProgressSink};
use crate::loader::{DependencyLoader, LoadReport, NodeExecutor, NodeSpec};
use crate::ports::{AnalysisProvider, AnalysisRequest, DataStore};
use crate::retry::{RetryExecutor, RetryPolicy};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Response to starting an analysis run.
#[derive(Debug, Clone, Serialize)]
pub struct StartResponse {
    /// The new run's id.
    pub run_id: String,
    /// Status after the initial drive.
    pub status: RunStatus,
    /// The full report, when the run completed in one pass.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<PipelineReport>,
    /// Resume token, when the run suspended for clarification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
    /// Open clarification questions, when suspended.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub questions: Vec<ClarificationQuestion>,
}

/// Response to resuming a suspended run.
#[derive(Debug, Clone, Serialize)]
pub struct ResumeResponse {
    /// The resumed run's id.
    pub run_id: String,
    /// Status after the resumed drive.
    pub status: RunStatus,
    /// The full report, when the run completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<PipelineReport>,
    /// A fresh resume token, when the run suspended again.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
    /// Open clarification questions, when suspended again.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub questions: Vec<ClarificationQuestion>,
}

/// Counts from one maintenance pass.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MaintenanceReport {
    /// Idle or terminal runs removed.
    pub runs_removed: usize,
    /// Expired resume tokens pruned.
    pub tokens_pruned: usize,
    /// Expired cache entries swept.
    pub cache_entries_swept: usize,
}

/// The embeddable analysis service.
pub struct AnalysisService {
    orchestrator: StageOrchestrator,
    loader: DependencyLoader,
    executors: HashMap<String, Arc<dyn NodeExecutor>>,
    progress: Arc<dyn ProgressSink>,
}

impl AnalysisService {
    /// Creates a service around a provider.
    #[must_use]
    pub fn new(provider: Arc<dyn AnalysisProvider>, config: VisionflowConfig) -> Self {
        let loader = DependencyLoader::new(config.loader.max_parallelism);
        Self {
            orchestrator: StageOrchestrator::new(provider, config),
            loader,
            executors: HashMap::new(),
            progress: Arc::new(TracingProgressSink::default()),
        }
    }

    /// Attaches a data store for run persistence.
    #[must_use]
    pub fn with_data_store(mut self, store: Arc<dyn DataStore>) -> Self {
        self.orchestrator = self.orchestrator.with_data_store(store);
        self
    }

    /// Replaces the progress sink.
    #[must_use]
    pub fn with_progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = sink;
        self
    }

    /// Registers a node executor for a load-graph node type.
    #[must_use]
    pub fn with_executor(
        mut self,
        node_type: impl Into<String>,
        executor: Arc<dyn NodeExecutor>,
    ) -> Self {
        self.executors.insert(node_type.into(), executor);
        self
    }

    /// The underlying orchestrator, for status queries and wiring.
    #[must_use]
    pub fn orchestrator(&self) -> &StageOrchestrator {
        &self.orchestrator
    }

    /// Starts a new analysis run and drives it as far as it can go.
    pub async fn start_analysis(
        &self,
        request: AnalysisRequest,
    ) -> Result<StartResponse, PipelineError> {
        let outcome = self
            .orchestrator
            .execute(request, self.progress.clone())
            .await?;
        Ok(match outcome {
            PipelineOutcome::Completed(report) => StartResponse {
                run_id: report.run_id.clone(),
                status: RunStatus::Completed,
                report: Some(report),
                resume_token: None,
                questions: Vec::new(),
            },
            PipelineOutcome::AwaitingClarification {
                run_id,
                resume_token,
                questions,
            } => StartResponse {
                run_id,
                status: RunStatus::AwaitingClarification,
                report: None,
                resume_token: Some(resume_token),
                questions,
            },
        })
    }

    /// Resumes a suspended run with clarification answers.
    pub async fn resume_analysis(
        &self,
        resume_token: &str,
        answers: HashMap<String, String>,
    ) -> Result<ResumeResponse, PipelineError> {
        let outcome = self
            .orchestrator
            .resume(resume_token, answers, self.progress.clone())
            .await?;
        Ok(match outcome {
            PipelineOutcome::Completed(report) => ResumeResponse {
                run_id: report.run_id.clone(),
                status: RunStatus::Completed,
                report: Some(report),
                resume_token: None,
                questions: Vec::new(),
            },
            PipelineOutcome::AwaitingClarification {
                run_id,
                resume_token,
                questions,
            } => ResumeResponse {
                run_id,
                status: RunStatus::AwaitingClarification,
                report: None,
                resume_token: Some(resume_token),
                questions,
            },
        })
    }

    /// Requests cancellation of a run.
    pub fn cancel_analysis(&self, run_id: &str) -> Result<(), PipelineError> {
        self.orchestrator.cancel(run_id)
    }

    /// Status snapshot of a run.
    pub fn get_run_status(&self, run_id: &str) -> Result<RunStatusView, PipelineError> {
        self.orchestrator
            .run_status(run_id)
            .ok_or_else(|| PipelineError::RunNotFound(run_id.to_string()))
    }

    /// Loads a dependency graph of supporting entities.
    ///
    /// Node types resolve against the executors registered with
    /// [`Self::with_executor`].
    pub async fn preload(&self, nodes: &[NodeSpec]) -> Result<LoadReport, PipelineError> {
        self.loader.load(nodes, &self.executors).await
    }

    /// Sweeps idle runs, expired tokens, and expired cache entries.
    pub fn run_maintenance(&self) -> MaintenanceReport {
        MaintenanceReport {
            runs_removed: self.orchestrator.sweep_idle_runs(),
            tokens_pruned: self.orchestrator.resumption().prune_expired(),
            cache_entries_swept: self.orchestrator.cache().sweep_expired(),
        }
    }
}

impl std::fmt::Debug for AnalysisService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisService")
            .field("orchestrator", &self.orchestrator)
            .field("executors", &self.executors.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Node executor that loads entities from the data store.
///
/// Results are memoized in the shared cache under the node's type and id,
/// registered against an `entity_type:{type}` dependency key so saving or
/// mutating entities of that type can bulk-invalidate them. Store calls go
/// through the retry executor and its circuit breakers.
pub struct EntityLoadExecutor {
    store: Arc<dyn DataStore>,
    retry: RetryExecutor,
    policy: RetryPolicy,
    cache: Arc<TtlCache>,
    ttl: Duration,
}

impl EntityLoadExecutor {
    /// Creates an executor over a store, sharing retry and cache state.
    #[must_use]
    pub fn new(
        store: Arc<dyn DataStore>,
        retry: RetryExecutor,
        policy: RetryPolicy,
        cache: Arc<TtlCache>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            retry,
            policy,
            cache,
            ttl,
        }
    }

    /// The dependency key entities of a type are cached under.
    #[must_use]
    pub fn dependency_key(entity_type: &str) -> String {
        format!("entity_type:{entity_type}")
    }
}

impl std::fmt::Debug for EntityLoadExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityLoadExecutor")
            .field("ttl", &self.ttl)
            .finish()
    }
}

#[async_trait]
impl NodeExecutor for EntityLoadExecutor {
    async fn load(&self, node: &NodeSpec) -> Result<serde_json::Value, PipelineError> {
        let key = format!("entities:{}:{}", node.node_type, node.id);
        let dependencies = [Self::dependency_key(&node.node_type)];
        let operation = format!("load_{}", node.node_type);

        self.cache
            .get_or_load(&key, self.ttl, &dependencies, || async move {
                self.retry
                    .run(&operation, &self.policy, None, move || {
                        let store = self.store.clone();
                        let node = node.clone();
                        async move {
                            let filter = serde_json::json!({ "id": node.id });
                            let entities = store.load_entities(&node.node_type, &filter).await?;
                            serde_json::to_value(entities)
                                .map_err(|e| PipelineError::Internal(e.to_string()))
                        }
                    })
                    .await
            })
            .await
    }
}
