//! Scriptable fakes for exercising the pipeline without real providers.
//!
//! These live in the crate proper (not behind a feature flag) so downstream
//! consumers can drive the orchestrator in their own tests.

use crate::core::{
    AnalysisFinding, ContextReport, DeepAnalysisReport, DetectedObject, PipelineRun, Stage,
    StageData, StageOutput, SynthesisReport, VisionReport,
};
use crate::errors::PipelineError;
use crate::health::HealthProbe;
use crate::ports::{AnalysisProvider, ContextPayload, DataStore, Entity, ImageRef};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Once};

static TRACING: Once = Once::new();

/// Installs a tracing subscriber for test output, once per process.
///
/// Respects `RUST_LOG`; silent by default.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A plausible completed output for a stage.
#[must_use]
pub fn sample_output(stage: Stage) -> StageOutput {
    let data = match stage {
        Stage::Context => StageData::Context(ContextReport {
            scene: "residential exterior".to_string(),
            tags: vec!["outdoor".to_string(), "daylight".to_string()],
            confidence: 0.93,
        }),
        Stage::Vision => StageData::Vision(VisionReport {
            objects: vec![DetectedObject {
                label: "roof".to_string(),
                confidence: 0.91,
            }],
            summary: "A pitched roof with visible shingles".to_string(),
            confidence: 0.9,
        }),
        Stage::Analysis => StageData::Analysis(DeepAnalysisReport {
            findings: vec![AnalysisFinding {
                category: "wear".to_string(),
                detail: "minor shingle curling near the ridge".to_string(),
                score: 0.4,
            }],
            confidence: 0.88,
        }),
        Stage::Synthesis => StageData::Synthesis(SynthesisReport {
            verdict: "No urgent repairs needed".to_string(),
            highlights: vec!["minor shingle wear".to_string()],
            confidence: 0.9,
        }),
    };
    StageOutput::complete(data)
}

type CallHook = Box<dyn Fn(Stage, usize) + Send + Sync>;

/// Provider fake with per-stage scripted outcomes.
///
/// Each stage has a queue of scripted results consumed in order; once the
/// queue runs dry, calls succeed with [`sample_output`]. A call hook fires
/// at the start of every `analyze` call with the stage and the running call
/// count, which lets tests inject cancellation or other side effects
/// mid-pipeline.
#[derive(Default)]
pub struct ScriptedProvider {
    scripts: Mutex<HashMap<Stage, VecDeque<Result<StageOutput, PipelineError>>>>,
    calls: AtomicUsize,
    concurrent: AtomicUsize,
    max_concurrent: AtomicUsize,
    delay: Mutex<Option<std::time::Duration>>,
    on_call: Mutex<Option<CallHook>>,
}

impl ScriptedProvider {
    /// Creates a provider that succeeds with sample outputs.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queues a scripted output for a stage.
    pub fn push_output(&self, stage: Stage, output: StageOutput) {
        self.scripts
            .lock()
            .entry(stage)
            .or_default()
            .push_back(Ok(output));
    }

    /// Queues a scripted error for a stage.
    pub fn push_error(&self, stage: Stage, error: PipelineError) {
        self.scripts
            .lock()
            .entry(stage)
            .or_default()
            .push_back(Err(error));
    }

    /// Installs a hook invoked at the start of every call.
    pub fn set_on_call(&self, hook: impl Fn(Stage, usize) + Send + Sync + 'static) {
        *self.on_call.lock() = Some(Box::new(hook));
    }

    /// Total `analyze` calls observed.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Makes every call sleep for the given duration, so overlapping calls
    /// become observable through [`Self::max_concurrent`].
    pub fn set_delay(&self, delay: std::time::Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// The highest number of `analyze` calls in flight at once.
    #[must_use]
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AnalysisProvider for ScriptedProvider {
    async fn analyze(
        &self,
        stage: Stage,
        _image_ref: &ImageRef,
        _payload: &ContextPayload,
    ) -> Result<StageOutput, PipelineError> {
        let count = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let in_flight = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(in_flight, Ordering::SeqCst);
        if let Some(hook) = self.on_call.lock().as_ref() {
            hook(stage, count);
        }

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.scripts.lock().get_mut(&stage).and_then(VecDeque::pop_front);
        self.concurrent.fetch_sub(1, Ordering::SeqCst);
        match scripted {
            Some(result) => result,
            None => Ok(sample_output(stage)),
        }
    }
}

impl std::fmt::Debug for ScriptedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedProvider")
            .field("calls", &self.calls())
            .finish()
    }
}

/// Health probe whose outcome is a runtime flag.
#[derive(Debug)]
pub struct FlakyProbe {
    healthy: AtomicBool,
}

impl FlakyProbe {
    /// A probe that always fails.
    #[must_use]
    pub fn always_failing() -> Self {
        Self {
            healthy: AtomicBool::new(false),
        }
    }

    /// A probe that always succeeds.
    #[must_use]
    pub fn always_healthy() -> Self {
        Self {
            healthy: AtomicBool::new(true),
        }
    }

    /// Flips the probe outcome.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

#[async_trait]
impl HealthProbe for FlakyProbe {
    async fn check(&self) -> Result<(), PipelineError> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PipelineError::transient("probe", "dependency unreachable"))
        }
    }
}

/// In-memory data store fake.
///
/// Entity filters match by shallow field equality against the entity data:
/// every key in the filter object must equal the corresponding field. An
/// empty filter matches all entities of the type.
#[derive(Debug, Default)]
pub struct InMemoryDataStore {
    entities: RwLock<Vec<Entity>>,
    runs: RwLock<HashMap<String, PipelineRun>>,
    load_calls: AtomicUsize,
    fail_loads: AtomicBool,
}

impl InMemoryDataStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Inserts an entity.
    pub fn insert_entity(&self, entity: Entity) {
        self.entities.write().push(entity);
    }

    /// Makes subsequent entity loads fail with a transient error.
    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    /// Number of `load_entities` calls observed.
    #[must_use]
    pub fn load_calls(&self) -> usize {
        self.load_calls.load(Ordering::SeqCst)
    }

    /// The most recently saved snapshot of a run.
    #[must_use]
    pub fn saved_run(&self, run_id: &str) -> Option<PipelineRun> {
        self.runs.read().get(run_id).cloned()
    }

    /// Number of distinct runs persisted.
    #[must_use]
    pub fn saved_run_count(&self) -> usize {
        self.runs.read().len()
    }
}

#[async_trait]
impl DataStore for InMemoryDataStore {
    async fn load_entities(
        &self,
        entity_type: &str,
        filter: &serde_json::Value,
    ) -> Result<Vec<Entity>, PipelineError> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(PipelineError::transient("data_store", "store unavailable"));
        }

        let matches = |entity: &Entity| {
            let Some(fields) = filter.as_object() else {
                return true;
            };
            fields
                .iter()
                .all(|(key, expected)| entity.data.get(key) == Some(expected))
        };

        Ok(self
            .entities
            .read()
            .iter()
            .filter(|entity| entity.entity_type == entity_type && matches(entity))
            .cloned()
            .collect())
    }

    async fn save_run(&self, run: &PipelineRun) -> Result<(), PipelineError> {
        self.runs.write().insert(run.run_id.clone(), run.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_scripted_provider_consumes_queue_then_defaults() {
        let provider = ScriptedProvider::new();
        provider.push_error(Stage::Vision, PipelineError::transient("vision_analysis", "x"));

        let image = ImageRef::Url("https://example.com/a.jpg".to_string());
        let payload = ContextPayload {
            user_context: String::new(),
            prior_outputs: std::collections::BTreeMap::new(),
            clarification_answers: HashMap::new(),
        };

        assert!(provider.analyze(Stage::Vision, &image, &payload).await.is_err());
        assert!(provider.analyze(Stage::Vision, &image, &payload).await.is_ok());
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_store_filter_matches_fields() {
        let store = InMemoryDataStore::new();
        store.insert_entity(Entity {
            id: "img-1".to_string(),
            entity_type: "images".to_string(),
            data: json!({ "id": "img-1", "kind": "roof" }),
        });
        store.insert_entity(Entity {
            id: "img-2".to_string(),
            entity_type: "images".to_string(),
            data: json!({ "id": "img-2", "kind": "wall" }),
        });

        let roofs = store
            .load_entities("images", &json!({ "kind": "roof" }))
            .await
            .unwrap();
        assert_eq!(roofs.len(), 1);
        assert_eq!(roofs[0].id, "img-1");

        let all = store.load_entities("images", &json!({})).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_store_failure_flag() {
        let store = InMemoryDataStore::new();
        store.set_fail_loads(true);
        let result = store.load_entities("images", &json!({})).await;
        assert!(matches!(result, Err(PipelineError::Transient { .. })));
    }

    #[test]
    fn test_sample_outputs_match_their_stage() {
        for stage in Stage::ALL {
            assert_eq!(sample_output(stage).stage(), stage);
        }
    }
}
