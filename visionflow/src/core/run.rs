//! Pipeline run state.

use super::{Stage, StageOutput};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// The lifecycle status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created but not yet started.
    Idle,
    /// Actively executing stages.
    Running,
    /// Suspended, waiting for clarification answers.
    AwaitingClarification,
    /// All stages completed.
    Completed,
    /// A stage failed terminally.
    Failed,
    /// The run was cancelled cooperatively.
    Cancelled,
}

impl RunStatus {
    /// Returns true if the run can make no further progress.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// A single in-flight analysis run.
///
/// Owned exclusively by the orchestrator. Partial results are written after
/// every stage, on both the success and clarification-suspend paths, so the
/// run is always resumable up to the last completed stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Unique run identifier.
    pub run_id: String,
    /// The stage the run is at (the next stage to execute, or the last one
    /// touched when terminal).
    pub stage: Stage,
    /// Current lifecycle status.
    pub status: RunStatus,
    /// Overall progress in `[0, 100]`.
    pub progress_percent: u8,
    /// Outputs of completed (or suspended) stages, keyed in stage order.
    pub partial_results: BTreeMap<Stage, StageOutput>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last state-transition timestamp, used for idle-run sweeping.
    pub last_activity_at: DateTime<Utc>,
    /// The active resume token, if suspended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
    /// Terminal failure description, if failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl PipelineRun {
    /// Creates a new idle run with a fresh id.
    #[must_use]
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4().to_string())
    }

    /// Creates a new idle run with an explicit id (used on resumption).
    #[must_use]
    pub fn with_id(run_id: String) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            stage: Stage::Context,
            status: RunStatus::Idle,
            progress_percent: 0,
            partial_results: BTreeMap::new(),
            created_at: now,
            last_activity_at: now,
            resume_token: None,
            failure: None,
        }
    }

    /// Records a stage output and advances progress accounting.
    pub fn record_output(&mut self, output: StageOutput) {
        let stage = output.stage();
        self.stage = stage;
        self.progress_percent = stage.progress_on_complete();
        self.partial_results.insert(stage, output);
        self.touch();
    }

    /// Transitions the run status.
    pub fn set_status(&mut self, status: RunStatus) {
        self.status = status;
        self.touch();
    }

    /// Updates the last-activity timestamp.
    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    /// The first stage that has not produced a completed output.
    ///
    /// Resumption starts here: a stage that suspended for clarification is
    /// re-executed with the answers, while fully completed stages are kept.
    #[must_use]
    pub fn next_pending_stage(&self) -> Option<Stage> {
        Stage::ALL.into_iter().find(|stage| {
            self.partial_results
                .get(stage)
                .map_or(true, StageOutput::requires_clarification)
        })
    }

    /// A caller-facing view of the run state.
    #[must_use]
    pub fn status_view(&self) -> RunStatusView {
        RunStatusView {
            run_id: self.run_id.clone(),
            stage: self.stage,
            status: self.status,
            progress_percent: self.progress_percent,
        }
    }
}

impl Default for PipelineRun {
    fn default() -> Self {
        Self::new()
    }
}

/// A lightweight snapshot of run state for status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatusView {
    /// The run identifier.
    pub run_id: String,
    /// The current stage.
    pub stage: Stage,
    /// The lifecycle status.
    pub status: RunStatus,
    /// Overall progress in `[0, 100]`.
    pub progress_percent: u8,
}

/// The final result of a completed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    /// The run identifier.
    pub run_id: String,
    /// All stage outputs in stage order.
    pub stages: BTreeMap<Stage, StageOutput>,
    /// Completion timestamp.
    pub completed_at: DateTime<Utc>,
}

impl PipelineReport {
    /// The final synthesis output, if present.
    #[must_use]
    pub fn synthesis(&self) -> Option<&StageOutput> {
        self.stages.get(&Stage::Synthesis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ContextReport, StageData};
    use pretty_assertions::assert_eq;

    fn context_output() -> StageOutput {
        StageOutput::complete(StageData::Context(ContextReport {
            scene: "street".to_string(),
            tags: vec![],
            confidence: 0.8,
        }))
    }

    #[test]
    fn test_new_run_is_idle() {
        let run = PipelineRun::new();
        assert_eq!(run.status, RunStatus::Idle);
        assert_eq!(run.progress_percent, 0);
        assert!(run.partial_results.is_empty());
        assert_eq!(run.next_pending_stage(), Some(Stage::Context));
    }

    #[test]
    fn test_record_output_advances_progress() {
        let mut run = PipelineRun::new();
        run.record_output(context_output());

        assert_eq!(run.stage, Stage::Context);
        assert_eq!(run.progress_percent, Stage::Context.progress_on_complete());
        assert_eq!(run.next_pending_stage(), Some(Stage::Vision));
    }

    #[test]
    fn test_suspended_stage_is_still_pending() {
        use crate::core::{ClarificationQuestion, ClarificationRequest};

        let mut run = PipelineRun::new();
        run.record_output(context_output());
        run.record_output(StageOutput::needs_clarification(
            StageData::Vision(crate::core::VisionReport {
                objects: vec![],
                summary: "unclear".to_string(),
                confidence: 0.3,
            }),
            ClarificationRequest::new(vec![ClarificationQuestion::new("q1", "What is this?")]),
        ));

        // Vision suspended, so resumption re-executes it.
        assert_eq!(run.next_pending_stage(), Some(Stage::Vision));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::AwaitingClarification.is_terminal());
    }

    #[test]
    fn test_partial_results_keys_ordered() {
        let mut run = PipelineRun::new();
        run.record_output(context_output());

        let keys: Vec<Stage> = run.partial_results.keys().copied().collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }
}
