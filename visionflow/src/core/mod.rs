//! Core pipeline types: stages, outputs, and run state.

mod output;
mod run;
mod stage;

pub use output::{
    AnalysisFinding, ClarificationQuestion, ClarificationRequest, ContextReport,
    DeepAnalysisReport, DetectedObject, StageData, StageOutput, SynthesisReport, VisionReport,
};
pub use run::{PipelineReport, PipelineRun, RunStatus, RunStatusView};
pub use stage::Stage;
