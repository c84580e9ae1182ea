//! Pipeline orchestration: the stage state machine and the caller-facing
//! service surface.

mod orchestrator;
mod service;


pub use orchestrator::{PipelineOutcome, StageOrchestrator};
pub use service::{
    AnalysisService, EntityLoadExecutor, MaintenanceReport, ResumeResponse, StartResponse,
};
