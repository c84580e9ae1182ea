//! # Visionflow
//!
//! A resilient multi-stage image analysis pipeline.
//!
//! Visionflow drives an analysis request through four fixed stages
//! (context detection, vision analysis, deep analysis, synthesis) with
//! production-grade failure handling:
//!
//! - **Retry with backoff**: Transient provider failures are retried with
//!   exponential backoff and jitter
//! - **Circuit breaking**: Per-operation breakers open under sustained
//!   failure rates and probe recovery with bounded half-open calls
//! - **Clarification and resumption**: A stage can suspend the run with
//!   questions; a resume token restores it once answers arrive
//! - **Cancellation**: Cooperative tokens observed at stage boundaries and
//!   before retry sleeps
//! - **Caching**: Stage results and supporting entities are memoized in a
//!   bounded TTL cache with LRU eviction and dependency invalidation
//! - **Dependency loading**: Supporting entities load as a DAG with bounded
//!   parallelism and partial-success reporting
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use visionflow::prelude::*;
//!
//! let service = AnalysisService::new(provider, VisionflowConfig::default())
//!     .with_data_store(store);
//!
//! let request = AnalysisRequest::new(
//!     ImageRef::Url("https://example.com/site.jpg".into()),
//!     "assess storm damage",
//! );
//!
//! match service.start_analysis(request).await? {
//!     response if response.status == RunStatus::Completed => { /* report */ }
//!     response => { /* collect answers, then resume_analysis */ }
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod breaker;
pub mod cache;
pub mod cancellation;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod health;
pub mod loader;
pub mod pipeline;
pub mod ports;
pub mod resume;
pub mod retry;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::breaker::{
        CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState,
    };
    pub use crate::cache::{CacheConfig, CacheEntryStats, TtlCache};
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::VisionflowConfig;
    pub use crate::core::{
        ClarificationQuestion, ClarificationRequest, PipelineReport, PipelineRun, RunStatus,
        RunStatusView, Stage, StageData, StageOutput,
    };
    pub use crate::errors::PipelineError;
    pub use crate::events::{
        CollectingProgressSink, NoOpProgressSink, ProgressSink, TracingProgressSink,
    };
    pub use crate::health::{HealthMonitor, HealthProbe, HealthStatus};
    pub use crate::loader::{DependencyLoader, LoadReport, NodeExecutor, NodeSpec, NodeStatus};
    pub use crate::pipeline::{
        AnalysisService, EntityLoadExecutor, PipelineOutcome, ResumeResponse, StageOrchestrator,
        StartResponse,
    };
    pub use crate::ports::{
        AnalysisProvider, AnalysisRequest, ContextPayload, DataStore, Entity, ImageRef,
    };
    pub use crate::resume::{ResumeSnapshot, ResumptionManager};
    pub use crate::retry::{RetryExecutor, RetryPolicy};
}
