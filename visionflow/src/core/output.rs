//! Stage output types.
//!
//! Each stage produces a closed, tagged output shape. Clarification is a
//! first-class value on the output, never an error: a stage that lacks
//! confidence returns its best partial data together with the questions it
//! needs answered.

use super::Stage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single question the pipeline needs answered before it can continue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarificationQuestion {
    /// Stable question identifier, used to key the caller's answers.
    pub id: String,
    /// Human-readable prompt.
    pub prompt: String,
}

impl ClarificationQuestion {
    /// Creates a new clarification question.
    #[must_use]
    pub fn new(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            prompt: prompt.into(),
        }
    }
}

/// A request for more user input, attached to a stage output.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClarificationRequest {
    /// The questions to surface to the caller.
    pub questions: Vec<ClarificationQuestion>,
}

impl ClarificationRequest {
    /// Creates a clarification request from a list of questions.
    #[must_use]
    pub fn new(questions: Vec<ClarificationQuestion>) -> Self {
        Self { questions }
    }
}

/// Output of the context detection stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextReport {
    /// Detected scene description.
    pub scene: String,
    /// Scene tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Detection confidence in `[0.0, 1.0]`.
    pub confidence: f64,
}

/// A single object detected by the vision stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    /// Object label.
    pub label: String,
    /// Detection confidence in `[0.0, 1.0]`.
    pub confidence: f64,
}

/// Output of the vision analysis stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisionReport {
    /// Detected objects.
    #[serde(default)]
    pub objects: Vec<DetectedObject>,
    /// Free-text summary of the image.
    pub summary: String,
    /// Overall confidence in `[0.0, 1.0]`.
    pub confidence: f64,
}

/// A single finding from the deep analysis stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisFinding {
    /// Finding category.
    pub category: String,
    /// Finding detail.
    pub detail: String,
    /// Severity or relevance score in `[0.0, 1.0]`.
    pub score: f64,
}

/// Output of the deep analysis stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeepAnalysisReport {
    /// Individual findings.
    #[serde(default)]
    pub findings: Vec<AnalysisFinding>,
    /// Overall confidence in `[0.0, 1.0]`.
    pub confidence: f64,
}

/// Output of the final synthesis stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisReport {
    /// The synthesized verdict text.
    pub verdict: String,
    /// Key highlights extracted from the prior stages.
    #[serde(default)]
    pub highlights: Vec<String>,
    /// Overall confidence in `[0.0, 1.0]`.
    pub confidence: f64,
}

/// The tagged union of per-stage output data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "report", rename_all = "snake_case")]
pub enum StageData {
    /// Context detection output.
    Context(ContextReport),
    /// Vision analysis output.
    Vision(VisionReport),
    /// Deep analysis output.
    Analysis(DeepAnalysisReport),
    /// Synthesis output.
    Synthesis(SynthesisReport),
}

impl StageData {
    /// The stage this data belongs to.
    #[must_use]
    pub fn stage(&self) -> Stage {
        match self {
            Self::Context(_) => Stage::Context,
            Self::Vision(_) => Stage::Vision,
            Self::Analysis(_) => Stage::Analysis,
            Self::Synthesis(_) => Stage::Synthesis,
        }
    }

    /// The reported confidence of this output.
    #[must_use]
    pub fn confidence(&self) -> f64 {
        match self {
            Self::Context(r) => r.confidence,
            Self::Vision(r) => r.confidence,
            Self::Analysis(r) => r.confidence,
            Self::Synthesis(r) => r.confidence,
        }
    }
}

/// The output of a single stage execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    /// The stage's typed report data.
    pub data: StageData,

    /// Pending clarification, if the stage needs more user input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarification: Option<ClarificationRequest>,

    /// Additional provider metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl StageOutput {
    /// Creates a completed output with no pending clarification.
    #[must_use]
    pub fn complete(data: StageData) -> Self {
        Self {
            data,
            clarification: None,
            metadata: HashMap::new(),
        }
    }

    /// Creates an output that suspends the run pending clarification.
    #[must_use]
    pub fn needs_clarification(data: StageData, request: ClarificationRequest) -> Self {
        Self {
            data,
            clarification: Some(request),
            metadata: HashMap::new(),
        }
    }

    /// Attaches a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// The stage this output belongs to.
    #[must_use]
    pub fn stage(&self) -> Stage {
        self.data.stage()
    }

    /// Returns true if the run must suspend for user input.
    #[must_use]
    pub fn requires_clarification(&self) -> bool {
        self.clarification
            .as_ref()
            .is_some_and(|c| !c.questions.is_empty())
    }
}
