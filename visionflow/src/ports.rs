//! External collaborator interfaces.
//!
//! The pipeline core never talks to a network or a database directly. The
//! vision/analysis provider and the data store are trait seams; their
//! implementations live outside this crate and translate transport failures
//! into the [`PipelineError`] taxonomy at the boundary.

use crate::core::{PipelineRun, Stage, StageOutput};
use crate::errors::PipelineError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// A reference to the image under analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageRef {
    /// A URL the provider can fetch.
    Url(String),
    /// Raw image bytes supplied by the caller.
    Bytes(Vec<u8>),
}

impl ImageRef {
    /// A stable representation used for input hashing.
    #[must_use]
    pub fn fingerprint(&self) -> Vec<u8> {
        match self {
            Self::Url(url) => url.as_bytes().to_vec(),
            Self::Bytes(bytes) => bytes.clone(),
        }
    }
}

/// A request to run the full analysis pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRequest {
    /// The image to analyze.
    pub image_ref: ImageRef,
    /// Free-text context from the user.
    pub user_context: String,
    /// Answers to previously raised clarification questions, keyed by
    /// question id. Empty on a fresh run.
    #[serde(default)]
    pub clarification_answers: HashMap<String, String>,
}

impl AnalysisRequest {
    /// Creates a request with no clarification answers.
    #[must_use]
    pub fn new(image_ref: ImageRef, user_context: impl Into<String>) -> Self {
        Self {
            image_ref,
            user_context: user_context.into(),
            clarification_answers: HashMap::new(),
        }
    }
}

/// The context payload handed to the provider for one stage call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextPayload {
    /// The user's free-text context.
    pub user_context: String,
    /// Outputs of all prior stages, in stage order.
    pub prior_outputs: BTreeMap<Stage, StageOutput>,
    /// Clarification answers, if resuming.
    #[serde(default)]
    pub clarification_answers: HashMap<String, String>,
}

/// The vision/analysis provider collaborator.
///
/// One call per stage. A provider signals "needs clarification" through the
/// returned [`StageOutput`], never through an error.
#[async_trait]
pub trait AnalysisProvider: Send + Sync {
    /// Runs one stage of analysis against the image.
    async fn analyze(
        &self,
        stage: Stage,
        image_ref: &ImageRef,
        payload: &ContextPayload,
    ) -> Result<StageOutput, PipelineError>;
}

/// A generic entity loaded from the data store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Entity identifier.
    pub id: String,
    /// Entity type (e.g. "images", "analyses").
    pub entity_type: String,
    /// Entity payload.
    pub data: serde_json::Value,
}

/// The opaque data-store collaborator.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Loads entities of a type matching a filter.
    async fn load_entities(
        &self,
        entity_type: &str,
        filter: &serde_json::Value,
    ) -> Result<Vec<Entity>, PipelineError>;

    /// Persists a run snapshot.
    async fn save_run(&self, run: &PipelineRun) -> Result<(), PipelineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_ref_fingerprint_distinct() {
        let a = ImageRef::Url("https://example.com/a.jpg".to_string());
        let b = ImageRef::Url("https://example.com/b.jpg".to_string());
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_request_serde() {
        let request = AnalysisRequest::new(
            ImageRef::Url("https://example.com/a.jpg".to_string()),
            "check the damage on the left panel",
        );
        let json = serde_json::to_string(&request).unwrap();
        let back: AnalysisRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.image_ref, request.image_ref);
        assert_eq!(back.user_context, request.user_context);
    }
}
