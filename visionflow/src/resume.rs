//! Resume tokens for clarification-suspended runs.
//!
//! When a stage asks for clarification, the orchestrator snapshots the run's
//! partial results and the open questions under an opaque token. Resolution
//! is idempotent: the same valid token always yields the identical snapshot,
//! and single use is deliberately not enforced.

use crate::core::{ClarificationQuestion, Stage, StageOutput};
use crate::errors::PipelineError;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// The state captured when a run suspends for clarification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeSnapshot {
    /// The suspended run's id.
    pub run_id: String,
    /// Stage outputs recorded before suspension, in stage order.
    pub partial_results: BTreeMap<Stage, StageOutput>,
    /// The questions that must be answered to resume.
    pub questions: Vec<ClarificationQuestion>,
    /// When the snapshot was taken.
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
struct StoredToken {
    snapshot: ResumeSnapshot,
    expires_at: Instant,
}

/// Issues and resolves resume tokens.
#[derive(Debug)]
pub struct ResumptionManager {
    ttl: Duration,
    tokens: RwLock<HashMap<String, StoredToken>>,
}

impl ResumptionManager {
    /// Creates a manager with the given token TTL.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            tokens: RwLock::new(HashMap::new()),
        }
    }

    /// Mints a token over a snapshot of the suspended run.
    pub fn create_token(
        &self,
        run_id: impl Into<String>,
        partial_results: BTreeMap<Stage, StageOutput>,
        questions: Vec<ClarificationQuestion>,
    ) -> String {
        let token = Uuid::new_v4().to_string();
        let snapshot = ResumeSnapshot {
            run_id: run_id.into(),
            partial_results,
            questions,
            created_at: Utc::now(),
        };
        self.tokens.write().insert(
            token.clone(),
            StoredToken {
                snapshot,
                expires_at: Instant::now() + self.ttl,
            },
        );
        token
    }

    /// Resolves a token to its snapshot.
    ///
    /// Never mutates on read: resolving the same valid token repeatedly
    /// returns identical snapshots. Expired tokens are removed and reported
    /// as [`PipelineError::TokenExpired`], distinct from unknown tokens.
    pub fn resolve(&self, token: &str) -> Result<ResumeSnapshot, PipelineError> {
        let expired = {
            let tokens = self.tokens.read();
            match tokens.get(token) {
                None => {
                    return Err(PipelineError::TokenNotFound {
                        token: token.to_string(),
                    })
                }
                Some(stored) => {
                    if stored.expires_at > Instant::now() {
                        return Ok(stored.snapshot.clone());
                    }
                    true
                }
            }
        };

        if expired {
            self.tokens.write().remove(token);
        }
        Err(PipelineError::TokenExpired {
            token: token.to_string(),
        })
    }

    /// Drops a token explicitly (e.g. once its run completes).
    pub fn discard(&self, token: &str) -> bool {
        self.tokens.write().remove(token).is_some()
    }

    /// Removes all expired tokens. Returns the count removed.
    pub fn prune_expired(&self) -> usize {
        let now = Instant::now();
        let mut tokens = self.tokens.write();
        let before = tokens.len();
        tokens.retain(|_, stored| stored.expires_at > now);
        before - tokens.len()
    }

    /// Number of live tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.read().len()
    }

    /// Returns true if no tokens are outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.read().is_empty()
    }
}
