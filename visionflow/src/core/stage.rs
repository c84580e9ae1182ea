//! The ordered pipeline stage enum.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One ordered phase of the analysis pipeline.
///
/// Transitions are strictly forward. A run never revisits a stage except
/// via resumption, which restarts at the successor of the last completed
/// stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Lightweight scene/context detection.
    Context,
    /// Vision model analysis of the image itself.
    Vision,
    /// Deep analysis combining vision output with user context.
    Analysis,
    /// Final synthesis of all prior stage outputs.
    Synthesis,
}

impl Stage {
    /// All stages in execution order.
    pub const ALL: [Self; 4] = [Self::Context, Self::Vision, Self::Analysis, Self::Synthesis];

    /// Returns the next stage, or `None` for the final stage.
    #[must_use]
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Context => Some(Self::Vision),
            Self::Vision => Some(Self::Analysis),
            Self::Analysis => Some(Self::Synthesis),
            Self::Synthesis => None,
        }
    }

    /// Zero-based position in the execution order.
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::Context => 0,
            Self::Vision => 1,
            Self::Analysis => 2,
            Self::Synthesis => 3,
        }
    }

    /// The operation class name used by the retry executor, the circuit
    /// breaker registry, and the health monitor.
    #[must_use]
    pub fn operation_name(self) -> &'static str {
        match self {
            Self::Context => "context_detection",
            Self::Vision => "vision_analysis",
            Self::Analysis => "deep_analysis",
            Self::Synthesis => "synthesis",
        }
    }

    /// Overall progress percentage once this stage has completed.
    ///
    /// Weights reflect relative stage cost rather than an even split.
    #[must_use]
    pub fn progress_on_complete(self) -> u8 {
        match self {
            Self::Context => 15,
            Self::Vision => 50,
            Self::Analysis => 85,
            Self::Synthesis => 100,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Context => write!(f, "context"),
            Self::Vision => write!(f, "vision"),
            Self::Analysis => write!(f, "analysis"),
            Self::Synthesis => write!(f, "synthesis"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_is_forward() {
        let mut stage = Stage::Context;
        let mut seen = vec![stage];
        while let Some(next) = stage.next() {
            assert!(next > stage);
            seen.push(next);
            stage = next;
        }
        assert_eq!(seen, Stage::ALL);
    }

    #[test]
    fn test_final_stage_has_no_successor() {
        assert_eq!(Stage::Synthesis.next(), None);
    }

    #[test]
    fn test_progress_is_monotonic() {
        let mut last = 0;
        for stage in Stage::ALL {
            assert!(stage.progress_on_complete() > last);
            last = stage.progress_on_complete();
        }
        assert_eq!(last, 100);
    }

    #[test]
    fn test_stage_serde_names() {
        let json = serde_json::to_string(&Stage::Vision).unwrap();
        assert_eq!(json, r#""vision""#);

        let back: Stage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Stage::Vision);
    }

    #[test]
    fn test_operation_names_are_distinct() {
        let names: std::collections::HashSet<_> =
            Stage::ALL.iter().map(|s| s.operation_name()).collect();
        assert_eq!(names.len(), Stage::ALL.len());
    }
}
