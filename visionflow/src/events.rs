//! Progress reporting sinks.
//!
//! The orchestrator reports progress through a [`ProgressSink`] after each
//! state transition. Sinks are fire-and-forget and must not block the run
//! loop; for a given run, calls arrive strictly ordered by stage sequence
//! from a single execution context.

use crate::core::Stage;
use tracing::debug;

/// Receives progress events for pipeline runs.
pub trait ProgressSink: Send + Sync {
    /// Reports progress for a run.
    ///
    /// Implementations must never panic or block; errors are swallowed at
    /// the sink boundary.
    fn on_progress(&self, run_id: &str, stage: Stage, percent: u8);
}

/// A sink that discards all progress events.
///
/// Used as the default when no sink is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpProgressSink;

impl ProgressSink for NoOpProgressSink {
    fn on_progress(&self, _run_id: &str, _stage: Stage, _percent: u8) {
        // Intentionally empty - discards all events
    }
}

/// A sink that logs progress through the tracing framework.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn on_progress(&self, run_id: &str, stage: Stage, percent: u8) {
        debug!(
            run_id = %run_id,
            stage = %stage,
            percent,
            "Pipeline progress"
        );
    }
}

/// A collecting sink for tests.
#[derive(Debug, Default)]
pub struct CollectingProgressSink {
    events: parking_lot::RwLock<Vec<(String, Stage, u8)>>,
}

impl CollectingProgressSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<(String, Stage, u8)> {
        self.events.read().clone()
    }

    /// Returns events for a single run.
    #[must_use]
    pub fn events_for_run(&self, run_id: &str) -> Vec<(Stage, u8)> {
        self.events
            .read()
            .iter()
            .filter(|(id, _, _)| id == run_id)
            .map(|(_, stage, pct)| (*stage, *pct))
            .collect()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

impl ProgressSink for CollectingProgressSink {
    fn on_progress(&self, run_id: &str, stage: Stage, percent: u8) {
        self.events
            .write()
            .push((run_id.to_string(), stage, percent));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_sink() {
        let sink = NoOpProgressSink;
        sink.on_progress("run-1", Stage::Context, 15);
        // Should not panic
    }

    #[test]
    fn test_collecting_sink() {
        let sink = CollectingProgressSink::new();
        assert!(sink.is_empty());

        sink.on_progress("run-1", Stage::Context, 15);
        sink.on_progress("run-2", Stage::Vision, 50);
        sink.on_progress("run-1", Stage::Vision, 50);

        assert_eq!(sink.len(), 3);
        assert_eq!(
            sink.events_for_run("run-1"),
            vec![(Stage::Context, 15), (Stage::Vision, 50)]
        );
    }
}
