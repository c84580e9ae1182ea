//! Health monitoring of external dependencies.
//!
//! Each registered dependency gets an independent probe loop. Consecutive
//! probe failures past the threshold mark the dependency unhealthy; the
//! orchestrator consults this as a soft pre-check before attempting a stage,
//! not as a hard block.

use crate::errors::PipelineError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Health classification of a dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// The last probe succeeded.
    Healthy,
    /// Recent probes failed, but fewer than the threshold in a row.
    Degraded,
    /// At least `failure_threshold` consecutive probes failed.
    Unhealthy,
}

/// A probe of one external dependency.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Checks the dependency, returning an error if it is unreachable.
    async fn check(&self) -> Result<(), PipelineError>;
}

#[derive(Debug, Clone)]
struct DependencyState {
    status: HealthStatus,
    consecutive_failures: u32,
    failure_threshold: u32,
    last_checked_at: Option<DateTime<Utc>>,
}

impl DependencyState {
    fn new(failure_threshold: u32) -> Self {
        Self {
            status: HealthStatus::Healthy,
            consecutive_failures: 0,
            failure_threshold,
            last_checked_at: None,
        }
    }
}

/// Periodically probes external dependencies on independent timers.
#[derive(Debug, Default)]
pub struct HealthMonitor {
    states: Arc<DashMap<String, DependencyState>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl HealthMonitor {
    /// Creates an empty monitor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a dependency and spawns its probe loop.
    pub fn register(
        &self,
        name: impl Into<String>,
        probe: Arc<dyn HealthProbe>,
        interval: Duration,
        failure_threshold: u32,
    ) {
        let name = name.into();
        self.states
            .insert(name.clone(), DependencyState::new(failure_threshold.max(1)));

        let states = self.states.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let ok = probe.check().await.is_ok();
                record(&states, &name, ok);
            }
        });
        self.handles.lock().push(handle);
    }

    /// Records a probe outcome directly.
    ///
    /// Exposed so executors can feed observed call outcomes into health
    /// state without waiting for the next timer tick.
    pub fn record_outcome(&self, name: &str, ok: bool) {
        record(&self.states, name, ok);
    }

    /// Current status of a dependency, if registered.
    #[must_use]
    pub fn status(&self, name: &str) -> Option<HealthStatus> {
        self.states.get(name).map(|state| state.status)
    }

    /// Returns true if the dependency is known to be unhealthy.
    #[must_use]
    pub fn is_unhealthy(&self, name: &str) -> bool {
        self.status(name) == Some(HealthStatus::Unhealthy)
    }

    /// Stops all probe loops.
    pub fn shutdown(&self) {
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn record(states: &DashMap<String, DependencyState>, name: &str, ok: bool) {
    let Some(mut state) = states.get_mut(name) else {
        return;
    };
    state.last_checked_at = Some(Utc::now());

    if ok {
        if state.status != HealthStatus::Healthy {
            debug!(dependency = %name, "Dependency recovered");
        }
        state.consecutive_failures = 0;
        state.status = HealthStatus::Healthy;
    } else {
        state.consecutive_failures += 1;
        state.status = if state.consecutive_failures >= state.failure_threshold {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Degraded
        };
        if state.status == HealthStatus::Unhealthy {
            warn!(
                dependency = %name,
                consecutive_failures = state.consecutive_failures,
                "Dependency marked unhealthy"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlagProbe {
        healthy: Arc<AtomicBool>,
    }

    #[async_trait]
    impl HealthProbe for FlagProbe {
        async fn check(&self) -> Result<(), PipelineError> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(PipelineError::transient("probe", "unreachable"))
            }
        }
    }

    #[test]
    fn test_unknown_dependency_has_no_status() {
        let monitor = HealthMonitor::new();
        assert_eq!(monitor.status("vision_provider"), None);
        assert!(!monitor.is_unhealthy("vision_provider"));
    }

    #[tokio::test]
    async fn test_consecutive_failures_mark_unhealthy() {
        let monitor = HealthMonitor::new();
        monitor.register(
            "vision_provider",
            Arc::new(FlagProbe {
                healthy: Arc::new(AtomicBool::new(true)),
            }),
            Duration::from_secs(3600),
            3,
        );

        monitor.record_outcome("vision_provider", false);
        assert_eq!(
            monitor.status("vision_provider"),
            Some(HealthStatus::Degraded)
        );

        monitor.record_outcome("vision_provider", false);
        monitor.record_outcome("vision_provider", false);
        assert_eq!(
            monitor.status("vision_provider"),
            Some(HealthStatus::Unhealthy)
        );
        assert!(monitor.is_unhealthy("vision_provider"));
    }

    #[tokio::test]
    async fn test_success_resets_failure_streak() {
        let monitor = HealthMonitor::new();
        monitor.register(
            "data_store",
            Arc::new(FlagProbe {
                healthy: Arc::new(AtomicBool::new(true)),
            }),
            Duration::from_secs(3600),
            2,
        );

        monitor.record_outcome("data_store", false);
        monitor.record_outcome("data_store", true);
        monitor.record_outcome("data_store", false);

        // Streak was broken, so still below the threshold.
        assert_eq!(monitor.status("data_store"), Some(HealthStatus::Degraded));
    }

    #[tokio::test]
    async fn test_probe_loop_drives_status() {
        let healthy = Arc::new(AtomicBool::new(false));
        let monitor = HealthMonitor::new();
        monitor.register(
            "vision_provider",
            Arc::new(FlagProbe {
                healthy: healthy.clone(),
            }),
            Duration::from_millis(10),
            2,
        );

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(
            monitor.status("vision_provider"),
            Some(HealthStatus::Unhealthy)
        );

        healthy.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            monitor.status("vision_provider"),
            Some(HealthStatus::Healthy)
        );

        monitor.shutdown();
    }
}
