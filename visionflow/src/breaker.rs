//! Per-operation circuit breakers.
//!
//! Each registered operation class (e.g. "vision_analysis") gets one breaker
//! tracking a rolling window of attempt outcomes. Breaker state is the sole
//! source of truth for whether a call is attempted; all mutation happens
//! under the breaker's lock so concurrent callers cannot race the counters
//! or oversubscribe the half-open probe budget.

use crate::errors::PipelineError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls proceed normally.
    Closed,
    /// Calls fail fast until the recovery timeout elapses.
    Open,
    /// A bounded number of probe calls is permitted.
    HalfOpen,
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failure rate in `[0.0, 1.0]` that opens the breaker.
    pub failure_threshold: f64,
    /// Minimum outcomes in the window before the rate is evaluated.
    pub minimum_sample_size: usize,
    /// Maximum outcomes kept in the rolling window.
    pub monitor_window: usize,
    /// How long an open breaker rejects calls before probing, in ms.
    pub recovery_timeout_ms: u64,
    /// Probe calls permitted while half-open.
    pub half_open_retry_limit: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 0.5,
            minimum_sample_size: 5,
            monitor_window: 20,
            recovery_timeout_ms: 30_000,
            half_open_retry_limit: 2,
        }
    }
}

impl CircuitBreakerConfig {
    /// Creates a config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the failure-rate threshold.
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: f64) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Sets the minimum sample size.
    #[must_use]
    pub fn with_minimum_sample_size(mut self, size: usize) -> Self {
        self.minimum_sample_size = size;
        self
    }

    /// Sets the rolling window size.
    #[must_use]
    pub fn with_monitor_window(mut self, window: usize) -> Self {
        self.monitor_window = window;
        self
    }

    /// Sets the recovery timeout.
    #[must_use]
    pub fn with_recovery_timeout_ms(mut self, ms: u64) -> Self {
        self.recovery_timeout_ms = ms;
        self
    }

    /// Sets the half-open probe limit.
    #[must_use]
    pub fn with_half_open_retry_limit(mut self, limit: u32) -> Self {
        self.half_open_retry_limit = limit;
        self
    }

    fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

/// A serializable snapshot of breaker state for introspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    /// The guarded operation name.
    pub operation_name: String,
    /// Current state.
    pub state: CircuitState,
    /// Failures in the rolling window.
    pub failure_count: usize,
    /// Successes in the rolling window.
    pub success_count: usize,
    /// Timestamp of the last state transition.
    pub last_transition_at: DateTime<Utc>,
    /// Remaining half-open probe permits.
    pub half_open_probes_remaining: u32,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    /// Rolling window of outcomes; `true` marks a failure.
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
    half_open_successes: u32,
    last_transition_at: DateTime<Utc>,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            window: VecDeque::new(),
            opened_at: None,
            half_open_in_flight: 0,
            half_open_successes: 0,
            last_transition_at: Utc::now(),
        }
    }

    fn transition(&mut self, state: CircuitState) {
        self.state = state;
        self.last_transition_at = Utc::now();
    }

    fn record_outcome(&mut self, failed: bool, window_size: usize) {
        self.window.push_back(failed);
        while self.window.len() > window_size {
            self.window.pop_front();
        }
    }

    fn failure_count(&self) -> usize {
        self.window.iter().filter(|failed| **failed).count()
    }
}

/// A circuit breaker guarding one operation class.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Creates a breaker for an operation.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::new()),
        }
    }

    /// The guarded operation name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Claims permission to attempt a call.
    ///
    /// Moves `Open -> HalfOpen` once the recovery timeout has elapsed. While
    /// half-open, permits are claimed under the lock so the probe budget is
    /// a bounded counter, never oversubscribed.
    pub fn begin_call(&self) -> Result<(), PipelineError> {
        let mut inner = self.inner.lock();

        if inner.state == CircuitState::Open {
            let elapsed = inner.opened_at.map(|at| at.elapsed());
            if elapsed.map_or(false, |e| e >= self.config.recovery_timeout()) {
                debug!(operation = %self.name, "Circuit breaker probing after recovery timeout");
                inner.transition(CircuitState::HalfOpen);
                inner.half_open_in_flight = 0;
                inner.half_open_successes = 0;
            }
        }

        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => Err(PipelineError::CircuitOpen {
                operation: self.name.clone(),
            }),
            CircuitState::HalfOpen => {
                let claimed = inner.half_open_in_flight + inner.half_open_successes;
                if claimed < self.config.half_open_retry_limit {
                    inner.half_open_in_flight += 1;
                    Ok(())
                } else {
                    Err(PipelineError::CircuitOpen {
                        operation: self.name.clone(),
                    })
                }
            }
        }
    }

    /// Records a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.record_outcome(false, self.config.monitor_window);
            }
            CircuitState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_retry_limit {
                    debug!(operation = %self.name, "Circuit breaker closed after successful probes");
                    inner.transition(CircuitState::Closed);
                    inner.window.clear();
                    inner.opened_at = None;
                }
            }
            // A stale success from a call that started before the breaker
            // reopened; the window was already reset.
            CircuitState::Open => {}
        }
    }

    /// Records a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.record_outcome(true, self.config.monitor_window);
                let total = inner.window.len();
                let failures = inner.failure_count();
                if total >= self.config.minimum_sample_size {
                    #[allow(clippy::cast_precision_loss)]
                    let rate = failures as f64 / total as f64;
                    if rate >= self.config.failure_threshold {
                        warn!(
                            operation = %self.name,
                            failure_rate = rate,
                            window = total,
                            "Circuit breaker opened"
                        );
                        inner.transition(CircuitState::Open);
                        inner.opened_at = Some(Instant::now());
                    }
                }
            }
            CircuitState::HalfOpen => {
                warn!(operation = %self.name, "Circuit breaker reopened after failed probe");
                inner.transition(CircuitState::Open);
                inner.opened_at = Some(Instant::now());
                inner.half_open_in_flight = 0;
                inner.half_open_successes = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// The current state, applying the open-to-half-open timer.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        let inner = self.inner.lock();
        if inner.state == CircuitState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= self.config.recovery_timeout() {
                    return CircuitState::HalfOpen;
                }
            }
        }
        inner.state
    }

    /// A serializable snapshot of breaker state.
    #[must_use]
    pub fn state_view(&self) -> CircuitBreakerState {
        let inner = self.inner.lock();
        let failure_count = inner.failure_count();
        let claimed = inner.half_open_in_flight + inner.half_open_successes;
        CircuitBreakerState {
            operation_name: self.name.clone(),
            state: inner.state,
            failure_count,
            success_count: inner.window.len() - failure_count,
            last_transition_at: inner.last_transition_at,
            half_open_probes_remaining: self
                .config
                .half_open_retry_limit
                .saturating_sub(claimed),
        }
    }
}

/// Registry of circuit breakers keyed by operation name.
///
/// Shared, process-wide; a breaker is created on first use with the default
/// config unless one was registered explicitly.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    default_config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    /// Creates a registry with a default breaker config.
    #[must_use]
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config,
        }
    }

    /// Registers a breaker with an operation-specific config.
    pub fn register(&self, operation: impl Into<String>, config: CircuitBreakerConfig) {
        let operation = operation.into();
        self.breakers.insert(
            operation.clone(),
            Arc::new(CircuitBreaker::new(operation, config)),
        );
    }

    /// Returns the breaker for an operation, creating it if needed.
    #[must_use]
    pub fn breaker(&self, operation: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(operation.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    operation.to_string(),
                    self.default_config.clone(),
                ))
            })
            .clone()
    }

    /// Wraps a single call attempt with breaker state enforcement.
    ///
    /// An open breaker fails fast with `CircuitOpen`. The outcome of an
    /// executed call is recorded; a `CircuitOpen` error bubbling out of the
    /// call itself is not counted as a new failure.
    pub async fn wrap<T, F, Fut>(&self, operation: &str, call: F) -> Result<T, PipelineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let breaker = self.breaker(operation);
        breaker.begin_call()?;

        match call().await {
            Ok(value) => {
                breaker.record_success();
                Ok(value)
            }
            Err(err) => {
                if !matches!(err, PipelineError::CircuitOpen { .. }) {
                    breaker.record_failure();
                }
                Err(err)
            }
        }
    }

    /// State snapshots for all known breakers.
    #[must_use]
    pub fn state_views(&self) -> Vec<CircuitBreakerState> {
        self.breakers
            .iter()
            .map(|entry| entry.value().state_view())
            .collect()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
