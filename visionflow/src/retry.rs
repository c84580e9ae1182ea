//! Retry execution with exponential backoff.
//!
//! All remote operations go through [`RetryExecutor::run`]. Each attempt is
//! wrapped by the circuit breaker registry first, so an open breaker
//! short-circuits the remaining budget immediately instead of sleeping
//! through it. Backoff is `min(base * multiplier^(attempt-1), cap)` plus
//! jitter.

use crate::breaker::CircuitBreakerRegistry;
use crate::cancellation::CancellationToken;
use crate::errors::PipelineError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Immutable retry configuration for one operation class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts, including the initial one.
    pub max_attempts: u32,
    /// Base delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Cap on any single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Exponential multiplier applied per attempt.
    pub multiplier: f64,
    /// Whether to add jitter to delays.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// The backoff delay after a failed attempt (1-based), before jitter.
    #[must_use]
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        #[allow(clippy::cast_precision_loss)]
        let raw = self.base_delay_ms as f64 * self.multiplier.powi(attempt as i32 - 1);
        #[allow(clippy::cast_precision_loss)]
        let capped = raw.min(self.max_delay_ms as f64);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Duration::from_millis(capped as u64)
    }

    /// The backoff delay after a failed attempt, with jitter applied.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_for_attempt(attempt);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
        // Up to 25% additive jitter to avoid thundering herds.
        let spread = (base_ms / 4).max(1);
        let extra = rand::thread_rng().gen_range(0..=spread);
        Duration::from_millis(base_ms.saturating_add(extra))
    }
}

/// Executes operations with retry, backoff, and breaker enforcement.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    breakers: Arc<CircuitBreakerRegistry>,
}

impl RetryExecutor {
    /// Creates an executor sharing a breaker registry.
    #[must_use]
    pub fn new(breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self { breakers }
    }

    /// The shared breaker registry.
    #[must_use]
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Runs an operation with retries.
    ///
    /// Retry eligibility is decided by [`PipelineError::is_retryable`]:
    /// validation errors and open breakers are surfaced immediately. The
    /// cancellation token, when supplied, is checked before every backoff
    /// sleep. The last error is returned once the budget is exhausted.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        policy: &RetryPolicy,
        cancel: Option<&CancellationToken>,
        mut call: F,
    ) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let max_attempts = policy.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            match self.breakers.wrap(operation, &mut call).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    // An open breaker short-circuits the whole budget; there
                    // is no point sleeping through attempts it will reject.
                    if matches!(err, PipelineError::CircuitOpen { .. }) {
                        return Err(err);
                    }
                    if !err.is_retryable() || attempt == max_attempts {
                        return Err(err);
                    }

                    if let Some(token) = cancel {
                        token.ensure_active()?;
                    }

                    let delay = policy.delay_for_attempt(attempt);
                    debug!(
                        operation = %operation,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "Retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        // max_attempts >= 1, so the loop always returns.
        Err(PipelineError::Internal(format!(
            "retry loop exited without outcome for '{operation}'"
        )))
    }
}
