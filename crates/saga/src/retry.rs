//! Bounded retries with exponential backoff and per-call deadlines.
//!
//! ```text
//! attempt    delay before next (base=50ms, max=1s)
//! ────────────────────────────────────────────────
//!    1           50ms
//!    2          100ms
//!    3          200ms
//!   ...          capped at max
//! ```

use std::future::Future;
use std::time::Duration;

use crate::config::SagaConfig;
use crate::error::ServiceError;

/// Classification of a single step attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome<T> {
    /// The call succeeded.
    Success(T),

    /// The call failed in a way that may succeed when repeated.
    RetryableFailure(ServiceError),

    /// The call failed for good; retrying cannot help.
    TerminalFailure(ServiceError),
}

impl<T> From<Result<T, ServiceError>> for StepOutcome<T> {
    fn from(result: Result<T, ServiceError>) -> Self {
        match result {
            Ok(value) => StepOutcome::Success(value),
            Err(e) if e.is_retryable() => StepOutcome::RetryableFailure(e),
            Err(e) => StepOutcome::TerminalFailure(e),
        }
    }
}

/// Retry policy applied to every external call the saga makes.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    call_deadline: Duration,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        call_deadline: Duration,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            call_deadline,
        }
    }

    /// Builds the policy from saga configuration.
    pub fn from_config(config: &SagaConfig) -> Self {
        Self::new(
            config.max_attempts,
            config.base_delay,
            config.max_delay,
            config.call_deadline,
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Runs one attempt under the call deadline.
    pub async fn attempt<T, Fut>(&self, service: &'static str, call: Fut) -> StepOutcome<T>
    where
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        match tokio::time::timeout(self.call_deadline, call).await {
            Ok(result) => result.into(),
            Err(_) => StepOutcome::RetryableFailure(ServiceError::Timeout { service }),
        }
    }

    /// Runs `call` until it succeeds, fails terminally, or attempts run out.
    ///
    /// Returns the last error once retries are exhausted.
    pub async fn run<T, F, Fut>(
        &self,
        step: &'static str,
        service: &'static str,
        mut call: F,
    ) -> Result<T, ServiceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let mut attempt = 1;
        loop {
            match self.attempt(service, call()).await {
                StepOutcome::Success(value) => return Ok(value),
                StepOutcome::TerminalFailure(e) => return Err(e),
                StepOutcome::RetryableFailure(e) if attempt >= self.max_attempts => {
                    tracing::warn!(step, attempts = attempt, error = %e, "retries exhausted");
                    return Err(e);
                }
                StepOutcome::RetryableFailure(e) => {
                    let delay = self.delay_for(attempt);
                    metrics::counter!("saga_step_retries_total", "step" => step).increment(1);
                    tracing::debug!(step, attempt, ?delay, error = %e, "retrying step");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SagaConfig::default())
    }
}
