//! Retry executor with exponential backoff, jitter, and a circuit breaker.
//!
//! Generalized from the LLM-provider retry logic: any async operation that
//! returns [`PipelineError`] can be wrapped in [`RetryExecutor::execute`].
//! Used by the LLM client (C6) and the vector-store client (C7).

use crate::error::PipelineError;
use crate::logging::{log_debug, log_error, log_warn};

use std::time::{Duration, Instant};
use tokio::time::sleep;

/// Exponential-backoff policy: 1s, 2s, 4s, 8s, 16s max, 5 attempts, 5m total.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub total_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            total_timeout: Duration::from_secs(300),
            request_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-collaborator circuit breaker: 5 failures opens for 30s.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    failure_threshold: u32,
    recovery_timeout: Duration,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_time: None,
            failure_threshold: 10,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitBreaker {
    pub fn should_allow_request(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => self.check_recovery_timeout(),
            CircuitState::HalfOpen => true,
        }
    }

    fn check_recovery_timeout(&mut self) -> bool {
        let Some(last_failure) = self.last_failure_time else {
            return false;
        };

        if last_failure.elapsed() >= self.recovery_timeout {
            log_debug!(
                recovery_timeout_seconds = self.recovery_timeout.as_secs(),
                "circuit breaker attempting recovery"
            );
            self.state = CircuitState::HalfOpen;
            true
        } else {
            false
        }
    }

    pub fn record_success(&mut self) {
        match self.state {
            CircuitState::HalfOpen => {
                log_debug!("circuit breaker recovered, returning to closed");
                self.state = CircuitState::Closed;
                self.failure_count = 0;
                self.last_failure_time = None;
            }
            CircuitState::Closed => self.failure_count = 0,
            CircuitState::Open => {
                self.failure_count = 0;
                self.last_failure_time = None;
            }
        }
    }

    pub fn record_failure(&mut self) {
        self.failure_count += 1;
        self.last_failure_time = Some(Instant::now());

        if self.failure_count >= self.failure_threshold {
            if self.state != CircuitState::Open {
                log_warn!(
                    failure_count = self.failure_count,
                    failure_threshold = self.failure_threshold,
                    "circuit breaker opened due to repeated failures"
                );
            }
            self.state = CircuitState::Open;
        }
    }

    pub(crate) fn state(&self) -> CircuitState {
        self.state.clone()
    }
}

/// Executes an async operation under a [`RetryPolicy`] and [`CircuitBreaker`].
///
/// Owns its circuit breaker, so callers hold one executor per external
/// collaborator (one for the LLM client, one for the vector-store client)
/// rather than sharing process-global state.
#[derive(Debug)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    circuit_breaker: CircuitBreaker,
    name: String,
}

impl RetryExecutor {
    pub fn new(name: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            policy,
            circuit_breaker: CircuitBreaker::default(),
            name: name.into(),
        }
    }

    pub async fn execute<F, Fut, T>(&mut self, operation: F) -> Result<T, PipelineError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, PipelineError>>,
    {
        let start_time = Instant::now();
        let mut attempt = 0;
        let mut last_error = None;

        while attempt < self.policy.max_attempts {
            if !self.circuit_breaker.should_allow_request() {
                return Err(PipelineError::circuit_open(self.name.clone()));
            }
            if start_time.elapsed() >= self.policy.total_timeout {
                return Err(PipelineError::cancelled(format!(
                    "{} exceeded total timeout of {}s",
                    self.name,
                    self.policy.total_timeout.as_secs()
                )));
            }

            attempt += 1;

            match self
                .execute_single_attempt(&operation, attempt, &mut last_error)
                .await
            {
                Ok(response) => return Ok(response),
                Err(should_continue) => {
                    if !should_continue {
                        break;
                    }
                }
            }
        }

        self.handle_exhausted_retries(attempt, last_error, &start_time)
    }

    async fn execute_single_attempt<F, Fut, T>(
        &mut self,
        operation: &F,
        attempt: u32,
        last_error: &mut Option<PipelineError>,
    ) -> Result<T, bool>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, PipelineError>>,
    {
        log_debug!(
            attempt = attempt,
            max_attempts = self.policy.max_attempts,
            circuit_state = ?self.circuit_breaker.state(),
            collaborator = %self.name,
            "executing request with retry logic"
        );

        let operation_start = Instant::now();
        let result = tokio::time::timeout(self.policy.request_timeout, operation()).await;

        match result {
            Ok(Ok(response)) => {
                self.circuit_breaker.record_success();
                log_debug!(
                    attempt = attempt,
                    duration_ms = operation_start.elapsed().as_millis(),
                    "request succeeded"
                );
                Ok(response)
            }
            Ok(Err(error)) => Err(self.handle_error(error, attempt, last_error).await),
            Err(_timeout) => Err(self.handle_timeout(attempt, last_error).await),
        }
    }

    async fn handle_error(
        &mut self,
        error: PipelineError,
        attempt: u32,
        last_error: &mut Option<PipelineError>,
    ) -> bool {
        let should_retry = error.is_retryable();
        *last_error = Some(error);

        self.circuit_breaker.record_failure();
        if should_retry && attempt < self.policy.max_attempts {
            let delay = self.calculate_delay(attempt);
            log_debug!(
                attempt = attempt,
                delay_ms = delay.as_millis(),
                "request failed, retrying after delay"
            );
            sleep(delay).await;
            true
        } else {
            false
        }
    }

    async fn handle_timeout(
        &mut self,
        attempt: u32,
        last_error: &mut Option<PipelineError>,
    ) -> bool {
        let timeout_error = PipelineError::transient(
            self.name.clone(),
            format!("request timed out after {}s", self.policy.request_timeout.as_secs()),
            None,
        );
        *last_error = Some(timeout_error);
        self.circuit_breaker.record_failure();

        if attempt < self.policy.max_attempts {
            let delay = self.calculate_delay(attempt);
            log_debug!(attempt = attempt, delay_ms = delay.as_millis(), "request timed out, retrying");
            sleep(delay).await;
            true
        } else {
            false
        }
    }

    fn handle_exhausted_retries<T>(
        &mut self,
        attempt: u32,
        last_error: Option<PipelineError>,
        start_time: &Instant,
    ) -> Result<T, PipelineError> {
        let final_error = last_error
            .unwrap_or_else(|| PipelineError::transient(self.name.clone(), "max retries exceeded", None));

        log_error!(
            attempts = attempt,
            total_duration_ms = start_time.elapsed().as_millis(),
            collaborator = %self.name,
            "request failed after all retry attempts"
        );

        Err(final_error)
    }

    /// Exponential backoff with up to 10% jitter, capped at `max_delay`.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let delay_seconds = self.policy.initial_delay.as_secs_f64()
            * self.policy.backoff_multiplier.powi((attempt - 1) as i32);
        let delay = Duration::from_secs_f64(delay_seconds.min(self.policy.max_delay.as_secs_f64()));
        let jitter = fastrand::f64() * 0.1;
        Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_grows_exponentially_and_caps_at_max() {
        let executor = RetryExecutor::new("test", RetryPolicy::default());
        let d1 = executor.calculate_delay(1).as_secs_f64();
        let d4 = executor.calculate_delay(4).as_secs_f64();
        assert!(d1 >= 2.0 && d1 < 2.2);
        assert!(d4 >= 16.0 && d4 < 17.7);
        let d10 = executor.calculate_delay(10).as_secs_f64();
        assert!(d10 <= 60.0 * 1.1);
    }

    #[tokio::test]
    async fn succeeds_without_retry_on_first_success() {
        let mut executor = RetryExecutor::new("test", RetryPolicy::default());
        let calls = AtomicU32::new(0);
        let result = executor
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, PipelineError>(42)
            })
            .await
            .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn does_not_retry_permanent_errors() {
        let mut executor = RetryExecutor::new("test", RetryPolicy::default());
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = executor
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(PipelineError::permanent("test", "bad request"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn circuit_opens_after_threshold_failures() {
        let policy = RetryPolicy {
            max_attempts: 1,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            ..RetryPolicy::default()
        };
        let mut executor = RetryExecutor::new("test", policy);
        for _ in 0..10 {
            let _ = executor
                .execute(|| async { Err::<(), _>(PipelineError::transient("test", "503", None)) })
                .await;
        }
        assert_eq!(executor.circuit_breaker.state(), CircuitState::Open);
        let result: Result<(), _> = executor.execute(|| async { Ok(()) }).await;
        assert!(matches!(result, Err(PipelineError::CircuitOpen { .. })));
    }
}
