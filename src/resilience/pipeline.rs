use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerStats};
use super::retry::{RetryPolicy, DEFAULT_RETRYABLE_STATUSES};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub retry_count: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
    pub retryable_statuses: Vec<u16>,
    pub failure_threshold: u32,
    pub open_duration: Duration,
    /// Upper bound for a single attempt. `None` leaves timing to the transport.
    pub attempt_timeout: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::workflow_default()
    }
}

impl PipelineConfig {
    /// 4 retries, 1s base backoff, opens after 5 failures, 30s cool-down.
    pub fn workflow_default() -> Self {
        Self {
            retry_count: 4,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: false,
            retryable_statuses: DEFAULT_RETRYABLE_STATUSES.to_vec(),
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
            attempt_timeout: None,
        }
    }

    /// Like the workflow policy with one retry fewer, and rate limiting (429) counts as transient.
    pub fn provider_default() -> Self {
        let mut retryable_statuses = DEFAULT_RETRYABLE_STATUSES.to_vec();
        retryable_statuses.push(429);

        Self {
            retry_count: 3,
            retryable_statuses,
            ..Self::workflow_default()
        }
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }
}

/// Timeout per attempt, retry inside, circuit breaker outside. An exhausted retry
/// sequence is a single breaker failure.
#[derive(Debug, Clone)]
pub struct ResiliencePipeline {
    name: String,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
    attempt_timeout: Option<Duration>,
}

impl ResiliencePipeline {
    pub fn new(name: impl Into<String>, config: &PipelineConfig) -> Self {
        let name = name.into();
        let retry = RetryPolicy::new(config.retry_count, config.base_delay)
            .with_max_delay(config.max_delay)
            .with_jitter(config.jitter)
            .with_retryable_statuses(config.retryable_statuses.clone());
        let breaker = CircuitBreaker::new(name.clone(), config.failure_threshold, config.open_duration);

        Self {
            name,
            retry,
            breaker,
            attempt_timeout: config.attempt_timeout,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        self.breaker.get_stats()
    }

    pub async fn execute<F, Fut, T>(&self, cancel: &CancellationToken, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let admission = self.breaker.try_acquire()?;
        let attempt_timeout = self.attempt_timeout;
        let name = self.name.as_str();

        let outcome = self
            .retry
            .run(name, cancel, || {
                let attempt = operation();
                async move {
                    match attempt_timeout {
                        Some(limit) => match tokio::time::timeout(limit, attempt).await {
                            Ok(result) => result,
                            Err(_) => Err(Error::timeout(format!("{} did not respond within {:?}", name, limit))),
                        },
                        None => attempt.await,
                    }
                }
            })
            .await;

        match &outcome {
            Ok(_) => self.breaker.on_success(admission),
            Err(error) if error.is_cancelled() => {
                debug!("Call through '{}' cancelled", self.name);
                self.breaker.on_abandon(admission);
            }
            Err(_) => self.breaker.on_failure(admission),
        }

        outcome
    }
}
