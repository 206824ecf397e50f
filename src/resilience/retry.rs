use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};

pub type RetryPredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// HTTP statuses treated as transient unless a policy says otherwise.
pub const DEFAULT_RETRYABLE_STATUSES: [u16; 4] = [500, 502, 503, 504];

/// Exponential backoff retry stage: `base * 2^(attempt - 1)`, capped at `max_delay`.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
    retry_on: RetryPredicate,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: Duration::from_secs(60),
            jitter: false,
            retry_on: status_predicate(DEFAULT_RETRYABLE_STATUSES.to_vec()),
        }
    }

    /// Transport errors and timeouts stay retryable; `statuses` replaces the retryable HTTP set.
    pub fn with_retryable_statuses(mut self, statuses: Vec<u16>) -> Self {
        self.retry_on = status_predicate(statuses);
        self
    }

    pub fn with_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        self.retry_on = Arc::new(predicate);
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn is_retryable(&self, error: &Error) -> bool {
        (self.retry_on)(error)
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let base_ms = self.base_delay.as_millis() as f64;
        let mut delay_ms = (base_ms * 2f64.powi(exponent as i32)).min(self.max_delay.as_millis() as f64);

        if self.jitter {
            let mut rng = rand::thread_rng();
            delay_ms *= rng.gen_range(0.5..1.5);
        }

        Duration::from_millis(delay_ms as u64)
    }

    /// Cancellation wins over both an in-flight attempt and a pending backoff sleep.
    pub async fn run<F, Fut, T>(&self, target: &str, cancel: &CancellationToken, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;

        loop {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                outcome = operation() => outcome,
            };

            let error = match outcome {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(target_name = target, retries = attempt, "Call succeeded after retrying");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if error.is_cancelled() || attempt >= self.max_retries || !self.is_retryable(&error) {
                return Err(error);
            }

            attempt += 1;
            let retry = RetryAttempt {
                attempt,
                delay: self.backoff_delay(attempt),
                reason: RetryReason::from(&error),
            };

            warn!(
                target_name = target,
                attempt = retry.attempt,
                delay_ms = retry.delay.as_millis() as u64,
                reason = %retry.reason,
                "Retrying call after failure"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(retry.delay) => {}
            }
        }
    }
}

fn status_predicate(statuses: Vec<u16>) -> RetryPredicate {
    Arc::new(move |error: &Error| {
        error.is_transient() || error.status().map_or(false, |status| statuses.contains(&status))
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryAttempt {
    pub attempt: u32,
    pub delay: Duration,
    pub reason: RetryReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryReason {
    Status(u16),
    Transport,
    Timeout,
    Other,
}

impl From<&Error> for RetryReason {
    fn from(error: &Error) -> Self {
        match error {
            Error::Protocol { status, .. } => RetryReason::Status(*status),
            Error::Transport(_) => RetryReason::Transport,
            Error::Timeout(_) => RetryReason::Timeout,
            _ => RetryReason::Other,
        }
    }
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryReason::Status(status) => write!(f, "http {}", status),
            RetryReason::Transport => write!(f, "transport"),
            RetryReason::Timeout => write!(f, "timeout"),
            RetryReason::Other => write!(f, "other"),
        }
    }
}
