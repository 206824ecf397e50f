pub mod circuit_breaker;
pub mod pipeline;
pub mod retry;

pub use circuit_breaker::{Admission, CircuitBreaker, CircuitBreakerStats, CircuitState};
pub use pipeline::{PipelineConfig, ResiliencePipeline};
pub use retry::{RetryAttempt, RetryPolicy, RetryReason, DEFAULT_RETRYABLE_STATUSES};
