use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

const CLOSED: u64 = 0;
const OPEN: u64 = 1;
const HALF_OPEN: u64 = 2;
const STATE_BITS: u64 = 2;
const STATE_MASK: u64 = (1 << STATE_BITS) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// How a call was let through. Trial calls decide the fate of a half-open breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Normal,
    Trial,
}

/// State and the instant it opened share one word so every transition is a single CAS.
#[derive(Debug)]
struct BreakerCore {
    word: AtomicU64,
    failure_count: AtomicU32,
    epoch: Instant,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    core: Arc<BreakerCore>,
    failure_threshold: u32,
    open_duration: Duration,
    name: String,
}

fn pack(state: u64, opened_at_ms: u64) -> u64 {
    (opened_at_ms << STATE_BITS) | state
}

fn unpack(word: u64) -> (u64, u64) {
    (word & STATE_MASK, word >> STATE_BITS)
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, open_duration: Duration) -> Self {
        let name = name.into();
        debug!(
            "Creating circuit breaker '{}' with threshold {} and open duration {:?}",
            name, failure_threshold, open_duration
        );

        Self {
            core: Arc::new(BreakerCore {
                word: AtomicU64::new(pack(CLOSED, 0)),
                failure_count: AtomicU32::new(0),
                epoch: Instant::now(),
            }),
            failure_threshold: failure_threshold.max(1),
            open_duration,
            name,
        }
    }

    fn now_ms(&self) -> u64 {
        self.core.epoch.elapsed().as_millis() as u64
    }

    /// Once the open duration has elapsed exactly one caller wins the Open→HalfOpen
    /// transition and runs as the trial.
    pub fn try_acquire(&self) -> Result<Admission> {
        loop {
            let word = self.core.word.load(Ordering::Acquire);
            let (state, opened_at) = unpack(word);

            match state {
                CLOSED => return Ok(Admission::Normal),
                OPEN => {
                    let elapsed = self.now_ms().saturating_sub(opened_at);
                    if elapsed < self.open_duration.as_millis() as u64 {
                        debug!("Circuit breaker '{}' is open, rejecting call", self.name);
                        return Err(Error::circuit_open(&self.name));
                    }

                    if self
                        .core
                        .word
                        .compare_exchange(word, pack(HALF_OPEN, opened_at), Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        info!("Circuit breaker '{}' half-open, admitting trial call", self.name);
                        return Ok(Admission::Trial);
                    }
                }
                _ => {
                    debug!("Circuit breaker '{}' trial in flight, rejecting call", self.name);
                    return Err(Error::circuit_open(&self.name));
                }
            }
        }
    }

    pub fn on_success(&self, admission: Admission) {
        let previous_count = self.core.failure_count.swap(0, Ordering::AcqRel);

        match admission {
            Admission::Trial => {
                self.core.word.store(pack(CLOSED, 0), Ordering::Release);
                info!("Circuit breaker '{}' recovered, transitioning to closed", self.name);
            }
            Admission::Normal => {
                if previous_count > 0 {
                    debug!("Circuit breaker '{}' reset failure count from {}", self.name, previous_count);
                }
            }
        }
    }

    pub fn on_failure(&self, admission: Admission) {
        match admission {
            Admission::Trial => {
                self.core.word.store(pack(OPEN, self.now_ms()), Ordering::Release);
                warn!("Circuit breaker '{}' re-opened after failed trial call", self.name);
            }
            Admission::Normal => {
                let failure_count = self.core.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
                debug!(
                    "Circuit breaker '{}' failure count: {}/{}",
                    self.name, failure_count, self.failure_threshold
                );

                if failure_count >= self.failure_threshold {
                    let closed = pack(CLOSED, 0);
                    if self
                        .core
                        .word
                        .compare_exchange(closed, pack(OPEN, self.now_ms()), Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        warn!(
                            "Circuit breaker '{}' opened for {:?} after {} consecutive failures",
                            self.name, self.open_duration, failure_count
                        );
                    }
                }
            }
        }
    }

    /// Call ended without a verdict. A trial hands its slot back.
    pub fn on_abandon(&self, admission: Admission) {
        if admission != Admission::Trial {
            return;
        }

        let word = self.core.word.load(Ordering::Acquire);
        let (state, opened_at) = unpack(word);
        if state == HALF_OPEN {
            let _ = self.core.word.compare_exchange(
                word,
                pack(OPEN, opened_at),
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            debug!("Circuit breaker '{}' trial abandoned, back to open", self.name);
        }
    }

    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let admission = self.try_acquire()?;

        match operation().await {
            Ok(value) => {
                self.on_success(admission);
                Ok(value)
            }
            Err(error) if error.is_cancelled() => {
                self.on_abandon(admission);
                Err(error)
            }
            Err(error) => {
                self.on_failure(admission);
                Err(error)
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get_state(&self) -> CircuitState {
        match unpack(self.core.word.load(Ordering::Acquire)).0 {
            CLOSED => CircuitState::Closed,
            OPEN => CircuitState::Open,
            _ => CircuitState::HalfOpen,
        }
    }

    pub fn get_failure_count(&self) -> u32 {
        self.core.failure_count.load(Ordering::Acquire)
    }

    pub fn is_open(&self) -> bool {
        self.get_state() == CircuitState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.get_state() == CircuitState::Closed
    }

    pub fn is_half_open(&self) -> bool {
        self.get_state() == CircuitState::HalfOpen
    }

    pub fn get_stats(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            name: self.name.clone(),
            state: self.get_state(),
            failure_count: self.get_failure_count(),
            failure_threshold: self.failure_threshold,
            open_duration: self.open_duration,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub open_duration: Duration,
}
