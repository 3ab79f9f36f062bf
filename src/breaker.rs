//! Circuit Breaker
//!
//! Guards calls to the portal so that a dead or flapping upstream is not
//! hammered by every connect-script invocation.
//!
//! # States
//! - Closed: calls pass; consecutive failures accumulate
//! - Open: calls are rejected immediately without invoking the guarded call
//! - Half-Open: a limited number of probe calls are admitted
//!
//! # Transitions
//! ```text
//! Closed    → Open:      consecutive_failures >= failure_threshold
//! Open      → Half-Open: timeout elapsed (evaluated on next access)
//! Half-Open → Closed:    max_requests consecutive successes
//! Half-Open → Open:      any failure
//! ```
//!
//! # Generations
//! Every state transition and every counter reset bumps the generation.
//! An admitted call carries the generation it was admitted under, and its
//! outcome is only applied while that generation is still current. A slow
//! half-open probe that completes after another failure already reopened
//! the breaker is therefore ignored.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Breaker configuration
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures in Closed before opening
    pub failure_threshold: u32,
    /// Time spent Open before admitting probes
    pub timeout: Duration,
    /// Probes admitted in Half-Open, and successes needed to close
    pub max_requests: u32,
    /// Closed-state counter reset period; zero disables the reset
    pub interval: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(30),
            max_requests: 1,
            interval: Duration::from_secs(60),
        }
    }
}

/// Request counters for the current generation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests = self.requests.saturating_add(1);
    }

    fn on_success(&mut self) {
        self.total_successes = self.total_successes.saturating_add(1);
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures = self.total_failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
    }
}

/// Error returned by [`CircuitBreaker::execute`]
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error("circuit breaker is open")]
    Open,

    #[error(transparent)]
    Inner(E),
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    generation: u64,
    counts: Counts,
    /// Open: when to move to Half-Open. Closed: when to reset counts.
    expiry: Option<Instant>,
}

struct Shared {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerState>,
}

/// Three-state circuit breaker. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CircuitBreaker {
    shared: Arc<Shared>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.shared.name)
            .field("state", &inner.state)
            .field("generation", &inner.generation)
            .field("counts", &inner.counts)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, mut config: BreakerConfig) -> Self {
        if config.failure_threshold == 0 {
            config.failure_threshold = 1;
        }
        if config.max_requests == 0 {
            config.max_requests = 1;
        }

        let now = Instant::now();
        let expiry = closed_expiry(&config, now);
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                config,
                inner: Mutex::new(BreakerState {
                    state: CircuitState::Closed,
                    generation: 0,
                    counts: Counts::default(),
                    expiry,
                }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.shared.config
    }

    /// Run `f` under the breaker.
    ///
    /// Rejected calls return `BreakerError::Open` without invoking `f`.
    /// If the returned future panics or is dropped before completing, the
    /// call is recorded as a failure.
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admission = self.admit().ok_or(BreakerError::Open)?;
        match f().await {
            Ok(value) => {
                admission.success();
                Ok(value)
            }
            Err(e) => {
                admission.failure();
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Reserve a generation-stamped admission slot, or `None` if rejected
    pub fn admit(&self) -> Option<Admission> {
        let now = Instant::now();
        let mut inner = self.shared.inner.lock();
        self.refresh(&mut inner, now);

        match inner.state {
            CircuitState::Open => return None,
            CircuitState::HalfOpen if inner.counts.requests >= self.shared.config.max_requests => {
                return None
            }
            _ => {}
        }

        inner.counts.on_request();
        Some(Admission {
            breaker: self.clone(),
            generation: inner.generation,
            settled: false,
        })
    }

    /// Current state (applies any pending time-based transition)
    pub fn state(&self) -> CircuitState {
        let mut inner = self.shared.inner.lock();
        self.refresh(&mut inner, Instant::now());
        inner.state
    }

    pub fn counts(&self) -> Counts {
        let mut inner = self.shared.inner.lock();
        self.refresh(&mut inner, Instant::now());
        inner.counts
    }

    pub fn generation(&self) -> u64 {
        let mut inner = self.shared.inner.lock();
        self.refresh(&mut inner, Instant::now());
        inner.generation
    }

    /// Force Closed with cleared counters. In-flight outcomes are discarded.
    pub fn reset(&self) {
        let now = Instant::now();
        let mut inner = self.shared.inner.lock();
        let prev = inner.state;
        inner.state = CircuitState::Closed;
        self.new_generation(&mut inner, now);

        tracing::info!(
            breaker = %self.shared.name,
            from = %prev,
            generation = inner.generation,
            "circuit breaker reset"
        );
    }

    /// Snapshot for diagnostics
    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.shared.inner.lock();
        self.refresh(&mut inner, Instant::now());
        BreakerSnapshot {
            state: inner.state,
            generation: inner.generation,
            counts: inner.counts,
        }
    }

    fn record(&self, generation: u64, success: bool) {
        let now = Instant::now();
        let mut inner = self.shared.inner.lock();
        self.refresh(&mut inner, now);

        if inner.generation != generation {
            tracing::debug!(
                breaker = %self.shared.name,
                admitted = generation,
                current = inner.generation,
                success,
                "discarding outcome from superseded generation"
            );
            return;
        }

        if success {
            self.on_success(&mut inner, now);
        } else {
            self.on_failure(&mut inner, now);
        }
    }

    fn release(&self, generation: u64) {
        let mut inner = self.shared.inner.lock();
        if inner.generation == generation {
            inner.counts.requests = inner.counts.requests.saturating_sub(1);
        }
        tracing::debug!(
            breaker = %self.shared.name,
            generation,
            "admitted call abandoned by caller, no outcome recorded"
        );
    }

    fn on_success(&self, inner: &mut BreakerState, now: Instant) {
        inner.counts.on_success();

        if inner.state == CircuitState::HalfOpen
            && inner.counts.consecutive_successes >= self.shared.config.max_requests
        {
            let successes = inner.counts.consecutive_successes;
            self.set_state(inner, CircuitState::Closed, now);
            tracing::info!(
                breaker = %self.shared.name,
                consecutive_successes = successes,
                "circuit breaker recovered"
            );
        }
    }

    fn on_failure(&self, inner: &mut BreakerState, now: Instant) {
        inner.counts.on_failure();

        match inner.state {
            CircuitState::Closed => {
                if inner.counts.consecutive_failures >= self.shared.config.failure_threshold {
                    let failures = inner.counts.consecutive_failures;
                    self.set_state(inner, CircuitState::Open, now);
                    tracing::warn!(
                        breaker = %self.shared.name,
                        consecutive_failures = failures,
                        timeout_ms = self.shared.config.timeout.as_millis() as u64,
                        "circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                self.set_state(inner, CircuitState::Open, now);
                tracing::warn!(
                    breaker = %self.shared.name,
                    reason = "failure_in_half_open",
                    "circuit breaker re-opened"
                );
            }
            CircuitState::Open => {}
        }
    }

    /// Apply lazy time-based transitions
    fn refresh(&self, inner: &mut BreakerState, now: Instant) {
        match inner.state {
            CircuitState::Closed => {
                if matches!(inner.expiry, Some(at) if at <= now) {
                    self.new_generation(inner, now);
                }
            }
            CircuitState::Open => {
                if matches!(inner.expiry, Some(at) if at <= now) {
                    self.set_state(inner, CircuitState::HalfOpen, now);
                }
            }
            CircuitState::HalfOpen => {}
        }
    }

    fn set_state(&self, inner: &mut BreakerState, state: CircuitState, now: Instant) {
        if inner.state == state {
            return;
        }
        let prev = inner.state;
        inner.state = state;
        self.new_generation(inner, now);

        tracing::info!(
            breaker = %self.shared.name,
            from = %prev,
            to = %state,
            generation = inner.generation,
            "circuit breaker state change"
        );
    }

    fn new_generation(&self, inner: &mut BreakerState, now: Instant) {
        inner.generation += 1;
        inner.counts = Counts::default();
        inner.expiry = match inner.state {
            CircuitState::Closed => closed_expiry(&self.shared.config, now),
            CircuitState::Open => Some(now + self.shared.config.timeout),
            CircuitState::HalfOpen => None,
        };
    }
}

fn closed_expiry(config: &BreakerConfig, now: Instant) -> Option<Instant> {
    if config.interval.is_zero() {
        None
    } else {
        Some(now + config.interval)
    }
}

/// An admitted call, stamped with the generation it was admitted under.
///
/// Must be settled with [`Admission::success`] or [`Admission::failure`].
/// Dropping it unsettled (panic, cancellation) records a failure.
#[must_use = "an unsettled admission is recorded as a failure when dropped"]
pub struct Admission {
    breaker: CircuitBreaker,
    generation: u64,
    settled: bool,
}

impl Admission {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record(self.generation, true);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record(self.generation, false);
    }

    /// Give the slot back without an outcome, for calls abandoned by the
    /// caller rather than failed by the upstream
    pub fn cancel(mut self) {
        self.settled = true;
        self.breaker.release(self.generation);
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        if !self.settled {
            tracing::debug!(
                breaker = %self.breaker.shared.name,
                generation = self.generation,
                "admitted call ended abnormally, recording failure"
            );
            self.breaker.record(self.generation, false);
        }
    }
}

/// Breaker diagnostics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub generation: u64,
    pub counts: Counts,
}
