//! Generic circuit breaker.
//!
//! A closed/open/half-open state machine that short-circuits calls when a
//! downstream dependency degrades:
//!
//! ```text
//!            N consecutive failures
//!   Closed ──────────────────────────▶ Open(since)
//!     ▲                                   │ reset_timeout elapsed,
//!     │ half_open_requests                │ next call attempt
//!     │ consecutive successes             ▼
//!     └────────────────────────────  HalfOpen(successes)
//!                 ▲                        │ any failure
//!                 └────────────────────────┘ (back to Open)
//! ```
//!
//! Any success resets the consecutive-failure counter. The [`call`] helper
//! evaluates state, releases the lock, runs the wrapped future, then
//! re-acquires the lock to record the outcome — the lock is never held across
//! I/O. Blocked calls fail with [`Error::CircuitOpen`].
//!
//! Time enters only at the probe boundary: the `*_at` methods accept an
//! explicit [`Instant`] so transition tests are deterministic; the plain
//! methods use `Instant::now()`.
//!
//! [`call`]: CircuitBreaker::call

use std::future::Future;
use std::sync::RwLock;
use std::time::Instant;

use crate::taskweave::config::BreakerConfig;
use crate::taskweave::error::{Error, Result};

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls flow through; consecutive failures are counted.
    Closed,
    /// Calls are blocked until the reset timeout elapses.
    Open,
    /// A limited probe phase after the reset timeout.
    HalfOpen,
}

#[derive(Debug)]
enum State {
    Closed,
    Open { since: Instant },
    HalfOpen { successes: u32 },
}

#[derive(Debug)]
struct Inner {
    state: State,
    consecutive_failures: u32,
}

/// A single circuit breaker instance, typically one per user.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: RwLock<Inner>,
}

impl CircuitBreaker {
    /// Create a closed breaker with the given thresholds.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(Inner {
                state: State::Closed,
                consecutive_failures: 0,
            }),
        }
    }

    /// Current state, for read-only probes. Does not perform the
    /// open → half-open transition; that happens on a call attempt.
    pub fn state(&self) -> BreakerState {
        let inner = self.inner.read().expect("breaker lock poisoned");
        match inner.state {
            State::Closed => BreakerState::Closed,
            State::Open { .. } => BreakerState::Open,
            State::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    /// Whether a call at `now` would be blocked.
    pub fn is_open_at(&self, now: Instant) -> bool {
        let inner = self.inner.read().expect("breaker lock poisoned");
        match inner.state {
            State::Open { since } => now.duration_since(since) <= self.config.reset_timeout,
            _ => false,
        }
    }

    /// Whether a call right now would be blocked.
    pub fn is_open(&self) -> bool {
        self.is_open_at(Instant::now())
    }

    /// Admission check for a call attempt at `now`.
    ///
    /// Returns `Ok(())` when the caller may proceed (performing the
    /// open → half-open transition when the reset timeout has elapsed) and
    /// `Err(Error::CircuitOpen)` when blocked.
    pub fn try_acquire_at(&self, scope: &str, now: Instant) -> Result<()> {
        let mut inner = self.inner.write().expect("breaker lock poisoned");
        match inner.state {
            State::Closed | State::HalfOpen { .. } => Ok(()),
            State::Open { since } => {
                if now.duration_since(since) > self.config.reset_timeout {
                    inner.state = State::HalfOpen { successes: 0 };
                    Ok(())
                } else {
                    Err(Error::circuit_open(scope))
                }
            }
        }
    }

    /// Admission check at the current instant.
    pub fn try_acquire(&self, scope: &str) -> Result<()> {
        self.try_acquire_at(scope, Instant::now())
    }

    /// Record a successful outcome.
    pub fn record_success(&self) {
        let mut inner = self.inner.write().expect("breaker lock poisoned");
        inner.consecutive_failures = 0;
        match inner.state {
            State::HalfOpen { successes } => {
                let successes = successes + 1;
                if successes >= self.config.half_open_requests {
                    inner.state = State::Closed;
                } else {
                    inner.state = State::HalfOpen { successes };
                }
            }
            State::Closed => {}
            // A success while open can only come from a call admitted before
            // the trip; it does not close the circuit.
            State::Open { .. } => {}
        }
    }

    /// Record a failed outcome at `now`.
    pub fn record_failure_at(&self, now: Instant) {
        let mut inner = self.inner.write().expect("breaker lock poisoned");
        inner.consecutive_failures += 1;
        match inner.state {
            State::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = State::Open { since: now };
                }
            }
            State::HalfOpen { .. } => {
                inner.state = State::Open { since: now };
            }
            State::Open { .. } => {}
        }
    }

    /// Record a failed outcome at the current instant.
    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now())
    }

    /// Run `operation` under the breaker.
    ///
    /// Evaluates admission, releases the lock, awaits the operation, then
    /// records the outcome. Fails fast with [`Error::CircuitOpen`] when the
    /// breaker blocks the call.
    pub async fn call<F, Fut, T>(&self, scope: &str, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.try_acquire(scope)?;
        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }
}
