//! Per-pool sliding-window circuit breaker.
//!
//! Each pool owns one breaker. State transitions on a fixed-size ring of
//! recent call outcomes rather than a consecutive-failure count, so a single
//! flaky call cannot trip the breaker and a single recovery cannot close it.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{info, warn};

const WINDOW_SIZE: usize = 10;
const MIN_CALLS: usize = 5;
const FAILURE_RATE_THRESHOLD: f64 = 0.5;
const OPEN_DURATION: Duration = Duration::from_secs(30);
const HALF_OPEN_PROBES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: BreakerState,
    recent_results: VecDeque<bool>,
    opened_at: Option<Instant>,
    half_open_probes_remaining: usize,
    half_open_successes: usize,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            recent_results: VecDeque::with_capacity(WINDOW_SIZE),
            opened_at: None,
            half_open_probes_remaining: 0,
            half_open_successes: 0,
        }
    }

    fn record(&mut self, success: bool) {
        self.recent_results.push_back(success);
        if self.recent_results.len() > WINDOW_SIZE {
            self.recent_results.pop_front();
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.recent_results.is_empty() {
            return 0.0;
        }
        let failures = self.recent_results.iter().filter(|r| !**r).count();
        failures as f64 / self.recent_results.len() as f64
    }
}

/// Thrown back to callers who attempt a call while the breaker is open.
#[derive(Debug)]
pub struct CallNotPermitted;

pub struct CircuitBreaker {
    pool_code: String,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(pool_code: impl Into<String>) -> Self {
        Self { pool_code: pool_code.into(), inner: Mutex::new(Inner::new()) }
    }

    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock();
        self.maybe_transition_to_half_open(&mut inner);
        inner.state
    }

    /// Call before attempting the mediated call. `Err` means the breaker is
    /// open and the call must not be attempted (caller nacks for retry).
    pub fn try_call(&self) -> Result<(), CallNotPermitted> {
        let mut inner = self.inner.lock();
        self.maybe_transition_to_half_open(&mut inner);

        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => Err(CallNotPermitted),
            BreakerState::HalfOpen => {
                if inner.half_open_probes_remaining > 0 {
                    inner.half_open_probes_remaining -= 1;
                    Ok(())
                } else {
                    Err(CallNotPermitted)
                }
            }
        }
    }

    /// Record the outcome of a call previously permitted by `try_call`.
    pub fn record_outcome(&self, success: bool) {
        let mut inner = self.inner.lock();

        match inner.state {
            BreakerState::HalfOpen => {
                if success {
                    inner.half_open_successes += 1;
                    if inner.half_open_successes >= HALF_OPEN_PROBES {
                        self.close(&mut inner);
                    }
                } else {
                    self.open(&mut inner);
                }
            }
            BreakerState::Closed => {
                inner.record(success);
                if inner.recent_results.len() >= MIN_CALLS && inner.failure_rate() >= FAILURE_RATE_THRESHOLD {
                    self.open(&mut inner);
                }
            }
            BreakerState::Open => {
                // A late result from a call issued just before the breaker opened.
            }
        }
    }

    fn maybe_transition_to_half_open(&self, inner: &mut Inner) {
        if inner.state == BreakerState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= OPEN_DURATION {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_probes_remaining = HALF_OPEN_PROBES;
                    inner.half_open_successes = 0;
                    info!(pool = %self.pool_code, "circuit breaker half-open, admitting probes");
                }
            }
        }
    }

    fn open(&self, inner: &mut Inner) {
        warn!(pool = %self.pool_code, failure_rate = inner.failure_rate(), "circuit breaker opening");
        inner.state = BreakerState::Open;
        inner.opened_at = Some(Instant::now());
        inner.recent_results.clear();
        inner.half_open_probes_remaining = 0;
        inner.half_open_successes = 0;
    }

    fn close(&self, inner: &mut Inner) {
        info!(pool = %self.pool_code, "circuit breaker closing");
        inner.state = BreakerState::Closed;
        inner.opened_at = None;
        inner.recent_results.clear();
        inner.half_open_probes_remaining = 0;
        inner.half_open_successes = 0;
    }
}

/// One breaker per pool code, created lazily on first access.
#[derive(Default)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, std::sync::Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self { breakers: DashMap::new() }
    }

    pub fn get_or_create(&self, pool_code: &str) -> std::sync::Arc<CircuitBreaker> {
        self.breakers
            .entry(pool_code.to_string())
            .or_insert_with(|| std::sync::Arc::new(CircuitBreaker::new(pool_code)))
            .clone()
    }

    pub fn remove(&self, pool_code: &str) {
        self.breakers.remove(pool_code);
    }

    pub fn states(&self) -> Vec<(String, BreakerState)> {
        self.breakers.iter().map(|e| (e.key().clone(), e.value().state())).collect()
    }
}
