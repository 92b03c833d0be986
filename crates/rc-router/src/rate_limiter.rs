//! Token-bucket rate limiter, one instance per pool.
//!
//! `try_acquire` never blocks. `reconfigure` atomically swaps the underlying
//! limiter so an update never stalls a worker mid-acquire. Zero or absent
//! rate means no limiting at all.

use std::num::NonZeroU32;
use std::sync::Arc;

use governor::{clock::DefaultClock, state::{InMemoryState, NotKeyed}, Quota, RateLimiter as GovernorLimiter};
use parking_lot::RwLock;

type Governed = GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>;

pub struct RateLimiter {
    inner: RwLock<Option<Arc<Governed>>>,
    rate_per_minute: RwLock<Option<u32>>,
}

impl RateLimiter {
    pub fn new(rate_per_minute: Option<u32>) -> Self {
        Self {
            inner: RwLock::new(build(rate_per_minute)),
            rate_per_minute: RwLock::new(rate_per_minute),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None)
    }

    /// Non-blocking: `true` if a token was available and consumed.
    pub fn try_acquire(&self) -> bool {
        match self.inner.read().as_ref() {
            None => true,
            Some(limiter) => limiter.check().is_ok(),
        }
    }

    pub fn reconfigure(&self, new_rate_per_minute: Option<u32>) {
        let current = *self.rate_per_minute.read();
        if current == new_rate_per_minute {
            return;
        }
        *self.inner.write() = build(new_rate_per_minute);
        *self.rate_per_minute.write() = new_rate_per_minute;
    }

    pub fn rate_per_minute(&self) -> Option<u32> {
        *self.rate_per_minute.read()
    }

    pub fn is_limited(&self) -> bool {
        !self.try_acquire_would_succeed()
    }

    fn try_acquire_would_succeed(&self) -> bool {
        match self.inner.read().as_ref() {
            None => true,
            Some(limiter) => limiter.check().is_ok(),
        }
    }
}

fn build(rate_per_minute: Option<u32>) -> Option<Arc<Governed>> {
    rate_per_minute
        .filter(|&rpm| rpm > 0)
        .and_then(NonZeroU32::new)
        .map(|nz| Arc::new(GovernorLimiter::direct(Quota::per_minute(nz))))
}
