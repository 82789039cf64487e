//! Per-source request rate gating.
//!
//! Each source adapter owns one gate and acquires a slot before every call
//! into the fetch layer. Ceilings are source-specific configuration, not
//! pipeline-wide; retry pacing is the fetch layer's job and independent of
//! this gate.
//!
//! Uses the `governor` crate for token bucket rate limiting.

use std::num::NonZeroU32;
use std::sync::Arc;

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorRateLimiter,
};

type Limiter = GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Requests-per-second gate for one upstream source.
///
/// A ceiling of 0 disables the gate entirely.
pub struct SourceRateLimiter {
    limiter: Option<Arc<Limiter>>,
    requests_per_second: u32,
}

impl SourceRateLimiter {
    pub fn new(requests_per_second: u32) -> Self {
        let limiter = NonZeroU32::new(requests_per_second).map(|rate| {
            let quota = Quota::per_second(rate);
            Arc::new(GovernorRateLimiter::direct(quota))
        });

        Self {
            limiter,
            requests_per_second,
        }
    }

    /// Wait until the next request slot is available.
    ///
    /// This is a cooperative suspension point; no shared state is held
    /// across the wait.
    pub async fn acquire(&self) {
        if let Some(ref limiter) = self.limiter {
            log::debug!(
                "Waiting for request slot ({} req/s ceiling)",
                self.requests_per_second
            );
            limiter.until_ready().await;
        }
    }

    /// Try to take a slot without waiting.
    pub fn try_acquire(&self) -> bool {
        match self.limiter {
            Some(ref limiter) => limiter.check().is_ok(),
            None => true,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.limiter.is_some()
    }

    pub fn requests_per_second(&self) -> u32 {
        self.requests_per_second
    }
}
