use std::{
    future::Future,
    num::NonZeroU32,
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Result};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use parking_lot::Mutex;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

const FAILURE_THRESHOLD: u32 = 5;
const OPEN_FOR: Duration = Duration::from_secs(60);
/// Attempts per outbound call, including the first one.
pub const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

enum Inner {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen,
}

/// Closed/open/half-open breaker guarding one upstream endpoint.
/// Opens after repeated failures, admits a single probe after the backoff.
pub struct CircuitBreaker {
    name: String,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            inner: Mutex::new(Inner::Closed { failures: 0 }),
        }
    }

    pub fn state(&self) -> BreakerState {
        match *self.inner.lock() {
            Inner::Closed { .. } => BreakerState::Closed,
            Inner::Open { .. } => BreakerState::Open,
            Inner::HalfOpen => BreakerState::HalfOpen,
        }
    }

    /// Whether a call may proceed right now. Transitions Open -> HalfOpen
    /// once the backoff has elapsed.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock();
        match *inner {
            Inner::Closed { .. } => true,
            Inner::HalfOpen => true,
            Inner::Open { since } => {
                if since.elapsed() >= OPEN_FOR {
                    *inner = Inner::HalfOpen;
                    tracing::info!("Circuit {} half-open, admitting probe", self.name);
                    true
                } else {
                    false
                }
            },
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if !matches!(*inner, Inner::Closed { failures: 0 }) {
            *inner = Inner::Closed { failures: 0 };
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match *inner {
            Inner::Closed { failures } => {
                let failures = failures + 1;
                if failures >= FAILURE_THRESHOLD {
                    tracing::warn!("Circuit {} opened after {} failures", self.name, failures);
                    *inner = Inner::Open {
                        since: Instant::now(),
                    };
                } else {
                    *inner = Inner::Closed { failures };
                }
            },
            Inner::HalfOpen => {
                tracing::warn!("Circuit {} re-opened after failed probe", self.name);
                *inner = Inner::Open {
                    since: Instant::now(),
                };
            },
            Inner::Open { .. } => {},
        }
    }
}

/// Rate limiter plus circuit breaker in front of one endpoint.
pub struct EndpointGuard {
    limiter: DirectLimiter,
    breaker: CircuitBreaker,
}

impl EndpointGuard {
    pub fn new(name: &str, requests_per_second: u32) -> Self {
        let quota = Quota::per_second(
            NonZeroU32::new(requests_per_second.max(1)).expect("nonzero rate"),
        );
        Self {
            limiter: RateLimiter::direct(quota),
            breaker: CircuitBreaker::new(name),
        }
    }

    /// Wait for a rate-limit slot; error without waiting when the breaker
    /// is open.
    pub async fn admit(&self) -> Result<()> {
        if !self.breaker.allow() {
            bail!("circuit open");
        }
        self.limiter.until_ready().await;
        Ok(())
    }

    pub fn record_success(&self) {
        self.breaker.record_success();
    }

    pub fn record_failure(&self) {
        self.breaker.record_failure();
    }

    /// Run `call` with bounded exponential backoff. Every attempt takes a
    /// rate-limit slot and reports its outcome to the breaker; an open
    /// breaker ends the loop immediately.
    pub async fn retry<T, F, Fut>(&self, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_err = None;
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(BACKOFF_BASE_MS << attempt)).await;
            }
            self.admit().await?;
            match call().await {
                Ok(value) => {
                    self.record_success();
                    return Ok(value);
                },
                Err(err) => {
                    self.record_failure();
                    tracing::debug!("Attempt {} failed: {:#}", attempt + 1, err);
                    last_err = Some(err);
                },
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("retries exhausted")))
    }
}
