//! Retry policy for object-store calls
//!
//! Exponential backoff with a per-attempt delay cap and an overall
//! deadline. The listing workers drive [`Backoff`] directly so they can
//! emit a liveness heartbeat between attempts; the download engine uses
//! the [`RetryPolicy::run`] convenience loop.

use std::future::Future;
use std::time::{Duration, Instant};

use crate::Result;

/// Exponential backoff configuration applied to every store call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Multiplier applied to the delay after each attempt.
    pub multiplier: f64,

    /// Cap on any single delay.
    pub max_delay: Duration,

    /// Overall deadline; once elapsed, the last error is surfaced.
    pub deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 1.2,
            max_delay: Duration::from_secs(45),
            deadline: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Start a backoff sequence for one logical operation.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            delay: self.initial_delay,
            multiplier: self.multiplier,
            max_delay: self.max_delay,
            deadline_at: Instant::now() + self.deadline,
        }
    }

    /// Run `op` until it succeeds or the deadline expires.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut backoff = self.backoff();
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => match backoff.next_delay() {
                    Some(delay) => {
                        tracing::debug!(
                            error = %e,
                            delay_ms = delay.as_millis() as u64,
                            "retrying storage call"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(e),
                },
            }
        }
    }
}

/// Backoff state for one operation.
#[derive(Debug)]
pub struct Backoff {
    delay: Duration,
    multiplier: f64,
    max_delay: Duration,
    deadline_at: Instant,
}

impl Backoff {
    /// Delay to sleep before the next attempt, or `None` once the overall
    /// deadline has passed.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if Instant::now() >= self.deadline_at {
            return None;
        }
        let delay = self.delay;
        self.delay = self.delay.mul_f64(self.multiplier).min(self.max_delay);
        Some(delay)
    }
}
