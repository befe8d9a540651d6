//! Bounded waiting primitives shared by image pulls, readiness polling,
//! health checks and client timeouts.

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use tracing::{debug, warn};

/// Explicit schedule of delays applied between attempts.
///
/// A schedule with `n` delays allows `n + 1` attempts in total.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    delays: Vec<Duration>,
}

impl Backoff {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    /// `base`, `2 * base`, ... `steps * base`.
    pub fn linear(base: Duration, steps: u32) -> Self {
        Self::new((1..=steps).map(|step| base * step).collect())
    }

    pub fn from_secs(delays: &[u64]) -> Self {
        Self::new(delays.iter().copied().map(Duration::from_secs).collect())
    }

    pub fn attempts(&self) -> usize {
        self.delays.len() + 1
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }
}

/// Run `operation` until it succeeds or the schedule is exhausted.
///
/// The closure receives the zero-based attempt index. The last error is
/// returned once every attempt has failed.
pub fn retry<T, F>(backoff: &Backoff, label: &str, mut operation: F) -> Result<T>
where
    F: FnMut(usize) -> Result<T>,
{
    let attempts = backoff.attempts();
    let mut last_error = None;
    for attempt in 0..attempts {
        match operation(attempt) {
            Ok(value) => return Ok(value),
            Err(err) => {
                let delay = backoff.delays.get(attempt).copied();
                match delay {
                    Some(delay) => {
                        warn!(
                            operation = label,
                            attempt = attempt + 1,
                            attempts,
                            retry_in_s = delay.as_secs(),
                            error = %err,
                            "attempt failed; backing off"
                        );
                        thread::sleep(delay);
                    }
                    None => {
                        warn!(operation = label, attempt = attempt + 1, attempts, error = %err, "final attempt failed");
                    }
                }
                last_error = Some(err);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| anyhow!("{label}: no attempts made")))
}

/// Result of one polling step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Poll<T> {
    Ready(T),
    Pending,
}

/// Call `probe` every `interval` until it yields [`Poll::Ready`] or `timeout`
/// elapses. Returns `Ok(None)` on timeout; probe errors abort immediately.
pub fn poll_until<T, F>(interval: Duration, timeout: Duration, mut probe: F) -> Result<Option<T>>
where
    F: FnMut() -> Result<Poll<T>>,
{
    let deadline = Instant::now() + timeout;
    let mut polls = 0u64;
    loop {
        polls += 1;
        if let Poll::Ready(value) = probe()? {
            debug!(polls, "poll resolved");
            return Ok(Some(value));
        }
        let now = Instant::now();
        if now >= deadline {
            debug!(polls, timeout_s = timeout.as_secs_f64(), "poll timed out");
            return Ok(None);
        }
        thread::sleep(interval.min(deadline - now));
    }
}
