//! Backoff computation.
//!
//! An `IntervalFunction`-style trait plus an `ExponentialBackoff` type
//! implementing a `base * 2^attempt + jitter` formula with additive jitter,
//! and honoring a caller's `Retry-After` header when present.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with additive jitter, capped by an optional ceiling.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    multiplier: f64,
    max_interval: Duration,
    jitter: Duration,
}

impl ExponentialBackoff {
    /// `base` is the attempt-0 delay; `max_interval` caps exponential
    /// growth; `jitter` bounds the additive random component.
    pub fn new(base: Duration, max_interval: Duration, jitter: Duration) -> Self {
        Self {
            base,
            multiplier: 2.0,
            max_interval,
            jitter,
        }
    }

    /// The delay before retrying attempt number `attempt` (0-indexed: the
    /// first retry is attempt 0), before any `Retry-After` override or
    /// remaining-budget cap is applied.
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let exponent = self.multiplier.powi(attempt as i32);
        let grown = self.base.mul_f64(exponent).min(self.max_interval);
        let jitter = if self.jitter.is_zero() {
            Duration::ZERO
        } else {
            Duration::from_nanos(rand::rng().random_range(0..=self.jitter.as_nanos() as u64))
        };
        grown + jitter
    }
}

/// Parses a `Retry-After` header value, accepting either a delta-seconds
/// integer or an HTTP-date.
pub fn parse_retry_after(value: &str, now: std::time::SystemTime) -> Option<Duration> {
    if let Ok(seconds) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let when = httpdate::parse_http_date(value.trim()).ok()?;
    when.duration_since(now).ok()
}

/// Caps `delay` so it never pushes the attempt past `deadline`.
pub fn cap_to_deadline(delay: Duration, remaining_budget: Duration) -> Duration {
    delay.min(remaining_budget)
}
