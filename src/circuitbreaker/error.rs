//! Circuit breaker errors.

use std::time::Duration;

use thiserror::Error;

/// Failure modes for [`super::CircuitBreaker::execute`].
#[derive(Debug, Clone, Error)]
pub enum CircuitBreakerError {
    /// The breaker is Open (or HalfOpen with its probe budget exhausted) and
    /// rejected the call without attempting it.
    #[error("circuit '{name}' is open, retry after {retry_after:?}")]
    Open {
        /// The circuit's name.
        name: String,
        /// How long until the breaker would admit a half-open probe.
        retry_after: Duration,
    },
}
