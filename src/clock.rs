//! Injectable time source.
//!
//! All expiration arithmetic goes through an injectable clock so tests can
//! advance time deterministically instead of sleeping in real time. A
//! `Clock` trait is threaded through the cache and circuit breaker so tests
//! can use a `ManualClock`, the same way `tokio::time::advance` is used
//! under `#[tokio::test(start_paused = true)]` elsewhere in this crate's
//! integration tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A source of monotonic time.
pub trait Clock: Send + Sync {
    /// The current instant, per this clock.
    fn now(&self) -> Instant;
}

/// The real wall clock, backed by `Instant::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock whose time only advances when told to. Used by tests that need
/// to assert exact TTL/sliding-expiration/circuit-breaker-timeout behavior
/// without sleeping.
#[derive(Clone)]
pub struct ManualClock {
    base: Instant,
    offset_millis: Arc<AtomicU64>,
}

impl ManualClock {
    /// Creates a manual clock anchored at the current real instant.
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset_millis: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Advances this clock by `duration`. All clones observe the advance.
    pub fn advance(&self, duration: Duration) {
        self.offset_millis
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + Duration::from_millis(self.offset_millis.load(Ordering::SeqCst))
    }
}

/// A type-erased, shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_deterministically() {
        let clock = ManualClock::new();
        let t0 = clock.now();
        clock.advance(Duration::from_secs(5));
        let t1 = clock.now();
        assert_eq!(t1 - t0, Duration::from_secs(5));
    }

    #[test]
    fn manual_clock_clones_share_state() {
        let clock = ManualClock::new();
        let clone = clock.clone();
        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now(), clone.now());
    }
}
