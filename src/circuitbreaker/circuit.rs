//! The circuit state machine.
//!
//! State held behind a plain struct, mutated under a lock owned by the
//! caller, with events emitted on every transition. Window accounting uses
//! a count-based ring buffer (`sliding_window_size` ticks of
//! `Success|Failure`, `failure_threshold` as an absolute count) rather than
//! a failure-rate-over-window model.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::config::CircuitBreakerConfig;
use super::events::CircuitBreakerEvent;

/// The three states a circuit can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls are allowed through; outcomes feed the failure window.
    Closed,
    /// Calls are rejected without being attempted.
    Open,
    /// A bounded number of probe calls are allowed through to test recovery.
    HalfOpen,
}

/// Point-in-time statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitStatistics {
    /// Failures currently counted in the sliding window.
    pub failures_in_window: usize,
    /// Total successes observed over this circuit's lifetime.
    pub total_successes: usize,
    /// Total failures observed over this circuit's lifetime.
    pub total_failures: usize,
    /// Total operations (successes + failures) observed.
    pub total_operations: usize,
}

pub(crate) struct Circuit {
    state: CircuitState,
    window: VecDeque<bool>,
    failures_in_window: usize,
    total_successes: usize,
    total_failures: usize,
    total_operations: usize,
    opened_at: Option<Instant>,
    half_open_successes: usize,
}

impl Circuit {
    pub(crate) fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            window: VecDeque::new(),
            failures_in_window: 0,
            total_successes: 0,
            total_failures: 0,
            total_operations: 0,
            opened_at: None,
            half_open_successes: 0,
        }
    }

    pub(crate) fn state(&self) -> CircuitState {
        self.state
    }

    pub(crate) fn statistics(&self) -> CircuitStatistics {
        CircuitStatistics {
            failures_in_window: self.failures_in_window,
            total_successes: self.total_successes,
            total_failures: self.total_failures,
            total_operations: self.total_operations,
        }
    }

    /// Lazily transitions Open → HalfOpen if `open_duration` has elapsed,
    /// then decides whether `now` may proceed.
    pub(crate) fn try_acquire(&mut self, config: &CircuitBreakerConfig, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => {
                self.emit_permitted(config, now);
                true
            }
            CircuitState::Open => {
                let opened_at = self.opened_at.expect("Open state always has opened_at");
                if now.duration_since(opened_at) >= config.open_duration {
                    self.transition_to(CircuitState::HalfOpen, config, now);
                    self.emit_permitted(config, now);
                    true
                } else {
                    self.emit_rejected(config, now);
                    false
                }
            }
            CircuitState::HalfOpen => {
                // One probe in flight at a time, up to the success threshold;
                // a prior half-open failure already bounced us back to Open.
                if self.half_open_successes < config.success_threshold_in_half_open {
                    self.emit_permitted(config, now);
                    true
                } else {
                    self.emit_rejected(config, now);
                    false
                }
            }
        }
    }

    pub(crate) fn record_success(&mut self, config: &CircuitBreakerConfig, now: Instant) {
        self.total_successes += 1;
        self.total_operations += 1;

        config.event_listeners.emit(&CircuitBreakerEvent::SuccessRecorded {
            name: config.name.clone(),
            state: self.state,
            timestamp: now,
        });

        match self.state {
            CircuitState::HalfOpen => {
                self.half_open_successes += 1;
                if self.half_open_successes >= config.success_threshold_in_half_open {
                    self.transition_to(CircuitState::Closed, config, now);
                }
            }
            CircuitState::Closed => {
                self.push_tick(config, false);
            }
            CircuitState::Open => {}
        }
    }

    pub(crate) fn record_failure(&mut self, config: &CircuitBreakerConfig, now: Instant) {
        self.total_failures += 1;
        self.total_operations += 1;

        config.event_listeners.emit(&CircuitBreakerEvent::FailureRecorded {
            name: config.name.clone(),
            state: self.state,
            timestamp: now,
        });

        match self.state {
            CircuitState::HalfOpen => {
                self.transition_to(CircuitState::Open, config, now);
            }
            CircuitState::Closed => {
                self.push_tick(config, true);
                if self.failures_in_window >= config.failure_threshold {
                    self.transition_to(CircuitState::Open, config, now);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Forces the circuit Closed and clears all counters, even if it was
    /// already Closed — `transition_to` alone no-ops on a same-state
    /// transition, which would otherwise leave a below-threshold
    /// `failures_in_window` untouched.
    pub(crate) fn reset(&mut self, config: &CircuitBreakerConfig, now: Instant) {
        let from = self.state;
        self.state = CircuitState::Closed;
        self.window.clear();
        self.failures_in_window = 0;
        self.half_open_successes = 0;
        self.opened_at = None;

        if from != CircuitState::Closed {
            #[cfg(feature = "tracing")]
            tracing::info!(circuit = %config.name, ?from, to = ?CircuitState::Closed, "circuit breaker state transition");

            #[cfg(feature = "metrics")]
            metrics::counter!(
                "circuitbreaker_transitions_total",
                "circuit" => config.name.clone(),
            )
            .increment(1);

            config.event_listeners.emit(&CircuitBreakerEvent::StateTransition {
                name: config.name.clone(),
                from,
                to: CircuitState::Closed,
                timestamp: now,
            });
        }
    }

    /// How long until an Open circuit would admit a half-open probe.
    pub(crate) fn retry_after(&self, config: &CircuitBreakerConfig, now: Instant) -> Duration {
        match (self.state, self.opened_at) {
            (CircuitState::Open, Some(opened_at)) => {
                config.open_duration.saturating_sub(now.duration_since(opened_at))
            }
            _ => Duration::ZERO,
        }
    }

    fn push_tick(&mut self, config: &CircuitBreakerConfig, is_failure: bool) {
        self.window.push_back(is_failure);
        if is_failure {
            self.failures_in_window += 1;
        }
        while self.window.len() > config.sliding_window_size {
            if let Some(evicted) = self.window.pop_front() {
                if evicted {
                    self.failures_in_window = self.failures_in_window.saturating_sub(1);
                }
            }
        }
    }

    fn transition_to(&mut self, to: CircuitState, config: &CircuitBreakerConfig, now: Instant) {
        if self.state == to {
            return;
        }
        let from = self.state;
        self.state = to;
        self.window.clear();
        self.failures_in_window = 0;
        self.half_open_successes = 0;
        self.opened_at = if to == CircuitState::Open { Some(now) } else { None };

        #[cfg(feature = "tracing")]
        tracing::info!(circuit = %config.name, ?from, ?to, "circuit breaker state transition");

        #[cfg(feature = "metrics")]
        metrics::counter!(
            "circuitbreaker_transitions_total",
            "circuit" => config.name.clone(),
        )
        .increment(1);

        config.event_listeners.emit(&CircuitBreakerEvent::StateTransition {
            name: config.name.clone(),
            from,
            to,
            timestamp: now,
        });
    }

    fn emit_permitted(&self, config: &CircuitBreakerConfig, now: Instant) {
        config.event_listeners.emit(&CircuitBreakerEvent::CallPermitted {
            name: config.name.clone(),
            state: self.state,
            timestamp: now,
        });
    }

    fn emit_rejected(&self, config: &CircuitBreakerConfig, now: Instant) {
        config.event_listeners.emit(&CircuitBreakerEvent::CallRejected {
            name: config.name.clone(),
            timestamp: now,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(failure_threshold: usize, window: usize) -> CircuitBreakerConfig {
        CircuitBreakerConfig::builder()
            .name("test")
            .failure_threshold(failure_threshold)
            .sliding_window_size(window)
            .open_duration(Duration::from_secs(30))
            .build()
    }

    #[test]
    fn three_consecutive_failures_open_the_circuit() {
        let config = config(3, 5);
        let mut circuit = Circuit::new();
        let now = Instant::now();

        for _ in 0..3 {
            assert!(circuit.try_acquire(&config, now));
            circuit.record_failure(&config, now);
        }

        assert_eq!(circuit.state(), CircuitState::Open);
        assert!(!circuit.try_acquire(&config, now));
    }

    #[test]
    fn open_transitions_to_half_open_after_open_duration() {
        let config = config(1, 5);
        let mut circuit = Circuit::new();
        let t0 = Instant::now();
        circuit.try_acquire(&config, t0);
        circuit.record_failure(&config, t0);
        assert_eq!(circuit.state(), CircuitState::Open);

        let still_open = t0 + Duration::from_secs(29);
        assert!(!circuit.try_acquire(&config, still_open));
        assert_eq!(circuit.state(), CircuitState::Open);

        let past_open_duration = t0 + Duration::from_secs(31);
        assert!(circuit.try_acquire(&config, past_open_duration));
        assert_eq!(circuit.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn one_half_open_success_closes_with_threshold_one() {
        let config = CircuitBreakerConfig::builder()
            .name("test")
            .failure_threshold(1)
            .sliding_window_size(5)
            .open_duration(Duration::from_millis(1))
            .success_threshold_in_half_open(1)
            .build();
        let mut circuit = Circuit::new();
        let t0 = Instant::now();
        circuit.try_acquire(&config, t0);
        circuit.record_failure(&config, t0);

        let later = t0 + Duration::from_millis(5);
        assert!(circuit.try_acquire(&config, later));
        circuit.record_success(&config, later);

        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    #[test]
    fn a_half_open_failure_reopens_the_circuit() {
        let config = CircuitBreakerConfig::builder()
            .name("test")
            .failure_threshold(1)
            .sliding_window_size(5)
            .open_duration(Duration::from_millis(1))
            .build();
        let mut circuit = Circuit::new();
        let t0 = Instant::now();
        circuit.try_acquire(&config, t0);
        circuit.record_failure(&config, t0);

        let later = t0 + Duration::from_millis(5);
        assert!(circuit.try_acquire(&config, later));
        circuit.record_failure(&config, later);

        assert_eq!(circuit.state(), CircuitState::Open);
    }

    #[test]
    fn retry_after_counts_down_to_zero() {
        let config = config(1, 5);
        let mut circuit = Circuit::new();
        let t0 = Instant::now();
        circuit.try_acquire(&config, t0);
        circuit.record_failure(&config, t0);

        let retry_after = circuit.retry_after(&config, t0 + Duration::from_secs(10));
        assert_eq!(retry_after, Duration::from_secs(20));

        let retry_after_past_due = circuit.retry_after(&config, t0 + Duration::from_secs(45));
        assert_eq!(retry_after_past_due, Duration::ZERO);
    }

    #[test]
    fn reset_forces_closed_and_clears_counters() {
        let config = config(1, 5);
        let mut circuit = Circuit::new();
        let t0 = Instant::now();
        circuit.try_acquire(&config, t0);
        circuit.record_failure(&config, t0);
        assert_eq!(circuit.state(), CircuitState::Open);

        circuit.reset(&config, t0);
        assert_eq!(circuit.state(), CircuitState::Closed);
        assert_eq!(circuit.statistics().failures_in_window, 0);
    }

    #[test]
    fn reset_clears_below_threshold_failures_even_when_already_closed() {
        let config = config(3, 5);
        let mut circuit = Circuit::new();
        let t0 = Instant::now();

        circuit.try_acquire(&config, t0);
        circuit.record_failure(&config, t0);
        assert_eq!(circuit.state(), CircuitState::Closed);
        assert_eq!(circuit.statistics().failures_in_window, 1);

        circuit.reset(&config, t0);
        assert_eq!(circuit.state(), CircuitState::Closed);
        assert_eq!(circuit.statistics().failures_in_window, 0);
    }

    #[test]
    fn window_only_counts_the_most_recent_ticks() {
        let config = config(3, 3);
        let mut circuit = Circuit::new();
        let t0 = Instant::now();

        circuit.try_acquire(&config, t0);
        circuit.record_failure(&config, t0);
        circuit.try_acquire(&config, t0);
        circuit.record_success(&config, t0);
        circuit.try_acquire(&config, t0);
        circuit.record_success(&config, t0);
        circuit.try_acquire(&config, t0);
        circuit.record_success(&config, t0);

        assert_eq!(circuit.state(), CircuitState::Closed);
        assert_eq!(circuit.statistics().failures_in_window, 0);
    }
}
