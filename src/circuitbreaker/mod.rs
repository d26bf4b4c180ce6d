//! Per-endpoint circuit breaker.
//!
//! Split across `config.rs`, `circuit.rs`, `error.rs`, and `events.rs`,
//! following a lock-the-state, mutate, emit-events shape. Wraps a bare
//! async factory rather than a generic middleware `Service`, since the
//! pipeline (`crate::pipeline`) is the only caller.

mod circuit;
mod config;
mod error;
mod events;

pub use circuit::{CircuitState, CircuitStatistics};
pub use config::{CircuitBreakerConfig, CircuitBreakerConfigBuilder, FailurePredicate};
pub use error::CircuitBreakerError;
pub use events::CircuitBreakerEvent;

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;

#[cfg(feature = "metrics")]
use metrics::describe_counter;

use crate::clock::SharedClock;
use crate::error::PipelineError;

use circuit::Circuit;

/// A named circuit breaker guarding one logical endpoint.
#[derive(Clone)]
pub struct CircuitBreaker {
    config: Arc<CircuitBreakerConfig>,
    circuit: Arc<Mutex<Circuit>>,
    clock: SharedClock,
}

impl CircuitBreaker {
    /// Creates a circuit breaker from `config`, using `clock` as its time
    /// source so tests can drive `open_duration` deterministically.
    pub fn new(config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        #[cfg(feature = "metrics")]
        describe_counter!(
            "circuitbreaker_transitions_total",
            "Total number of circuit breaker state transitions"
        );

        Self {
            config: Arc::new(config),
            circuit: Arc::new(Mutex::new(Circuit::new())),
            clock,
        }
    }

    /// The circuit's name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The circuit's current state.
    pub fn state(&self) -> CircuitState {
        self.circuit.lock().state()
    }

    /// A snapshot of `{failures_in_window, total_successes, total_failures,
    /// total_operations}`.
    pub fn statistics(&self) -> CircuitStatistics {
        self.circuit.lock().statistics()
    }

    /// Forces the circuit Closed and clears its counters.
    pub fn reset(&self) {
        let now = self.clock.now();
        self.circuit.lock().reset(&self.config, now);
    }

    /// Runs `factory` if the circuit admits the call.
    ///
    /// - Rejected outright: returns [`CircuitBreakerError::Open`] without
    ///   invoking `factory`.
    /// - `factory` resolves to `Err(e)` where `e.is_cancelled()`: propagated
    ///   without touching the failure window.
    /// - `factory` resolves to `Err(e)` otherwise: counted as failure iff
    ///   `should_count_as_failure(&e)`, which defaults to "every
    ///   non-cancelled error."
    /// - `factory` resolves to `Ok(_)`: counted as success.
    pub async fn execute<F, Fut, T>(
        &self,
        operation_name: Option<&str>,
        factory: F,
    ) -> Result<T, PipelineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let admitted = {
            let now = self.clock.now();
            let mut circuit = self.circuit.lock();
            circuit.try_acquire(&self.config, now)
        };

        if !admitted {
            let now = self.clock.now();
            let retry_after = self.circuit.lock().retry_after(&self.config, now);
            return Err(PipelineError::CircuitOpen {
                circuit_name: self.config.name.clone(),
                operation_name: operation_name.map(str::to_owned),
                retry_after,
            });
        }

        let result = factory().await;
        let now = self.clock.now();

        match &result {
            Ok(_) => {
                self.circuit.lock().record_success(&self.config, now);
            }
            Err(err) if err.is_cancelled() => {
                // Cancellation never feeds the failure window.
            }
            Err(err) => {
                if (self.config.should_count_as_failure)(err) {
                    self.circuit.lock().record_failure(&self.config, now);
                } else {
                    self.circuit.lock().record_success(&self.config, now);
                }
            }
        }

        result
    }
}
