//! Circuit breaker events.
//!
//! Covers the Closed/Open/HalfOpen transitions this breaker actually makes
//! (no slow-call variant — it is count-of-failures based, not latency
//! based).

use std::time::Instant;

use crate::events::SubsystemEvent;

use super::CircuitState;

/// Events emitted by [`super::CircuitBreaker`].
#[derive(Debug, Clone)]
pub enum CircuitBreakerEvent {
    /// The breaker transitioned from one state to another. Fires exactly
    /// once per transition.
    StateTransition {
        /// The circuit's name.
        name: String,
        /// State before the transition.
        from: CircuitState,
        /// State after the transition.
        to: CircuitState,
        /// When this occurred.
        timestamp: Instant,
    },
    /// A call was permitted through the breaker.
    CallPermitted {
        /// The circuit's name.
        name: String,
        /// State at permission time.
        state: CircuitState,
        /// When this occurred.
        timestamp: Instant,
    },
    /// A call was rejected by the breaker.
    CallRejected {
        /// The circuit's name.
        name: String,
        /// When this occurred.
        timestamp: Instant,
    },
    /// A call outcome was recorded as a success.
    SuccessRecorded {
        /// The circuit's name.
        name: String,
        /// State at record time.
        state: CircuitState,
        /// When this occurred.
        timestamp: Instant,
    },
    /// A call outcome was recorded as a failure.
    FailureRecorded {
        /// The circuit's name.
        name: String,
        /// State at record time.
        state: CircuitState,
        /// When this occurred.
        timestamp: Instant,
    },
}

impl SubsystemEvent for CircuitBreakerEvent {
    fn event_type(&self) -> &'static str {
        match self {
            CircuitBreakerEvent::StateTransition { .. } => "state_transition",
            CircuitBreakerEvent::CallPermitted { .. } => "call_permitted",
            CircuitBreakerEvent::CallRejected { .. } => "call_rejected",
            CircuitBreakerEvent::SuccessRecorded { .. } => "success_recorded",
            CircuitBreakerEvent::FailureRecorded { .. } => "failure_recorded",
        }
    }

    fn timestamp(&self) -> Instant {
        match self {
            CircuitBreakerEvent::StateTransition { timestamp, .. }
            | CircuitBreakerEvent::CallPermitted { timestamp, .. }
            | CircuitBreakerEvent::CallRejected { timestamp, .. }
            | CircuitBreakerEvent::SuccessRecorded { timestamp, .. }
            | CircuitBreakerEvent::FailureRecorded { timestamp, .. } => *timestamp,
        }
    }

    fn source_name(&self) -> &str {
        match self {
            CircuitBreakerEvent::StateTransition { name, .. }
            | CircuitBreakerEvent::CallPermitted { name, .. }
            | CircuitBreakerEvent::CallRejected { name, .. }
            | CircuitBreakerEvent::SuccessRecorded { name, .. }
            | CircuitBreakerEvent::FailureRecorded { name, .. } => name,
        }
    }
}
