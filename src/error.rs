//! Crate-wide error taxonomy.
//!
//! Every error surfaced by the pipeline or any of its subsystems ultimately
//! converts into [`PipelineError`], which mirrors the five-way taxonomy from
//! the resilience design: transient failures that were retried, terminal
//! failures, cancellation, a fail-fast circuit, and retry-budget exhaustion.
//! This follows the same "one error type per composed stack" idea that lets
//! callers compose multiple resilience layers without writing their own
//! `From` implementations for each one.

use std::time::Duration;

use thiserror::Error;

use crate::cache::CacheError;
use crate::circuitbreaker::CircuitBreakerError;
use crate::dedup::DedupError;
use crate::hostgate::HostGateError;

/// Coarse classification of a failure, used by the send loop to decide
/// whether to retry and by the circuit breaker to decide whether to count
/// the outcome as a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network error, 5xx, 429, 408, or 425 — eligible for retry within budget.
    Transient,
    /// Non-429 4xx or a schema violation — surfaced immediately.
    Terminal,
    /// Caller cancellation. Never counted as a failure.
    Cancelled,
    /// The circuit breaker is open for this endpoint.
    CircuitOpen,
    /// The retry budget was exhausted before a terminal outcome was reached.
    BudgetExhausted,
}

/// The unified error type surfaced to plugins by the integrated pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The circuit protecting `circuit_name` is open.
    #[error("{}", format_circuit_open(circuit_name, operation_name, *retry_after))]
    CircuitOpen {
        /// Name of the circuit (typically the endpoint tag).
        circuit_name: String,
        /// Name of the operation being attempted, if known.
        operation_name: Option<String>,
        /// How long until the breaker would allow a half-open probe.
        retry_after: Duration,
    },
    /// The retry budget (`retry_budget` deadline or `max_retries`) was
    /// exhausted. Carries the last underlying error observed.
    #[error("retry budget exhausted, last error: {source}")]
    BudgetExhausted {
        /// The error from the final attempt.
        #[source]
        source: Box<PipelineError>,
    },
    /// The caller's cancellation token fired. Never counted against retries
    /// or the circuit breaker.
    #[error("request cancelled")]
    Cancelled,
    /// A non-retryable HTTP status or schema violation.
    #[error("terminal error: {0}")]
    Terminal(String),
    /// A transport-level error from the underlying HTTP client.
    #[error("transport error: {0}")]
    Transport(String),
    /// An error from the response cache subsystem.
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    /// An error from the single-flight deduplicator.
    #[error("dedup error: {0}")]
    Dedup(#[from] DedupError),
    /// An error from the host gate registry.
    #[error("host gate error: {0}")]
    HostGate(#[from] HostGateError),
}

fn format_circuit_open(circuit_name: &str, operation_name: &Option<String>, retry_after: Duration) -> String {
    match operation_name {
        Some(op) => format!("circuit '{circuit_name}' is open for operation '{op}', retry after {retry_after:?}"),
        None => format!("circuit '{circuit_name}' is open, retry after {retry_after:?}"),
    }
}

impl PipelineError {
    /// Classifies this error into its broad retry/terminal/cancellation kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            PipelineError::BudgetExhausted { .. } => ErrorKind::BudgetExhausted,
            PipelineError::Cancelled => ErrorKind::Cancelled,
            PipelineError::HostGate(HostGateError::Cancelled { .. }) => ErrorKind::Cancelled,
            PipelineError::Dedup(DedupError::Cancelled) => ErrorKind::Cancelled,
            PipelineError::Terminal(_) => ErrorKind::Terminal,
            PipelineError::Transport(_) => ErrorKind::Transient,
            PipelineError::Cache(_) | PipelineError::Dedup(_) | PipelineError::HostGate(_) => {
                ErrorKind::Terminal
            }
        }
    }

    /// Returns `true` if this error must never be counted against retry
    /// budgets or circuit-breaker failure accounting. This includes
    /// cancellation observed at any named suspension point, not just a
    /// caller's own token — host-gate acquisition and dedup joins surface
    /// it wrapped in their own subsystem error.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            PipelineError::Cancelled
                | PipelineError::HostGate(HostGateError::Cancelled { .. })
                | PipelineError::Dedup(DedupError::Cancelled)
        )
    }
}

impl From<CircuitBreakerError> for PipelineError {
    fn from(e: CircuitBreakerError) -> Self {
        match e {
            CircuitBreakerError::Open {
                name,
                retry_after,
            } => PipelineError::CircuitOpen {
                circuit_name: name,
                operation_name: None,
                retry_after,
            },
        }
    }
}
