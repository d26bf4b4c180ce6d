//! Host gate errors.

use std::time::Duration;

use thiserror::Error;

/// Failure modes for [`super::HostGate`] acquisition.
#[derive(Debug, Error)]
pub enum HostGateError {
    /// The caller's wait budget elapsed before a permit became available.
    #[error("timed out waiting {waited:?} for a slot on host '{host}'")]
    Timeout {
        /// The host that was gated.
        host: String,
        /// How long the caller was willing to wait.
        waited: Duration,
    },
    /// The caller's cancellation token fired while waiting for a permit.
    #[error("cancelled while waiting for a slot on host '{host}'")]
    Cancelled {
        /// The host that was gated.
        host: String,
    },
}
