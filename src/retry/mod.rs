//! Resilient send loop: host-gate-aware retrying HTTP execution.
//!
//! Host-fair gating lives inside this subsystem's own `execute` call rather
//! than an outer orchestrator, so [`execute`] here takes the shared
//! [`crate::hostgate::HostGateRegistry`] and acquires a permit before
//! entering the retry loop, releasing it (via `GatePermit`'s `Drop`)
//! once the loop returns.

mod backoff;
mod config;
mod events;
mod send_loop;

pub use backoff::ExponentialBackoff;
pub use config::{
    InMemoryResiliencePolicyProvider, ResiliencePolicyProvider, ResiliencePolicySpec, RetryPolicy,
    RetryPolicyBuilder, DEFAULT_RETRYABLE_STATUSES,
};
pub use events::RetryEvent;
pub use send_loop::send_with_retries;

use std::time::Duration;

use reqwest::{Client, Request, Response};

use crate::cancel::CancellationToken;
use crate::clock::SharedClock;
use crate::error::PipelineError;
use crate::hostgate::HostGateRegistry;

/// Acquires a fair slot for `host` and then runs [`send_with_retries`]
/// against it.
pub async fn execute(
    host_gate: &HostGateRegistry,
    host: &str,
    client: &Client,
    template: Request,
    policy: &RetryPolicy,
    backoff: &ExponentialBackoff,
    clock: &SharedClock,
    cancel: &CancellationToken,
) -> Result<Response, PipelineError> {
    let gate = host_gate.gate_for(host, policy.max_concurrency_per_host());
    let remaining_for_gate_wait = None::<Duration>;
    let _permit = gate.acquire(remaining_for_gate_wait, cancel).await?;

    send_with_retries(client, template, policy, backoff, clock, cancel).await
}

impl RetryPolicy {
    /// Exposed for [`execute`]'s host-gate sizing; not part of the builder
    /// surface since it is set once at construction.
    pub fn max_concurrency_per_host(&self) -> usize {
        self.max_concurrency_per_host
    }
}
