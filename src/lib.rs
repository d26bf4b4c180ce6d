//! Resilience and caching core for media-library plugin HTTP clients.
//!
//! This crate provides the collaborators a plugin host wires together to
//! make outbound HTTP calls well-behaved under load: host-fair concurrency
//! ([`hostgate`]), retry with backoff and a wall-clock budget ([`retry`]),
//! response caching with conditional revalidation ([`cache`]), request
//! coalescing ([`dedup`]), and circuit breaking ([`circuitbreaker`]).
//! [`pipeline::Pipeline`] composes all five into the single call path most
//! callers want; the individual subsystems remain public for callers who
//! need to use one on its own.

mod cancel;
mod canonical;
mod clock;
mod error;
mod events;
mod options;
mod sniffer;

pub mod cache;
pub mod circuitbreaker;
pub mod dedup;
pub mod hostgate;
pub mod pipeline;
pub mod retry;

pub use cancel::CancellationToken;
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{ErrorKind, PipelineError};
pub use events::{EventListener, EventListeners, FnListener, SubsystemEvent};
pub use options::{RequestFingerprint, RequestOptions};
pub use sniffer::{sniff, SniffedBody};

pub use canonical::{canonicalize, redact_for_log};

pub use cache::{
    CacheEntry, CacheError, CacheEvent, CachePolicy, CachePolicyProvider, ConditionalStateStore,
    InMemoryCachePolicyProvider, InMemoryConditionalStateStore, ResponseCache, Validators,
};
pub use circuitbreaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerConfigBuilder, CircuitBreakerError,
    CircuitBreakerEvent, CircuitState, CircuitStatistics,
};
pub use dedup::{DedupError, DedupStatistics, SingleFlightDeduplicator};
pub use hostgate::{GatePermit, HostGate, HostGateError, HostGateEvent, HostGateRegistry};
pub use pipeline::{default_http_client, CircuitConfigFactory, Pipeline, PipelineResponse};
pub use retry::{
    ExponentialBackoff, InMemoryResiliencePolicyProvider, ResiliencePolicyProvider,
    ResiliencePolicySpec, RetryEvent, RetryPolicy, RetryPolicyBuilder, DEFAULT_RETRYABLE_STATUSES,
};
