//! Circuit breaker configuration and presets.
//!
//! A builder over a count-based failure-threshold model: a fixed-size
//! sliding window of `Success`/`Failure` ticks and an absolute failure
//! count, with no rate threshold or slow-call detection.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::PipelineError;
use crate::events::EventListeners;

use super::events::CircuitBreakerEvent;

/// A predicate deciding whether an error should count against the circuit's
/// failure window. Defaults to "every non-cancelled error counts."
pub type FailurePredicate = Arc<dyn Fn(&PipelineError) -> bool + Send + Sync>;

/// Configuration for one circuit breaker instance.
pub struct CircuitBreakerConfig {
    pub(crate) name: String,
    pub(crate) failure_threshold: usize,
    pub(crate) sliding_window_size: usize,
    pub(crate) open_duration: Duration,
    pub(crate) success_threshold_in_half_open: usize,
    pub(crate) should_count_as_failure: FailurePredicate,
    pub(crate) event_listeners: EventListeners<CircuitBreakerEvent>,
}

impl fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("name", &self.name)
            .field("failure_threshold", &self.failure_threshold)
            .field("sliding_window_size", &self.sliding_window_size)
            .field("open_duration", &self.open_duration)
            .field(
                "success_threshold_in_half_open",
                &self.success_threshold_in_half_open,
            )
            .finish_non_exhaustive()
    }
}

impl CircuitBreakerConfig {
    /// Starts a builder with the `Default` preset values.
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// `failure_threshold=5, sliding_window_size=10, open_duration=30s,
    /// success_threshold_in_half_open=1`. A balanced general-purpose default.
    pub fn default_preset(name: impl Into<String>) -> Self {
        CircuitBreakerConfigBuilder::new().name(name).build()
    }

    /// `failure_threshold=2, sliding_window_size=4, open_duration=60s,
    /// success_threshold_in_half_open=2`. Trips fast, recovers cautiously —
    /// for endpoints where a few failures reliably predict an outage.
    pub fn aggressive(name: impl Into<String>) -> Self {
        CircuitBreakerConfigBuilder::new()
            .name(name)
            .failure_threshold(2)
            .sliding_window_size(4)
            .open_duration(Duration::from_secs(60))
            .success_threshold_in_half_open(2)
            .build()
    }

    /// `failure_threshold=10, sliding_window_size=20, open_duration=15s,
    /// success_threshold_in_half_open=1`. Tolerates noisy but largely
    /// self-healing endpoints.
    pub fn lenient(name: impl Into<String>) -> Self {
        CircuitBreakerConfigBuilder::new()
            .name(name)
            .failure_threshold(10)
            .sliding_window_size(20)
            .open_duration(Duration::from_secs(15))
            .build()
    }

    /// `failure_threshold=3, sliding_window_size=10, open_duration=90s,
    /// success_threshold_in_half_open=1`, classifying 429 responses
    /// (surfaced as [`crate::error::ErrorKind::Transient`]) as circuit
    /// failures like any other transient outcome, but with a long open
    /// window since rate limits rarely clear in under a minute.
    pub fn for_rate_limited_service(name: impl Into<String>) -> Self {
        CircuitBreakerConfigBuilder::new()
            .name(name)
            .failure_threshold(3)
            .sliding_window_size(10)
            .open_duration(Duration::from_secs(90))
            .build()
    }

    /// `failure_threshold=5, sliding_window_size=15, open_duration=20s,
    /// success_threshold_in_half_open=2`, excluding `Terminal` (non-429 4xx)
    /// errors from failure accounting — a malformed request from the caller
    /// should not trip the breaker protecting a healthy upstream.
    pub fn for_api_service(name: impl Into<String>) -> Self {
        CircuitBreakerConfigBuilder::new()
            .name(name)
            .failure_threshold(5)
            .sliding_window_size(15)
            .open_duration(Duration::from_secs(20))
            .success_threshold_in_half_open(2)
            .should_count_as_failure(|err| {
                !matches!(
                    err.kind(),
                    crate::error::ErrorKind::Terminal | crate::error::ErrorKind::Cancelled
                )
            })
            .build()
    }
}

/// Builder for [`CircuitBreakerConfig`].
pub struct CircuitBreakerConfigBuilder {
    name: String,
    failure_threshold: usize,
    sliding_window_size: usize,
    open_duration: Duration,
    success_threshold_in_half_open: usize,
    should_count_as_failure: FailurePredicate,
    event_listeners: EventListeners<CircuitBreakerEvent>,
}

impl CircuitBreakerConfigBuilder {
    /// Creates a builder seeded with the `Default` preset's values.
    pub fn new() -> Self {
        Self {
            name: String::from("<unnamed>"),
            failure_threshold: 5,
            sliding_window_size: 10,
            open_duration: Duration::from_secs(30),
            success_threshold_in_half_open: 1,
            should_count_as_failure: Arc::new(|err| !err.is_cancelled()),
            event_listeners: EventListeners::new(),
        }
    }

    /// Names this circuit for observability and error messages.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Number of failures in the window required to open the circuit.
    pub fn failure_threshold(mut self, threshold: usize) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Size of the ring buffer of outcome ticks.
    pub fn sliding_window_size(mut self, size: usize) -> Self {
        self.sliding_window_size = size;
        self
    }

    /// How long the circuit stays Open before admitting a half-open probe.
    pub fn open_duration(mut self, duration: Duration) -> Self {
        self.open_duration = duration;
        self
    }

    /// Consecutive half-open successes required to close the circuit.
    pub fn success_threshold_in_half_open(mut self, threshold: usize) -> Self {
        self.success_threshold_in_half_open = threshold;
        self
    }

    /// Overrides which errors count against the failure window. Cancellation
    /// should almost never be included.
    pub fn should_count_as_failure<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&PipelineError) -> bool + Send + Sync + 'static,
    {
        self.should_count_as_failure = Arc::new(predicate);
        self
    }

    /// Registers a listener for every event this breaker emits.
    pub fn on_event<L>(mut self, listener: L) -> Self
    where
        L: crate::events::EventListener<CircuitBreakerEvent> + 'static,
    {
        self.event_listeners.add(listener);
        self
    }

    /// Validates and builds the configuration.
    ///
    /// # Panics
    /// Panics if `failure_threshold == 0`, `failure_threshold >
    /// sliding_window_size`, `open_duration` is zero, or
    /// `success_threshold_in_half_open == 0`.
    pub fn build(self) -> CircuitBreakerConfig {
        assert!(self.failure_threshold >= 1, "failure_threshold must be >= 1");
        assert!(
            self.failure_threshold <= self.sliding_window_size,
            "failure_threshold must be <= sliding_window_size"
        );
        assert!(!self.open_duration.is_zero(), "open_duration must be > 0");
        assert!(
            self.success_threshold_in_half_open >= 1,
            "success_threshold_in_half_open must be >= 1"
        );

        CircuitBreakerConfig {
            name: self.name,
            failure_threshold: self.failure_threshold,
            sliding_window_size: self.sliding_window_size,
            open_duration: self.open_duration,
            success_threshold_in_half_open: self.success_threshold_in_half_open,
            should_count_as_failure: self.should_count_as_failure,
            event_listeners: self.event_listeners,
        }
    }
}

impl Default for CircuitBreakerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
