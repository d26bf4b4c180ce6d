//! Resilient send loop configuration.
//!
//! A builder (`RetryConfigBuilder`, `on_retry`/`on_success`/
//! `on_budget_exhausted` listener registration) producing a policy shape of
//! `{max_retries, retry_budget, max_concurrency_per_host,
//! per_request_timeout?, profile_name, should_retry?}`, with a wall-clock
//! budget deadline per call (see DESIGN.md for the reasoning behind a
//! per-call deadline rather than a cross-request token bucket).

use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "metrics")]
use metrics::{describe_counter, describe_histogram};

use crate::events::{EventListeners, FnListener};

use super::events::RetryEvent;

/// Status codes retried by default.
pub const DEFAULT_RETRYABLE_STATUSES: [u16; 7] = [408, 425, 429, 500, 502, 503, 504];

/// A predicate overriding the default retryable-status classification.
/// Receives `None` for a transport-level (connection) failure and
/// `Some(status)` for an HTTP response.
pub type RetryPredicate = Arc<dyn Fn(Option<u16>) -> bool + Send + Sync>;

/// Policy governing one call through [`super::send_loop::send_with_retries`].
pub struct RetryPolicy {
    pub(crate) max_retries: usize,
    pub(crate) retry_budget: Duration,
    pub(crate) max_concurrency_per_host: usize,
    pub(crate) per_request_timeout: Option<Duration>,
    pub(crate) profile_name: String,
    pub(crate) should_retry: Option<RetryPredicate>,
    pub(crate) event_listeners: EventListeners<RetryEvent>,
}

impl RetryPolicy {
    /// Starts a builder for `profile_name`.
    pub fn builder(profile_name: impl Into<String>) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(profile_name)
    }

    /// The profile name this policy was built for.
    pub fn profile_name(&self) -> &str {
        &self.profile_name
    }

    /// Whether `status` (or `None` for a transport error) should be retried.
    pub fn is_retryable(&self, status: Option<u16>) -> bool {
        if let Some(predicate) = &self.should_retry {
            return predicate(status);
        }
        match status {
            None => true,
            Some(code) => DEFAULT_RETRYABLE_STATUSES.contains(&code),
        }
    }
}

/// Builder for [`RetryPolicy`].
pub struct RetryPolicyBuilder {
    max_retries: usize,
    retry_budget: Duration,
    max_concurrency_per_host: usize,
    per_request_timeout: Option<Duration>,
    profile_name: String,
    should_retry: Option<RetryPredicate>,
    event_listeners: EventListeners<RetryEvent>,
}

impl RetryPolicyBuilder {
    /// Starts a builder with sane defaults: 3 retries, a 30s overall
    /// budget, and a concurrency cap of 4 per host.
    pub fn new(profile_name: impl Into<String>) -> Self {
        Self {
            max_retries: 3,
            retry_budget: Duration::from_secs(30),
            max_concurrency_per_host: 4,
            per_request_timeout: None,
            profile_name: profile_name.into(),
            should_retry: None,
            event_listeners: EventListeners::new(),
        }
    }

    /// Sets the maximum number of retry attempts (not counting the first).
    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the overall wall-clock budget for the whole call, including
    /// retries.
    pub fn retry_budget(mut self, retry_budget: Duration) -> Self {
        self.retry_budget = retry_budget;
        self
    }

    /// Sets the aggregate concurrency cap for the host this profile targets.
    pub fn max_concurrency_per_host(mut self, max_concurrency_per_host: usize) -> Self {
        self.max_concurrency_per_host = max_concurrency_per_host;
        self
    }

    /// Sets a per-attempt timeout, independent of the overall budget.
    pub fn per_request_timeout(mut self, per_request_timeout: Duration) -> Self {
        self.per_request_timeout = Some(per_request_timeout);
        self
    }

    /// Overrides the default retryable-status classification.
    pub fn should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(Option<u16>) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Some(Arc::new(predicate));
        self
    }

    /// Registers a callback fired before each retry sleep.
    pub fn on_retry<F>(mut self, f: F) -> Self
    where
        F: Fn(usize, Duration) + Send + Sync + 'static,
    {
        self.event_listeners.add(FnListener::new(move |event: &RetryEvent| {
            if let RetryEvent::Retry { attempt, delay, .. } = event {
                f(*attempt, *delay);
            }
        }));
        self
    }

    /// Registers a callback fired when the retry budget is exhausted.
    pub fn on_budget_exhausted<F>(mut self, f: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.event_listeners.add(FnListener::new(move |event: &RetryEvent| {
            if let RetryEvent::BudgetExhausted { attempts, .. } = event {
                f(*attempts);
            }
        }));
        self
    }

    /// Builds the policy.
    pub fn build(self) -> RetryPolicy {
        assert!(self.max_retries >= 1, "max_retries must allow at least the initial attempt");
        assert!(!self.retry_budget.is_zero(), "retry_budget must be non-zero");
        assert!(
            self.max_concurrency_per_host >= 1,
            "max_concurrency_per_host must be at least 1"
        );

        #[cfg(feature = "metrics")]
        {
            describe_counter!("retry_calls_total", "Total number of calls through the send loop, by outcome");
            describe_counter!("retry_attempts_total", "Total number of individual send attempts, including retries");
            describe_histogram!("retry_attempts", "Number of attempts per successful call");
        }

        RetryPolicy {
            max_retries: self.max_retries,
            retry_budget: self.retry_budget,
            max_concurrency_per_host: self.max_concurrency_per_host,
            per_request_timeout: self.per_request_timeout,
            profile_name: self.profile_name,
            should_retry: self.should_retry,
            event_listeners: self.event_listeners,
        }
    }
}

/// The resilience-policy collaborator interface: `get(profile_name) ->
/// {max_retries, retry_budget, max_concurrency_per_host,
/// max_total_concurrency_per_host, per_request_timeout?}`.
pub trait ResiliencePolicyProvider: Send + Sync {
    /// Resolves the policy for `profile_name`.
    fn get(&self, profile_name: &str) -> ResiliencePolicySpec;
}

/// One resolved resilience policy, as returned by a
/// [`ResiliencePolicyProvider`].
#[derive(Debug, Clone)]
pub struct ResiliencePolicySpec {
    /// Maximum retry attempts, not counting the first.
    pub max_retries: usize,
    /// Overall wall-clock budget for the call, including retries.
    pub retry_budget: Duration,
    /// Aggregate concurrency cap for the target host for this profile.
    pub max_concurrency_per_host: usize,
    /// Aggregate concurrency cap across all profiles sharing the host.
    pub max_total_concurrency_per_host: usize,
    /// Optional per-attempt timeout.
    pub per_request_timeout: Option<Duration>,
}

impl ResiliencePolicySpec {
    /// Builds the [`RetryPolicy`] this spec describes for `profile_name`.
    pub fn into_retry_policy(self, profile_name: &str) -> RetryPolicy {
        let mut builder = RetryPolicyBuilder::new(profile_name)
            .max_retries(self.max_retries.max(1))
            .retry_budget(self.retry_budget)
            .max_concurrency_per_host(self.max_total_concurrency_per_host.max(1));
        if let Some(timeout) = self.per_request_timeout {
            builder = builder.per_request_timeout(timeout);
        }
        builder.build()
    }
}

/// A fixed-table reference implementation of [`ResiliencePolicyProvider`],
/// mirroring [`crate::cache::InMemoryCachePolicyProvider`]'s shape: one
/// default spec plus named overrides per profile.
pub struct InMemoryResiliencePolicyProvider {
    default: ResiliencePolicySpec,
    overrides: std::collections::HashMap<String, ResiliencePolicySpec>,
}

impl InMemoryResiliencePolicyProvider {
    /// Creates a provider returning `default` for every profile not
    /// explicitly overridden.
    pub fn new(default: ResiliencePolicySpec) -> Self {
        Self {
            default,
            overrides: std::collections::HashMap::new(),
        }
    }

    /// Registers a profile-specific override.
    pub fn with_profile(mut self, profile_name: impl Into<String>, spec: ResiliencePolicySpec) -> Self {
        self.overrides.insert(profile_name.into(), spec);
        self
    }
}

impl ResiliencePolicyProvider for InMemoryResiliencePolicyProvider {
    fn get(&self, profile_name: &str) -> ResiliencePolicySpec {
        self.overrides
            .get(profile_name)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

impl<F> ResiliencePolicyProvider for F
where
    F: Fn(&str) -> ResiliencePolicySpec + Send + Sync,
{
    fn get(&self, profile_name: &str) -> ResiliencePolicySpec {
        self(profile_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_classification_matches_spec_list() {
        let policy = RetryPolicy::builder("search").build();
        for code in DEFAULT_RETRYABLE_STATUSES {
            assert!(policy.is_retryable(Some(code)));
        }
        assert!(!policy.is_retryable(Some(404)));
        assert!(policy.is_retryable(None));
    }

    #[test]
    fn custom_predicate_overrides_defaults() {
        let policy = RetryPolicy::builder("search")
            .should_retry(|status| status == Some(404))
            .build();
        assert!(policy.is_retryable(Some(404)));
        assert!(!policy.is_retryable(Some(500)));
    }

    #[test]
    #[should_panic(expected = "retry_budget must be non-zero")]
    fn zero_budget_panics() {
        RetryPolicy::builder("search").retry_budget(Duration::ZERO).build();
    }

    #[test]
    fn resilience_policy_provider_falls_back_to_default() {
        let provider = InMemoryResiliencePolicyProvider::new(ResiliencePolicySpec {
            max_retries: 3,
            retry_budget: Duration::from_secs(10),
            max_concurrency_per_host: 4,
            max_total_concurrency_per_host: 8,
            per_request_timeout: None,
        })
        .with_profile(
            "download",
            ResiliencePolicySpec {
                max_retries: 1,
                retry_budget: Duration::from_secs(120),
                max_concurrency_per_host: 1,
                max_total_concurrency_per_host: 2,
                per_request_timeout: Some(Duration::from_secs(30)),
            },
        );

        assert_eq!(provider.get("search").max_retries, 3);
        assert_eq!(provider.get("download").max_retries, 1);
    }
}
