//! The integrated call path: cache, conditional revalidation, single-flight
//! deduplication, circuit breaking, and the resilient send loop wired
//! together behind one `call()` entry point.
//!
//! This is where the five subsystems above meet: it follows the same
//! "resolve collaborators, lock nothing across components, emit events as a
//! side effect" shape the rest of this crate uses, composing `cache`,
//! `dedup`, `circuitbreaker`, and `retry` rather than reimplementing any of
//! them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue};
use parking_lot::Mutex;
use reqwest::{Client, Request};

use crate::cache::{CacheEntry, ConditionalStateStore, ResponseCache, Validators};
use crate::cancel::CancellationToken;
use crate::circuitbreaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::clock::SharedClock;
use crate::dedup::{DedupError, SingleFlightDeduplicator};
use crate::error::PipelineError;
use crate::hostgate::{HostGateError, HostGateRegistry};
use crate::options::RequestOptions;
use crate::retry::{self, ExponentialBackoff, ResiliencePolicyProvider};
use crate::sniffer;

/// A factory for per-endpoint circuit breaker configuration. Circuit presets
/// aren't sourced from any of the three collaborator interfaces the pipeline
/// otherwise consumes (resilience policy, cache policy, conditional state) —
/// a plugin host configures them directly, so the pipeline exposes this as
/// its own pluggable hook, defaulting to [`CircuitBreakerConfig::default_preset`].
pub type CircuitConfigFactory = Arc<dyn Fn(&str) -> CircuitBreakerConfig + Send + Sync>;

/// One resolved response from [`Pipeline::call`]: either fetched fresh from
/// cache, synthesized from a `304`, or read straight off the wire.
#[derive(Debug, Clone)]
pub struct PipelineResponse {
    /// The HTTP status as observed by the caller — always `200` for a cache
    /// hit or a revalidated `304`.
    pub status: u16,
    /// The (possibly decompressed) response body.
    pub body: Bytes,
    /// The (possibly corrected) content type.
    pub content_type: String,
    /// `true` if this response was synthesized from a `304` revalidation.
    pub revalidated: bool,
}

impl PipelineResponse {
    fn from_cache_entry(entry: &CacheEntry, revalidated: bool) -> Self {
        Self {
            status: 200,
            body: entry.payload().clone(),
            content_type: entry.content_type().to_string(),
            revalidated,
        }
    }

    /// Reconstructs the response headers a plugin host would see, including
    /// the diagnostic `X-Cache-Revalidated: true` marker on a revalidated
    /// response.
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_str(&self.content_type)
                .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
        );
        if self.revalidated {
            headers.insert(
                HeaderName::from_static("x-cache-revalidated"),
                HeaderValue::from_static("true"),
            );
        }
        headers
    }
}

/// Builds a `reqwest::Client` with redirects disabled at the transport
/// level, the configuration [`retry::send_with_retries`] requires so it can
/// implement redirect handling itself.
pub fn default_http_client() -> reqwest::Result<Client> {
    Client::builder().redirect(reqwest::redirect::Policy::none()).build()
}

/// Wires the cache, deduplicator, circuit breakers, and resilient send loop
/// into one call path for a plugin host.
pub struct Pipeline {
    client: Client,
    host_gate: HostGateRegistry,
    cache: Arc<ResponseCache>,
    dedup: Arc<SingleFlightDeduplicator<PipelineResponse>>,
    conditional_state: Arc<dyn ConditionalStateStore>,
    resilience_policy_provider: Arc<dyn ResiliencePolicyProvider>,
    circuit_breakers: Mutex<HashMap<String, CircuitBreaker>>,
    circuit_config_factory: CircuitConfigFactory,
    backoff: ExponentialBackoff,
    clock: SharedClock,
}

impl Pipeline {
    /// Creates a pipeline from its required collaborators. Host gating,
    /// single-flight deduplication, and circuit breakers are created with
    /// sane defaults; use the `with_*` builders to override them.
    pub fn new(
        client: Client,
        cache: Arc<ResponseCache>,
        resilience_policy_provider: Arc<dyn ResiliencePolicyProvider>,
        conditional_state: Arc<dyn ConditionalStateStore>,
        clock: SharedClock,
    ) -> Self {
        Self {
            client,
            host_gate: HostGateRegistry::new(),
            cache,
            dedup: Arc::new(SingleFlightDeduplicator::new(Duration::from_secs(60))),
            conditional_state,
            resilience_policy_provider,
            circuit_breakers: Mutex::new(HashMap::new()),
            circuit_config_factory: Arc::new(|endpoint: &str| CircuitBreakerConfig::default_preset(endpoint)),
            backoff: ExponentialBackoff::new(
                Duration::from_millis(50),
                Duration::from_secs(2),
                Duration::from_millis(25),
            ),
            clock,
        }
    }

    /// Overrides the overall timeout the single-flight deduplicator imposes
    /// on its producer task, independent of any caller's own cancellation.
    pub fn with_dedup_request_timeout(mut self, timeout: Duration) -> Self {
        self.dedup = Arc::new(SingleFlightDeduplicator::new(timeout));
        self
    }

    /// Overrides the backoff curve the resilient send loop uses between
    /// retries.
    pub fn with_backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Overrides how per-endpoint circuit breaker configuration is resolved.
    /// Defaults to [`CircuitBreakerConfig::default_preset`] for every
    /// endpoint.
    pub fn with_circuit_config_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&str) -> CircuitBreakerConfig + Send + Sync + 'static,
    {
        self.circuit_config_factory = Arc::new(factory);
        self
    }

    /// A snapshot of the single-flight deduplicator's registry occupancy,
    /// exposed so callers can assert `active_requests == 0` once every
    /// caller has finished or cancelled.
    pub fn dedup_statistics(&self) -> crate::dedup::DedupStatistics {
        self.dedup.statistics()
    }

    /// Returns the circuit breaker guarding `endpoint`, creating it from the
    /// configured [`CircuitConfigFactory`] on first use.
    pub fn circuit_breaker_for(&self, endpoint: &str) -> CircuitBreaker {
        let mut breakers = self.circuit_breakers.lock();
        if let Some(existing) = breakers.get(endpoint) {
            return existing.clone();
        }
        let config = (self.circuit_config_factory)(endpoint);
        let breaker = CircuitBreaker::new(config, Arc::clone(&self.clock));
        breakers.insert(endpoint.to_string(), breaker.clone());
        breaker
    }

    /// Runs `request` through the full pipeline: cache lookup, conditional
    /// revalidation, single-flight deduplication, circuit breaking, and the
    /// resilient send loop, in that order.
    ///
    /// `request` must already carry its method, URL, headers, and (if any)
    /// body — only conditional-revalidation headers are added on top.
    pub async fn call(
        &self,
        request: Request,
        options: RequestOptions,
        cancel: &CancellationToken,
    ) -> Result<PipelineResponse, PipelineError> {
        let (policy, key) = self.cache.policy_and_key(&options);
        let (fresh, stale) = self.cache.get_or_stale(&options);

        if let Some(entry) = fresh {
            return Ok(PipelineResponse::from_cache_entry(&entry, false));
        }

        let validators = if policy.enable_conditional_revalidation {
            stale
                .as_ref()
                .map(|entry| entry.validators().clone())
                .filter(|v| !v.is_empty())
                .or_else(|| self.conditional_state.try_get_validators(&key))
        } else {
            None
        };

        let host = request.url().host_str().unwrap_or_default().to_string();
        let endpoint = options.endpoint.clone();
        let profile = options.profile.clone();

        let client = self.client.clone();
        let host_gate = self.host_gate.clone();
        let resilience_policy_provider = Arc::clone(&self.resilience_policy_provider);
        let circuit_breaker = self.circuit_breaker_for(&endpoint);
        let backoff = self.backoff.clone();
        let clock = Arc::clone(&self.clock);
        let cache = Arc::clone(&self.cache);
        let conditional_state = Arc::clone(&self.conditional_state);
        let cache_options = options.clone();
        let cache_key = key.clone();
        let producer_cancel = cancel.clone();
        let stale_for_producer = stale;

        let producer = move || async move {
            let mut attempt_request = request;
            if let Some(validators) = &validators {
                attach_validators(&mut attempt_request, validators);
            }

            let resolved = resilience_policy_provider.get(&profile);
            let retry_policy = resolved.into_retry_policy(&profile);

            let response = circuit_breaker
                .execute(Some(&endpoint), || {
                    retry::execute(
                        &host_gate,
                        &host,
                        &client,
                        attempt_request,
                        &retry_policy,
                        &backoff,
                        &clock,
                        &producer_cancel,
                    )
                })
                .await?;

            let status = response.status().as_u16();
            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("application/octet-stream")
                .to_string();
            let content_encoding = response
                .headers()
                .get(reqwest::header::CONTENT_ENCODING)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let response_validators = read_validators(response.headers());

            let body = tokio::select! {
                biased;
                _ = producer_cancel.cancelled() => return Err(PipelineError::Cancelled),
                result = response.bytes() => result.map_err(|e| PipelineError::Transport(e.to_string()))?,
            };

            if status == 304 {
                return Ok(handle_not_modified(
                    stale_for_producer.as_ref(),
                    response_validators,
                    content_type,
                    &cache,
                    &cache_options,
                    &conditional_state,
                    &cache_key,
                ));
            }

            let sniffed = sniffer::sniff(body, content_encoding.as_deref(), &content_type)?;

            if (200..300).contains(&status) {
                cache.set(
                    &cache_options,
                    sniffed.bytes.clone(),
                    sniffed.content_type.clone(),
                    response_validators.clone().unwrap_or_default(),
                );
                if let Some(v) = response_validators {
                    conditional_state.set_validators(&cache_key, v);
                }
            }

            Ok(PipelineResponse {
                status,
                body: sniffed.bytes,
                content_type: sniffed.content_type,
                revalidated: false,
            })
        };

        match self.dedup.get_or_create(key, producer, cancel, None).await {
            Ok(response) => Ok((*response).clone()),
            Err(err) => Err(into_pipeline_error(err)),
        }
    }
}

/// Synthesizes the `200 OK` a `304` revalidation produces: the cached body
/// and content type, a refreshed `expires_at` (via a fresh `set`), and
/// updated validators if the upstream sent new ones.
fn handle_not_modified(
    stale: Option<&CacheEntry>,
    response_validators: Option<Validators>,
    fallback_content_type: String,
    cache: &ResponseCache,
    cache_options: &RequestOptions,
    conditional_state: &Arc<dyn ConditionalStateStore>,
    cache_key: &str,
) -> PipelineResponse {
    let Some(stale_entry) = stale else {
        return PipelineResponse {
            status: 200,
            body: Bytes::new(),
            content_type: fallback_content_type,
            revalidated: true,
        };
    };

    let validators = response_validators.unwrap_or_else(|| stale_entry.validators().clone());
    cache.set(
        cache_options,
        stale_entry.payload().clone(),
        stale_entry.content_type().to_string(),
        validators.clone(),
    );
    if !validators.is_empty() {
        conditional_state.set_validators(cache_key, validators);
    }

    PipelineResponse {
        status: 200,
        body: stale_entry.payload().clone(),
        content_type: stale_entry.content_type().to_string(),
        revalidated: true,
    }
}

fn attach_validators(request: &mut Request, validators: &Validators) {
    if let Some(etag) = &validators.etag {
        if let Ok(value) = HeaderValue::from_str(etag) {
            request.headers_mut().insert(reqwest::header::IF_NONE_MATCH, value);
        }
    }
    if let Some(last_modified) = &validators.last_modified {
        if let Ok(value) = HeaderValue::from_str(last_modified) {
            request.headers_mut().insert(reqwest::header::IF_MODIFIED_SINCE, value);
        }
    }
}

fn read_validators(headers: &HeaderMap) -> Option<Validators> {
    let etag = headers
        .get(reqwest::header::ETAG)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let last_modified = headers
        .get(reqwest::header::LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    if etag.is_none() && last_modified.is_none() {
        None
    } else {
        Some(Validators { etag, last_modified })
    }
}

/// Converts a dedup-layer failure into a [`PipelineError`], preserving the
/// original variant (recursively, for `BudgetExhausted`'s nested source)
/// rather than collapsing everything to a generic terminal error.
fn into_pipeline_error(err: DedupError) -> PipelineError {
    match err {
        DedupError::Cancelled => PipelineError::Cancelled,
        DedupError::Upstream(inner) => clone_pipeline_error(&inner),
    }
}

fn clone_pipeline_error(err: &PipelineError) -> PipelineError {
    match err {
        PipelineError::CircuitOpen {
            circuit_name,
            operation_name,
            retry_after,
        } => PipelineError::CircuitOpen {
            circuit_name: circuit_name.clone(),
            operation_name: operation_name.clone(),
            retry_after: *retry_after,
        },
        PipelineError::BudgetExhausted { source } => PipelineError::BudgetExhausted {
            source: Box::new(clone_pipeline_error(source)),
        },
        PipelineError::Cancelled => PipelineError::Cancelled,
        PipelineError::Terminal(msg) => PipelineError::Terminal(msg.clone()),
        PipelineError::Transport(msg) => PipelineError::Transport(msg.clone()),
        PipelineError::Cache(e) => PipelineError::Terminal(e.to_string()),
        PipelineError::Dedup(DedupError::Cancelled) => PipelineError::Cancelled,
        PipelineError::Dedup(DedupError::Upstream(inner)) => clone_pipeline_error(inner),
        PipelineError::HostGate(HostGateError::Cancelled { .. }) => PipelineError::Cancelled,
        PipelineError::HostGate(e) => PipelineError::Terminal(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CachePolicy, InMemoryCachePolicyProvider, InMemoryConditionalStateStore};
    use crate::clock::ManualClock;
    use crate::retry::{InMemoryResiliencePolicyProvider, ResiliencePolicySpec};

    fn pipeline(clock: SharedClock, cache_policy: CachePolicy) -> Pipeline {
        let cache = Arc::new(ResponseCache::new(
            "example",
            100,
            Arc::new(InMemoryCachePolicyProvider::new(cache_policy)),
            Arc::clone(&clock),
        ));
        let resilience = Arc::new(InMemoryResiliencePolicyProvider::new(ResiliencePolicySpec {
            max_retries: 2,
            retry_budget: Duration::from_secs(5),
            max_concurrency_per_host: 4,
            max_total_concurrency_per_host: 4,
            per_request_timeout: None,
        }));
        let conditional = Arc::new(InMemoryConditionalStateStore::new());
        let client = default_http_client().unwrap();
        Pipeline::new(client, cache, resilience, conditional, clock)
            .with_backoff(ExponentialBackoff::new(
                Duration::from_millis(1),
                Duration::from_millis(5),
                Duration::ZERO,
            ))
            .with_dedup_request_timeout(Duration::from_secs(5))
    }

    fn options() -> RequestOptions {
        RequestOptions::new("example", "/search", "search").with_parameter("q", "beatles")
    }

    #[tokio::test]
    async fn fifty_concurrent_callers_collapse_into_one_upstream_call() {
        let server = wiremock::MockServer::start().await;
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(move |_: &wiremock::Request| {
                calls_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                wiremock::ResponseTemplate::new(200)
                    .insert_header("content-type", "application/json")
                    .set_body_raw(br#"{"ok":true}"#.to_vec(), "application/json")
            })
            .mount(&server)
            .await;

        let clock: SharedClock = Arc::new(ManualClock::new());
        let pipeline = Arc::new(pipeline(clock, CachePolicy::with_duration(Duration::from_secs(60))));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let pipeline = Arc::clone(&pipeline);
            let url = server.uri();
            handles.push(tokio::spawn(async move {
                let client = default_http_client().unwrap();
                let request = client.get(&url).build().unwrap();
                let cancel = CancellationToken::new();
                pipeline.call(request, options(), &cancel).await
            }));
        }

        for handle in handles {
            let response = handle.await.unwrap().unwrap();
            assert_eq!(response.status, 200);
            assert_eq!(response.body.as_ref(), br#"{"ok":true}"#);
        }

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(pipeline.dedup_statistics().active_requests, 0);
    }

    #[tokio::test]
    async fn second_call_is_served_from_cache_without_a_network_request() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(
                wiremock::ResponseTemplate::new(200)
                    .insert_header("content-type", "application/json")
                    .set_body_raw(br#"{"ok":true}"#.to_vec(), "application/json"),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;

        let clock: SharedClock = Arc::new(ManualClock::new());
        let pipeline = pipeline(clock, CachePolicy::with_duration(Duration::from_secs(60)));
        let client = default_http_client().unwrap();

        for _ in 0..2 {
            let request = client.get(server.uri()).build().unwrap();
            let cancel = CancellationToken::new();
            let response = pipeline.call(request, options(), &cancel).await.unwrap();
            assert_eq!(response.status, 200);
        }
    }

    #[tokio::test]
    async fn a_304_is_synthesized_into_a_revalidated_200() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(
                wiremock::ResponseTemplate::new(200)
                    .insert_header("content-type", "application/json")
                    .insert_header("etag", "\"v1\"")
                    .set_body_raw(br#"{"ok":true}"#.to_vec(), "application/json"),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(wiremock::ResponseTemplate::new(304))
            .mount(&server)
            .await;

        let clock = Arc::new(ManualClock::new());
        let mut policy = CachePolicy::with_duration(Duration::from_millis(10));
        policy.enable_conditional_revalidation = true;
        let pipeline = pipeline(clock.clone() as SharedClock, policy);
        let client = default_http_client().unwrap();

        let first = client.get(server.uri()).build().unwrap();
        let response = pipeline.call(first, options(), &CancellationToken::new()).await.unwrap();
        assert!(!response.revalidated);

        clock.advance(Duration::from_millis(20));

        let second = client.get(server.uri()).build().unwrap();
        let response = pipeline.call(second, options(), &CancellationToken::new()).await.unwrap();
        assert!(response.revalidated);
        assert_eq!(response.body.as_ref(), br#"{"ok":true}"#);
        assert!(response.headers().get("x-cache-revalidated").is_some());
    }

    #[tokio::test]
    async fn cancellation_before_the_first_send_leaves_cache_and_registry_empty() {
        let server = wiremock::MockServer::start().await;
        let clock: SharedClock = Arc::new(ManualClock::new());
        let pipeline = pipeline(clock, CachePolicy::with_duration(Duration::from_secs(60)));
        let client = default_http_client().unwrap();
        let request = client.get(server.uri()).build().unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = pipeline.call(request, options(), &cancel).await;
        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(pipeline.dedup_statistics().active_requests, 0);
        assert!(pipeline.cache.get(&options()).is_none());
    }
}
