//! Cache entries and the cache-policy collaborator interface.
//!
//! Plain-struct config types modeling TTL, sliding expiration, and
//! validators together, plus the per-endpoint cache policy collaborator.

use std::time::{Duration, Instant};

use bytes::Bytes;

/// Cached response validators, used for conditional revalidation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validators {
    /// The `ETag` response header, if the upstream sent one.
    pub etag: Option<String>,
    /// The `Last-Modified` response header, if the upstream sent one.
    pub last_modified: Option<String>,
}

impl Validators {
    /// Returns `true` if neither validator is present.
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// One stored response.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub(crate) payload: Bytes,
    pub(crate) content_type: String,
    pub(crate) validators: Validators,
    pub(crate) created_at: Instant,
    pub(crate) expires_at: Instant,
    pub(crate) sliding_expiration: Option<Duration>,
    pub(crate) sliding_refresh_window: Duration,
    pub(crate) last_slide_at: Instant,
}

impl CacheEntry {
    /// The cached response body.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// The declared media type of [`payload`](Self::payload).
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Known validators for conditional revalidation.
    pub fn validators(&self) -> &Validators {
        &self.validators
    }

    /// When this entry was created (or last refreshed by a `200`/`304`).
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When this entry expires absent a sliding extension.
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }
}

/// Per-endpoint cache behavior, supplied by the plugin host.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    /// Time-to-live applied on `set`.
    pub duration: Duration,
    /// If set, a hit within `sliding_refresh_window` of the last slide
    /// extends `expires_at` to `now + sliding_expiration`.
    pub sliding_expiration: Option<Duration>,
    /// Minimum interval between sliding-expiration extensions. Defaults to
    /// `sliding_expiration` itself when sliding is enabled but this is unset.
    pub sliding_refresh_window: Option<Duration>,
    /// Whether a stale/missing entry should be conditionally revalidated
    /// rather than unconditionally refetched.
    pub enable_conditional_revalidation: bool,
    /// Whether the cache key includes the request's auth scope.
    pub vary_by_scope: bool,
}

impl CachePolicy {
    /// A policy with only a TTL: no sliding expiration, no revalidation, no
    /// scope variance.
    pub fn with_duration(duration: Duration) -> Self {
        Self {
            duration,
            sliding_expiration: None,
            sliding_refresh_window: None,
            enable_conditional_revalidation: false,
            vary_by_scope: false,
        }
    }

    pub(crate) fn resolved_refresh_window(&self) -> Duration {
        self.sliding_refresh_window
            .or(self.sliding_expiration)
            .unwrap_or(Duration::ZERO)
    }
}

/// Supplies [`CachePolicy`] for a given endpoint and canonical parameter
/// string.
pub trait CachePolicyProvider: Send + Sync {
    /// Resolves the policy for `endpoint` with canonical query `params`.
    fn get_policy(&self, endpoint: &str, params: &str) -> CachePolicy;
}

/// A fixed, endpoint-agnostic policy provider — useful for tests and for
/// plugin hosts with a single uniform cache policy.
pub struct InMemoryCachePolicyProvider {
    policy: CachePolicy,
}

impl InMemoryCachePolicyProvider {
    /// Creates a provider that returns `policy` for every endpoint.
    pub fn new(policy: CachePolicy) -> Self {
        Self { policy }
    }
}

impl CachePolicyProvider for InMemoryCachePolicyProvider {
    fn get_policy(&self, _endpoint: &str, _params: &str) -> CachePolicy {
        self.policy.clone()
    }
}

impl<F> CachePolicyProvider for F
where
    F: Fn(&str, &str) -> CachePolicy + Send + Sync,
{
    fn get_policy(&self, endpoint: &str, params: &str) -> CachePolicy {
        self(endpoint, params)
    }
}
