//! Keyed response cache with TTL, sliding expiration, and scope-vary keying.
//!
//! Split across `store.rs` for storage and `entry.rs`/`events.rs` for the
//! rest, following a lock-the-store, mutate, emit-events shape.

mod conditional;
mod entry;
mod error;
mod events;
mod store;

pub use conditional::{ConditionalStateStore, InMemoryConditionalStateStore};
pub use entry::{CacheEntry, CachePolicy, CachePolicyProvider, InMemoryCachePolicyProvider, Validators};
pub use error::CacheError;
pub use events::CacheEvent;

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;

#[cfg(feature = "metrics")]
use metrics::{counter, describe_counter, gauge};

#[cfg(feature = "tracing")]
use tracing::debug;

use crate::clock::SharedClock;
use crate::events::EventListeners;
use crate::options::RequestOptions;

use store::InsertionOrderedStore;

/// Callback invoked whenever a sliding-expiration extension happens:
/// `on_sliding_extended(endpoint, key, previous, new)`.
pub type SlidingExtendedHook = Arc<dyn Fn(&str, &str, Instant, Instant) + Send + Sync>;

/// The response cache for one logical service.
pub struct ResponseCache {
    service_name: String,
    policy_provider: Arc<dyn CachePolicyProvider>,
    clock: SharedClock,
    store: Mutex<InsertionOrderedStore>,
    event_listeners: EventListeners<CacheEvent>,
    on_sliding_extended: Option<SlidingExtendedHook>,
}

impl ResponseCache {
    /// Creates a cache for `service_name` with a fixed entry-count ceiling.
    pub fn new(
        service_name: impl Into<String>,
        max_size: usize,
        policy_provider: Arc<dyn CachePolicyProvider>,
        clock: SharedClock,
    ) -> Self {
        #[cfg(feature = "metrics")]
        {
            describe_counter!("cache_hits_total", "Total number of cache lookups that hit a fresh entry");
            describe_counter!("cache_misses_total", "Total number of cache lookups that found no fresh entry");
            describe_counter!("cache_sets_total", "Total number of entries written to the cache");
            describe_counter!("cache_evictions_total", "Total number of entries evicted to respect max_size");
        }

        Self {
            service_name: service_name.into(),
            policy_provider,
            clock,
            store: Mutex::new(InsertionOrderedStore::new(max_size)),
            event_listeners: EventListeners::new(),
            on_sliding_extended: None,
        }
    }

    /// Registers a listener for every cache event.
    pub fn add_listener<L>(&mut self, listener: L)
    where
        L: crate::events::EventListener<CacheEvent> + 'static,
    {
        self.event_listeners.add(listener);
    }

    /// Registers the `on_sliding_extended` hook.
    pub fn with_sliding_extended_hook(mut self, hook: SlidingExtendedHook) -> Self {
        self.on_sliding_extended = Some(hook);
        self
    }

    /// This cache's service name, used to scope prefix operations.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Resolves the cache policy and fingerprint for `options`, without
    /// touching the store. Exposed so pipeline glue can decide whether to
    /// attach conditional-revalidation headers before re-entering the cache.
    pub fn policy_and_key(&self, options: &RequestOptions) -> (CachePolicy, String) {
        let policy = self
            .policy_provider
            .get_policy(&options.endpoint, &options.canonical_parameters());
        let key = options.fingerprint(policy.vary_by_scope).cache_key();
        (policy, key)
    }

    /// Looks up a fresh entry for `options`. Expired entries are evicted on
    /// read. A sliding-expiration extension, if due, happens atomically with
    /// the read.
    pub fn get(&self, options: &RequestOptions) -> Option<CacheEntry> {
        self.get_or_stale(options).0
    }

    /// Looks up `options`, returning `(fresh_entry, stale_entry)` — exactly
    /// one is ever `Some`. The stale half lets pipeline glue recover a
    /// conditional-revalidation body even though the entry is evicted from
    /// the store on this same read.
    pub fn get_or_stale(&self, options: &RequestOptions) -> (Option<CacheEntry>, Option<CacheEntry>) {
        let (policy, key) = self.policy_and_key(options);
        let now = self.clock.now();

        let mut store = self.store.lock();
        let expired = match store.get(&key) {
            Some(entry) => now > entry.expires_at,
            None => {
                self.emit_miss(&key, now);
                return (None, None);
            }
        };

        if expired {
            let stale = store.get(&key).cloned();
            store.remove(&key);
            self.emit_miss(&key, now);
            return (None, stale);
        }

        if let Some(sliding) = policy.sliding_expiration {
            let refresh_window = policy.resolved_refresh_window();
            let entry = store.get_mut(&key).expect("checked present above");
            if now.duration_since(entry.last_slide_at) >= refresh_window {
                let previous = entry.expires_at;
                entry.expires_at = now + sliding;
                entry.last_slide_at = now;
                let new_expires_at = entry.expires_at;
                drop(store);

                #[cfg(feature = "tracing")]
                debug!(service = %self.service_name, key = %key, "sliding expiration extended");

                self.event_listeners.emit(&CacheEvent::SlidingExtended {
                    service: self.service_name.clone(),
                    endpoint: options.endpoint.clone(),
                    key: key.clone(),
                    previous_expires_at: previous,
                    new_expires_at,
                    timestamp: now,
                });
                if let Some(hook) = &self.on_sliding_extended {
                    hook(&options.endpoint, &key, previous, new_expires_at);
                }

                let mut store = self.store.lock();
                let entry = store.get(&key).cloned();
                self.emit_hit(&key, now);
                return (entry, None);
            }
        }

        let entry = store.get(&key).cloned();
        drop(store);
        self.emit_hit(&key, now);
        (entry, None)
    }

    /// Writes an entry for `options`, evicting the oldest entries if
    /// `max_size` is exceeded.
    pub fn set(
        &self,
        options: &RequestOptions,
        payload: Bytes,
        content_type: impl Into<String>,
        validators: Validators,
    ) {
        let (policy, key) = self.policy_and_key(options);
        let now = self.clock.now();
        let entry = CacheEntry {
            payload,
            content_type: content_type.into(),
            validators,
            created_at: now,
            expires_at: now + policy.duration,
            sliding_expiration: policy.sliding_expiration,
            sliding_refresh_window: policy.resolved_refresh_window(),
            last_slide_at: now,
        };

        let evicted = {
            let mut store = self.store.lock();
            store.insert(key.clone(), entry)
        };

        #[cfg(feature = "metrics")]
        {
            counter!("cache_sets_total", "service" => self.service_name.clone()).increment(1);
            gauge!("cache_size", "service" => self.service_name.clone())
                .set(self.store.lock().len() as f64);
        }

        self.event_listeners.emit(&CacheEvent::Set {
            service: self.service_name.clone(),
            key,
            timestamp: now,
        });
        for (evicted_key, _) in evicted {
            #[cfg(feature = "metrics")]
            counter!("cache_evictions_total", "service" => self.service_name.clone()).increment(1);

            self.event_listeners.emit(&CacheEvent::Eviction {
                service: self.service_name.clone(),
                key: evicted_key,
                timestamp: now,
            });
        }
    }

    /// Removes every entry whose key starts with `"<service_name>|<endpoint>|"`.
    pub fn clear_endpoint(&self, endpoint: &str) -> usize {
        let prefix = format!("{}|{}|", self.service_name, endpoint);
        self.remove_by_prefix_unchecked(&prefix)
    }

    /// Removes every entry whose key starts with `prefix`. Rejects a prefix
    /// that does not scope to this cache's own service, to prevent
    /// cross-service invalidation.
    pub fn invalidate_by_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        let required = format!("{}|", self.service_name);
        if !prefix.starts_with(&required) {
            return Err(CacheError::UnscopedPrefix {
                prefix: prefix.to_string(),
                service: self.service_name.clone(),
            });
        }
        Ok(self.remove_by_prefix_unchecked(prefix))
    }

    /// Counts entries whose key starts with `prefix`, without removing them.
    pub fn count_by_prefix(&self, prefix: &str) -> usize {
        self.store.lock().keys_with_prefix(prefix).count()
    }

    fn remove_by_prefix_unchecked(&self, prefix: &str) -> usize {
        let mut store = self.store.lock();
        let before = store.len();
        let prefix_owned = prefix.to_string();
        store.retain_keys(|k| !k.starts_with(&prefix_owned));
        before - store.len()
    }

    fn emit_hit(&self, key: &str, now: Instant) {
        #[cfg(feature = "metrics")]
        counter!("cache_hits_total", "service" => self.service_name.clone()).increment(1);

        #[cfg(feature = "tracing")]
        debug!(service = %self.service_name, key = %key, "cache hit");

        self.event_listeners.emit(&CacheEvent::Hit {
            service: self.service_name.clone(),
            key: key.to_string(),
            timestamp: now,
        });
    }

    fn emit_miss(&self, key: &str, now: Instant) {
        #[cfg(feature = "metrics")]
        counter!("cache_misses_total", "service" => self.service_name.clone()).increment(1);

        #[cfg(feature = "tracing")]
        debug!(service = %self.service_name, key = %key, "cache miss");

        self.event_listeners.emit(&CacheEvent::Miss {
            service: self.service_name.clone(),
            key: key.to_string(),
            timestamp: now,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    fn cache_with_policy(policy: CachePolicy) -> (ResponseCache, ManualClock) {
        let clock = ManualClock::new();
        let cache = ResponseCache::new(
            "spotify",
            100,
            Arc::new(InMemoryCachePolicyProvider::new(policy)),
            Arc::new(clock.clone()),
        );
        (cache, clock)
    }

    fn options() -> RequestOptions {
        RequestOptions::new("spotify", "/search", "search").with_parameter("q", "beatles")
    }

    #[test]
    fn set_then_get_within_ttl_is_a_hit() {
        let (cache, _clock) = cache_with_policy(CachePolicy::with_duration(Duration::from_secs(60)));
        cache.set(&options(), Bytes::from_static(b"body"), "application/json", Validators::default());
        let entry = cache.get(&options()).expect("expected a hit");
        assert_eq!(entry.payload().as_ref(), b"body");
    }

    #[test]
    fn entry_expires_after_ttl() {
        let (cache, clock) = cache_with_policy(CachePolicy::with_duration(Duration::from_secs(10)));
        cache.set(&options(), Bytes::from_static(b"body"), "application/json", Validators::default());
        clock.advance(Duration::from_secs(11));
        assert!(cache.get(&options()).is_none());
    }

    #[test]
    fn sliding_expiration_extends_on_hit_within_refresh_window() {
        let mut policy = CachePolicy::with_duration(Duration::from_millis(100));
        policy.sliding_expiration = Some(Duration::from_millis(100));
        policy.sliding_refresh_window = Some(Duration::from_millis(200));
        let (cache, clock) = cache_with_policy(policy);

        cache.set(&options(), Bytes::from_static(b"body"), "application/json", Validators::default());

        clock.advance(Duration::from_millis(50));
        assert!(cache.get(&options()).is_some());
        clock.advance(Duration::from_millis(50));
        // Still alive thanks to the slide (would have expired at 100ms otherwise).
        assert!(cache.get(&options()).is_some());
    }

    #[test]
    fn sliding_extension_only_fires_once_per_window_under_concurrency() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let mut policy = CachePolicy::with_duration(Duration::from_millis(100));
        policy.sliding_expiration = Some(Duration::from_millis(100));
        policy.sliding_refresh_window = Some(Duration::from_millis(200));
        let (mut cache, _clock) = cache_with_policy(policy);

        let extensions = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&extensions);
        cache.add_listener(crate::events::FnListener::new(move |event: &CacheEvent| {
            if matches!(event, CacheEvent::SlidingExtended { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));

        cache.set(&options(), Bytes::from_static(b"body"), "application/json", Validators::default());

        for _ in 0..50 {
            cache.get(&options());
        }

        assert_eq!(extensions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn eviction_removes_the_oldest_entry_first() {
        let (cache, _clock) = cache_with_policy(CachePolicy::with_duration(Duration::from_secs(60)));
        let cache = ResponseCache::new(
            "spotify",
            1,
            Arc::new(InMemoryCachePolicyProvider::new(CachePolicy::with_duration(
                Duration::from_secs(60),
            ))),
            cache.clock.clone(),
        );

        let first = RequestOptions::new("spotify", "/search", "search").with_parameter("q", "a");
        let second = RequestOptions::new("spotify", "/search", "search").with_parameter("q", "b");

        cache.set(&first, Bytes::from_static(b"1"), "application/json", Validators::default());
        cache.set(&second, Bytes::from_static(b"2"), "application/json", Validators::default());

        assert!(cache.get(&first).is_none());
        assert!(cache.get(&second).is_some());
    }

    #[test]
    fn invalidate_by_prefix_rejects_unscoped_prefixes() {
        let (cache, _clock) = cache_with_policy(CachePolicy::with_duration(Duration::from_secs(60)));
        let result = cache.invalidate_by_prefix("");
        assert!(matches!(result, Err(CacheError::UnscopedPrefix { .. })));

        let result = cache.invalidate_by_prefix("spotify|/search|");
        assert!(result.is_ok());
    }

    #[test]
    fn clear_endpoint_removes_only_matching_entries() {
        let (cache, _clock) = cache_with_policy(CachePolicy::with_duration(Duration::from_secs(60)));
        cache.set(&options(), Bytes::from_static(b"body"), "application/json", Validators::default());

        let other = RequestOptions::new("spotify", "/detail", "detail").with_parameter("id", "1");
        cache.set(&other, Bytes::from_static(b"other"), "application/json", Validators::default());

        let removed = cache.clear_endpoint("/search");
        assert_eq!(removed, 1);
        assert!(cache.get(&options()).is_none());
        assert!(cache.get(&other).is_some());
    }
}
