//! Single-flight request deduplication.
//!
//! A `Mutex<HashMap<K, broadcast::Sender<...>>>` in-flight registry:
//! the first caller for a key becomes the leader and runs the factory,
//! later callers subscribe to its broadcast, and a drop guard removes an
//! abandoned leader from the map. An explicit reference count on each
//! in-flight record lets the producer be aborted once every holder has
//! left through cancellation; an overall `request_timeout` bounds the
//! producer regardless of callers; and a per-call timeout lets a joiner
//! fall back to running its own factory without disturbing the original
//! producer. Dropping the deduplicator itself aborts every still-running
//! producer and closes their broadcast channels, so any caller still
//! waiting on one observes [`DedupError::Cancelled`] rather than a hang.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;

#[cfg(feature = "metrics")]
use metrics::{counter, describe_counter, gauge};

#[cfg(feature = "tracing")]
use tracing::debug;

use crate::cancel::CancellationToken;
use crate::error::PipelineError;

/// What a joiner observes once the leader's factory resolves.
type Outcome<T> = Result<Arc<T>, Arc<PipelineError>>;

/// Failure modes for [`SingleFlightDeduplicator::get_or_create`].
#[derive(Debug, Clone, Error)]
pub enum DedupError {
    /// The producer (or this caller's own fallback factory) returned an
    /// error.
    #[error("upstream error: {0}")]
    Upstream(Arc<PipelineError>),
    /// This caller's cancellation token fired, or the producer was dropped
    /// without completing (e.g. deduplicator disposal, or every holder
    /// cancelled and the producer was aborted).
    #[error("cancelled")]
    Cancelled,
}

/// `{active_requests}` must read `0` once every caller has finished or
/// cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupStatistics {
    /// Number of distinct keys with at least one holder.
    pub active_requests: usize,
}

struct InFlightEntry<T> {
    sender: broadcast::Sender<Outcome<T>>,
    ref_count: Arc<AtomicUsize>,
    abort_handle: Option<AbortHandle>,
}

/// Collapses concurrent identical requests for one response type `T` into a
/// single producer call.
pub struct SingleFlightDeduplicator<T: Send + Sync + 'static> {
    in_flight: Arc<Mutex<HashMap<String, InFlightEntry<T>>>>,
    request_timeout: Duration,
}

impl<T: Send + Sync + 'static> SingleFlightDeduplicator<T> {
    /// Creates a deduplicator whose producers are aborted if they run past
    /// `request_timeout`, independent of any caller's own cancellation.
    pub fn new(request_timeout: Duration) -> Self {
        #[cfg(feature = "metrics")]
        {
            describe_counter!(
                "dedup_joins_total",
                "Total number of calls into the single-flight deduplicator, by role"
            );
        }

        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            request_timeout,
        }
    }

    /// A snapshot of registry occupancy.
    pub fn statistics(&self) -> DedupStatistics {
        let active_requests = self.in_flight.lock().len();

        #[cfg(feature = "metrics")]
        gauge!("dedup_active_requests").set(active_requests as f64);

        DedupStatistics { active_requests }
    }

    /// Runs `factory` for `key`, or joins another in-flight call for the
    /// same key.
    ///
    /// `factory` is always supplied, even by a joiner: it is only invoked if
    /// this caller becomes the leader, or if it is joining and `call_timeout`
    /// elapses before the leader's result arrives, so that joining a stuck
    /// producer cannot exceed the caller's own deadline.
    pub async fn get_or_create<F, Fut>(
        &self,
        key: impl Into<String>,
        factory: F,
        cancel: &CancellationToken,
        call_timeout: Option<Duration>,
    ) -> Result<Arc<T>, DedupError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, PipelineError>> + Send + 'static,
    {
        let key = key.into();

        let joined = {
            let map = self.in_flight.lock();
            map.get(&key).map(|entry| {
                entry.ref_count.fetch_add(1, Ordering::SeqCst);
                (entry.sender.subscribe(), Arc::clone(&entry.ref_count))
            })
        };

        if let Some((rx, ref_count)) = joined {
            #[cfg(feature = "metrics")]
            counter!("dedup_joins_total", "role" => "waiter").increment(1);

            #[cfg(feature = "tracing")]
            debug!(key = %key, "joining in-flight request as waiter");

            return self.wait(key, rx, ref_count, Some(factory), cancel, call_timeout).await;
        }

        #[cfg(feature = "metrics")]
        counter!("dedup_joins_total", "role" => "leader").increment(1);

        #[cfg(feature = "tracing")]
        debug!(key = %key, "becoming leader for in-flight request");

        // Become the leader.
        let (tx, rx) = broadcast::channel(1);
        let ref_count = Arc::new(AtomicUsize::new(1));

        let producer_sender = tx.clone();
        let producer_map = Arc::clone(&self.in_flight);
        let producer_key = key.clone();
        let request_timeout = self.request_timeout;

        let join_handle = tokio::spawn(async move {
            let outcome = match tokio::time::timeout(request_timeout, factory()).await {
                Ok(Ok(value)) => Ok(Arc::new(value)),
                Ok(Err(err)) => Err(Arc::new(err)),
                Err(_elapsed) => Err(Arc::new(PipelineError::Cancelled)),
            };

            let mut map = producer_map.lock();
            let _ = producer_sender.send(outcome);
            map.remove(&producer_key);
        });

        {
            let mut map = self.in_flight.lock();
            map.insert(
                key.clone(),
                InFlightEntry {
                    sender: tx,
                    ref_count: Arc::clone(&ref_count),
                    abort_handle: Some(join_handle.abort_handle()),
                },
            );
        }

        self.wait::<fn() -> std::future::Ready<Result<T, PipelineError>>, _>(
            key, rx, ref_count, None, cancel, None,
        )
        .await
    }

    async fn wait<F, Fut>(
        &self,
        key: String,
        mut rx: broadcast::Receiver<Outcome<T>>,
        ref_count: Arc<AtomicUsize>,
        fallback_factory: Option<F>,
        cancel: &CancellationToken,
        call_timeout: Option<Duration>,
    ) -> Result<Arc<T>, DedupError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, PipelineError>> + Send + 'static,
    {
        let _guard = HolderGuard {
            key: key.clone(),
            ref_count: Arc::clone(&ref_count),
            in_flight: Arc::clone(&self.in_flight),
        };

        let timeout_fut = async {
            match call_timeout {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(timeout_fut);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DedupError::Cancelled),
            recv_result = rx.recv() => match recv_result {
                Ok(outcome) => outcome.map_err(DedupError::Upstream),
                Err(_closed) => Err(DedupError::Cancelled),
            },
            _ = &mut timeout_fut => {
                drop(_guard);
                match fallback_factory {
                    Some(factory) => factory()
                        .await
                        .map(Arc::new)
                        .map_err(|e| DedupError::Upstream(Arc::new(e))),
                    None => Err(DedupError::Cancelled),
                }
            }
        }
    }
}

/// Decrements the shared ref count on drop; if this was the last holder,
/// aborts the producer (if still running) and removes the registry entry —
/// satisfying "the registry MUST contain zero active entries after all
/// callers finish or cancel" even when every holder cancelled before the
/// producer resolved.
struct HolderGuard<T: Send + Sync + 'static> {
    key: String,
    ref_count: Arc<AtomicUsize>,
    in_flight: Arc<Mutex<HashMap<String, InFlightEntry<T>>>>,
}

impl<T: Send + Sync + 'static> Drop for SingleFlightDeduplicator<T> {
    /// Aborts every still-running producer and drops its broadcast sender,
    /// so any waiter's next `rx.recv()` sees the channel closed and resolves
    /// to [`DedupError::Cancelled`] rather than hanging past the
    /// deduplicator's own lifetime.
    fn drop(&mut self) {
        let mut map = self.in_flight.lock();
        for (_, entry) in map.drain() {
            if let Some(handle) = entry.abort_handle {
                handle.abort();
            }
        }
    }
}

impl<T: Send + Sync + 'static> Drop for HolderGuard<T> {
    fn drop(&mut self) {
        if self.ref_count.fetch_sub(1, Ordering::SeqCst) == 1 {
            let mut map = self.in_flight.lock();
            if let Some(entry) = map.get(&self.key) {
                if entry.ref_count.load(Ordering::SeqCst) == 0 {
                    if let Some(handle) = &entry.abort_handle {
                        handle.abort();
                    }
                    map.remove(&self.key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn fifty_concurrent_callers_invoke_the_factory_once() {
        let dedup: Arc<SingleFlightDeduplicator<u32>> =
            Arc::new(SingleFlightDeduplicator::new(Duration::from_secs(5)));
        let calls = Arc::new(StdAtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let dedup = Arc::clone(&dedup);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                dedup
                    .get_or_create(
                        "k",
                        move || {
                            let calls = Arc::clone(&calls);
                            async move {
                                calls.fetch_add(1, Ordering::SeqCst);
                                tokio::time::sleep(Duration::from_millis(20)).await;
                                Ok(42u32)
                            }
                        },
                        &cancel,
                        None,
                    )
                    .await
            }));
        }

        for handle in handles {
            let result = handle.await.unwrap();
            assert_eq!(*result.unwrap(), 42);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dedup.statistics().active_requests, 0);
    }

    #[tokio::test]
    async fn cancelling_all_joiners_before_completion_leaves_the_registry_empty() {
        let dedup: Arc<SingleFlightDeduplicator<u32>> =
            Arc::new(SingleFlightDeduplicator::new(Duration::from_secs(5)));
        let leader_cancel = CancellationToken::new();
        let joiner_cancel = CancellationToken::new();

        let dedup_leader = Arc::clone(&dedup);
        let leader_cancel_clone = leader_cancel.clone();
        let leader = tokio::spawn(async move {
            dedup_leader
                .get_or_create(
                    "k",
                    || async {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                        Ok(1u32)
                    },
                    &leader_cancel_clone,
                    None,
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;

        let dedup_joiner = Arc::clone(&dedup);
        let joiner_cancel_clone = joiner_cancel.clone();
        let joiner = tokio::spawn(async move {
            dedup_joiner
                .get_or_create("k", || async { Ok(1u32) }, &joiner_cancel_clone, None)
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(dedup.statistics().active_requests, 1);

        leader_cancel.cancel();
        joiner_cancel.cancel();

        let leader_result = leader.await.unwrap();
        let joiner_result = joiner.await.unwrap();
        assert!(matches!(leader_result, Err(DedupError::Cancelled)));
        assert!(matches!(joiner_result, Err(DedupError::Cancelled)));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(dedup.statistics().active_requests, 0);
    }

    #[tokio::test]
    async fn joiner_falls_back_to_its_own_factory_on_timeout() {
        let dedup: Arc<SingleFlightDeduplicator<u32>> =
            Arc::new(SingleFlightDeduplicator::new(Duration::from_secs(5)));
        let leader_cancel = CancellationToken::new();

        let dedup_leader = Arc::clone(&dedup);
        let leader_cancel_clone = leader_cancel.clone();
        let _leader = tokio::spawn(async move {
            dedup_leader
                .get_or_create(
                    "k",
                    || async {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                        Ok(1u32)
                    },
                    &leader_cancel_clone,
                    None,
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;

        let joiner_cancel = CancellationToken::new();
        let result = dedup
            .get_or_create(
                "k",
                || async { Ok(99u32) },
                &joiner_cancel,
                Some(Duration::from_millis(20)),
            )
            .await;

        assert_eq!(*result.unwrap(), 99);
        leader_cancel.cancel();
    }

    #[tokio::test]
    async fn dropping_the_deduplicator_aborts_producers_and_closes_waiters() {
        let dedup: SingleFlightDeduplicator<u32> = SingleFlightDeduplicator::new(Duration::from_secs(5));

        let ran_to_completion = Arc::new(StdAtomicUsize::new(0));
        let ran_to_completion_clone = Arc::clone(&ran_to_completion);
        let producer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            ran_to_completion_clone.fetch_add(1, Ordering::SeqCst);
        });

        let (tx, mut rx) = broadcast::channel::<Outcome<u32>>(1);
        dedup.in_flight.lock().insert(
            "k".to_string(),
            InFlightEntry {
                sender: tx,
                ref_count: Arc::new(AtomicUsize::new(1)),
                abort_handle: Some(producer.abort_handle()),
            },
        );

        drop(dedup);

        assert!(producer.await.unwrap_err().is_cancelled());
        assert_eq!(ran_to_completion.load(Ordering::SeqCst), 0);
        assert!(matches!(rx.recv().await, Err(broadcast::error::RecvError::Closed)));
    }
}
