//! Host-fair concurrency gating.
//!
//! An acquire / wait-with-timeout / emit-events / release shape around one
//! aggregate semaphore per host. A host's concurrency ceiling must be able
//! to grow at runtime without invalidating permits already held by
//! in-flight calls, and must never shrink. `tokio::sync::Semaphore::add_permits`
//! adds capacity to the *same* semaphore instance, so every outstanding
//! `OwnedSemaphorePermit` stays valid across a grow — that primitive alone
//! satisfies the "preserve identity for already-issued permits" requirement
//! without needing to swap out the underlying pool.

mod error;
mod events;

pub use error::HostGateError;
pub use events::HostGateEvent;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

#[cfg(feature = "tracing")]
use tracing::debug;

use crate::cancel::CancellationToken;
use crate::events::EventListeners;

struct HostGateInner {
    host: String,
    semaphore: Arc<Semaphore>,
    capacity: AtomicUsize,
    listeners: EventListeners<HostGateEvent>,
}

/// A single host's concurrency gate.
#[derive(Clone)]
pub struct HostGate {
    inner: Arc<HostGateInner>,
}

impl HostGate {
    fn new(host: String, capacity: usize, listeners: EventListeners<HostGateEvent>) -> Self {
        Self {
            inner: Arc::new(HostGateInner {
                host,
                semaphore: Arc::new(Semaphore::new(capacity)),
                capacity: AtomicUsize::new(capacity),
                listeners,
            }),
        }
    }

    /// Current capacity (monotonically non-decreasing over this gate's life).
    pub fn capacity(&self) -> usize {
        self.inner.capacity.load(Ordering::SeqCst)
    }

    /// Permits currently checked out.
    pub fn in_use(&self) -> usize {
        self.capacity()
            .saturating_sub(self.inner.semaphore.available_permits())
    }

    /// Grows this gate's capacity to `desired` if `desired` exceeds the
    /// current capacity. A no-op when `desired` is not larger — capacity
    /// never shrinks.
    pub fn grow_to(&self, desired: usize) {
        loop {
            let current = self.inner.capacity.load(Ordering::SeqCst);
            if desired <= current {
                return;
            }
            if self
                .inner
                .capacity
                .compare_exchange(current, desired, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.inner.semaphore.add_permits(desired - current);

                #[cfg(feature = "metrics")]
                counter!("hostgate_capacity_grown_total", "host" => self.inner.host.clone())
                    .increment(1);

                #[cfg(feature = "tracing")]
                debug!(host = %self.inner.host, previous_capacity = current, new_capacity = desired, "host gate capacity grew");

                self.inner.listeners.emit(&HostGateEvent::CapacityGrew {
                    host: self.inner.host.clone(),
                    previous_capacity: current,
                    new_capacity: desired,
                    timestamp: Instant::now(),
                });
                return;
            }
        }
    }

    /// Acquires a permit, waiting up to `max_wait` (if set) or until
    /// `cancel` fires.
    pub async fn acquire(
        &self,
        max_wait: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<GatePermit, HostGateError> {
        let semaphore = Arc::clone(&self.inner.semaphore);
        let acquire_fut = semaphore.acquire_owned();

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                #[cfg(feature = "metrics")]
                counter!("hostgate_acquire_abandoned_total", "host" => self.inner.host.clone(), "reason" => "cancelled")
                    .increment(1);

                self.inner.listeners.emit(&HostGateEvent::AcquireAbandoned {
                    host: self.inner.host.clone(),
                    reason: "cancelled",
                    timestamp: Instant::now(),
                });
                return Err(HostGateError::Cancelled { host: self.inner.host.clone() });
            }
            result = timed(acquire_fut, max_wait) => {
                match result {
                    Some(Ok(permit)) => permit,
                    Some(Err(_)) => unreachable!("host gate semaphore is never closed"),
                    None => {
                        #[cfg(feature = "metrics")]
                        counter!("hostgate_acquire_abandoned_total", "host" => self.inner.host.clone(), "reason" => "timeout")
                            .increment(1);

                        self.inner.listeners.emit(&HostGateEvent::AcquireAbandoned {
                            host: self.inner.host.clone(),
                            reason: "timeout",
                            timestamp: Instant::now(),
                        });
                        return Err(HostGateError::Timeout {
                            host: self.inner.host.clone(),
                            waited: max_wait.unwrap_or_default(),
                        });
                    }
                }
            }
        };

        #[cfg(feature = "metrics")]
        {
            counter!("hostgate_acquired_total", "host" => self.inner.host.clone()).increment(1);
            gauge!("hostgate_in_use", "host" => self.inner.host.clone()).set(self.in_use() as f64);
        }

        #[cfg(feature = "tracing")]
        debug!(host = %self.inner.host, in_use = self.in_use(), capacity = self.capacity(), "host gate permit acquired");

        self.inner.listeners.emit(&HostGateEvent::PermitAcquired {
            host: self.inner.host.clone(),
            in_use: self.in_use(),
            capacity: self.capacity(),
            timestamp: Instant::now(),
        });

        Ok(GatePermit {
            _permit: permit,
            gate: self.inner.clone(),
        })
    }
}

async fn timed<F, T>(fut: F, max_wait: Option<Duration>) -> Option<T>
where
    F: std::future::Future<Output = T>,
{
    match max_wait {
        Some(duration) => tokio::time::timeout(duration, fut).await.ok(),
        None => Some(fut.await),
    }
}

/// A held slot on a host gate. Releases automatically on drop.
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
    gate: Arc<HostGateInner>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        let in_use = self
            .gate
            .capacity
            .load(Ordering::SeqCst)
            .saturating_sub(self.gate.semaphore.available_permits() + 1);

        #[cfg(feature = "metrics")]
        gauge!("hostgate_in_use", "host" => self.gate.host.clone()).set(in_use as f64);

        self.gate.listeners.emit(&HostGateEvent::PermitReleased {
            host: self.gate.host.clone(),
            in_use,
            timestamp: Instant::now(),
        });
    }
}

/// Owns one [`HostGate`] per host, creating and growing them on demand.
#[derive(Clone, Default)]
pub struct HostGateRegistry {
    gates: Arc<Mutex<HashMap<String, HostGate>>>,
}

impl HostGateRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the gate for `host`, creating it with `default_capacity` if it
    /// does not yet exist, and growing it to `default_capacity` if it does
    /// and is currently smaller.
    pub fn gate_for(&self, host: &str, default_capacity: usize) -> HostGate {
        let mut gates = self.gates.lock();
        if let Some(gate) = gates.get(host) {
            gate.grow_to(default_capacity);
            return gate.clone();
        }
        let gate = HostGate::new(host.to_string(), default_capacity, EventListeners::new());
        gates.insert(host.to_string(), gate.clone());
        gate
    }
}
