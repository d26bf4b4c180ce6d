//! Event system shared by every subsystem.
//!
//! A typed event trait, a panic-isolated listener collection, and a
//! closure-based listener, because every subsystem in this crate (circuit
//! breaker, cache, host gate, dedup) wants the same fan-out semantics:
//! state changes and sliding-expiration extensions must notify observers
//! exactly once, and a misbehaving listener must not take down the others.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Trait for events emitted by a subsystem.
pub trait SubsystemEvent: Send + Sync + fmt::Debug {
    /// Machine-readable event type, e.g. `"state_transition"`.
    fn event_type(&self) -> &'static str;
    /// When the event occurred.
    fn timestamp(&self) -> Instant;
    /// Name of the subsystem instance that emitted this event.
    fn source_name(&self) -> &str;
}

/// Trait for listening to subsystem events.
pub trait EventListener<E: SubsystemEvent>: Send + Sync {
    /// Called synchronously when an event occurs.
    fn on_event(&self, event: &E);
}

type BoxedEventListener<E> = Arc<dyn EventListener<E>>;

/// A collection of event listeners, fanned out to on every `emit`.
#[derive(Clone)]
pub struct EventListeners<E: SubsystemEvent> {
    listeners: Vec<BoxedEventListener<E>>,
}

impl<E: SubsystemEvent> EventListeners<E> {
    /// Creates an empty listener collection.
    pub fn new() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }

    /// Registers a listener.
    pub fn add<L>(&mut self, listener: L)
    where
        L: EventListener<E> + 'static,
    {
        self.listeners.push(Arc::new(listener));
    }

    /// Emits an event to every registered listener.
    ///
    /// A panicking listener is caught so the remaining listeners still run;
    /// with the `tracing` feature the panic is logged as a warning.
    pub fn emit(&self, event: &E) {
        for listener in &self.listeners {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                listener.on_event(event);
            }));

            if let Err(_panic_payload) = result {
                #[cfg(feature = "tracing")]
                {
                    let message = _panic_payload
                        .downcast_ref::<&'static str>()
                        .map(|s| (*s).to_string())
                        .or_else(|| _panic_payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic payload".to_string());
                    tracing::warn!(
                        source = event.source_name(),
                        event_type = event.event_type(),
                        panic_message = %message,
                        "event listener panicked"
                    );
                }
            }
        }
    }

    /// Returns `true` when no listeners are registered.
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

impl<E: SubsystemEvent> Default for EventListeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// A closure-backed event listener.
pub struct FnListener<E, F>
where
    F: Fn(&E) + Send + Sync,
{
    f: F,
    _phantom: std::marker::PhantomData<E>,
}

impl<E, F> FnListener<E, F>
where
    F: Fn(&E) + Send + Sync,
{
    /// Wraps a closure as an [`EventListener`].
    pub fn new(f: F) -> Self {
        Self {
            f,
            _phantom: std::marker::PhantomData,
        }
    }
}

impl<E, F> EventListener<E> for FnListener<E, F>
where
    E: SubsystemEvent,
    F: Fn(&E) + Send + Sync,
{
    fn on_event(&self, event: &E) {
        (self.f)(event)
    }
}
