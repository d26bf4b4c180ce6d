//! Cache events.

use std::time::Instant;

use crate::events::SubsystemEvent;

/// Events emitted by [`super::ResponseCache`].
#[derive(Debug, Clone)]
pub enum CacheEvent {
    /// A lookup found a fresh entry.
    Hit {
        /// The cache's service name.
        service: String,
        /// The matched cache key.
        key: String,
        /// When this occurred.
        timestamp: Instant,
    },
    /// A lookup found nothing, or an expired entry.
    Miss {
        /// The cache's service name.
        service: String,
        /// The cache key that missed.
        key: String,
        /// When this occurred.
        timestamp: Instant,
    },
    /// An entry was written.
    Set {
        /// The cache's service name.
        service: String,
        /// The written cache key.
        key: String,
        /// When this occurred.
        timestamp: Instant,
    },
    /// An entry was evicted to enforce `max_size`.
    Eviction {
        /// The cache's service name.
        service: String,
        /// The evicted cache key.
        key: String,
        /// When this occurred.
        timestamp: Instant,
    },
    /// A hit's sliding expiration was extended.
    SlidingExtended {
        /// The cache's service name.
        service: String,
        /// The endpoint tag of the extended entry.
        endpoint: String,
        /// The extended cache key.
        key: String,
        /// `expires_at` before the extension.
        previous_expires_at: Instant,
        /// `expires_at` after the extension.
        new_expires_at: Instant,
        /// When this occurred.
        timestamp: Instant,
    },
}

impl SubsystemEvent for CacheEvent {
    fn event_type(&self) -> &'static str {
        match self {
            CacheEvent::Hit { .. } => "hit",
            CacheEvent::Miss { .. } => "miss",
            CacheEvent::Set { .. } => "set",
            CacheEvent::Eviction { .. } => "eviction",
            CacheEvent::SlidingExtended { .. } => "sliding_extended",
        }
    }

    fn timestamp(&self) -> Instant {
        match self {
            CacheEvent::Hit { timestamp, .. }
            | CacheEvent::Miss { timestamp, .. }
            | CacheEvent::Set { timestamp, .. }
            | CacheEvent::Eviction { timestamp, .. }
            | CacheEvent::SlidingExtended { timestamp, .. } => *timestamp,
        }
    }

    fn source_name(&self) -> &str {
        match self {
            CacheEvent::Hit { service, .. }
            | CacheEvent::Miss { service, .. }
            | CacheEvent::Set { service, .. }
            | CacheEvent::Eviction { service, .. }
            | CacheEvent::SlidingExtended { service, .. } => service,
        }
    }
}
