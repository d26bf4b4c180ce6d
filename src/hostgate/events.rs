//! Host gate events.

use std::time::Instant;

use crate::events::SubsystemEvent;

/// Events emitted by [`super::HostGate`].
#[derive(Debug, Clone)]
pub enum HostGateEvent {
    /// A permit was granted.
    PermitAcquired {
        /// The host this gate protects.
        host: String,
        /// Occupied permits immediately after this acquisition.
        in_use: usize,
        /// Current capacity.
        capacity: usize,
        /// When this occurred.
        timestamp: Instant,
    },
    /// A permit was returned.
    PermitReleased {
        /// The host this gate protects.
        host: String,
        /// Occupied permits immediately after this release.
        in_use: usize,
        /// When this occurred.
        timestamp: Instant,
    },
    /// The gate's capacity grew.
    CapacityGrew {
        /// The host this gate protects.
        host: String,
        /// Capacity before the growth.
        previous_capacity: usize,
        /// Capacity after the growth.
        new_capacity: usize,
        /// When this occurred.
        timestamp: Instant,
    },
    /// A caller gave up waiting for a permit (timeout or cancellation).
    AcquireAbandoned {
        /// The host this gate protects.
        host: String,
        /// Why the wait ended without a permit.
        reason: &'static str,
        /// When this occurred.
        timestamp: Instant,
    },
}

impl SubsystemEvent for HostGateEvent {
    fn event_type(&self) -> &'static str {
        match self {
            HostGateEvent::PermitAcquired { .. } => "permit_acquired",
            HostGateEvent::PermitReleased { .. } => "permit_released",
            HostGateEvent::CapacityGrew { .. } => "capacity_grew",
            HostGateEvent::AcquireAbandoned { .. } => "acquire_abandoned",
        }
    }

    fn timestamp(&self) -> Instant {
        match self {
            HostGateEvent::PermitAcquired { timestamp, .. }
            | HostGateEvent::PermitReleased { timestamp, .. }
            | HostGateEvent::CapacityGrew { timestamp, .. }
            | HostGateEvent::AcquireAbandoned { timestamp, .. } => *timestamp,
        }
    }

    fn source_name(&self) -> &str {
        match self {
            HostGateEvent::PermitAcquired { host, .. }
            | HostGateEvent::PermitReleased { host, .. }
            | HostGateEvent::CapacityGrew { host, .. }
            | HostGateEvent::AcquireAbandoned { host, .. } => host,
        }
    }
}
