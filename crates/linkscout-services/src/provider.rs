//! Collaborator seams: what discovery consumes from the controller and
//! what it reports back.
//!
//! Everything here is intentionally narrow. The inventory, mastership
//! arbitration, packet I/O and policy storage live elsewhere; discovery
//! only needs to ask a handful of questions and emit a handful of signals.

use bytes::Bytes;

use linkscout_core::{ConnectPoint, Device, DeviceId, LinkKey, LinkType, Port};

use crate::suppression::SuppressionRules;

/// Read-only view of the device/port inventory.
pub trait DeviceInventory: Send + Sync {
    /// All known devices, available or not.
    fn devices(&self) -> Vec<Device>;

    fn device(&self, id: &DeviceId) -> Option<Device>;

    fn ports(&self, id: &DeviceId) -> Vec<Port>;

    fn port(&self, cp: &ConnectPoint) -> Option<Port>;

    fn is_available(&self, id: &DeviceId) -> bool;

    fn available_devices(&self) -> Vec<Device> {
        self.devices()
            .into_iter()
            .filter(|d| self.is_available(&d.id))
            .collect()
    }
}

/// Cluster mastership. Only the master of a device probes it, and only the
/// master of a link's destination prunes it.
pub trait MastershipService: Send + Sync {
    fn is_local_master(&self, device: &DeviceId) -> bool;
}

/// Outbound frame path. Fire-and-forget: `send` never waits for a reply.
pub trait PacketTransport: Send + Sync {
    fn send(&self, out: &ConnectPoint, frame: Bytes) -> Result<(), TransportError>;
}

/// Source of suppression rules.
pub trait PolicySource: Send + Sync {
    fn load(&self) -> Result<SuppressionRules, PolicyError>;
}

/// Topology sink. Receives link detections and losses.
pub trait LinkReporter: Send + Sync {
    fn link_detected(&self, src: &ConnectPoint, dst: &ConnectPoint, link_type: LinkType);

    /// Every link with an endpoint at `cp` is gone.
    fn links_vanished_at(&self, cp: &ConnectPoint);

    /// Every link with an endpoint on `device` is gone.
    fn device_links_vanished(&self, device: &DeviceId);

    /// One specific link is gone.
    fn link_vanished(&self, key: &LinkKey);
}

/// Lifecycle notifications fed to the orchestrator.
///
/// Device and port events carry the snapshot the inventory had when the
/// event fired, so removals can be handled after the inventory forgot
/// the subject.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    DeviceAdded(Device),
    DeviceUpdated(Device),
    DeviceRemoved(Device),
    DeviceSuspended(Device),
    /// Availability flipped; the inventory says which way.
    DeviceAvailabilityChanged(Device),
    PortAdded(Device, Port),
    PortUpdated(Device, Port),
    PortRemoved(Device, Port),
    /// Mastership of this device moved; the mastership service says where.
    MastershipChanged(DeviceId),
    /// The policy source has a new rule set.
    PolicyChanged,
}

impl DiscoveryEvent {
    /// Device the event is about, for logging.
    pub fn subject(&self) -> Option<&DeviceId> {
        match self {
            DiscoveryEvent::DeviceAdded(d)
            | DiscoveryEvent::DeviceUpdated(d)
            | DiscoveryEvent::DeviceRemoved(d)
            | DiscoveryEvent::DeviceSuspended(d)
            | DiscoveryEvent::DeviceAvailabilityChanged(d)
            | DiscoveryEvent::PortAdded(d, _)
            | DiscoveryEvent::PortUpdated(d, _)
            | DiscoveryEvent::PortRemoved(d, _) => Some(&d.id),
            DiscoveryEvent::MastershipChanged(id) => Some(id),
            DiscoveryEvent::PolicyChanged => None,
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no route to {0}")]
    NoRoute(ConnectPoint),
    #[error("transport closed")]
    Closed,
    #[error("send failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("no policy configured")]
    Missing,
    #[error("failed to parse policy: {0}")]
    Parse(String),
}
