//! Network model — devices, ports, connect points, and links as seen by
//! the discovery engine.
//!
//! These are immutable snapshots. The inventory hands out a fresh copy on
//! every lookup; nothing here is shared mutable state.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque device identifier, e.g. `of:0000000000000001`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Switch port number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortNumber(pub u32);

impl PortNumber {
    /// First reserved number. Everything at or above is a logical port
    /// (controller, local, flood, ...) with no physical peer.
    pub const LOGICAL_BASE: u32 = 0xffff_ff00;

    pub fn is_logical(&self) -> bool {
        self.0 >= Self::LOGICAL_BASE
    }
}

impl fmt::Display for PortNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Device classification. Optical and transport gear does not speak
/// link discovery and is excluded by the default suppression rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceType {
    Switch,
    Router,
    Roadm,
    FiberSwitch,
    OpticalAmplifier,
    Otn,
    Ols,
    TerminalDevice,
    Controller,
    Other,
}

pub type Annotations = BTreeMap<String, String>;

/// Snapshot of a device as reported by the inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    /// Carried in the Chassis ID TLV of every probe this device emits.
    pub chassis_id: u64,
    #[serde(default)]
    pub annotations: Annotations,
}

impl Device {
    pub fn new(id: impl Into<String>, device_type: DeviceType, chassis_id: u64) -> Self {
        Self {
            id: DeviceId::new(id),
            device_type,
            chassis_id,
            annotations: Annotations::new(),
        }
    }

    pub fn with_annotation(mut self, key: &str, value: &str) -> Self {
        self.annotations.insert(key.to_string(), value.to_string());
        self
    }
}

/// Snapshot of a port as reported by the inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub device: DeviceId,
    pub number: PortNumber,
    pub enabled: bool,
    #[serde(default)]
    pub annotations: Annotations,
}

impl Port {
    pub fn new(device: DeviceId, number: u32, enabled: bool) -> Self {
        Self {
            device,
            number: PortNumber(number),
            enabled,
            annotations: Annotations::new(),
        }
    }

    pub fn with_annotation(mut self, key: &str, value: &str) -> Self {
        self.annotations.insert(key.to_string(), value.to_string());
        self
    }

    pub fn connect_point(&self) -> ConnectPoint {
        ConnectPoint::new(self.device.clone(), self.number)
    }
}

/// One endpoint of a link.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectPoint {
    pub device: DeviceId,
    pub port: PortNumber,
}

impl ConnectPoint {
    pub fn new(device: DeviceId, port: PortNumber) -> Self {
        Self { device, port }
    }
}

impl fmt::Display for ConnectPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device, self.port)
    }
}

/// Directed link identity: probes emitted at `src` were received at `dst`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LinkKey {
    pub src: ConnectPoint,
    pub dst: ConnectPoint,
}

impl LinkKey {
    pub fn new(src: ConnectPoint, dst: ConnectPoint) -> Self {
        Self { src, dst }
    }

    pub fn touches(&self, cp: &ConnectPoint) -> bool {
        self.src == *cp || self.dst == *cp
    }

    pub fn touches_device(&self, device: &DeviceId) -> bool {
        self.src.device == *device || self.dst.device == *device
    }
}

impl fmt::Display for LinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

/// How a link was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkType {
    /// Seen via a confined probe; the two ports are physically adjacent.
    Direct,
    /// Seen via a flood probe; there may be unmanaged switches in between.
    Indirect,
}
