//! Simulated switching fabric.
//!
//! Stands in for the controller's southbound: it is the device inventory,
//! the mastership service and the packet transport all at once. Frames
//! sent out of a port are queued and delivered by `delivery_loop` to
//! whatever sits at the other end: the cabled peer port for every probe,
//! and every other member of an unmanaged hub for flood probes only.
//!
//! The fabric is described in TOML:
//!
//! ```toml
//! [[devices]]
//! id = "of:0000000000000001"
//! type = "SWITCH"
//! chassis_id = 1
//!
//! [[ports]]
//! device = "of:0000000000000001"
//! number = 1
//! enabled = true
//!
//! [[cables]]
//! a = { device = "of:0000000000000001", port = 1 }
//! b = { device = "of:0000000000000002", port = 1 }
//!
//! [[script]]
//! at_secs = 20
//! action = "port_down"
//! device = "of:0000000000000001"
//! port = 1
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use linkscout_core::wire::ETHERNET_HEADER_LEN;
use linkscout_core::{ConnectPoint, Device, DeviceId, Port, PortNumber, ProbeDomain};
use linkscout_services::{
    DeviceInventory, DiscoveryEvent, DiscoveryOrchestrator, MastershipService, PacketTransport,
    TransportError,
};

// ── Description ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricSpec {
    pub devices: Vec<FabricDevice>,
    pub ports: Vec<Port>,
    pub cables: Vec<Cable>,
    pub hubs: Vec<Hub>,
    pub script: Vec<ScriptStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FabricDevice {
    #[serde(flatten)]
    pub device: Device,
    #[serde(default = "yes")]
    pub available: bool,
    /// Whether this node masters the device.
    #[serde(default = "yes")]
    pub local_master: bool,
}

fn yes() -> bool {
    true
}

/// Point-to-point wire between two ports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cable {
    pub a: ConnectPoint,
    pub b: ConnectPoint,
}

/// Unmanaged segment: repeats flood-domain frames to every other member,
/// swallows confined ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hub {
    pub members: Vec<ConnectPoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptStep {
    pub at_secs: u64,
    #[serde(flatten)]
    pub action: FabricAction,
}

/// A change applied to the running fabric.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FabricAction {
    PortDown { device: DeviceId, port: PortNumber },
    PortUp { device: DeviceId, port: PortNumber },
    DeviceDown { device: DeviceId },
    DeviceUp { device: DeviceId },
    MastershipLost { device: DeviceId },
    MastershipGained { device: DeviceId },
}

impl FabricSpec {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read fabric {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("failed to parse fabric {}", path.display()))
    }

    /// Write a small sample fabric if none exists.
    pub fn write_sample_if_missing(path: &Path) -> Result<()> {
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let text = toml::to_string_pretty(&Self::sample()).context("failed to serialize fabric")?;
        std::fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))
    }

    /// Three switches in a line plus a hub hanging off s1 and s3, and a
    /// ROADM that stays silent under the default rules.
    pub fn sample() -> Self {
        let id = |n: u64| format!("of:{n:016x}");
        let cp = |n: u64, p: u32| ConnectPoint::new(DeviceId::new(id(n)), PortNumber(p));

        let mut devices: Vec<FabricDevice> = (1..=3)
            .map(|n| FabricDevice {
                device: Device::new(id(n), linkscout_core::DeviceType::Switch, n),
                available: true,
                local_master: true,
            })
            .collect();
        devices.push(FabricDevice {
            device: Device::new(id(9), linkscout_core::DeviceType::Roadm, 9),
            available: true,
            local_master: true,
        });

        let ports = [(1, 1), (1, 2), (2, 1), (2, 2), (3, 1), (3, 2), (9, 1)]
            .into_iter()
            .map(|(n, p)| Port::new(DeviceId::new(id(n)), p, true))
            .collect();

        Self {
            devices,
            ports,
            cables: vec![
                Cable { a: cp(1, 1), b: cp(2, 1) },
                Cable { a: cp(2, 2), b: cp(3, 1) },
            ],
            hubs: vec![Hub {
                members: vec![cp(1, 2), cp(3, 2)],
            }],
            script: vec![
                ScriptStep {
                    at_secs: 20,
                    action: FabricAction::PortDown { device: DeviceId::new(id(2)), port: PortNumber(2) },
                },
                ScriptStep {
                    at_secs: 40,
                    action: FabricAction::PortUp { device: DeviceId::new(id(2)), port: PortNumber(2) },
                },
            ],
        }
    }
}

// ── Runtime ───────────────────────────────────────────────────────────────────

struct DeviceSlot {
    device: Device,
    available: bool,
    local_master: bool,
}

pub type Outbound = mpsc::UnboundedReceiver<(ConnectPoint, Bytes)>;

pub struct SimFabric {
    devices: DashMap<DeviceId, DeviceSlot>,
    ports: DashMap<ConnectPoint, Port>,
    cables: HashMap<ConnectPoint, ConnectPoint>,
    hubs: Vec<Vec<ConnectPoint>>,
    outbound: mpsc::UnboundedSender<(ConnectPoint, Bytes)>,
}

impl SimFabric {
    /// Build the fabric. The returned receiver carries every frame sent
    /// into it and must be fed to `delivery_loop`.
    pub fn new(spec: &FabricSpec) -> (Arc<Self>, Outbound) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let devices = spec
            .devices
            .iter()
            .map(|d| {
                (
                    d.device.id.clone(),
                    DeviceSlot {
                        device: d.device.clone(),
                        available: d.available,
                        local_master: d.local_master,
                    },
                )
            })
            .collect();
        let ports = spec
            .ports
            .iter()
            .map(|p| (p.connect_point(), p.clone()))
            .collect();
        let mut cables = HashMap::new();
        for cable in &spec.cables {
            cables.insert(cable.a.clone(), cable.b.clone());
            cables.insert(cable.b.clone(), cable.a.clone());
        }
        let fabric = Self {
            devices,
            ports,
            cables,
            hubs: spec.hubs.iter().map(|h| h.members.clone()).collect(),
            outbound,
        };
        (Arc::new(fabric), rx)
    }

    fn port_live(&self, cp: &ConnectPoint) -> bool {
        self.is_available(&cp.device) && self.ports.get(cp).map(|p| p.enabled).unwrap_or(false)
    }

    /// Ports a frame sent out of `out` arrives at.
    pub fn destinations(&self, out: &ConnectPoint, frame: &[u8]) -> Vec<ConnectPoint> {
        if !self.port_live(out) {
            return Vec::new();
        }
        let domain = frame
            .get(ETHERNET_HEADER_LEN - 2..ETHERNET_HEADER_LEN)
            .and_then(|t| ProbeDomain::from_ether_type(u16::from_be_bytes([t[0], t[1]])));

        let mut hits = Vec::new();
        if let Some(peer) = self.cables.get(out) {
            hits.push(peer.clone());
        }
        if domain == Some(ProbeDomain::Flood) {
            for hub in self.hubs.iter().filter(|h| h.contains(out)) {
                hits.extend(hub.iter().filter(|m| *m != out).cloned());
            }
        }
        hits.retain(|cp| self.port_live(cp));
        hits
    }

    /// Apply a change and return the events it produces.
    pub fn apply(&self, action: &FabricAction) -> Vec<DiscoveryEvent> {
        match action {
            FabricAction::PortDown { device, port } | FabricAction::PortUp { device, port } => {
                let enabled = matches!(action, FabricAction::PortUp { .. });
                let cp = ConnectPoint::new(device.clone(), *port);
                let (Some(dev), Some(mut p)) = (self.device(device), self.ports.get_mut(&cp)) else {
                    tracing::warn!(connect_point = %cp, "script names unknown port");
                    return Vec::new();
                };
                p.enabled = enabled;
                vec![DiscoveryEvent::PortUpdated(dev, p.clone())]
            }
            FabricAction::DeviceDown { device } | FabricAction::DeviceUp { device } => {
                let up = matches!(action, FabricAction::DeviceUp { .. });
                match self.devices.get_mut(device) {
                    Some(mut slot) => {
                        slot.available = up;
                        vec![DiscoveryEvent::DeviceAvailabilityChanged(slot.device.clone())]
                    }
                    None => {
                        tracing::warn!(%device, "script names unknown device");
                        Vec::new()
                    }
                }
            }
            FabricAction::MastershipLost { device } | FabricAction::MastershipGained { device } => {
                let local = matches!(action, FabricAction::MastershipGained { .. });
                if let Some(mut slot) = self.devices.get_mut(device) {
                    slot.local_master = local;
                }
                vec![DiscoveryEvent::MastershipChanged(device.clone())]
            }
        }
    }
}

impl DeviceInventory for SimFabric {
    fn devices(&self) -> Vec<Device> {
        self.devices.iter().map(|e| e.device.clone()).collect()
    }

    fn device(&self, id: &DeviceId) -> Option<Device> {
        self.devices.get(id).map(|e| e.device.clone())
    }

    fn ports(&self, id: &DeviceId) -> Vec<Port> {
        self.ports
            .iter()
            .filter(|e| &e.key().device == id)
            .map(|e| e.value().clone())
            .collect()
    }

    fn port(&self, cp: &ConnectPoint) -> Option<Port> {
        self.ports.get(cp).map(|p| p.clone())
    }

    fn is_available(&self, id: &DeviceId) -> bool {
        self.devices.get(id).map(|e| e.available).unwrap_or(false)
    }
}

impl MastershipService for SimFabric {
    fn is_local_master(&self, device: &DeviceId) -> bool {
        self.devices.get(device).map(|e| e.local_master).unwrap_or(false)
    }
}

impl PacketTransport for SimFabric {
    fn send(&self, out: &ConnectPoint, frame: Bytes) -> Result<(), TransportError> {
        if !self.ports.contains_key(out) {
            return Err(TransportError::NoRoute(out.clone()));
        }
        self.outbound
            .send((out.clone(), frame))
            .map_err(|_| TransportError::Closed)
    }
}

// ── Tasks ─────────────────────────────────────────────────────────────────────

/// Carry queued frames across the fabric and hand them to discovery.
pub async fn delivery_loop(
    fabric: Arc<SimFabric>,
    orchestrator: Arc<DiscoveryOrchestrator>,
    mut outbound: Outbound,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            next = outbound.recv() => {
                let Some((out, frame)) = next else { return };
                for at in fabric.destinations(&out, &frame) {
                    if !orchestrator.process_frame(&at, &frame) {
                        tracing::trace!(from = %out, to = %at, "frame not consumed");
                    }
                }
            }
        }
    }
}

/// Play the fabric's script against the running daemon.
pub async fn script_loop(
    fabric: Arc<SimFabric>,
    orchestrator: Arc<DiscoveryOrchestrator>,
    mut steps: Vec<ScriptStep>,
    mut shutdown: broadcast::Receiver<()>,
) {
    steps.sort_by_key(|s| s.at_secs);
    let started = tokio::time::Instant::now();
    for step in steps {
        let at = started + Duration::from_secs(step.at_secs);
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = tokio::time::sleep_until(at) => {}
        }
        tracing::info!(at_secs = step.at_secs, action = ?step.action, "fabric script step");
        for event in fabric.apply(&step.action) {
            orchestrator.submit(event);
        }
    }
}
