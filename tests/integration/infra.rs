//! Loopback testbed: an in-memory network of switches wired by cables,
//! driving a real orchestrator under paused Tokio time.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use linkscout_core::config::{ClusterConfig, DiscoveryConfig};
use linkscout_core::{
    ConnectPoint, Device, DeviceId, DeviceType, LinkKey, LinkType, Port, PortNumber,
};
use linkscout_services::{
    Collaborators, DeviceInventory, DiscoveryEvent, DiscoveryOrchestrator, LinkReporter,
    MastershipService, PacketTransport, StaticPolicy, SuppressionRules, TransportError,
};

pub fn cp(device: &str, port: u32) -> ConnectPoint {
    ConnectPoint::new(device.into(), PortNumber(port))
}

pub fn link(src: ConnectPoint, dst: ConnectPoint) -> LinkKey {
    LinkKey::new(src, dst)
}

/// Let timers and the delivery task run for `ms` of virtual time.
pub async fn settle(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

/// Poll `cond` every 100ms of virtual time until it holds or `timeout_ms`
/// runs out.
pub async fn wait_for<F>(timeout_ms: u64, cond: F) -> anyhow::Result<()>
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return Ok(());
        }
        settle(100).await;
    }
    if cond() {
        return Ok(());
    }
    anyhow::bail!("condition not met within {}ms", timeout_ms)
}

// ── Network ───────────────────────────────────────────────────────────────────

struct Slot {
    device: Device,
    available: bool,
    master: bool,
}

pub struct LoopbackNet {
    devices: DashMap<DeviceId, Slot>,
    ports: DashMap<ConnectPoint, Port>,
    cables: DashMap<ConnectPoint, ConnectPoint>,
    wire: mpsc::UnboundedSender<(ConnectPoint, Bytes)>,
    sent: Mutex<Vec<ConnectPoint>>,
}

impl LoopbackNet {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(ConnectPoint, Bytes)>) {
        let (wire, rx) = mpsc::unbounded_channel();
        let net = Self {
            devices: DashMap::new(),
            ports: DashMap::new(),
            cables: DashMap::new(),
            wire,
            sent: Mutex::new(Vec::new()),
        };
        (Arc::new(net), rx)
    }

    pub fn add_device(&self, device: Device, ports: &[u32]) {
        for &n in ports {
            let port = Port::new(device.id.clone(), n, true);
            self.ports.insert(port.connect_point(), port);
        }
        self.devices.insert(
            device.id.clone(),
            Slot {
                device,
                available: true,
                master: true,
            },
        );
    }

    pub fn cable(&self, a: ConnectPoint, b: ConnectPoint) {
        self.cables.insert(a.clone(), b.clone());
        self.cables.insert(b, a);
    }

    /// Pull the cable at `a` without telling anyone.
    pub fn cut(&self, a: &ConnectPoint) {
        if let Some((_, b)) = self.cables.remove(a) {
            self.cables.remove(&b);
        }
    }

    pub fn set_master(&self, id: &str, master: bool) {
        if let Some(mut slot) = self.devices.get_mut(&DeviceId::from(id)) {
            slot.master = master;
        }
    }

    pub fn set_available(&self, id: &str, available: bool) {
        if let Some(mut slot) = self.devices.get_mut(&DeviceId::from(id)) {
            slot.available = available;
        }
    }

    pub fn set_port_enabled(&self, at: &ConnectPoint, enabled: bool) -> Option<Port> {
        let mut port = self.ports.get_mut(at)?;
        port.enabled = enabled;
        Some(port.clone())
    }

    /// Frames sent out of `out` so far.
    pub fn sent_on(&self, out: &ConnectPoint) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|c| *c == out)
            .count()
    }

    pub fn sent_from(&self, device: &str) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.device.as_str() == device)
            .count()
    }

    fn live(&self, at: &ConnectPoint) -> bool {
        self.is_available(&at.device) && self.ports.get(at).map(|p| p.enabled).unwrap_or(false)
    }

    fn peer(&self, out: &ConnectPoint) -> Option<ConnectPoint> {
        if !self.live(out) {
            return None;
        }
        let peer = self.cables.get(out)?.clone();
        self.live(&peer).then_some(peer)
    }
}

impl DeviceInventory for LoopbackNet {
    fn devices(&self) -> Vec<Device> {
        self.devices.iter().map(|s| s.device.clone()).collect()
    }

    fn device(&self, id: &DeviceId) -> Option<Device> {
        self.devices.get(id).map(|s| s.device.clone())
    }

    fn ports(&self, id: &DeviceId) -> Vec<Port> {
        self.ports
            .iter()
            .filter(|p| &p.device == id)
            .map(|p| p.value().clone())
            .collect()
    }

    fn port(&self, at: &ConnectPoint) -> Option<Port> {
        self.ports.get(at).map(|p| p.clone())
    }

    fn is_available(&self, id: &DeviceId) -> bool {
        self.devices.get(id).map(|s| s.available).unwrap_or(false)
    }
}

impl MastershipService for LoopbackNet {
    fn is_local_master(&self, device: &DeviceId) -> bool {
        self.devices.get(device).map(|s| s.master).unwrap_or(false)
    }
}

impl PacketTransport for LoopbackNet {
    fn send(&self, out: &ConnectPoint, frame: Bytes) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(out.clone());
        self.wire
            .send((out.clone(), frame))
            .map_err(|_| TransportError::Closed)
    }
}

// ── Topology sink ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Detected(LinkKey, LinkType),
    VanishedAt(ConnectPoint),
    DeviceVanished(DeviceId),
    LinkVanished(LinkKey),
}

#[derive(Default)]
pub struct Topology {
    pub links: DashMap<LinkKey, LinkType>,
    signals: Mutex<Vec<Signal>>,
}

impl Topology {
    pub fn has(&self, key: &LinkKey) -> bool {
        self.links.contains_key(key)
    }

    pub fn signals(&self) -> Vec<Signal> {
        self.signals.lock().unwrap().clone()
    }

    pub fn count(&self, signal: &Signal) -> usize {
        self.signals
            .lock()
            .unwrap()
            .iter()
            .filter(|s| *s == signal)
            .count()
    }
}

impl LinkReporter for Topology {
    fn link_detected(&self, src: &ConnectPoint, dst: &ConnectPoint, link_type: LinkType) {
        let key = link(src.clone(), dst.clone());
        self.links
            .entry(key.clone())
            .and_modify(|t| {
                if link_type == LinkType::Direct {
                    *t = LinkType::Direct;
                }
            })
            .or_insert(link_type);
        self.signals
            .lock()
            .unwrap()
            .push(Signal::Detected(key, link_type));
    }

    fn links_vanished_at(&self, at: &ConnectPoint) {
        self.links.retain(|k, _| !k.touches(at));
        self.signals
            .lock()
            .unwrap()
            .push(Signal::VanishedAt(at.clone()));
    }

    fn device_links_vanished(&self, device: &DeviceId) {
        self.links.retain(|k, _| !k.touches_device(device));
        self.signals
            .lock()
            .unwrap()
            .push(Signal::DeviceVanished(device.clone()));
    }

    fn link_vanished(&self, key: &LinkKey) {
        self.links.remove(key);
        self.signals
            .lock()
            .unwrap()
            .push(Signal::LinkVanished(key.clone()));
    }
}

// ── Testbed ───────────────────────────────────────────────────────────────────

pub struct Testbed {
    pub net: Arc<LoopbackNet>,
    pub topo: Arc<Topology>,
    pub policy: Arc<StaticPolicy>,
    pub orch: Arc<DiscoveryOrchestrator>,
    wire: Option<mpsc::UnboundedReceiver<(ConnectPoint, Bytes)>>,
    delivery: Option<JoinHandle<()>>,
}

impl Testbed {
    pub fn new(settings: DiscoveryConfig) -> Self {
        Self::with_cluster(settings, ClusterConfig::default())
    }

    pub fn with_cluster(settings: DiscoveryConfig, cluster: ClusterConfig) -> Self {
        let (net, wire) = LoopbackNet::new();
        let topo = Arc::new(Topology::default());
        let policy = Arc::new(StaticPolicy::new(SuppressionRules::builtin()));
        let orch = Arc::new(DiscoveryOrchestrator::new(
            settings,
            &cluster,
            Collaborators {
                inventory: net.clone(),
                mastership: net.clone(),
                transport: net.clone(),
                policy: policy.clone(),
                reporter: topo.clone(),
            },
        ));
        Self {
            net,
            topo,
            policy,
            orch,
            wire: Some(wire),
            delivery: None,
        }
    }

    /// Two switches cabled port 1 to port 1.
    pub fn pair(settings: DiscoveryConfig) -> Self {
        let bed = Self::new(settings);
        bed.net.add_device(switch("s1"), &[1]);
        bed.net.add_device(switch("s2"), &[1]);
        bed.net.cable(cp("s1", 1), cp("s2", 1));
        bed
    }

    /// Start the wire and the orchestrator.
    pub fn start(&mut self) {
        if let Some(mut wire) = self.wire.take() {
            let net = self.net.clone();
            let orch = self.orch.clone();
            self.delivery = Some(tokio::spawn(async move {
                while let Some((out, frame)) = wire.recv().await {
                    if let Some(peer) = net.peer(&out) {
                        orch.process_frame(&peer, &frame);
                    }
                }
            }));
        }
        self.orch.start();
    }

    pub async fn submit(&self, event: DiscoveryEvent) {
        self.orch.submit(event);
        self.orch.flush().await;
    }

    pub async fn shutdown(mut self) {
        self.orch.stop().await;
        if let Some(task) = self.delivery.take() {
            task.abort();
        }
    }
}

pub fn switch(id: &str) -> Device {
    Device::new(id, DeviceType::Switch, id.bytes().map(u64::from).sum())
}

pub fn quiet() -> DiscoveryConfig {
    DiscoveryConfig {
        use_flood: false,
        ..DiscoveryConfig::default()
    }
}
