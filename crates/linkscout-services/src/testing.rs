//! In-memory collaborators for unit tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use linkscout_core::config::{ClusterConfig, DiscoveryConfig};
use linkscout_core::{ConnectPoint, Device, DeviceId, LinkKey, LinkType, Port, PortNumber};

use crate::context::DiscoveryContext;
use crate::provider::{
    DeviceInventory, LinkReporter, MastershipService, PacketTransport, TransportError,
};

#[derive(Default)]
pub struct FakeInventory {
    devices: Mutex<BTreeMap<DeviceId, (Device, bool)>>,
    ports: Mutex<BTreeMap<ConnectPoint, Port>>,
}

impl FakeInventory {
    pub fn add_device(&self, device: Device) {
        self.devices
            .lock()
            .unwrap()
            .insert(device.id.clone(), (device, true));
    }

    pub fn add_port(&self, port: Port) {
        self.ports.lock().unwrap().insert(port.connect_point(), port);
    }

    pub fn remove_port(&self, cp: &ConnectPoint) {
        self.ports.lock().unwrap().remove(cp);
    }

    pub fn set_available(&self, id: &DeviceId, available: bool) {
        if let Some(entry) = self.devices.lock().unwrap().get_mut(id) {
            entry.1 = available;
        }
    }

    pub fn set_port_enabled(&self, cp: &ConnectPoint, enabled: bool) {
        if let Some(port) = self.ports.lock().unwrap().get_mut(cp) {
            port.enabled = enabled;
        }
    }
}

impl DeviceInventory for FakeInventory {
    fn devices(&self) -> Vec<Device> {
        self.devices
            .lock()
            .unwrap()
            .values()
            .map(|(d, _)| d.clone())
            .collect()
    }

    fn device(&self, id: &DeviceId) -> Option<Device> {
        self.devices.lock().unwrap().get(id).map(|(d, _)| d.clone())
    }

    fn ports(&self, id: &DeviceId) -> Vec<Port> {
        self.ports
            .lock()
            .unwrap()
            .values()
            .filter(|p| &p.device == id)
            .cloned()
            .collect()
    }

    fn port(&self, cp: &ConnectPoint) -> Option<Port> {
        self.ports.lock().unwrap().get(cp).cloned()
    }

    fn is_available(&self, id: &DeviceId) -> bool {
        self.devices
            .lock()
            .unwrap()
            .get(id)
            .map(|(_, a)| *a)
            .unwrap_or(false)
    }
}

/// Local master of everything except the listed devices.
#[derive(Default)]
pub struct FakeMastership {
    foreign: Mutex<Vec<DeviceId>>,
}

impl FakeMastership {
    pub fn set_master(&self, id: &DeviceId, local: bool) {
        let mut foreign = self.foreign.lock().unwrap();
        foreign.retain(|d| d != id);
        if !local {
            foreign.push(id.clone());
        }
    }
}

impl MastershipService for FakeMastership {
    fn is_local_master(&self, device: &DeviceId) -> bool {
        !self.foreign.lock().unwrap().contains(device)
    }
}

/// Records every frame handed to it. While `failing`, every send errors
/// and only the attempt is counted.
#[derive(Default)]
pub struct RecordingTransport {
    pub sent: Mutex<Vec<(ConnectPoint, Bytes)>>,
    failing: AtomicBool,
    failed: AtomicUsize,
}

impl RecordingTransport {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn sent_on(&self, cp: &ConnectPoint) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(out, _)| out == cp)
            .count()
    }

    pub fn take(&self) -> Vec<(ConnectPoint, Bytes)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }
}

impl PacketTransport for RecordingTransport {
    fn send(&self, out: &ConnectPoint, frame: Bytes) -> Result<(), TransportError> {
        if self.failing.load(Ordering::SeqCst) {
            self.failed.fetch_add(1, Ordering::SeqCst);
            return Err(TransportError::NoRoute(out.clone()));
        }
        self.sent.lock().unwrap().push((out.clone(), frame));
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Detected(ConnectPoint, ConnectPoint, LinkType),
    VanishedAt(ConnectPoint),
    DeviceVanished(DeviceId),
    LinkVanished(LinkKey),
}

#[derive(Default)]
pub struct RecordingReporter {
    pub signals: Mutex<Vec<Signal>>,
}

impl RecordingReporter {
    pub fn take(&self) -> Vec<Signal> {
        std::mem::take(&mut *self.signals.lock().unwrap())
    }

    pub fn snapshot(&self) -> Vec<Signal> {
        self.signals.lock().unwrap().clone()
    }
}

impl LinkReporter for RecordingReporter {
    fn link_detected(&self, src: &ConnectPoint, dst: &ConnectPoint, link_type: LinkType) {
        self.signals
            .lock()
            .unwrap()
            .push(Signal::Detected(src.clone(), dst.clone(), link_type));
    }

    fn links_vanished_at(&self, cp: &ConnectPoint) {
        self.signals
            .lock()
            .unwrap()
            .push(Signal::VanishedAt(cp.clone()));
    }

    fn device_links_vanished(&self, device: &DeviceId) {
        self.signals
            .lock()
            .unwrap()
            .push(Signal::DeviceVanished(device.clone()));
    }

    fn link_vanished(&self, key: &LinkKey) {
        self.signals
            .lock()
            .unwrap()
            .push(Signal::LinkVanished(key.clone()));
    }
}

pub struct Harness {
    pub inventory: Arc<FakeInventory>,
    pub mastership: Arc<FakeMastership>,
    pub transport: Arc<RecordingTransport>,
    pub reporter: Arc<RecordingReporter>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            inventory: Arc::new(FakeInventory::default()),
            mastership: Arc::new(FakeMastership::default()),
            transport: Arc::new(RecordingTransport::default()),
            reporter: Arc::new(RecordingReporter::default()),
        }
    }

    pub fn context(&self, settings: DiscoveryConfig) -> Arc<DiscoveryContext> {
        Arc::new(DiscoveryContext::new(
            settings,
            &ClusterConfig::default(),
            self.mastership.clone(),
            self.transport.clone(),
            self.reporter.clone(),
        ))
    }
}

pub fn cp(device: &str, port: u32) -> ConnectPoint {
    ConnectPoint::new(device.into(), PortNumber(port))
}
