//! Per-device discovery worker.
//!
//! One worker per admitted device. It owns the device's port probe state
//! and a periodic timer; every timer fire advances the state machine,
//! emits probes for the ports that need them, and reports the ports whose
//! links went silent.
//!
//! All access to a worker's state goes through one mutex, so a timer fire
//! never interleaves with an ack or a port change for the same device.
//! `stop` flips the running flag under that same mutex, which is what
//! guarantees no fire does any work once `stop` has returned.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use linkscout_core::{ConnectPoint, Device, DeviceId, PortNumber, ProbeDomain, ProbeFrame};

use crate::context::DiscoveryContext;
use crate::port_state::{PortProbeState, PortState};

struct WorkerState {
    ports: PortProbeState,
    chassis_id: u64,
    running: bool,
}

struct Shared {
    device: DeviceId,
    ctx: Arc<DiscoveryContext>,
    state: Mutex<WorkerState>,
}

pub struct DeviceDiscoveryWorker {
    shared: Arc<Shared>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl DeviceDiscoveryWorker {
    /// Create a stopped worker for `device`.
    pub fn new(device: &Device, ctx: Arc<DiscoveryContext>) -> Self {
        let ceiling = ctx.settings.retry_ceiling;
        Self {
            shared: Arc::new(Shared {
                device: device.id.clone(),
                ctx,
                state: Mutex::new(WorkerState {
                    ports: PortProbeState::new(ceiling),
                    chassis_id: device.chassis_id,
                    running: false,
                }),
            }),
            timer: Mutex::new(None),
        }
    }

    pub fn device(&self) -> &DeviceId {
        &self.shared.device
    }

    /// Pick up a fresh device snapshot (the chassis id may have changed).
    pub fn refresh(&self, device: &Device) {
        lock(&self.shared.state).chassis_id = device.chassis_id;
    }

    /// Start the periodic timer. Idempotent. Must be called from within a
    /// Tokio runtime.
    pub fn start(&self) {
        let mut timer = lock(&self.timer);
        {
            let mut state = lock(&self.shared.state);
            let alive = timer.as_ref().map(|h| !h.is_finished()).unwrap_or(false);
            if state.running && alive {
                tracing::trace!(device = %self.shared.device, "worker already running");
                return;
            }
            state.running = true;
        }
        if let Some(stale) = timer.take() {
            stale.abort();
        }

        let shared = self.shared.clone();
        let rate = shared.ctx.settings.probe_rate();
        *timer = Some(tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + rate, rate);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if !shared.fire() {
                    break;
                }
            }
        }));
        tracing::debug!(device = %self.shared.device, rate_ms = rate.as_millis() as u64, "discovery worker started");
    }

    /// Cancel the timer and discard all port state. Idempotent. Once this
    /// returns, no further timer fire sends a probe or reports a vanish.
    pub fn stop(&self) {
        let mut timer = lock(&self.timer);
        {
            let mut state = lock(&self.shared.state);
            if !state.running && timer.is_none() {
                return;
            }
            state.running = false;
            state.ports.clear();
        }
        if let Some(handle) = timer.take() {
            handle.abort();
        }
        tracing::debug!(device = %self.shared.device, "discovery worker stopped");
    }

    pub fn is_stopped(&self) -> bool {
        let timer = lock(&self.timer);
        let running = lock(&self.shared.state).running;
        !running || timer.as_ref().map(|h| h.is_finished()).unwrap_or(true)
    }

    /// Track a port. A newly tracked port is probed right away when this
    /// node masters the device. Logical ports and stopped workers ignore
    /// the call. Returns whether the port became tracked.
    pub fn add_port(&self, port: PortNumber) -> bool {
        if port.is_logical() {
            return false;
        }
        let mut state = lock(&self.shared.state);
        if !state.running || !state.ports.add_port(port) {
            return false;
        }
        tracing::debug!(device = %self.shared.device, %port, "port tracked");
        if self.shared.ctx.mastership.is_local_master(&self.shared.device) {
            self.shared.send_probes(state.chassis_id, port);
        }
        true
    }

    /// Stop tracking a port. Returns whether it was tracked.
    pub fn remove_port(&self, port: PortNumber) -> bool {
        let removed = lock(&self.shared.state).ports.remove_port(port);
        if removed {
            tracing::debug!(device = %self.shared.device, %port, "port untracked");
        }
        removed
    }

    /// A probe was received on `port` of this device.
    pub fn on_ack(&self, port: PortNumber) -> bool {
        let mut state = lock(&self.shared.state);
        state.running && state.ports.on_ack(port)
    }

    /// Run one timer fire now.
    pub fn tick(&self) {
        self.shared.fire();
    }

    pub fn port_state(&self, port: PortNumber) -> Option<PortState> {
        lock(&self.shared.state).ports.state(port)
    }

    pub fn ports(&self) -> Vec<PortNumber> {
        lock(&self.shared.state).ports.ports()
    }
}

impl Drop for DeviceDiscoveryWorker {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.timer).take() {
            handle.abort();
        }
    }
}

impl Shared {
    /// One timer fire. Returns false once the worker is stopped.
    fn fire(&self) -> bool {
        let mut state = lock(&self.state);
        if !state.running {
            return false;
        }
        if !self.ctx.mastership.is_local_master(&self.device) {
            tracing::trace!(device = %self.device, "not master, skipping probe round");
            return true;
        }

        let outcome = state.ports.tick();
        for port in outcome.vanished {
            let cp = ConnectPoint::new(self.device.clone(), port);
            tracing::info!(connect_point = %cp, "no probes received, links vanished");
            self.ctx.reporter.links_vanished_at(&cp);
            self.ctx.links.remove_touching(&cp);
        }
        for port in outcome.probe {
            self.send_probes(state.chassis_id, port);
        }
        true
    }

    fn send_probes(&self, chassis_id: u64, port: PortNumber) {
        let out = ConnectPoint::new(self.device.clone(), port);
        self.send_one(chassis_id, &out, ProbeDomain::Confined);
        if self.ctx.settings.use_flood {
            self.send_one(chassis_id, &out, ProbeDomain::Flood);
        }
    }

    fn send_one(&self, chassis_id: u64, out: &ConnectPoint, domain: ProbeDomain) {
        let probe = ProbeFrame::now(
            self.device.clone(),
            chassis_id,
            out.port,
            self.ctx.fingerprint,
            domain,
        );
        let frame = match self.ctx.codec.encode(&probe) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(device = %self.device, error = %e, "failed to encode probe");
                return;
            }
        };
        if let Err(e) = self.ctx.transport.send(out, frame) {
            tracing::warn!(connect_point = %out, ?domain, error = %e, "probe send failed");
        }
    }
}
