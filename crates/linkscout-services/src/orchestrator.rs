//! Discovery orchestrator: lifecycle, event handling, inbound probes,
//! stale-link pruning, and periodic resync.
//!
//! Three background tasks run while started:
//!   - the event loop, draining lifecycle events one at a time
//!   - the pruner, expiring links not seen within the stale age
//!   - the resync timer, queueing a reconciliation of workers against the
//!     live inventory behind any pending events
//!
//! Inbound probes are handled on the caller's task via `process_frame`.
//! An orchestrator runs once: `start`, then `stop`.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use linkscout_core::config::{ClusterConfig, DiscoveryConfig};
use linkscout_core::wire::now_millis;
use linkscout_core::{ConnectPoint, Device, DeviceId, LinkKey, LinkType, Port, ProbeDomain};

use crate::context::DiscoveryContext;
use crate::links::LinkRegistry;
use crate::provider::{
    DeviceInventory, DiscoveryEvent, LinkReporter, MastershipService, PacketTransport,
    PolicySource,
};
use crate::suppression::SuppressionRules;
use crate::worker::DeviceDiscoveryWorker;

/// Everything the orchestrator talks to.
pub struct Collaborators {
    pub inventory: Arc<dyn DeviceInventory>,
    pub mastership: Arc<dyn MastershipService>,
    pub transport: Arc<dyn PacketTransport>,
    pub policy: Arc<dyn PolicySource>,
    pub reporter: Arc<dyn LinkReporter>,
}

enum Command {
    Event(DiscoveryEvent),
    Resync,
    Flush(oneshot::Sender<()>),
}

pub struct DiscoveryOrchestrator {
    inner: Arc<Inner>,
    commands: mpsc::UnboundedSender<Command>,
    pending: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    shutdown: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct Inner {
    ctx: Arc<DiscoveryContext>,
    inventory: Arc<dyn DeviceInventory>,
    policy: Arc<dyn PolicySource>,
    rules: RwLock<Arc<SuppressionRules>>,
    workers: DashMap<DeviceId, Arc<DeviceDiscoveryWorker>>,
    running: AtomicBool,
}

impl DiscoveryOrchestrator {
    pub fn new(settings: DiscoveryConfig, cluster: &ClusterConfig, c: Collaborators) -> Self {
        let ctx = Arc::new(DiscoveryContext::new(
            settings,
            cluster,
            c.mastership,
            c.transport,
            c.reporter,
        ));
        let (commands, pending) = mpsc::unbounded_channel();
        let (shutdown, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(Inner {
                ctx,
                inventory: c.inventory,
                policy: c.policy,
                rules: RwLock::new(Arc::new(SuppressionRules::builtin())),
                workers: DashMap::new(),
                running: AtomicBool::new(false),
            }),
            commands,
            pending: Mutex::new(Some(pending)),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Load rules, admit every available device, and spawn the background
    /// tasks. A no-op when discovery is disabled by configuration or the
    /// orchestrator is already started. Must be called within a Tokio
    /// runtime.
    pub fn start(&self) {
        let settings = &self.inner.ctx.settings;
        if !settings.enabled {
            tracing::info!("link discovery disabled by configuration");
            return;
        }
        let Some(commands) = self.pending.lock().ok().and_then(|mut p| p.take()) else {
            tracing::warn!("link discovery already started");
            return;
        };
        self.inner.running.store(true, Ordering::SeqCst);

        let rules = self.inner.load_rules();
        self.inner.swap_rules(rules);
        self.inner.load_devices();

        let prune_every = settings.prune_interval();
        let resync_every = settings.resync_interval();
        let handles = vec![
            tokio::spawn(event_loop(
                self.inner.clone(),
                commands,
                self.shutdown.subscribe(),
            )),
            tokio::spawn(periodic(
                self.inner.clone(),
                prune_every,
                self.shutdown.subscribe(),
                Inner::prune_stale_links,
            )),
            tokio::spawn(resync_timer(
                self.commands.clone(),
                resync_every,
                self.shutdown.subscribe(),
            )),
        ];
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.extend(handles);
        }

        tracing::info!(
            fingerprint = %self.inner.ctx.fingerprint,
            probe_rate_ms = settings.probe_rate_ms,
            flood = settings.use_flood,
            signed = self.inner.ctx.codec.is_signing(),
            devices = self.inner.running_workers(),
            "link discovery started"
        );
    }

    /// Stop the background tasks and every worker, and forget all links.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(());
        let tasks = self
            .tasks
            .lock()
            .map(|mut t| std::mem::take(&mut *t))
            .unwrap_or_default();
        for task in tasks {
            let _ = task.await;
        }
        for entry in self.inner.workers.iter() {
            entry.value().stop();
        }
        self.inner.workers.clear();
        self.inner.ctx.links.clear();
        tracing::info!("link discovery stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Queue a lifecycle event. Events are handled in submission order.
    pub fn submit(&self, event: DiscoveryEvent) {
        if self.commands.send(Command::Event(event)).is_err() {
            tracing::debug!("event loop gone, dropping event");
        }
    }

    /// Wait until every event submitted before this call has been handled.
    /// Returns at once if the event loop is not running.
    pub async fn flush(&self) {
        if !self.is_running() {
            return;
        }
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Handle a frame received at `received_at`. Returns true when the
    /// frame was one of our probes and was consumed.
    pub fn process_frame(&self, received_at: &ConnectPoint, frame: &[u8]) -> bool {
        self.inner.handle_probe(received_at, frame)
    }

    /// Run one pruning pass now.
    pub fn prune(&self) {
        self.inner.prune_stale_links();
    }

    /// Queue a resync pass behind every event submitted so far. Await
    /// `flush` to wait for it.
    pub fn resync(&self) {
        if self.commands.send(Command::Resync).is_err() {
            tracing::debug!("event loop gone, dropping resync");
        }
    }

    pub fn rules(&self) -> Arc<SuppressionRules> {
        self.inner.rules()
    }

    pub fn links(&self) -> &LinkRegistry {
        &self.inner.ctx.links
    }

    pub fn worker(&self, device: &DeviceId) -> Option<Arc<DeviceDiscoveryWorker>> {
        self.inner.workers.get(device).map(|w| w.value().clone())
    }

    /// Devices whose worker is currently running.
    pub fn active_devices(&self) -> Vec<DeviceId> {
        let mut ids: Vec<_> = self
            .inner
            .workers
            .iter()
            .filter(|e| !e.value().is_stopped())
            .map(|e| e.key().clone())
            .collect();
        ids.sort();
        ids
    }
}

// ── Background tasks ──────────────────────────────────────────────────────────

async fn event_loop(
    inner: Arc<Inner>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!("event loop shutting down");
                return;
            }
            command = commands.recv() => match command {
                Some(Command::Event(event)) => inner.handle_event(event),
                Some(Command::Resync) => {
                    tracing::trace!("resync");
                    inner.load_devices();
                }
                Some(Command::Flush(done)) => {
                    let _ = done.send(());
                }
                None => return,
            },
        }
    }
}

/// Resync runs on the event loop so it never overtakes a lifecycle event.
async fn resync_timer(
    commands: mpsc::UnboundedSender<Command>,
    every: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut interval = time::interval_at(Instant::now() + every, every);
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = interval.tick() => {
                if commands.send(Command::Resync).is_err() {
                    return;
                }
            }
        }
    }
}

async fn periodic(
    inner: Arc<Inner>,
    every: Duration,
    mut shutdown: broadcast::Receiver<()>,
    pass: fn(&Inner),
) {
    let mut interval = time::interval_at(Instant::now() + every, every);
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = interval.tick() => pass(&inner),
        }
    }
}

// ── Core logic ────────────────────────────────────────────────────────────────

impl Inner {
    fn rules(&self) -> Arc<SuppressionRules> {
        match self.rules.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Current rules from the policy source, or the built-in set if it has
    /// none or cannot be read.
    fn load_rules(&self) -> SuppressionRules {
        match self.policy.load() {
            Ok(rules) => rules,
            Err(e) => {
                tracing::warn!(error = %e, "using built-in suppression rules");
                SuppressionRules::builtin()
            }
        }
    }

    /// Install `rules`. Returns false if they equal the current set.
    fn swap_rules(&self, rules: SuppressionRules) -> bool {
        let mut guard = match self.rules.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if **guard == rules {
            return false;
        }
        *guard = Arc::new(rules);
        true
    }

    fn running_workers(&self) -> usize {
        self.workers.iter().filter(|e| !e.value().is_stopped()).count()
    }

    fn handle_event(&self, event: DiscoveryEvent) {
        tracing::trace!(subject = ?event.subject(), ?event, "discovery event");
        match event {
            DiscoveryEvent::DeviceAdded(device) | DiscoveryEvent::DeviceUpdated(device) => {
                if let Some(worker) = self.admit_device(&device) {
                    self.sync_ports(&worker, &device);
                }
            }
            DiscoveryEvent::PortAdded(device, port) | DiscoveryEvent::PortUpdated(device, port) => {
                if port.number.is_logical() {
                    return;
                }
                if !port.enabled {
                    tracing::debug!(connect_point = %port.connect_point(), "port down");
                    self.drop_port(&port.connect_point(), true);
                    return;
                }
                if let Some(worker) = self.admit_device(&device) {
                    self.update_port(&worker, &device, &port, true);
                }
            }
            DiscoveryEvent::PortRemoved(_, port) => {
                if !port.number.is_logical() {
                    self.drop_port(&port.connect_point(), true);
                }
            }
            DiscoveryEvent::DeviceRemoved(device) | DiscoveryEvent::DeviceSuspended(device) => {
                self.retire_device(&device.id);
                self.vanish_device(&device.id);
            }
            DiscoveryEvent::DeviceAvailabilityChanged(device) => {
                if self.inventory.is_available(&device.id) {
                    if let Some(worker) = self.admit_device(&device) {
                        self.sync_ports(&worker, &device);
                    }
                } else {
                    self.retire_device(&device.id);
                    self.vanish_device(&device.id);
                }
            }
            DiscoveryEvent::MastershipChanged(id) => {
                if !self.ctx.mastership.is_local_master(&id) {
                    // The worker keeps its timer and simply stops probing.
                    return;
                }
                match self.inventory.device(&id) {
                    Some(device) => {
                        if let Some(worker) = self.admit_device(&device) {
                            self.sync_ports(&worker, &device);
                        }
                    }
                    None => tracing::debug!(device = %id, "mastership gained for unknown device"),
                }
            }
            DiscoveryEvent::PolicyChanged => {
                let rules = self.load_rules();
                if self.swap_rules(rules) {
                    tracing::info!("suppression rules changed, re-evaluating devices");
                    self.load_devices();
                } else {
                    tracing::debug!("suppression rules unchanged");
                }
            }
        }
    }

    /// Ensure a running worker exists for an unsuppressed device. A
    /// suppressed device has its worker stopped instead.
    fn admit_device(&self, device: &Device) -> Option<Arc<DeviceDiscoveryWorker>> {
        if self.rules().is_device_suppressed(device) {
            tracing::trace!(device = %device.id, "link discovery suppressed for device");
            if self.retire_device(&device.id) {
                self.vanish_device(&device.id);
            }
            return None;
        }

        let worker = self
            .workers
            .entry(device.id.clone())
            .or_insert_with(|| Arc::new(DeviceDiscoveryWorker::new(device, self.ctx.clone())))
            .clone();
        worker.refresh(device);
        if worker.is_stopped() {
            worker.start();
        }
        Some(worker)
    }

    /// Stop the device's worker if it is running. Returns whether it was.
    fn retire_device(&self, id: &DeviceId) -> bool {
        let Some(worker) = self.workers.get(id).map(|w| w.value().clone()) else {
            return false;
        };
        if worker.is_stopped() {
            return false;
        }
        worker.stop();
        true
    }

    /// Make the worker's tracked ports match the inventory's.
    fn sync_ports(&self, worker: &DeviceDiscoveryWorker, device: &Device) {
        let ports = self.inventory.ports(&device.id);
        let present: BTreeSet<_> = ports.iter().map(|p| p.number).collect();
        for port in &ports {
            if !port.number.is_logical() {
                self.update_port(worker, device, port, false);
            }
        }
        for tracked in worker.ports() {
            if !present.contains(&tracked) {
                self.drop_port(&ConnectPoint::new(device.id.clone(), tracked), false);
            }
        }
    }

    /// Track an enabled, unsuppressed port; untrack anything else. With
    /// `always_vanish`, untracking reports the connect point even if the
    /// port was not tracked.
    fn update_port(
        &self,
        worker: &DeviceDiscoveryWorker,
        device: &Device,
        port: &Port,
        always_vanish: bool,
    ) {
        if self.rules().is_port_suppressed(device, port) {
            tracing::trace!(connect_point = %port.connect_point(), "link discovery suppressed for port");
            self.drop_port(&port.connect_point(), always_vanish);
            return;
        }
        if !port.enabled {
            self.drop_port(&port.connect_point(), always_vanish);
            return;
        }
        worker.add_port(port.number);
    }

    fn drop_port(&self, cp: &ConnectPoint, always_vanish: bool) {
        let was_tracked = self
            .workers
            .get(&cp.device)
            .map(|w| w.value().clone())
            .map(|w| w.remove_port(cp.port))
            .unwrap_or(false);
        if was_tracked || always_vanish {
            self.vanish_connect_point(cp);
        }
    }

    fn vanish_connect_point(&self, cp: &ConnectPoint) {
        self.ctx.reporter.links_vanished_at(cp);
        self.ctx.links.remove_touching(cp);
    }

    fn vanish_device(&self, id: &DeviceId) {
        self.ctx.reporter.device_links_vanished(id);
        self.ctx.links.remove_device(id);
    }

    /// Resync: admit every available device, reconcile its ports, and stop
    /// workers whose device is no longer available. Also the sweep run
    /// after the suppression rules change.
    fn load_devices(&self) {
        let available = self.inventory.available_devices();
        let live: BTreeSet<DeviceId> = available.iter().map(|d| d.id.clone()).collect();

        for device in &available {
            if let Some(worker) = self.admit_device(device) {
                self.sync_ports(&worker, device);
            }
        }

        let orphans: Vec<DeviceId> = self
            .workers
            .iter()
            .filter(|e| !live.contains(e.key()) && !e.value().is_stopped())
            .map(|e| e.key().clone())
            .collect();
        for id in orphans {
            tracing::debug!(device = %id, "device no longer available, stopping worker");
            self.retire_device(&id);
            self.vanish_device(&id);
        }
    }

    fn handle_probe(&self, received_at: &ConnectPoint, frame: &[u8]) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            return false;
        }
        let Some(probe) = self.ctx.codec.decode(frame) else {
            return false;
        };
        if probe.fingerprint != self.ctx.fingerprint {
            tracing::trace!(connect_point = %received_at, fingerprint = %probe.fingerprint, "probe from another cluster");
            return false;
        }
        let Some(worker) = self.workers.get(&received_at.device).map(|w| w.value().clone()) else {
            return false;
        };
        if worker.is_stopped() {
            return false;
        }

        if let Some(max) = self.ctx.settings.max_discovery_delay() {
            let delay = now_millis().saturating_sub(probe.timestamp_ms);
            if delay > max.as_millis() as u64 {
                tracing::debug!(connect_point = %received_at, delay_ms = delay, "probe too old, ignoring");
                return true;
            }
        }

        let src = ConnectPoint::new(probe.device_id, probe.port);
        let link_type = match probe.domain {
            ProbeDomain::Confined => LinkType::Direct,
            ProbeDomain::Flood => LinkType::Indirect,
        };
        // Untracked or suppressed receiving port: consumed, nothing learned.
        if !worker.on_ack(received_at.port) {
            tracing::trace!(connect_point = %received_at, "probe on untracked port");
            return true;
        }
        let key = LinkKey::new(src, received_at.clone());
        self.ctx
            .links
            .touch_with_ttl(key.clone(), Duration::from_secs(u64::from(probe.ttl_secs)));
        // `stop` may have cleared the registry since the check above.
        if !self.running.load(Ordering::SeqCst) {
            self.ctx.links.remove(&key);
            return true;
        }
        self.ctx.reporter.link_detected(&key.src, &key.dst, link_type);
        true
    }

    fn prune_stale_links(&self) {
        let settings = &self.ctx.settings;
        let age = settings.stale_link_age();
        let now = Instant::now();

        for key in self.ctx.links.keys() {
            // The destination's master owns the link.
            if !self.ctx.mastership.is_local_master(&key.dst.device) {
                continue;
            }
            if settings.use_stale_link_age {
                if self.ctx.links.remove_if_older(&key, age, now) {
                    tracing::info!(link = %key, "stale link pruned");
                    self.ctx.reporter.link_vanished(&key);
                }
            } else if !self.endpoints_alive(&key) {
                if self.ctx.links.remove_if_older(&key, age, now) {
                    tracing::debug!(link = %key, "dropped stale entry for dead endpoint");
                }
            }
        }
    }

    fn endpoints_alive(&self, key: &LinkKey) -> bool {
        [&key.src, &key.dst].into_iter().all(|cp| {
            self.inventory.is_available(&cp.device)
                && self
                    .inventory
                    .port(cp)
                    .map(|p| p.enabled)
                    .unwrap_or(false)
        })
    }
}
