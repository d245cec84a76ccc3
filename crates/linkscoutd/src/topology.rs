//! Topology sink for the daemon. Keeps the current link set and logs
//! every change to it.

use std::sync::Arc;

use dashmap::DashMap;

use linkscout_core::{ConnectPoint, DeviceId, LinkKey, LinkType};
use linkscout_services::LinkReporter;

#[derive(Clone, Default)]
pub struct TopologyLog {
    links: Arc<DashMap<LinkKey, LinkType>>,
}

impl TopologyLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Sorted snapshot.
    pub fn snapshot(&self) -> Vec<(LinkKey, LinkType)> {
        let mut links: Vec<_> = self
            .links
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        links.sort_by(|a, b| a.0.cmp(&b.0));
        links
    }

    fn drop_where(&self, what: &str, pred: impl Fn(&LinkKey) -> bool) {
        let gone: Vec<LinkKey> = self
            .links
            .iter()
            .filter(|e| pred(e.key()))
            .map(|e| e.key().clone())
            .collect();
        for key in gone {
            if self.links.remove(&key).is_some() {
                tracing::info!(link = %key, cause = what, "link removed");
            }
        }
    }
}

impl LinkReporter for TopologyLog {
    fn link_detected(&self, src: &ConnectPoint, dst: &ConnectPoint, link_type: LinkType) {
        let key = LinkKey::new(src.clone(), dst.clone());
        // A direct sighting outranks an indirect one.
        let mut upgraded = false;
        let mut entry = self.links.entry(key.clone()).or_insert_with(|| {
            upgraded = true;
            link_type
        });
        if *entry == LinkType::Indirect && link_type == LinkType::Direct {
            *entry = LinkType::Direct;
            upgraded = true;
        }
        drop(entry);
        if upgraded {
            tracing::info!(link = %key, ?link_type, "link detected");
        }
    }

    fn links_vanished_at(&self, cp: &ConnectPoint) {
        self.drop_where("port", |k| k.touches(cp));
    }

    fn device_links_vanished(&self, device: &DeviceId) {
        self.drop_where("device", |k| k.touches_device(device));
    }

    fn link_vanished(&self, key: &LinkKey) {
        if self.links.remove(key).is_some() {
            tracing::info!(link = %key, cause = "stale", "link removed");
        }
    }
}
