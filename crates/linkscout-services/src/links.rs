//! Link registry: when each detected link was last seen, and for how long
//! its sender promised it stays valid.
//!
//! Written on every accepted probe, swept by the pruner, and trimmed when
//! links are reported vanished. Lives outside any single worker: a link's
//! two ends belong to two different devices.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use linkscout_core::{ConnectPoint, DeviceId, LinkKey};

#[derive(Debug, Clone, Copy)]
struct Sighting {
    at: Instant,
    /// TTL advertised by the probe that produced this sighting.
    ttl: Option<Duration>,
}

impl Sighting {
    fn expired(&self, age: Duration, now: Instant) -> bool {
        let limit = self.ttl.map_or(age, |ttl| ttl.min(age));
        now.saturating_duration_since(self.at) > limit
    }
}

/// Shared map from link to last sighting. Clones share the same map.
#[derive(Clone, Default)]
pub struct LinkRegistry {
    seen: Arc<DashMap<LinkKey, Sighting>>,
}

impl LinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `key` was seen now.
    pub fn touch(&self, key: LinkKey) {
        self.touch_at(key, Instant::now());
    }

    pub fn touch_at(&self, key: LinkKey, at: Instant) {
        self.seen.insert(key, Sighting { at, ttl: None });
    }

    /// Record a sighting whose sender advertised `ttl`. The link expires
    /// after `ttl` or the pruner's stale age, whichever is shorter.
    pub fn touch_with_ttl(&self, key: LinkKey, ttl: Duration) {
        self.seen.insert(
            key,
            Sighting {
                at: Instant::now(),
                ttl: Some(ttl),
            },
        );
    }

    pub fn last_seen(&self, key: &LinkKey) -> Option<Instant> {
        self.seen.get(key).map(|e| e.value().at)
    }

    pub fn contains(&self, key: &LinkKey) -> bool {
        self.seen.contains_key(key)
    }

    pub fn remove(&self, key: &LinkKey) -> bool {
        self.seen.remove(key).is_some()
    }

    /// Remove `key` only if it has not been seen for longer than `age`, or
    /// than its advertised TTL if that is shorter. Atomic with respect to a
    /// concurrent `touch`.
    pub fn remove_if_older(&self, key: &LinkKey, age: Duration, now: Instant) -> bool {
        self.seen
            .remove_if(key, |_, seen| seen.expired(age, now))
            .is_some()
    }

    /// Drop every link with an endpoint at `cp`. Returns how many.
    pub fn remove_touching(&self, cp: &ConnectPoint) -> usize {
        let before = self.seen.len();
        self.seen.retain(|key, _| !key.touches(cp));
        before.saturating_sub(self.seen.len())
    }

    /// Drop every link with an endpoint on `device`. Returns how many.
    pub fn remove_device(&self, device: &DeviceId) -> usize {
        let before = self.seen.len();
        self.seen.retain(|key, _| !key.touches_device(device));
        before.saturating_sub(self.seen.len())
    }

    /// Snapshot of all tracked links.
    pub fn keys(&self) -> Vec<LinkKey> {
        self.seen.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn clear(&self) {
        self.seen.clear();
    }
}
