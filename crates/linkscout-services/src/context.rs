//! Shared discovery context: the collaborators and settings every worker
//! and the orchestrator read from. Built once at startup, never mutated.

use std::sync::Arc;

use linkscout_core::config::{ClusterConfig, DiscoveryConfig};
use linkscout_core::{Fingerprint, ProbeCodec};

use crate::links::LinkRegistry;
use crate::provider::{LinkReporter, MastershipService, PacketTransport};

pub struct DiscoveryContext {
    pub mastership: Arc<dyn MastershipService>,
    pub transport: Arc<dyn PacketTransport>,
    pub reporter: Arc<dyn LinkReporter>,
    pub codec: ProbeCodec,
    /// Stamped on every outgoing probe; inbound probes must match.
    pub fingerprint: Fingerprint,
    pub settings: DiscoveryConfig,
    pub links: LinkRegistry,
}

impl DiscoveryContext {
    pub fn new(
        settings: DiscoveryConfig,
        cluster: &ClusterConfig,
        mastership: Arc<dyn MastershipService>,
        transport: Arc<dyn PacketTransport>,
        reporter: Arc<dyn LinkReporter>,
    ) -> Self {
        let codec = if cluster.secret.is_empty() {
            ProbeCodec::new()
        } else {
            ProbeCodec::with_secret(&cluster.secret)
        };
        Self {
            mastership,
            transport,
            reporter,
            codec,
            fingerprint: Fingerprint::from_cluster(&cluster.name),
            settings,
            links: LinkRegistry::new(),
        }
    }
}
