//! linkscout-services — the discovery engine: per-device workers, the
//! port liveness state machine, suppression policy, the link registry,
//! and the orchestrator tying them to the controller's collaborators.

pub mod context;
pub mod links;
pub mod orchestrator;
pub mod port_state;
pub mod provider;
pub mod suppression;
pub mod worker;

#[cfg(test)]
mod testing;

pub use context::DiscoveryContext;
pub use links::LinkRegistry;
pub use orchestrator::{Collaborators, DiscoveryOrchestrator};
pub use port_state::{PortProbeState, PortState, TickOutcome};
pub use provider::{
    DeviceInventory, DiscoveryEvent, LinkReporter, MastershipService, PacketTransport,
    PolicyError, PolicySource, TransportError,
};
pub use suppression::{AnnotationRule, StaticPolicy, SuppressionRules};
pub use worker::DeviceDiscoveryWorker;
