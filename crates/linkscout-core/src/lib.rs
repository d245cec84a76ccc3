//! linkscout-core — shared network model, probe wire format, and configuration.
//! All other Linkscout crates depend on this one.

pub mod config;
pub mod model;
pub mod wire;

pub use model::{
    Annotations, ConnectPoint, Device, DeviceId, DeviceType, LinkKey, LinkType, Port, PortNumber,
};
pub use wire::{Fingerprint, ProbeCodec, ProbeDomain, ProbeFrame, WireError};
