//! Suppression policy — which devices and ports take part in discovery.
//!
//! A device is suppressed when its type is excluded, when it carries an
//! annotation matching a rule, or when discovery is switched off for it
//! explicitly. A port is suppressed when its device is, or when the port
//! itself matches. The checks are pure functions of (entity, rules).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use linkscout_core::{Annotations, ConnectPoint, Device, DeviceId, DeviceType, Port};

use crate::provider::{PolicyError, PolicySource};

/// Annotation present on devices or ports that must never be probed.
pub const NO_LLDP: &str = "no-lldp";

/// Spelling of the "any value" sentinel in serialized rule sets.
pub const ANY_VALUE: &str = "(any)";

/// What an annotation rule requires of the annotation's value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AnnotationRule {
    /// Value must equal this literal.
    Exact(String),
    /// Key presence is enough.
    AnyValue,
}

impl AnnotationRule {
    fn matches(&self, value: &str) -> bool {
        match self {
            AnnotationRule::Exact(expected) => expected == value,
            AnnotationRule::AnyValue => true,
        }
    }
}

impl From<String> for AnnotationRule {
    fn from(s: String) -> Self {
        if s == ANY_VALUE {
            AnnotationRule::AnyValue
        } else {
            AnnotationRule::Exact(s)
        }
    }
}

impl From<AnnotationRule> for String {
    fn from(rule: AnnotationRule) -> Self {
        match rule {
            AnnotationRule::Exact(s) => s,
            AnnotationRule::AnyValue => ANY_VALUE.to_string(),
        }
    }
}

/// One complete rule set. Swapped as a whole, never edited in place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuppressionRules {
    pub device_types: BTreeSet<DeviceType>,
    pub annotations: BTreeMap<String, AnnotationRule>,
    /// Devices with discovery switched off by operator config.
    pub disabled_devices: BTreeSet<DeviceId>,
    /// Ports with discovery switched off by operator config.
    pub disabled_ports: BTreeSet<ConnectPoint>,
}

impl SuppressionRules {
    /// Rules used when no policy can be loaded: optical and transport
    /// equipment is excluded, and anything annotated `no-lldp`.
    pub fn builtin() -> Self {
        Self {
            device_types: [
                DeviceType::Roadm,
                DeviceType::FiberSwitch,
                DeviceType::OpticalAmplifier,
                DeviceType::Otn,
                DeviceType::Ols,
                DeviceType::TerminalDevice,
            ]
            .into_iter()
            .collect(),
            annotations: [(NO_LLDP.to_string(), AnnotationRule::AnyValue)]
                .into_iter()
                .collect(),
            disabled_devices: BTreeSet::new(),
            disabled_ports: BTreeSet::new(),
        }
    }

    /// Parse the `[suppression]` table of the config file.
    pub fn from_toml(value: toml::Value) -> Result<Self, PolicyError> {
        value
            .try_into()
            .map_err(|e: toml::de::Error| PolicyError::Parse(e.to_string()))
    }

    pub fn is_device_suppressed(&self, device: &Device) -> bool {
        self.device_types.contains(&device.device_type)
            || self.disabled_devices.contains(&device.id)
            || self.matches_annotations(&device.annotations)
    }

    /// A port of a suppressed device is always suppressed, whatever the
    /// port's own annotations say.
    pub fn is_port_suppressed(&self, device: &Device, port: &Port) -> bool {
        self.is_device_suppressed(device)
            || self.disabled_ports.contains(&port.connect_point())
            || self.matches_annotations(&port.annotations)
    }

    fn matches_annotations(&self, annotations: &Annotations) -> bool {
        self.annotations.iter().any(|(key, rule)| {
            annotations
                .get(key)
                .map(|value| rule.matches(value))
                .unwrap_or(false)
        })
    }
}

/// In-memory policy source. The daemon fills it from the config file;
/// tests swap rule sets at will.
#[derive(Debug, Default)]
pub struct StaticPolicy {
    rules: RwLock<Option<SuppressionRules>>,
}

impl StaticPolicy {
    pub fn new(rules: SuppressionRules) -> Self {
        Self {
            rules: RwLock::new(Some(rules)),
        }
    }

    /// A source with nothing configured. Loads fail, callers fall back.
    pub fn unset() -> Self {
        Self::default()
    }

    pub fn set(&self, rules: SuppressionRules) {
        if let Ok(mut guard) = self.rules.write() {
            *guard = Some(rules);
        }
    }
}

impl PolicySource for StaticPolicy {
    fn load(&self) -> Result<SuppressionRules, PolicyError> {
        self.rules
            .read()
            .ok()
            .and_then(|guard| guard.clone())
            .ok_or(PolicyError::Missing)
    }
}
