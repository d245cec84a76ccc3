//! Per-device port liveness state machine.
//!
//! Every tracked port is either SLOW (never acknowledged, or demoted) or
//! FAST (acknowledged, liveness counted). Untracked ports are simply not in
//! the map.
//!
//!   add_port:  absent → SLOW
//!   on_ack:    SLOW → FAST(0),  FAST(n) → FAST(0)
//!   tick:      FAST(n), n + 1 ≥ ceiling → SLOW, vanished
//!              FAST(n), n + 1 < ceiling → FAST(n + 1), probe
//!              SLOW                     → SLOW, probe
//!
//! So a FAST port that sees `ceiling` ticks in a row without an ack is
//! demoted on the last of them.
//!
//! SLOW ports are probed on every tick, all of them. FAST ports are only
//! probed while they have retries left.
//!
//! The machine is pure: `tick` reports which ports to probe and which
//! vanished, and the worker turns that into frames and signals. Callers
//! serialize access per device.

use std::collections::BTreeMap;

use linkscout_core::PortNumber;

pub const DEFAULT_RETRY_CEILING: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Slow,
    Fast { missed: u32 },
}

/// What one tick asks the caller to do.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TickOutcome {
    pub probe: Vec<PortNumber>,
    pub vanished: Vec<PortNumber>,
}

#[derive(Debug)]
pub struct PortProbeState {
    ports: BTreeMap<PortNumber, PortState>,
    retry_ceiling: u32,
}

impl Default for PortProbeState {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_CEILING)
    }
}

impl PortProbeState {
    pub fn new(retry_ceiling: u32) -> Self {
        Self {
            ports: BTreeMap::new(),
            retry_ceiling,
        }
    }

    /// Start tracking a port as SLOW. Returns false if it was already
    /// tracked, in which case its state is left alone.
    pub fn add_port(&mut self, port: PortNumber) -> bool {
        if self.ports.contains_key(&port) {
            return false;
        }
        self.ports.insert(port, PortState::Slow);
        true
    }

    /// Record an acknowledgement. Returns false for untracked ports.
    pub fn on_ack(&mut self, port: PortNumber) -> bool {
        match self.ports.get_mut(&port) {
            Some(state) => {
                *state = PortState::Fast { missed: 0 };
                true
            }
            None => false,
        }
    }

    /// Stop tracking a port. Returns whether it was tracked.
    pub fn remove_port(&mut self, port: PortNumber) -> bool {
        self.ports.remove(&port).is_some()
    }

    pub fn tick(&mut self) -> TickOutcome {
        let ceiling = self.retry_ceiling;
        let mut outcome = TickOutcome::default();
        for (port, state) in self.ports.iter_mut() {
            match *state {
                PortState::Fast { missed } if missed + 1 >= ceiling => {
                    *state = PortState::Slow;
                    outcome.vanished.push(*port);
                }
                PortState::Fast { missed } => {
                    *state = PortState::Fast { missed: missed + 1 };
                    outcome.probe.push(*port);
                }
                PortState::Slow => outcome.probe.push(*port),
            }
        }
        outcome
    }

    pub fn state(&self, port: PortNumber) -> Option<PortState> {
        self.ports.get(&port).copied()
    }

    pub fn contains(&self, port: PortNumber) -> bool {
        self.ports.contains_key(&port)
    }

    pub fn ports(&self) -> Vec<PortNumber> {
        self.ports.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn clear(&mut self) {
        self.ports.clear();
    }

    pub fn retry_ceiling(&self) -> u32 {
        self.retry_ceiling
    }
}
