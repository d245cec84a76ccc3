//! Linkscout integration tests.
//!
//! Every test builds a loopback network of simulated switches, runs a real
//! orchestrator against it, and drives virtual time with a paused Tokio
//! clock. Nothing touches real interfaces, so the suite runs anywhere:
//!
//!   cargo test --test integration

mod infra;

mod discovery;
