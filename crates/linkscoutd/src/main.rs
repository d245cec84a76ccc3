//! linkscoutd — link discovery daemon running against a simulated fabric.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use linkscout_core::config::LinkscoutConfig;
use linkscout_services::{
    Collaborators, DiscoveryEvent, DiscoveryOrchestrator, StaticPolicy, SuppressionRules,
};

mod fabric;
mod topology;

use fabric::{FabricSpec, SimFabric};
use topology::TopologyLog;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = LinkscoutConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = LinkscoutConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        LinkscoutConfig::default()
    });

    let fabric_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| config.fabric.path.clone());
    FabricSpec::write_sample_if_missing(&fabric_path)?;
    let spec = FabricSpec::load(&fabric_path)?;
    tracing::info!(
        path = %fabric_path.display(),
        devices = spec.devices.len(),
        cables = spec.cables.len(),
        hubs = spec.hubs.len(),
        "fabric loaded"
    );

    // Collaborators
    let (fabric, outbound) = SimFabric::new(&spec);
    let policy = Arc::new(policy_from(&config));
    let topology = TopologyLog::new();

    let orchestrator = Arc::new(DiscoveryOrchestrator::new(
        config.discovery.clone(),
        &config.cluster,
        Collaborators {
            inventory: fabric.clone(),
            mastership: fabric.clone(),
            transport: fabric.clone(),
            policy: policy.clone(),
            reporter: Arc::new(topology.clone()),
        },
    ));

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let delivery_task = tokio::spawn(fabric::delivery_loop(
        fabric.clone(),
        orchestrator.clone(),
        outbound,
        shutdown_tx.subscribe(),
    ));

    orchestrator.start();

    let script_task = tokio::spawn(fabric::script_loop(
        fabric.clone(),
        orchestrator.clone(),
        spec.script.clone(),
        shutdown_tx.subscribe(),
    ));

    let reload_task = tokio::spawn(reload_loop(policy, orchestrator.clone()));

    let topology_printer = {
        let topology = topology.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            loop {
                interval.tick().await;
                tracing::info!(count = topology.len(), "topology snapshot");
                for (link, link_type) in topology.snapshot() {
                    tracing::info!(%link, ?link_type, "  link");
                }
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv()   => tracing::info!("shutting down"),
        r = delivery_task        => tracing::error!("delivery task exited: {:?}", r),
        r = reload_task          => tracing::error!("reload task exited: {:?}", r),
        r = topology_printer     => tracing::error!("topology printer exited: {:?}", r),
    }

    orchestrator.stop().await;
    script_task.abort();
    Ok(())
}

/// Suppression rules from the config file's `[suppression]` table. Left
/// unset when the table is absent or broken, so the built-in rules apply.
fn policy_from(config: &LinkscoutConfig) -> StaticPolicy {
    let Some(table) = config.suppression.clone() else {
        return StaticPolicy::unset();
    };
    match SuppressionRules::from_toml(table) {
        Ok(rules) => StaticPolicy::new(rules),
        Err(e) => {
            tracing::warn!(error = %e, "invalid [suppression] table");
            StaticPolicy::unset()
        }
    }
}

/// Re-read the config file on SIGHUP and push new suppression rules.
#[cfg(unix)]
async fn reload_loop(policy: Arc<StaticPolicy>, orchestrator: Arc<DiscoveryOrchestrator>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
    while hangup.recv().await.is_some() {
        let config = match LinkscoutConfig::load() {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "config reload failed, keeping current rules");
                continue;
            }
        };
        let Some(table) = config.suppression else {
            tracing::info!("no [suppression] table after reload");
            continue;
        };
        match SuppressionRules::from_toml(table) {
            Ok(rules) => {
                policy.set(rules);
                orchestrator.submit(DiscoveryEvent::PolicyChanged);
                tracing::info!("suppression rules reloaded");
            }
            Err(e) => tracing::warn!(error = %e, "invalid [suppression] table, keeping current rules"),
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn reload_loop(_policy: Arc<StaticPolicy>, _orchestrator: Arc<DiscoveryOrchestrator>) -> Result<()> {
    std::future::pending::<()>().await;
    Ok(())
}
