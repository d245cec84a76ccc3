use linkscout_core::config::{ClusterConfig, DiscoveryConfig};
use linkscout_core::{Fingerprint, LinkType, PortNumber, ProbeCodec, ProbeDomain, ProbeFrame};
use linkscout_services::PortState;

use crate::infra::*;

#[tokio::test(start_paused = true)]
async fn test_pair_discovers_both_directions() {
    let mut bed = Testbed::pair(DiscoveryConfig::default());
    bed.start();
    settle(10).await;

    let forward = link(cp("s1", 1), cp("s2", 1));
    let reverse = link(cp("s2", 1), cp("s1", 1));
    assert!(bed.topo.has(&forward));
    assert!(bed.topo.has(&reverse));
    assert_eq!(*bed.topo.links.get(&forward).unwrap(), LinkType::Direct);
    assert!(bed.orch.links().contains(&forward));

    // Both the confined and the flood probe crossed the cable.
    assert_eq!(bed.topo.count(&Signal::Detected(forward.clone(), LinkType::Direct)), 1);
    assert_eq!(bed.topo.count(&Signal::Detected(forward, LinkType::Indirect)), 1);

    for device in ["s1", "s2"] {
        let worker = bed.orch.worker(&device.into()).unwrap();
        assert_eq!(worker.port_state(PortNumber(1)), Some(PortState::Fast { missed: 0 }));
    }
    bed.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_steady_state_keeps_links_alive() {
    let mut bed = Testbed::pair(DiscoveryConfig::default());
    bed.start();
    settle(60_000).await;

    assert_eq!(bed.topo.links.len(), 2);
    assert!(bed
        .topo
        .signals()
        .iter()
        .all(|s| matches!(s, Signal::Detected(..))));
    bed.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_unconnected_port_stays_slow_and_keeps_probing() {
    let mut bed = Testbed::new(quiet());
    bed.net.add_device(switch("s1"), &[1, 2]);
    bed.start();
    settle(9_500).await;

    let worker = bed.orch.worker(&"s1".into()).unwrap();
    assert_eq!(worker.port_state(PortNumber(2)), Some(PortState::Slow));
    // One immediate probe plus one per round at 3s, 6s, 9s.
    assert_eq!(bed.net.sent_on(&cp("s1", 2)), 4);
    assert!(bed.topo.links.is_empty());
    bed.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_signed_cluster_discovers_and_rejects_unsigned() {
    let cluster = ClusterConfig {
        name: "fabric-a".into(),
        secret: "hunter2".into(),
    };
    let mut bed = Testbed::with_cluster(DiscoveryConfig::default(), cluster);
    bed.net.add_device(switch("s1"), &[1]);
    bed.net.add_device(switch("s2"), &[1]);
    bed.net.cable(cp("s1", 1), cp("s2", 1));
    bed.start();
    settle(10).await;
    assert_eq!(bed.topo.links.len(), 2);

    let forged = ProbeFrame::now(
        "s9".into(),
        9,
        PortNumber(9),
        Fingerprint::from_cluster("fabric-a"),
        ProbeDomain::Confined,
    );
    let forged = ProbeCodec::new().encode(&forged).unwrap();
    assert!(!bed.orch.process_frame(&cp("s2", 1), &forged));
    assert!(!bed.topo.has(&link(cp("s9", 9), cp("s2", 1))));
    bed.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_disabled_discovery_sends_nothing() {
    let mut bed = Testbed::pair(DiscoveryConfig {
        enabled: false,
        ..DiscoveryConfig::default()
    });
    bed.start();
    settle(10_000).await;

    assert_eq!(bed.net.sent_from("s1") + bed.net.sent_from("s2"), 0);
    assert!(bed.topo.links.is_empty());
    bed.shutdown().await;
}
