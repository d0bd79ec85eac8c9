mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use sealvault::raft::{
    AddressProvider, LocalNetwork, Peer, RaftConfiguration, Role, StaticAddressProvider,
};
use sealvault::storage::{HaLock, InmemBackend};
use sealvault::{Core, SealState, SealvaultError};

use common::{init_tracing, raft_node, unseal, CONVERGE};

fn expected(ids: &[&str]) -> RaftConfiguration {
    RaftConfiguration::new(ids.iter().map(|id| Peer::voter(*id, "")).collect())
}

/// Three voters at `<id>:8201`, formed by bootstrap plus two joins.
fn three_nodes(network: &LocalNetwork, stores: &[InmemBackend; 3]) -> Vec<Core> {
    let n1 = raft_node(network, "n1", "n1:8201", &stores[0], None, false);
    let n2 = raft_node(network, "n2", "n2:8201", &stores[1], None, false);
    let n3 = raft_node(network, "n3", "n3:8201", &stores[2], None, false);

    n1.cluster().bootstrap().unwrap();
    n2.cluster().join("n1:8201", CONVERGE).unwrap();
    // A join sent to a follower is relayed to the leader.
    n3.cluster().join("n2:8201", CONVERGE).unwrap();
    vec![n1, n2, n3]
}

fn stores() -> [InmemBackend; 3] {
    [InmemBackend::new(), InmemBackend::new(), InmemBackend::new()]
}

#[test]
fn test_configuration_converges_and_survives_failover() {
    init_tracing();
    let network = LocalNetwork::new();
    let stores = stores();
    let nodes = three_nodes(&network, &stores);
    let all = expected(&["n1", "n2", "n3"]);

    // 1. Every member converges on the three-voter configuration.
    for node in &nodes {
        node.cluster().await_configuration(&all, CONVERGE).unwrap();
    }
    assert_eq!(nodes[0].cluster().role(), Some(Role::Leader));

    // 2. Initialize through the leader; a follower unseals from replicated state.
    let init = nodes[0].initialize(3, 5).unwrap();
    unseal(&nodes[0], &init.shares[..3]);
    nodes[0].write("secret/foo", br#"{"zork":"quux"}"#).unwrap();

    assert_eq!(unseal(&nodes[2], &init.shares[2..]), SealState::Unsealed);
    assert_eq!(nodes[2].read("secret/foo").unwrap(), br#"{"zork":"quux"}"#);

    // 3. The leader drops off the network and n2 takes over.
    network.disconnect("n1:8201");
    let n2 = nodes[1].cluster().node().unwrap();
    assert!(n2.campaign().unwrap());
    for node in &nodes[1..] {
        node.cluster().await_configuration(&all, CONVERGE).unwrap();
    }

    // 4. Writes through a follower of the new leader still commit.
    nodes[2].write("secret/after", b"failover").unwrap();
    unseal(&nodes[1], &init.shares[..3]);
    assert_eq!(nodes[1].read("secret/after").unwrap(), b"failover");

    // 5. The old leader rejoins, steps down, and agrees on membership.
    network.reconnect("n1:8201");
    nodes[1].write("secret/heal", b"1").unwrap();
    assert_eq!(nodes[0].cluster().role(), Some(Role::Follower));
    assert_eq!(nodes[0].cluster().leader_id().as_deref(), Some("n2"));
    nodes[0].cluster().await_configuration(&all, CONVERGE).unwrap();
    assert_eq!(nodes[0].read("secret/after").unwrap(), b"failover");
}

#[test]
fn test_verify_reports_mismatch() {
    let network = LocalNetwork::new();
    let stores = stores();
    let nodes = three_nodes(&network, &stores);

    let short = expected(&["n1", "n2"]);
    match nodes[1].cluster().verify_configuration(&short) {
        Err(SealvaultError::ConfigurationMismatch(msg)) => assert!(msg.contains("n3"), "{msg}"),
        other => panic!("expected mismatch, got {other:?}"),
    }

    let demoted = expected(&["n1", "n2"]).with_peer(Peer::non_voter("n3", ""));
    assert!(matches!(
        nodes[0].cluster().verify_configuration(&demoted),
        Err(SealvaultError::ConfigurationMismatch(_))
    ));
}

#[test]
fn test_non_voter_replicates_without_counting_toward_quorum() {
    let network = LocalNetwork::new();
    let stores = stores();
    let n1 = raft_node(&network, "n1", "n1:8201", &stores[0], None, false);
    let n2 = raft_node(&network, "n2", "n2:8201", &stores[1], None, true);
    n1.cluster().bootstrap().unwrap();
    n2.cluster().join("n1:8201", CONVERGE).unwrap();

    let config = expected(&["n1"]).with_peer(Peer::non_voter("n2", ""));
    n2.cluster().await_configuration(&config, CONVERGE).unwrap();

    let init = n1.initialize(1, 1).unwrap();
    unseal(&n1, &init.shares);

    // The non-voter is cut off, yet the lone voter still commits.
    network.disconnect("n2:8201");
    n1.write("solo", b"committed").unwrap();
    assert!(!n2.cluster().node().unwrap().campaign().unwrap());

    network.reconnect("n2:8201");
    n1.write("solo", b"replicated").unwrap();
    unseal(&n2, &init.shares);
    assert_eq!(n2.read("solo").unwrap(), b"replicated");
}

#[test]
fn test_removed_peer_leaves_configuration() {
    let network = LocalNetwork::new();
    let stores = stores();
    let nodes = three_nodes(&network, &stores);

    nodes[0].cluster().remove_peer("n3").unwrap();
    let remaining = expected(&["n1", "n2"]);
    nodes[0].cluster().await_configuration(&remaining, CONVERGE).unwrap();
    nodes[1].cluster().await_configuration(&remaining, CONVERGE).unwrap();
}

#[test]
fn test_restart_at_new_addresses() {
    init_tracing();
    let stores = stores();
    let all = expected(&["n1", "n2", "n3"]);

    // 1. Form a cluster and store a secret.
    let init = {
        let network = LocalNetwork::new();
        let nodes = three_nodes(&network, &stores);
        let init = nodes[0].initialize(2, 3).unwrap();
        unseal(&nodes[0], &init.shares[..2]);
        nodes[0].write("secret/foo", b"before restart").unwrap();
        init
    };

    // 2. Every node comes back on a new host. The committed configuration
    //    still names the old addresses; the static map overrides them.
    let network = LocalNetwork::new();
    let remap: Arc<dyn AddressProvider> = Arc::new(StaticAddressProvider::new([
        ("n1", "10.1.0.1:8201"),
        ("n2", "10.1.0.2:8201"),
        ("n3", "10.1.0.3:8201"),
    ]));
    let nodes: Vec<Core> = ["n1", "n2", "n3"]
        .iter()
        .enumerate()
        .map(|(i, id)| {
            let address = format!("10.1.0.{}:8201", i + 1);
            raft_node(&network, id, &address, &stores[i], Some(Arc::clone(&remap)), false)
        })
        .collect();

    // 3. The replayed configuration is intact and an election succeeds.
    for node in &nodes {
        assert!(node.is_sealed());
        let committed = node.cluster().node().unwrap().committed_configuration();
        assert_eq!(committed.diff(&all), None);
        assert_eq!(committed.get("n1").unwrap().address, "n1:8201");
    }
    assert!(nodes[1].cluster().node().unwrap().campaign().unwrap());
    for node in &nodes {
        node.cluster().await_configuration(&all, CONVERGE).unwrap();
    }

    // 4. Writes replicate over the remapped addresses.
    unseal(&nodes[2], &init.shares[1..]);
    assert_eq!(nodes[2].read("secret/foo").unwrap(), b"before restart");
    nodes[2].write("secret/bar", b"after restart").unwrap();
    unseal(&nodes[0], &init.shares[..2]);
    assert_eq!(nodes[0].read("secret/bar").unwrap(), b"after restart");
}

#[test]
fn test_background_driver_elects_a_new_leader() {
    init_tracing();
    let network = LocalNetwork::new();
    let stores = stores();
    let nodes = three_nodes(&network, &stores);
    let drivers: Vec<_> = nodes
        .iter()
        .map(|n| n.cluster().node().unwrap().start_driver().unwrap())
        .collect();

    let init = nodes[0].initialize(1, 1).unwrap();
    network.disconnect("n1:8201");

    // Heartbeats stop, a follower times out and wins an election.
    let deadline = Instant::now() + CONVERGE;
    let new_leader = loop {
        let leader = nodes[1..]
            .iter()
            .position(|n| n.cluster().role() == Some(Role::Leader));
        if let Some(position) = leader {
            break position + 1;
        }
        assert!(Instant::now() < deadline, "no leader elected");
        thread::sleep(Duration::from_millis(10));
    };

    let all = expected(&["n1", "n2", "n3"]);
    nodes[new_leader].cluster().await_configuration(&all, CONVERGE).unwrap();
    unseal(&nodes[new_leader], &init.shares);
    nodes[new_leader].write("secret/driven", b"ok").unwrap();

    drop(drivers);
}

#[test]
fn test_ha_lock_follows_raft_leadership() {
    let network = LocalNetwork::new();
    let stores = stores();
    let nodes = three_nodes(&network, &stores);

    let lock = nodes[0].acquire_ha_lock("n1").unwrap().expect("leader holds the lock");
    assert!(nodes[1].acquire_ha_lock("n2").unwrap().is_none());
    assert!(lock.is_held().unwrap());

    assert!(nodes[1].cluster().node().unwrap().campaign().unwrap());
    assert!(!lock.is_held().unwrap());
    assert!(nodes[1].acquire_ha_lock("n2").unwrap().is_some());
}
