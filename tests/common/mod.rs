//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use sealvault::raft::{AddressProvider, LocalNetwork};
use sealvault::storage::{InmemBackend, LoopbackKv};
use sealvault::{ClusterSettings, Collaborators, Core, CoreConfig, KeyShare, StorageConfig};
use tempfile::TempDir;

/// Install a test-friendly subscriber once. `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Raft timings short enough for tests.
pub fn fast_cluster() -> ClusterSettings {
    ClusterSettings {
        heartbeat_interval_ms: 10,
        election_timeout_ms: 80,
        join_timeout_ms: 2_000,
        poll_interval_ms: 5,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Inmem,
    File,
    Kv,
    Raft,
}

pub const ALL_VARIANTS: [Variant; 4] = [Variant::Inmem, Variant::File, Variant::Kv, Variant::Raft];

/// Key namespace of the `Kv` variant inside its loopback service.
pub const KV_NAMESPACE: &str = "sealvault";

/// Durable state for one node that outlives any single `Core`.
///
/// Each [`Storage::start`] behaves like a fresh process start against the
/// same disk, service, or Raft log.
pub struct Storage {
    pub variant: Variant,
    inmem: InmemBackend,
    kv: LoopbackKv,
    network: LocalNetwork,
    dir: TempDir,
}

impl Storage {
    pub fn new(variant: Variant) -> Self {
        Self {
            variant,
            inmem: InmemBackend::new(),
            kv: LoopbackKv::new(),
            network: LocalNetwork::new(),
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn config(&self) -> CoreConfig {
        let storage = match self.variant {
            Variant::Inmem => StorageConfig::Inmem,
            Variant::File => StorageConfig::File {
                path: self.dir.path().join("data"),
            },
            Variant::Kv => StorageConfig::Kv {
                prefix: KV_NAMESPACE.into(),
            },
            Variant::Raft => StorageConfig::Raft {
                node_id: "solo".into(),
                address: "solo:8201".into(),
                path: Some(self.dir.path().join("raft")),
                non_voter: false,
            },
        };
        let mut config = CoreConfig::new(storage);
        config.cluster = fast_cluster();
        config
    }

    /// The service behind the `Kv` variant, for injecting faults.
    pub fn kv(&self) -> &LoopbackKv {
        &self.kv
    }

    /// Open a sealed node over this storage.
    pub fn start(&self) -> Core {
        let collaborators = Collaborators::default()
            .with_inmem(self.inmem.clone())
            .with_kv(Arc::new(self.kv.clone()))
            .with_raft_transport(self.network.endpoint("solo:8201"));
        let core = Core::open(&self.config(), collaborators).unwrap();

        // A single-node cluster elects itself, bootstrapping on first start.
        if let Some(node) = core.cluster().node() {
            if node.has_state() {
                assert!(node.campaign().unwrap());
            } else {
                core.cluster().bootstrap().unwrap();
            }
            assert!(node.is_leader());
        }
        core
    }
}

/// Submit `shares` in order and return the final state.
pub fn unseal(core: &Core, shares: &[KeyShare]) -> sealvault::SealState {
    let mut state = core.seal_state();
    for share in shares {
        state = core.submit_share(share.clone()).unwrap();
    }
    state
}

/// Every `k`-element subset of `0..n`, as index lists.
pub fn combinations(n: usize, k: usize) -> Vec<Vec<usize>> {
    fn walk(start: usize, n: usize, k: usize, current: &mut Vec<usize>, out: &mut Vec<Vec<usize>>) {
        if current.len() == k {
            out.push(current.clone());
            return;
        }
        for i in start..n {
            current.push(i);
            walk(i + 1, n, k, current, out);
            current.pop();
        }
    }
    let mut out = Vec::new();
    walk(0, n, k, &mut Vec::new(), &mut out);
    out
}

// ---------------------------------------------------------------------------
// Multi-node clusters
// ---------------------------------------------------------------------------

/// Open a Raft-backed node on `network` listening at `address`.
pub fn raft_node(
    network: &LocalNetwork,
    id: &str,
    address: &str,
    store: &InmemBackend,
    addresses: Option<Arc<dyn AddressProvider>>,
    non_voter: bool,
) -> Core {
    let mut config = CoreConfig::new(StorageConfig::Raft {
        node_id: id.into(),
        address: address.into(),
        path: None,
        non_voter,
    });
    config.cluster = fast_cluster();

    let mut collaborators = Collaborators::default()
        .with_inmem(store.clone())
        .with_raft_transport(network.endpoint(address));
    if let Some(addresses) = addresses {
        collaborators = collaborators.with_addresses(addresses);
    }
    Core::open(&config, collaborators).unwrap()
}

pub const CONVERGE: Duration = Duration::from_secs(3);
