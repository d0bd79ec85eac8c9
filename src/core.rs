//! The administrative surface of one node.
//!
//! [`Core`] wires a storage backend, the barrier over it, the seal state
//! machine and the cluster coordinator together. Every logical read and
//! write passes the seal guard, then the barrier, then the backend.
//! Application paths are confined to the `logical/` namespace so they can
//! never collide with the reserved `core/` and `raft/` records.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::barrier::{Barrier, KeyStatus};
use crate::cluster::ClusterCoordinator;
use crate::config::{Collaborators, CoreConfig};
use crate::error::{Result, SealvaultError};
use crate::raft::RaftNode;
use crate::seal::{InitResult, SealConfig, SealCoordinator, SealState, SealStatus};
use crate::shamir::KeyShare;
use crate::storage::{Backend, Capabilities, HaLock};
use crate::token;

/// Prefix under which application data is stored.
pub const LOGICAL_PREFIX: &str = "logical/";

/// Key of the active-node lock on HA-capable backends.
pub const HA_LOCK_KEY: &str = "core/lock";

pub struct Core {
    backend: Arc<dyn Backend>,
    barrier: Arc<Barrier>,
    seal: SealCoordinator,
    cluster: ClusterCoordinator,
}

impl Core {
    /// A sealed node over a non-replicated backend.
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self::with_cluster(backend, None, Duration::from_millis(50))
    }

    /// A sealed node, optionally backed by a Raft node.
    pub fn with_cluster(backend: Arc<dyn Backend>, node: Option<Arc<RaftNode>>, poll_interval: Duration) -> Self {
        let barrier = Arc::new(Barrier::new(Arc::clone(&backend)));
        let seal = SealCoordinator::new(Arc::clone(&backend), Arc::clone(&barrier));
        debug!(backend = backend.name(), replicated = node.is_some(), "core created");
        Self {
            backend,
            barrier,
            seal,
            cluster: ClusterCoordinator::new(node, poll_interval),
        }
    }

    /// Build the configured backend and a sealed node over it.
    pub fn open(config: &CoreConfig, collaborators: Collaborators) -> Result<Self> {
        let (backend, node) = config.build_storage(collaborators)?;
        Ok(Self::with_cluster(backend, node, config.cluster.poll_interval()))
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn capabilities(&self) -> Capabilities {
        self.backend.capabilities()
    }

    pub fn cluster(&self) -> &ClusterCoordinator {
        &self.cluster
    }

    // -----------------------------------------------------------------------
    // Seal
    // -----------------------------------------------------------------------

    /// Initialize the barrier and split a new root key into `total` shares,
    /// any `threshold` of which unseal the node. The node stays sealed.
    pub fn initialize(&self, threshold: usize, total: usize) -> Result<InitResult> {
        let config = SealConfig::new(threshold, total)?;
        self.seal.initialize(config)
    }

    pub fn submit_share(&self, share: KeyShare) -> Result<SealState> {
        self.seal.submit_share(share)
    }

    pub fn reseal(&self) -> SealState {
        self.seal.reseal()
    }

    pub fn reset_unseal(&self) -> SealState {
        self.seal.reset_unseal()
    }

    pub fn is_sealed(&self) -> bool {
        self.seal.is_sealed()
    }

    pub fn seal_state(&self) -> SealState {
        self.seal.state()
    }

    pub fn seal_status(&self) -> Result<SealStatus> {
        self.seal.status()
    }

    /// Replace the root key. Returns the new shares.
    pub fn rekey(&self, threshold: usize, total: usize) -> Result<Vec<KeyShare>> {
        let config = SealConfig::new(threshold, total)?;
        self.seal.rekey(config)
    }

    // -----------------------------------------------------------------------
    // Logical data
    // -----------------------------------------------------------------------

    fn guard(&self) -> Result<()> {
        if self.seal.is_sealed() {
            return Err(SealvaultError::Sealed);
        }
        Ok(())
    }

    pub fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.guard()?;
        let full = logical_path(path)?;
        self.barrier
            .get(&full)?
            .ok_or_else(|| SealvaultError::NotFound(path.to_string()))
    }

    pub fn write(&self, path: &str, value: &[u8]) -> Result<()> {
        self.guard()?;
        let full = logical_path(path)?;
        self.barrier.put(&full, value)
    }

    pub fn delete(&self, path: &str) -> Result<()> {
        self.guard()?;
        let full = logical_path(path)?;
        self.barrier.delete(&full)
    }

    /// Immediate children of `prefix`. An empty prefix lists the root.
    pub fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.guard()?;
        let full = if prefix.is_empty() {
            LOGICAL_PREFIX.to_string()
        } else {
            let dir = prefix.strip_suffix('/').ok_or_else(|| {
                SealvaultError::InvalidParameters(format!("list prefix {:?} must end in '/'", prefix))
            })?;
            format!("{}/", logical_path(dir)?)
        };
        self.barrier.list(&full)
    }

    // -----------------------------------------------------------------------
    // Keys and tokens
    // -----------------------------------------------------------------------

    /// Install a new data-encryption term. Returns it.
    pub fn rotate(&self) -> Result<u32> {
        self.guard()?;
        self.barrier.rotate()
    }

    pub fn key_status(&self) -> Result<KeyStatus> {
        self.guard()?;
        self.barrier.key_status()
    }

    pub fn verify_root_token(&self, token: &str) -> Result<bool> {
        self.guard()?;
        token::verify(&self.barrier, token)
    }

    // -----------------------------------------------------------------------
    // High availability
    // -----------------------------------------------------------------------

    /// Try to become the active node. `Ok(None)` means another node is.
    pub fn acquire_ha_lock(&self, holder: &str) -> Result<Option<Box<dyn HaLock>>> {
        let ha = self.backend.as_ha().ok_or_else(|| {
            SealvaultError::InvalidParameters(format!("{} backend has no HA support", self.backend.name()))
        })?;
        let lock = ha.try_lock(HA_LOCK_KEY, holder)?;
        if lock.is_some() {
            info!(holder, backend = self.backend.name(), "node is active");
        }
        Ok(lock)
    }
}

/// Map an application path into the logical namespace.
///
/// Every `/`-separated segment must be non-empty and neither `.` nor `..`,
/// which also rules out leading, trailing and doubled slashes.
fn logical_path(path: &str) -> Result<String> {
    let invalid = path
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..");
    if invalid {
        return Err(SealvaultError::InvalidParameters(format!("invalid path {:?}", path)));
    }
    Ok(format!("{}{}", LOGICAL_PREFIX, path))
}
