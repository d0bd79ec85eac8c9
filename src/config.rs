//! Startup configuration.
//!
//! The storage variant is chosen here, once, from a JSON document. Anything
//! that cannot live in a file (network clients, address maps, an existing
//! in-memory store) is injected through [`Collaborators`].

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, SealvaultError};
use crate::raft::{
    AddressProvider, ConfiguredAddresses, Peer, RaftBackend, RaftNode, RaftSettings, RaftTransport,
};
use crate::storage::{Backend, FileBackend, InmemBackend, KvBackend, KvTransport, RetryPolicy};

/// Which storage backend to run on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    Inmem,
    File {
        path: PathBuf,
    },
    Kv {
        #[serde(default)]
        prefix: String,
    },
    Raft {
        node_id: String,
        /// The address this node announces to the cluster.
        address: String,
        /// Directory for the Raft log. Without one the log is kept in memory.
        #[serde(default)]
        path: Option<PathBuf>,
        #[serde(default)]
        non_voter: bool,
    },
}

/// Raft timing and cluster-formation bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    pub heartbeat_interval_ms: u64,
    pub election_timeout_ms: u64,
    pub join_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 50,
            election_timeout_ms: 300,
            join_timeout_ms: 10_000,
            poll_interval_ms: 50,
        }
    }
}

impl ClusterSettings {
    pub fn raft_settings(&self) -> RaftSettings {
        RaftSettings {
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            election_timeout: Duration::from_millis(self.election_timeout_ms),
        }
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreConfig {
    pub storage: StorageConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub cluster: ClusterSettings,
}

impl CoreConfig {
    pub fn new(storage: StorageConfig) -> Self {
        Self {
            storage,
            retry: RetryPolicy::default(),
            cluster: ClusterSettings::default(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<()> {
        if let StorageConfig::Raft { node_id, address, .. } = &self.storage {
            if node_id.is_empty() || address.is_empty() {
                return Err(SealvaultError::InvalidParameters(
                    "raft storage needs a node_id and an address".into(),
                ));
            }
            if self.cluster.heartbeat_interval_ms == 0
                || self.cluster.election_timeout_ms <= self.cluster.heartbeat_interval_ms
            {
                return Err(SealvaultError::InvalidParameters(
                    "election timeout must exceed a non-zero heartbeat interval".into(),
                ));
            }
        }
        Ok(())
    }

    /// Build the configured backend. Also returns the Raft node when the
    /// backend is replicated.
    pub(crate) fn build_storage(
        &self,
        collaborators: Collaborators,
    ) -> Result<(Arc<dyn Backend>, Option<Arc<RaftNode>>)> {
        self.validate()?;
        let built: (Arc<dyn Backend>, Option<Arc<RaftNode>>) = match &self.storage {
            StorageConfig::Inmem => (Arc::new(collaborators.inmem.unwrap_or_default()), None),
            StorageConfig::File { path } => (Arc::new(FileBackend::new(path, self.retry.clone())?), None),
            StorageConfig::Kv { prefix } => {
                let transport = collaborators.kv.ok_or_else(|| {
                    SealvaultError::InvalidParameters("kv storage needs a kv transport".into())
                })?;
                (Arc::new(KvBackend::new(transport, prefix.clone(), self.retry.clone())), None)
            }
            StorageConfig::Raft {
                node_id,
                address,
                path,
                non_voter,
            } => {
                let transport = collaborators.raft_transport.ok_or_else(|| {
                    SealvaultError::InvalidParameters("raft storage needs a raft transport".into())
                })?;
                let addresses = collaborators
                    .addresses
                    .unwrap_or_else(|| Arc::new(ConfiguredAddresses));
                let store: Arc<dyn Backend> = match path {
                    Some(path) => Arc::new(FileBackend::new(path, self.retry.clone())?),
                    None => Arc::new(collaborators.inmem.unwrap_or_default()),
                };
                let peer = if *non_voter {
                    Peer::non_voter(node_id.clone(), address.clone())
                } else {
                    Peer::voter(node_id.clone(), address.clone())
                };
                let node = RaftNode::open(peer, self.cluster.raft_settings(), store, transport, addresses)?;
                let backend = RaftBackend::new(Arc::clone(&node), self.retry.clone());
                (Arc::new(backend), Some(node))
            }
        };
        info!(backend = built.0.name(), capabilities = ?built.0.capabilities(), "storage ready");
        Ok(built)
    }
}

/// Runtime dependencies that a config file cannot describe.
#[derive(Clone, Default)]
pub struct Collaborators {
    /// Client for the external key-value service.
    pub kv: Option<Arc<dyn KvTransport>>,
    /// RPC transport for the Raft node.
    pub raft_transport: Option<Arc<dyn RaftTransport>>,
    /// Peer address resolution. Defaults to the addresses peers announced.
    pub addresses: Option<Arc<dyn AddressProvider>>,
    /// An existing in-memory store to open, for the in-memory variant or a
    /// Raft log kept in memory.
    pub inmem: Option<InmemBackend>,
}

impl Collaborators {
    pub fn with_kv(mut self, kv: Arc<dyn KvTransport>) -> Self {
        self.kv = Some(kv);
        self
    }

    pub fn with_raft_transport(mut self, transport: Arc<dyn RaftTransport>) -> Self {
        self.raft_transport = Some(transport);
        self
    }

    pub fn with_addresses(mut self, addresses: Arc<dyn AddressProvider>) -> Self {
        self.addresses = Some(addresses);
        self
    }

    pub fn with_inmem(mut self, inmem: InmemBackend) -> Self {
        self.inmem = Some(inmem);
        self
    }
}
