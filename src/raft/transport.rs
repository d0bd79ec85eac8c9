//! Cluster RPC surface and address resolution.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{Command, LogEntry, Peer, RaftConfiguration, RaftNode};
use crate::error::{BackendError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: String,
    /// Where followers forward writes and joins.
    pub leader_address: String,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    /// On success the last index known to match the leader. On failure a
    /// hint for where the leader should retry from.
    pub last_log_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: String,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub granted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub peer: Peer,
    /// Set when a follower relays the request to its leader. A relayed
    /// request is never relayed again.
    pub forwarded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinResponse {
    pub leader_id: String,
    /// Log index of the configuration entry that admitted the peer. The
    /// joiner is caught up once it has applied this index.
    pub config_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationResponse {
    pub configuration: RaftConfiguration,
    pub commit_index: u64,
    pub leader_id: Option<String>,
}

/// Delivers RPCs to the node listening at an address.
///
/// Implementations report unreachable peers as transient backend errors.
pub trait RaftTransport: Send + Sync {
    fn append_entries(&self, target: &str, request: AppendEntriesRequest) -> Result<AppendEntriesResponse>;

    fn request_vote(&self, target: &str, request: VoteRequest) -> Result<VoteResponse>;

    fn join(&self, target: &str, request: JoinRequest) -> Result<JoinResponse>;

    /// Hand a command to the leader at `target`. Returns its log index once
    /// committed.
    fn apply(&self, target: &str, command: Command) -> Result<u64>;

    /// The committed configuration as seen by the node at `target`.
    fn configuration(&self, target: &str) -> Result<ConfigurationResponse>;

    /// Called once the local node exists, so inbound RPCs can reach it.
    fn attach(&self, _node: &Arc<RaftNode>) {}
}

// ---------------------------------------------------------------------------
// Address resolution
// ---------------------------------------------------------------------------

/// Maps a peer to the address its RPCs should go to.
pub trait AddressProvider: Send + Sync {
    fn address_for(&self, peer: &Peer) -> Option<String>;
}

/// Uses the address each peer announced when it joined.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfiguredAddresses;

impl AddressProvider for ConfiguredAddresses {
    fn address_for(&self, peer: &Peer) -> Option<String> {
        Some(peer.address.clone())
    }
}

/// A fixed id-to-address map, for clusters restarted at new addresses.
///
/// Peers missing from the map are unreachable.
#[derive(Debug, Clone, Default)]
pub struct StaticAddressProvider {
    addresses: HashMap<String, String>,
}

impl StaticAddressProvider {
    pub fn new<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            addresses: entries.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

impl AddressProvider for StaticAddressProvider {
    fn address_for(&self, peer: &Peer) -> Option<String> {
        self.addresses.get(&peer.id).cloned()
    }
}

// ---------------------------------------------------------------------------
// In-process network
// ---------------------------------------------------------------------------

#[derive(Default)]
struct NetworkState {
    nodes: HashMap<String, Weak<RaftNode>>,
    down: HashSet<String>,
}

/// An in-process network of Raft nodes keyed by address.
///
/// Addresses can be disconnected to simulate partitions and crashed hosts:
/// traffic to or from them fails with a transient error.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// The transport for a node listening at `local_address`.
    pub fn endpoint(&self, local_address: impl Into<String>) -> Arc<dyn RaftTransport> {
        Arc::new(LocalEndpoint {
            network: self.clone(),
            local: local_address.into(),
        })
    }

    pub fn disconnect(&self, address: &str) {
        self.state.lock().down.insert(address.to_string());
    }

    pub fn reconnect(&self, address: &str) {
        self.state.lock().down.remove(address);
    }

    fn register(&self, address: &str, node: &Arc<RaftNode>) {
        self.state
            .lock()
            .nodes
            .insert(address.to_string(), Arc::downgrade(node));
    }

    fn route(&self, from: &str, to: &str) -> Result<Arc<RaftNode>> {
        let state = self.state.lock();
        if state.down.contains(from) || state.down.contains(to) {
            return Err(BackendError::transient(format!("{} unreachable from {}", to, from)).into());
        }
        state
            .nodes
            .get(to)
            .and_then(Weak::upgrade)
            .ok_or_else(|| BackendError::transient(format!("nothing listening at {}", to)).into())
    }
}

struct LocalEndpoint {
    network: LocalNetwork,
    local: String,
}

impl RaftTransport for LocalEndpoint {
    fn append_entries(&self, target: &str, request: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        self.network.route(&self.local, target)?.handle_append_entries(request)
    }

    fn request_vote(&self, target: &str, request: VoteRequest) -> Result<VoteResponse> {
        self.network.route(&self.local, target)?.handle_request_vote(request)
    }

    fn join(&self, target: &str, request: JoinRequest) -> Result<JoinResponse> {
        self.network.route(&self.local, target)?.handle_join(request)
    }

    fn apply(&self, target: &str, command: Command) -> Result<u64> {
        self.network.route(&self.local, target)?.handle_apply(command)
    }

    fn configuration(&self, target: &str) -> Result<ConfigurationResponse> {
        Ok(self.network.route(&self.local, target)?.handle_configuration())
    }

    fn attach(&self, node: &Arc<RaftNode>) {
        self.network.register(&self.local, node);
    }
}
