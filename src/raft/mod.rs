//! Consensus-replicated storage.
//!
//! A compact Raft: leader election with randomized timeouts, log replication
//! with quorum commit, and membership changes carried as log entries. The
//! replicated state machine is a sorted key-value map, exposed to the rest
//! of the crate as an ordinary [`crate::storage::Backend`].
//!
//! Each node persists its hard state and log to a backing backend (memory
//! or file tree) and replays the committed prefix on restart.
//!
//! RPCs travel through [`RaftTransport`]. Peer addresses are resolved by an
//! injected [`AddressProvider`], so a restarted cluster can be reached at new
//! addresses without rewriting its committed configuration.

mod backend;
mod log;
mod node;
mod transport;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use backend::RaftBackend;
pub use log::{Command, LogEntry};
pub use node::{DriverHandle, RaftNode, Role};
pub use transport::{
    AddressProvider, AppendEntriesRequest, AppendEntriesResponse, ConfigurationResponse,
    ConfiguredAddresses, JoinRequest, JoinResponse, LocalNetwork, RaftTransport,
    StaticAddressProvider, VoteRequest, VoteResponse,
};

/// Whether a peer counts toward quorum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Suffrage {
    Voter,
    NonVoter,
}

/// One cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peer {
    pub id: String,
    /// The address the peer announced when it joined.
    pub address: String,
    pub suffrage: Suffrage,
}

impl Peer {
    pub fn voter(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            suffrage: Suffrage::Voter,
        }
    }

    pub fn non_voter(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            suffrage: Suffrage::NonVoter,
        }
    }
}

/// The cluster membership, kept sorted by peer id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftConfiguration {
    pub peers: Vec<Peer>,
}

impl RaftConfiguration {
    pub fn new(mut peers: Vec<Peer>) -> Self {
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers.dedup_by(|a, b| a.id == b.id);
        Self { peers }
    }

    pub fn get(&self, id: &str) -> Option<&Peer> {
        self.peers.iter().find(|p| p.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn voters(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter().filter(|p| p.suffrage == Suffrage::Voter)
    }

    pub fn is_voter(&self, id: &str) -> bool {
        self.get(id).map(|p| p.suffrage == Suffrage::Voter).unwrap_or(false)
    }

    /// Votes needed for a majority of voters.
    pub fn quorum(&self) -> usize {
        self.voters().count() / 2 + 1
    }

    /// A copy with `peer` added or replaced.
    pub fn with_peer(&self, peer: Peer) -> Self {
        let mut peers: Vec<Peer> = self.peers.iter().filter(|p| p.id != peer.id).cloned().collect();
        peers.push(peer);
        Self::new(peers)
    }

    pub fn without_peer(&self, id: &str) -> Self {
        Self::new(self.peers.iter().filter(|p| p.id != id).cloned().collect())
    }

    /// Compare membership by identity and suffrage.
    ///
    /// Addresses are not compared, since an address provider may remap them
    /// after a restart. Returns a description of the first difference.
    pub fn diff(&self, expected: &RaftConfiguration) -> Option<String> {
        for want in &expected.peers {
            match self.get(&want.id) {
                None => return Some(format!("peer {} missing", want.id)),
                Some(have) if have.suffrage != want.suffrage => {
                    return Some(format!(
                        "peer {} is {:?}, expected {:?}",
                        want.id, have.suffrage, want.suffrage
                    ))
                }
                Some(_) => {}
            }
        }
        self.peers
            .iter()
            .find(|p| !expected.contains(&p.id))
            .map(|p| format!("unexpected peer {}", p.id))
    }
}

/// Timing for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaftSettings {
    pub heartbeat_interval: Duration,
    /// Base election timeout. Each wait adds up to the same again in jitter.
    pub election_timeout: Duration,
}

impl Default for RaftSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(50),
            election_timeout: Duration::from_millis(300),
        }
    }
}
