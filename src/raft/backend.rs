//! The Raft node seen as a storage backend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use super::{Command, RaftNode};
use crate::error::{BackendError, Result, SealvaultError};
use crate::storage::{Backend, Capabilities, HaBackend, HaLock, RetryPolicy, Transactional, TxnOp};

/// Consensus-replicated backend.
///
/// Writes return once a quorum has committed them. Reads are served from
/// this node's applied state, so a follower may briefly lag the leader.
pub struct RaftBackend {
    node: Arc<RaftNode>,
    retry: RetryPolicy,
}

impl RaftBackend {
    pub fn new(node: Arc<RaftNode>, retry: RetryPolicy) -> Self {
        Self { node, retry }
    }

    pub fn node(&self) -> &Arc<RaftNode> {
        &self.node
    }

    /// Commit `command`, retrying leader changes and lost quorums.
    fn commit(&self, what: &str, command: Command) -> Result<()> {
        let mut fatal = None;
        let outcome = self.retry.run(what, || match self.node.apply(command.clone()) {
            Ok(_) => Ok(()),
            Err(SealvaultError::Backend(err)) => Err(err),
            Err(other) => {
                let err = BackendError::permanent(other.to_string());
                fatal = Some(other);
                Err(err)
            }
        });
        match fatal {
            Some(err) => Err(err),
            None => outcome,
        }
    }
}

impl Backend for RaftBackend {
    fn name(&self) -> &'static str {
        "raft"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            ha_enabled: true,
            transactional: true,
            consensus: true,
        }
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.node.read(key))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.commit(
            "raft.put",
            Command::Put {
                key: key.to_string(),
                value: value.to_vec(),
            },
        )
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.commit(
            "raft.delete",
            Command::Delete {
                key: key.to_string(),
            },
        )
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self.node.list(prefix))
    }

    fn as_ha(&self) -> Option<&dyn HaBackend> {
        Some(self)
    }

    fn as_transactional(&self) -> Option<&dyn Transactional> {
        Some(self)
    }
}

impl Transactional for RaftBackend {
    fn transaction(&self, ops: &[TxnOp]) -> Result<()> {
        self.commit("raft.transaction", Command::Transaction(ops.to_vec()))
    }
}

/// Leadership doubles as the HA lock: whoever leads holds every key.
impl HaBackend for RaftBackend {
    fn try_lock(&self, key: &str, holder: &str) -> Result<Option<Box<dyn HaLock>>> {
        if !self.node.is_leader() {
            debug!(key, holder, node = %self.node.id(), "HA lock unavailable on follower");
            return Ok(None);
        }
        let term = self.node.term();
        info!(key, holder, node = %self.node.id(), term, "acquired HA lock as leader");
        Ok(Some(Box::new(LeaderLock {
            node: Arc::clone(&self.node),
            holder: holder.to_string(),
            term,
            released: AtomicBool::new(false),
        })))
    }
}

/// Held for as long as the node stays leader in the term it was taken.
struct LeaderLock {
    node: Arc<RaftNode>,
    holder: String,
    term: u64,
    released: AtomicBool,
}

impl HaLock for LeaderLock {
    fn holder(&self) -> &str {
        &self.holder
    }

    fn is_held(&self) -> Result<bool> {
        Ok(!self.released.load(Ordering::SeqCst)
            && self.node.is_leader()
            && self.node.term() == self.term)
    }

    fn release(&self) -> Result<()> {
        self.released.store(true, Ordering::SeqCst);
        Ok(())
    }
}
