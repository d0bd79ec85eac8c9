//! Cluster formation for the consensus-replicated backend.
//!
//! Every operation here is a no-op when the node runs on a backend without
//! consensus, so callers can drive the same startup sequence everywhere.
//!
//! Membership changes are log entries, so a join that has returned is not yet
//! visible on every member. Convergence is awaited by polling with a bounded
//! timeout, never by sleeping a fixed amount.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{BackendError, Result, SealvaultError};
use crate::raft::{RaftConfiguration, RaftNode, Role};

pub struct ClusterCoordinator {
    node: Option<Arc<RaftNode>>,
    poll_interval: Duration,
}

impl ClusterCoordinator {
    /// `node` is `None` for non-replicated backends.
    pub fn new(node: Option<Arc<RaftNode>>, poll_interval: Duration) -> Self {
        Self {
            node,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    pub fn is_replicated(&self) -> bool {
        self.node.is_some()
    }

    pub fn node(&self) -> Option<&Arc<RaftNode>> {
        self.node.as_ref()
    }

    pub fn role(&self) -> Option<Role> {
        self.node.as_ref().map(|n| n.role())
    }

    pub fn leader_id(&self) -> Option<String> {
        self.node.as_ref().and_then(|n| n.leader_id())
    }

    /// Declare this node the sole voter of a new cluster.
    ///
    /// Does nothing on a node that already has Raft state.
    pub fn bootstrap(&self) -> Result<()> {
        let Some(node) = &self.node else {
            return Ok(());
        };
        if node.bootstrap()? {
            info!(node = %node.id(), "cluster bootstrapped");
        }
        Ok(())
    }

    /// Join the cluster through the member at `leader_address`, then wait
    /// until this node has replayed the log up to its own admission.
    ///
    /// A node already in its committed configuration returns at once.
    pub fn join(&self, leader_address: &str, timeout: Duration) -> Result<()> {
        let Some(node) = &self.node else {
            return Ok(());
        };
        if node.committed_configuration().contains(node.id()) {
            debug!(node = %node.id(), "already a cluster member");
            return Ok(());
        }

        let started = Instant::now();
        let response = poll_until("raft.join", timeout, self.poll_interval, || {
            node.join(leader_address)
        })?;

        let remaining = timeout.saturating_sub(started.elapsed());
        if !node.wait_applied(response.config_index, remaining) {
            warn!(
                node = %node.id(),
                config_index = response.config_index,
                applied = node.last_applied(),
                "joined but log replay did not finish in time"
            );
            return Err(BackendError::transient(format!(
                "log replay to index {} did not finish within {:?}",
                response.config_index, timeout
            ))
            .into());
        }
        info!(node = %node.id(), leader = %response.leader_id, "joined cluster and caught up");
        Ok(())
    }

    /// Check that both this node and the leader have committed exactly the
    /// `expected` membership. Addresses are not compared.
    pub fn verify_configuration(&self, expected: &RaftConfiguration) -> Result<()> {
        let Some(node) = &self.node else {
            return Ok(());
        };
        if let Some(diff) = node.committed_configuration().diff(expected) {
            return Err(SealvaultError::ConfigurationMismatch(format!("{}: {}", node.id(), diff)));
        }
        let leader = node.leader_configuration()?;
        if let Some(diff) = leader.configuration.diff(expected) {
            let leader_id = leader.leader_id.unwrap_or_else(|| "leader".to_string());
            return Err(SealvaultError::ConfigurationMismatch(format!("{}: {}", leader_id, diff)));
        }
        Ok(())
    }

    /// Poll [`Self::verify_configuration`] until it passes or `timeout`
    /// elapses. On timeout the last mismatch is returned.
    pub fn await_configuration(&self, expected: &RaftConfiguration, timeout: Duration) -> Result<()> {
        poll_until("raft.verify_configuration", timeout, self.poll_interval, || {
            self.verify_configuration(expected)
        })
    }

    /// Remove a peer from the cluster. Must run on the leader.
    pub fn remove_peer(&self, id: &str) -> Result<()> {
        let Some(node) = &self.node else {
            return Ok(());
        };
        node.remove_peer(id)?;
        Ok(())
    }
}

fn is_retryable(err: &SealvaultError) -> bool {
    match err {
        SealvaultError::ConfigurationMismatch(_) => true,
        SealvaultError::Backend(err) => err.is_transient(),
        _ => false,
    }
}

/// Run `attempt` until it succeeds, fails permanently, or `timeout` passes.
fn poll_until<T, F>(what: &str, timeout: Duration, interval: Duration, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let started = Instant::now();
    loop {
        match attempt() {
            Ok(value) => {
                debug!(
                    operation = what,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "condition met"
                );
                return Ok(value);
            }
            Err(err) if !is_retryable(&err) => return Err(err),
            Err(err) => {
                if started.elapsed() >= timeout {
                    warn!(operation = what, timeout_ms = timeout.as_millis() as u64, error = %err, "gave up waiting");
                    return Err(err);
                }
                debug!(operation = what, error = %err, "not yet");
            }
        }
        thread::sleep(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::{ConfiguredAddresses, LocalNetwork, Peer, RaftSettings};
    use crate::storage::InmemBackend;

    fn coordinator(network: &LocalNetwork, id: &str) -> ClusterCoordinator {
        let address = format!("{}:8201", id);
        let node = RaftNode::open(
            Peer::voter(id, address.clone()),
            RaftSettings::default(),
            Arc::new(InmemBackend::new()),
            network.endpoint(address),
            Arc::new(ConfiguredAddresses),
        )
        .unwrap();
        ClusterCoordinator::new(Some(node), Duration::from_millis(5))
    }

    #[test]
    fn test_non_replicated_is_noop() {
        let cluster = ClusterCoordinator::new(None, Duration::from_millis(5));
        cluster.bootstrap().unwrap();
        cluster.join("anywhere:1", Duration::from_millis(1)).unwrap();
        cluster
            .verify_configuration(&RaftConfiguration::new(vec![Peer::voter("x", "x:1")]))
            .unwrap();
        assert!(!cluster.is_replicated());
    }

    #[test]
    fn test_mismatch_is_reported_not_reconciled() {
        let network = LocalNetwork::new();
        let n1 = coordinator(&network, "n1");
        n1.bootstrap().unwrap();

        let expected = RaftConfiguration::new(vec![Peer::voter("n1", "n1:8201"), Peer::voter("n2", "n2:8201")]);
        match n1.await_configuration(&expected, Duration::from_millis(30)) {
            Err(SealvaultError::ConfigurationMismatch(msg)) => assert!(msg.contains("n2")),
            other => panic!("expected mismatch, got {:?}", other),
        }
        assert_eq!(n1.node().unwrap().committed_configuration().peers.len(), 1);
    }

    #[test]
    fn test_join_to_unreachable_times_out() {
        let network = LocalNetwork::new();
        let n2 = coordinator(&network, "n2");
        match n2.join("nowhere:8201", Duration::from_millis(30)) {
            Err(SealvaultError::Backend(err)) => assert!(err.is_transient()),
            other => panic!("expected transient error, got {:?}", other),
        }
    }
}
