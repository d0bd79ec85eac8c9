//! A single Raft node: election, replication and the replicated map.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use super::log::{HardState, LogStore};
use super::transport::ConfigurationResponse;
use super::{
    AddressProvider, AppendEntriesRequest, AppendEntriesResponse, Command, JoinRequest,
    JoinResponse, LogEntry, Peer, RaftConfiguration, RaftSettings, RaftTransport, Suffrage,
    VoteRequest, VoteResponse,
};
use crate::crypto;
use crate::error::{BackendError, Result, SealvaultError};
use crate::storage::{immediate_children, Backend, TxnOp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

#[derive(Debug, Clone)]
struct LeaderHint {
    id: String,
    address: String,
}

enum Proposal {
    Append(Command),
    /// Nothing to do. The value is the index that already covers the request.
    Existing(u64),
}

struct NodeState {
    term: u64,
    voted_for: Option<String>,
    role: Role,
    leader: Option<LeaderHint>,
    /// Entry `i` lives at `log[i - 1]`.
    log: Vec<LogEntry>,
    commit_index: u64,
    last_applied: u64,
    fsm: BTreeMap<String, Vec<u8>>,
    committed: RaftConfiguration,
    election_deadline: Instant,
    last_broadcast: Instant,
    next_index: HashMap<String, u64>,
    match_index: HashMap<String, u64>,
}

impl NodeState {
    fn last_index(&self) -> u64 {
        self.log.len() as u64
    }

    fn last_term(&self) -> u64 {
        self.log.last().map(|e| e.term).unwrap_or(0)
    }

    fn term_at(&self, index: u64) -> u64 {
        if index == 0 {
            return 0;
        }
        self.log
            .get(index as usize - 1)
            .map(|e| e.term)
            .unwrap_or(0)
    }

    /// The newest configuration in the log, committed or not, and its index.
    fn latest_configuration(&self) -> (u64, RaftConfiguration) {
        self.log
            .iter()
            .rev()
            .find_map(|entry| match &entry.command {
                Command::Configuration(config) => Some((entry.index, config.clone())),
                _ => None,
            })
            .unwrap_or_default()
    }

    fn hard_state(&self) -> HardState {
        HardState {
            term: self.term,
            voted_for: self.voted_for.clone(),
            commit_index: self.commit_index,
        }
    }

    fn apply_committed(&mut self) {
        while self.last_applied < self.commit_index {
            let entry = &self.log[self.last_applied as usize];
            match &entry.command {
                Command::Noop => {}
                Command::Put { key, value } => {
                    self.fsm.insert(key.clone(), value.clone());
                }
                Command::Delete { key } => {
                    self.fsm.remove(key);
                }
                Command::Transaction(ops) => {
                    for op in ops {
                        match op {
                            TxnOp::Put { key, value } => {
                                self.fsm.insert(key.clone(), value.clone());
                            }
                            TxnOp::Delete { key } => {
                                self.fsm.remove(key);
                            }
                        }
                    }
                }
                Command::Configuration(config) => {
                    self.committed = config.clone();
                }
            }
            self.last_applied += 1;
        }
    }
}

fn election_deadline(settings: &RaftSettings) -> Instant {
    let base = settings.election_timeout;
    let span = (base.as_millis() as u64).max(1);
    let jitter = crypto::random_u64().unwrap_or(0) % span;
    Instant::now() + base + Duration::from_millis(jitter)
}

/// One member of a Raft cluster.
///
/// Lock order is `propose_lock` then `state`. The state lock is never held
/// across a transport call.
pub struct RaftNode {
    peer: Peer,
    settings: RaftSettings,
    transport: Arc<dyn RaftTransport>,
    addresses: Arc<dyn AddressProvider>,
    store: LogStore,
    state: Mutex<NodeState>,
    applied: Condvar,
    /// Serializes replication rounds.
    propose_lock: Mutex<()>,
}

impl RaftNode {
    /// Open a node, replaying whatever `store` already holds.
    ///
    /// A node always starts as a follower. Only committed entries are
    /// applied; any uncommitted tail waits for a leader's verdict.
    pub fn open(
        peer: Peer,
        settings: RaftSettings,
        store: Arc<dyn Backend>,
        transport: Arc<dyn RaftTransport>,
        addresses: Arc<dyn AddressProvider>,
    ) -> Result<Arc<Self>> {
        let store = LogStore::new(store);
        let (hard, log) = store.load()?;
        if hard.commit_index > log.len() as u64 {
            return Err(BackendError::permanent(format!(
                "commit index {} beyond log end {}",
                hard.commit_index,
                log.len()
            ))
            .into());
        }

        let now = Instant::now();
        let mut state = NodeState {
            term: hard.term,
            voted_for: hard.voted_for,
            role: Role::Follower,
            leader: None,
            log,
            commit_index: hard.commit_index,
            last_applied: 0,
            fsm: BTreeMap::new(),
            committed: RaftConfiguration::default(),
            election_deadline: election_deadline(&settings),
            last_broadcast: now,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
        };
        state.apply_committed();

        info!(
            node = %peer.id,
            term = state.term,
            entries = state.log.len(),
            commit_index = state.commit_index,
            "raft node opened"
        );

        let node = Arc::new(Self {
            peer,
            settings,
            transport,
            addresses,
            store,
            state: Mutex::new(state),
            applied: Condvar::new(),
            propose_lock: Mutex::new(()),
        });
        node.transport.attach(&node);
        Ok(node)
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn id(&self) -> &str {
        &self.peer.id
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn settings(&self) -> &RaftSettings {
        &self.settings
    }

    pub fn role(&self) -> Role {
        self.state.lock().role
    }

    pub fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    pub fn term(&self) -> u64 {
        self.state.lock().term
    }

    pub fn leader_id(&self) -> Option<String> {
        self.state.lock().leader.as_ref().map(|l| l.id.clone())
    }

    pub fn commit_index(&self) -> u64 {
        self.state.lock().commit_index
    }

    pub fn last_applied(&self) -> u64 {
        self.state.lock().last_applied
    }

    pub fn committed_configuration(&self) -> RaftConfiguration {
        self.state.lock().committed.clone()
    }

    pub fn latest_configuration(&self) -> RaftConfiguration {
        self.state.lock().latest_configuration().1
    }

    /// Whether the node holds any log at all.
    pub fn has_state(&self) -> bool {
        let state = self.state.lock();
        !state.log.is_empty() || state.term > 0
    }

    // -----------------------------------------------------------------------
    // Replicated map
    // -----------------------------------------------------------------------

    /// Read from the local copy of the map. Followers may lag the leader.
    pub fn read(&self, key: &str) -> Option<Vec<u8>> {
        self.state.lock().fsm.get(key).cloned()
    }

    pub fn list(&self, prefix: &str) -> Vec<String> {
        let state = self.state.lock();
        let keys = state
            .fsm
            .range(prefix.to_string()..)
            .map(|(k, _)| k.as_str())
            .take_while(|k| k.starts_with(prefix));
        immediate_children(keys, prefix)
    }

    /// Commit `command` through the leader, forwarding if this node follows.
    ///
    /// Returns the committed index after this node has applied it, or after
    /// one election timeout if it has not caught up by then.
    pub fn apply(&self, command: Command) -> Result<u64> {
        if self.is_leader() {
            return self.propose(command);
        }
        let leader = self
            .leader_address()
            .ok_or_else(|| BackendError::transient(format!("{} knows no leader", self.peer.id)))?;
        debug!(node = %self.peer.id, leader = %leader, "forwarding command to leader");
        let index = self.transport.apply(&leader, command)?;
        if !self.wait_applied(index, self.settings.election_timeout) {
            debug!(node = %self.peer.id, index, "forwarded entry not yet applied locally");
        }
        Ok(index)
    }

    /// Block until `index` is applied locally or `timeout` passes.
    pub fn wait_applied(&self, index: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.last_applied < index {
            if self.applied.wait_until(&mut state, deadline).timed_out() {
                return state.last_applied >= index;
            }
        }
        true
    }

    /// Append `command` as leader and wait for a quorum to commit it.
    pub fn propose(&self, command: Command) -> Result<u64> {
        self.submit(|_| Ok(Proposal::Append(command)))
    }

    // -----------------------------------------------------------------------
    // Membership
    // -----------------------------------------------------------------------

    /// Start a new cluster with this node as its only voter.
    ///
    /// Returns `false` without touching anything if the node already has
    /// state, so calling it on every start is safe.
    pub fn bootstrap(&self) -> Result<bool> {
        {
            let mut state = self.state.lock();
            if !state.log.is_empty() || state.term > 0 {
                debug!(node = %self.peer.id, "bootstrap skipped, node has state");
                return Ok(false);
            }
            let config = RaftConfiguration::new(vec![Peer {
                suffrage: Suffrage::Voter,
                ..self.peer.clone()
            }]);
            let entry = LogEntry {
                index: 1,
                term: 1,
                command: Command::Configuration(config),
            };
            self.store.append(std::slice::from_ref(&entry))?;
            state.log.push(entry);
            state.term = 1;
            state.commit_index = 1;
            state.apply_committed();
            self.store.save_state(&state.hard_state())?;
            info!(node = %self.peer.id, "bootstrapped new cluster");
        }
        self.campaign()?;
        Ok(true)
    }

    /// Ask the member at `target` to admit this node.
    pub fn join(&self, target: &str) -> Result<JoinResponse> {
        let response = self.transport.join(
            target,
            JoinRequest {
                peer: self.peer.clone(),
                forwarded: false,
            },
        )?;
        info!(
            node = %self.peer.id,
            leader = %response.leader_id,
            config_index = response.config_index,
            "join accepted"
        );
        Ok(response)
    }

    /// Add or update a peer. Leader only.
    pub fn add_peer(&self, peer: Peer) -> Result<JoinResponse> {
        let admitted = peer.clone();
        let index = self.submit(move |state| {
            let (index, latest) = state.latest_configuration();
            if latest.get(&peer.id) == Some(&peer) {
                return Ok(Proposal::Existing(index));
            }
            if index > state.commit_index {
                return Err(BackendError::transient("configuration change in progress").into());
            }
            Ok(Proposal::Append(Command::Configuration(latest.with_peer(peer))))
        })?;
        info!(
            node = %self.peer.id,
            peer = %admitted.id,
            suffrage = ?admitted.suffrage,
            index,
            "peer admitted"
        );
        Ok(JoinResponse {
            leader_id: self.peer.id.clone(),
            config_index: index,
        })
    }

    /// Drop a peer from the configuration. Leader only, and never the
    /// leader itself.
    pub fn remove_peer(&self, id: &str) -> Result<u64> {
        if id == self.peer.id {
            return Err(SealvaultError::InvalidParameters(
                "a leader cannot remove itself".to_string(),
            ));
        }
        let index = self.submit(|state| {
            let (index, latest) = state.latest_configuration();
            if !latest.contains(id) {
                return Ok(Proposal::Existing(index));
            }
            if index > state.commit_index {
                return Err(BackendError::transient("configuration change in progress").into());
            }
            Ok(Proposal::Append(Command::Configuration(latest.without_peer(id))))
        })?;
        info!(node = %self.peer.id, peer = id, index, "peer removed");
        Ok(index)
    }

    // -----------------------------------------------------------------------
    // Inbound RPCs
    // -----------------------------------------------------------------------

    pub fn handle_append_entries(&self, request: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        let mut state = self.state.lock();
        if request.term < state.term {
            return Ok(AppendEntriesResponse {
                term: state.term,
                success: false,
                last_log_index: state.last_index(),
            });
        }
        self.observe_term(&mut state, request.term)?;
        if state.role != Role::Follower {
            info!(node = %self.peer.id, term = state.term, "stepping down to follower");
            state.role = Role::Follower;
        }
        if state.leader.as_ref().map(|l| l.id != request.leader_id).unwrap_or(true) {
            info!(node = %self.peer.id, leader = %request.leader_id, term = state.term, "following leader");
        }
        state.leader = Some(LeaderHint {
            id: request.leader_id.clone(),
            address: request.leader_address.clone(),
        });
        state.election_deadline = election_deadline(&self.settings);

        if request.prev_log_index > state.last_index() {
            return Ok(AppendEntriesResponse {
                term: state.term,
                success: false,
                last_log_index: state.last_index(),
            });
        }
        if state.term_at(request.prev_log_index) != request.prev_log_term {
            return Ok(AppendEntriesResponse {
                term: state.term,
                success: false,
                last_log_index: request.prev_log_index.saturating_sub(1),
            });
        }

        let matched = request.prev_log_index + request.entries.len() as u64;
        let mut fresh = Vec::new();
        for entry in request.entries {
            if entry.index <= state.last_index() {
                if state.term_at(entry.index) == entry.term {
                    continue;
                }
                if entry.index <= state.commit_index {
                    return Err(BackendError::permanent(format!(
                        "leader {} conflicts with committed entry {}",
                        request.leader_id, entry.index
                    ))
                    .into());
                }
                let last = state.last_index();
                self.store.truncate(entry.index, last)?;
                state.log.truncate(entry.index as usize - 1);
                debug!(node = %self.peer.id, from = entry.index, "truncated conflicting log tail");
            }
            fresh.push(entry);
        }
        if !fresh.is_empty() {
            self.store.append(&fresh)?;
            state.log.extend(fresh);
        }

        let commit = request.leader_commit.min(matched);
        if commit > state.commit_index {
            state.commit_index = commit;
            state.apply_committed();
            self.store.save_state(&state.hard_state())?;
            self.applied.notify_all();
        }

        Ok(AppendEntriesResponse {
            term: state.term,
            success: true,
            last_log_index: matched,
        })
    }

    pub fn handle_request_vote(&self, request: VoteRequest) -> Result<VoteResponse> {
        let mut state = self.state.lock();
        if request.term < state.term {
            return Ok(VoteResponse {
                term: state.term,
                granted: false,
            });
        }
        self.observe_term(&mut state, request.term)?;

        let up_to_date =
            (request.last_log_term, request.last_log_index) >= (state.last_term(), state.last_index());
        let free = state
            .voted_for
            .as_deref()
            .map(|v| v == request.candidate_id)
            .unwrap_or(true);
        let granted = up_to_date && free;
        if granted {
            state.voted_for = Some(request.candidate_id.clone());
            state.election_deadline = election_deadline(&self.settings);
            self.store.save_state(&state.hard_state())?;
            debug!(node = %self.peer.id, candidate = %request.candidate_id, term = request.term, "granted vote");
        }
        Ok(VoteResponse {
            term: state.term,
            granted,
        })
    }

    /// Admit a peer, relaying once to the leader if this node follows.
    pub fn handle_join(&self, request: JoinRequest) -> Result<JoinResponse> {
        if self.is_leader() {
            return self.add_peer(request.peer);
        }
        if request.forwarded {
            return Err(self.not_leader());
        }
        let leader = self.leader_address().ok_or_else(|| self.not_leader())?;
        debug!(node = %self.peer.id, peer = %request.peer.id, leader = %leader, "relaying join");
        self.transport.join(
            &leader,
            JoinRequest {
                forwarded: true,
                ..request
            },
        )
    }

    /// A command relayed by a follower. Never relayed further.
    pub fn handle_apply(&self, command: Command) -> Result<u64> {
        self.propose(command)
    }

    pub fn handle_configuration(&self) -> ConfigurationResponse {
        let state = self.state.lock();
        ConfigurationResponse {
            configuration: state.committed.clone(),
            commit_index: state.commit_index,
            leader_id: state.leader.as_ref().map(|l| l.id.clone()),
        }
    }

    /// The committed configuration according to the current leader.
    pub fn leader_configuration(&self) -> Result<ConfigurationResponse> {
        if self.is_leader() {
            return Ok(self.handle_configuration());
        }
        let leader = self
            .leader_address()
            .ok_or_else(|| BackendError::transient(format!("{} knows no leader", self.peer.id)))?;
        self.transport.configuration(&leader)
    }

    // -----------------------------------------------------------------------
    // Elections
    // -----------------------------------------------------------------------

    /// Stand for election now. Returns whether this node ends up leader.
    pub fn campaign(&self) -> Result<bool> {
        let (request, voters, quorum) = {
            let mut state = self.state.lock();
            if state.role == Role::Leader {
                return Ok(true);
            }
            let (_, config) = state.latest_configuration();
            if !config.is_voter(&self.peer.id) {
                debug!(node = %self.peer.id, "not a voter, not campaigning");
                return Ok(false);
            }
            state.term += 1;
            state.role = Role::Candidate;
            state.voted_for = Some(self.peer.id.clone());
            state.leader = None;
            state.election_deadline = election_deadline(&self.settings);
            self.store.save_state(&state.hard_state())?;
            info!(node = %self.peer.id, term = state.term, "starting election");

            let request = VoteRequest {
                term: state.term,
                candidate_id: self.peer.id.clone(),
                last_log_index: state.last_index(),
                last_log_term: state.last_term(),
            };
            let voters: Vec<Option<String>> = config
                .voters()
                .filter(|p| p.id != self.peer.id)
                .map(|p| self.addresses.address_for(p))
                .collect();
            (request, voters, config.quorum())
        };

        let term = request.term;
        let mut votes = 1;
        for address in voters.into_iter().flatten() {
            if votes >= quorum {
                break;
            }
            match self.transport.request_vote(&address, request.clone()) {
                Ok(response) if response.term > term => {
                    let mut state = self.state.lock();
                    self.observe_term(&mut state, response.term)?;
                    return Ok(false);
                }
                Ok(response) if response.granted => votes += 1,
                Ok(_) => {}
                Err(err) => debug!(node = %self.peer.id, peer = %address, error = %err, "vote request failed"),
            }
        }

        {
            let mut state = self.state.lock();
            if state.term != term || state.role != Role::Candidate {
                return Ok(false);
            }
            if votes < quorum {
                debug!(node = %self.peer.id, term, votes, quorum, "election lost");
                return Ok(false);
            }
            self.become_leader(&mut state)?;
        }

        let _round = self.propose_lock.lock();
        if let Err(err) = self.replicate_round() {
            debug!(node = %self.peer.id, error = %err, "initial heartbeat failed");
        }
        Ok(self.is_leader())
    }

    fn become_leader(&self, state: &mut NodeState) -> Result<()> {
        state.role = Role::Leader;
        state.leader = Some(LeaderHint {
            id: self.peer.id.clone(),
            address: self.peer.address.clone(),
        });
        let next = state.last_index() + 1;
        let (_, config) = state.latest_configuration();
        state.next_index = config
            .peers
            .iter()
            .filter(|p| p.id != self.peer.id)
            .map(|p| (p.id.clone(), next))
            .collect();
        state.match_index.clear();

        // Commits entries left over from earlier terms.
        let entry = LogEntry {
            index: next,
            term: state.term,
            command: Command::Noop,
        };
        self.store.append(std::slice::from_ref(&entry))?;
        state.log.push(entry);
        info!(node = %self.peer.id, term = state.term, "became leader");
        Ok(())
    }

    /// Adopt a newer term seen on the wire.
    fn observe_term(&self, state: &mut NodeState, term: u64) -> Result<()> {
        if term <= state.term {
            return Ok(());
        }
        if state.role != Role::Follower {
            info!(node = %self.peer.id, old_term = state.term, new_term = term, "newer term seen, stepping down");
        }
        state.term = term;
        state.voted_for = None;
        state.role = Role::Follower;
        state.leader = None;
        self.store.save_state(&state.hard_state())
    }

    // -----------------------------------------------------------------------
    // Replication
    // -----------------------------------------------------------------------

    fn submit<F>(&self, build: F) -> Result<u64>
    where
        F: FnOnce(&NodeState) -> Result<Proposal>,
    {
        let _round = self.propose_lock.lock();
        let (index, term) = {
            let mut state = self.state.lock();
            if state.role != Role::Leader {
                return Err(self.not_leader());
            }
            let command = match build(&*state)? {
                Proposal::Existing(index) => return Ok(index),
                Proposal::Append(command) => command,
            };
            let entry = LogEntry {
                index: state.last_index() + 1,
                term: state.term,
                command,
            };
            self.store.append(std::slice::from_ref(&entry))?;
            let stamp = (entry.index, entry.term);
            state.log.push(entry);
            stamp
        };

        let deadline = Instant::now() + self.settings.election_timeout * 2;
        loop {
            self.replicate_round()?;
            {
                let state = self.state.lock();
                if state.commit_index >= index {
                    if state.term_at(index) != term {
                        return Err(BackendError::transient(format!("entry {} superseded", index)).into());
                    }
                    break;
                }
                if state.role != Role::Leader {
                    return Err(BackendError::transient("leadership lost before commit").into());
                }
            }
            if Instant::now() >= deadline {
                warn!(node = %self.peer.id, index, "entry not committed, quorum unreachable");
                return Err(BackendError::transient(format!("entry {} not committed: no quorum", index)).into());
            }
            thread::sleep(self.settings.heartbeat_interval);
        }

        // Followers learn the new commit index now rather than on the next heartbeat.
        if let Err(err) = self.replicate_round() {
            debug!(node = %self.peer.id, error = %err, "commit broadcast failed");
        }
        Ok(index)
    }

    /// One append-entries pass over every peer. Caller holds `propose_lock`.
    fn replicate_round(&self) -> Result<()> {
        let (term, targets) = {
            let mut state = self.state.lock();
            if state.role != Role::Leader {
                return Err(self.not_leader());
            }
            state.last_broadcast = Instant::now();
            let (_, config) = state.latest_configuration();
            let targets: Vec<(String, Option<String>)> = config
                .peers
                .iter()
                .filter(|p| p.id != self.peer.id)
                .map(|p| (p.id.clone(), self.addresses.address_for(p)))
                .collect();
            (state.term, targets)
        };

        for (peer_id, address) in targets {
            match address {
                Some(address) => self.replicate_to(term, &peer_id, &address)?,
                None => debug!(node = %self.peer.id, peer = %peer_id, "no address for peer"),
            }
        }

        let mut state = self.state.lock();
        if state.role == Role::Leader && state.term == term {
            self.advance_commit(&mut state)?;
        }
        Ok(())
    }

    /// Bring one follower up to date, walking back on log mismatches.
    fn replicate_to(&self, term: u64, peer_id: &str, address: &str) -> Result<()> {
        loop {
            let request = {
                let state = self.state.lock();
                if state.role != Role::Leader || state.term != term {
                    return Ok(());
                }
                let next = state
                    .next_index
                    .get(peer_id)
                    .copied()
                    .unwrap_or(state.last_index() + 1)
                    .clamp(1, state.last_index() + 1);
                let prev = next - 1;
                AppendEntriesRequest {
                    term,
                    leader_id: self.peer.id.clone(),
                    leader_address: self.peer.address.clone(),
                    prev_log_index: prev,
                    prev_log_term: state.term_at(prev),
                    entries: state.log[prev as usize..].to_vec(),
                    leader_commit: state.commit_index,
                }
            };
            let sent_next = request.prev_log_index + 1;
            let sent_through = request.prev_log_index + request.entries.len() as u64;

            let response = match self.transport.append_entries(address, request) {
                Ok(response) => response,
                Err(err) => {
                    debug!(node = %self.peer.id, peer = peer_id, error = %err, "append entries failed");
                    return Ok(());
                }
            };

            let mut state = self.state.lock();
            if response.term > state.term {
                return self.observe_term(&mut state, response.term);
            }
            if state.role != Role::Leader || state.term != term {
                return Ok(());
            }
            if response.success {
                let matched = response.last_log_index.min(sent_through);
                let current = state.match_index.get(peer_id).copied().unwrap_or(0).max(matched);
                state.match_index.insert(peer_id.to_string(), current);
                state.next_index.insert(peer_id.to_string(), current + 1);
                return Ok(());
            }
            if sent_next <= 1 {
                return Ok(());
            }
            let retry = (response.last_log_index + 1).min(sent_next - 1).max(1);
            state.next_index.insert(peer_id.to_string(), retry);
        }
    }

    fn advance_commit(&self, state: &mut NodeState) -> Result<()> {
        let (_, config) = state.latest_configuration();
        let quorum = config.quorum();
        let mut candidate = state.last_index();
        while candidate > state.commit_index && state.term_at(candidate) == state.term {
            let acks = config
                .voters()
                .filter(|p| {
                    p.id == self.peer.id
                        || state.match_index.get(&p.id).copied().unwrap_or(0) >= candidate
                })
                .count();
            if acks >= quorum {
                state.commit_index = candidate;
                state.apply_committed();
                self.store.save_state(&state.hard_state())?;
                self.applied.notify_all();
                debug!(node = %self.peer.id, commit_index = candidate, "commit advanced");
                break;
            }
            candidate -= 1;
        }
        Ok(())
    }

    fn leader_address(&self) -> Option<String> {
        let state = self.state.lock();
        let hint = state.leader.as_ref()?;
        let (_, config) = state.latest_configuration();
        config
            .get(&hint.id)
            .and_then(|p| self.addresses.address_for(p))
            .or_else(|| Some(hint.address.clone()))
    }

    fn not_leader(&self) -> SealvaultError {
        BackendError::transient(format!("{} is not the leader", self.peer.id)).into()
    }

    // -----------------------------------------------------------------------
    // Background driver
    // -----------------------------------------------------------------------

    /// One timer step: heartbeat if leading, campaign if the leader went quiet.
    pub fn tick(&self) {
        let now = Instant::now();
        let (role, election_due, heartbeat_due) = {
            let state = self.state.lock();
            (
                state.role,
                now >= state.election_deadline,
                now.duration_since(state.last_broadcast) >= self.settings.heartbeat_interval,
            )
        };
        match role {
            Role::Leader if heartbeat_due => {
                let _round = self.propose_lock.lock();
                if let Err(err) = self.replicate_round() {
                    debug!(node = %self.peer.id, error = %err, "heartbeat failed");
                }
            }
            Role::Leader => {}
            Role::Follower | Role::Candidate if election_due => {
                if let Err(err) = self.campaign() {
                    warn!(node = %self.peer.id, error = %err, "election attempt failed");
                }
            }
            Role::Follower | Role::Candidate => {}
        }
    }

    /// Run [`RaftNode::tick`] on a background thread until the handle drops.
    pub fn start_driver(self: &Arc<Self>) -> Result<DriverHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let node = Arc::downgrade(self);
        let pause = (self.settings.heartbeat_interval / 5).max(Duration::from_millis(1));

        let thread = thread::Builder::new()
            .name(format!("raft-{}", self.peer.id))
            .spawn(move || {
                while !flag.load(Ordering::SeqCst) {
                    match node.upgrade() {
                        Some(node) => node.tick(),
                        None => break,
                    }
                    thread::sleep(pause);
                }
            })?;

        debug!(node = %self.peer.id, "raft driver started");
        Ok(DriverHandle {
            stop,
            thread: Some(thread),
        })
    }
}

/// Owns a node's background driver. Dropping it stops the thread.
pub struct DriverHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for DriverHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::{ConfiguredAddresses, LocalNetwork};
    use crate::storage::InmemBackend;

    fn settings() -> RaftSettings {
        RaftSettings {
            heartbeat_interval: Duration::from_millis(10),
            election_timeout: Duration::from_millis(60),
        }
    }

    fn node(network: &LocalNetwork, id: &str, store: &InmemBackend) -> Arc<RaftNode> {
        let address = format!("{}:8201", id);
        RaftNode::open(
            Peer::voter(id, address.clone()),
            settings(),
            Arc::new(store.clone()),
            network.endpoint(address),
            Arc::new(ConfiguredAddresses),
        )
        .unwrap()
    }

    #[test]
    fn test_bootstrap_elects_single_node() {
        let network = LocalNetwork::new();
        let n1 = node(&network, "n1", &InmemBackend::new());

        assert!(n1.bootstrap().unwrap());
        assert!(n1.is_leader());
        assert!(!n1.bootstrap().unwrap());

        let index = n1
            .apply(Command::Put {
                key: "a/b".into(),
                value: b"1".to_vec(),
            })
            .unwrap();
        assert_eq!(n1.commit_index(), index);
        assert_eq!(n1.read("a/b"), Some(b"1".to_vec()));
        assert_eq!(n1.list("a/"), vec!["b"]);
    }

    #[test]
    fn test_join_replicates_and_forwards() {
        let network = LocalNetwork::new();
        let n1 = node(&network, "n1", &InmemBackend::new());
        let n2 = node(&network, "n2", &InmemBackend::new());
        let n3 = node(&network, "n3", &InmemBackend::new());
        n1.bootstrap().unwrap();
        n1.apply(Command::Put {
            key: "early".into(),
            value: b"x".to_vec(),
        })
        .unwrap();

        let joined = n2.join("n1:8201").unwrap();
        assert!(n2.wait_applied(joined.config_index, Duration::from_secs(1)));
        assert_eq!(n2.read("early"), Some(b"x".to_vec()));

        // Joining through a follower relays to the leader.
        let joined = n3.join("n2:8201").unwrap();
        assert_eq!(joined.leader_id, "n1");
        assert!(n3.wait_applied(joined.config_index, Duration::from_secs(1)));
        assert_eq!(n1.committed_configuration().voters().count(), 3);

        n3.apply(Command::Put {
            key: "late".into(),
            value: b"y".to_vec(),
        })
        .unwrap();
        assert_eq!(n1.read("late"), Some(b"y".to_vec()));
        assert_eq!(n3.read("late"), Some(b"y".to_vec()));
    }

    #[test]
    fn test_restart_replays_committed_log() {
        let network = LocalNetwork::new();
        let store = InmemBackend::new();
        {
            let n1 = node(&network, "n1", &store);
            n1.bootstrap().unwrap();
            n1.apply(Command::Transaction(vec![
                TxnOp::Put {
                    key: "k1".into(),
                    value: b"v1".to_vec(),
                },
                TxnOp::Put {
                    key: "k2".into(),
                    value: b"v2".to_vec(),
                },
            ]))
            .unwrap();
            n1.apply(Command::Delete { key: "k1".into() }).unwrap();
        }

        let n1 = node(&network, "n1", &store);
        assert_eq!(n1.role(), Role::Follower);
        assert_eq!(n1.read("k1"), None);
        assert_eq!(n1.read("k2"), Some(b"v2".to_vec()));
        assert!(n1.campaign().unwrap());
    }

    #[test]
    fn test_remove_peer() {
        let network = LocalNetwork::new();
        let n1 = node(&network, "n1", &InmemBackend::new());
        let n2 = node(&network, "n2", &InmemBackend::new());
        n1.bootstrap().unwrap();
        n2.join("n1:8201").unwrap();

        assert!(matches!(
            n1.remove_peer("n1"),
            Err(SealvaultError::InvalidParameters(_))
        ));
        n1.remove_peer("n2").unwrap();
        assert!(!n1.committed_configuration().contains("n2"));

        // A lone voter again, so writes commit without n2.
        n1.apply(Command::Put {
            key: "after".into(),
            value: b"z".to_vec(),
        })
        .unwrap();
        assert_eq!(n2.read("after"), None);
    }

    #[test]
    fn test_write_without_quorum_fails_transient() {
        let network = LocalNetwork::new();
        let n1 = node(&network, "n1", &InmemBackend::new());
        let n2 = node(&network, "n2", &InmemBackend::new());
        n1.bootstrap().unwrap();
        n2.join("n1:8201").unwrap();

        network.disconnect("n2:8201");
        match n1.apply(Command::Noop) {
            Err(SealvaultError::Backend(err)) => assert!(err.is_transient()),
            other => panic!("expected transient failure, got {:?}", other),
        }
    }
}
