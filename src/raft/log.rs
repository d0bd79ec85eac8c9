//! Log entries and their durable store.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::RaftConfiguration;
use crate::error::{BackendError, Result};
use crate::storage::{Backend, TxnOp};

const STATE_KEY: &str = "raft/state";
const LOG_PREFIX: &str = "raft/log/";

/// A state-machine command carried by the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Appended by a new leader to commit entries from earlier terms.
    Noop,
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
    Transaction(Vec<TxnOp>),
    /// Membership change. Takes effect as soon as it is appended.
    Configuration(RaftConfiguration),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub command: Command,
}

/// What a node must remember across restarts besides its log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct HardState {
    pub term: u64,
    pub voted_for: Option<String>,
    pub commit_index: u64,
}

/// Hard state and log entries persisted on a backing backend.
pub(crate) struct LogStore {
    store: Arc<dyn Backend>,
}

impl LogStore {
    pub fn new(store: Arc<dyn Backend>) -> Self {
        Self { store }
    }

    fn entry_key(index: u64) -> String {
        format!("{}{:020}", LOG_PREFIX, index)
    }

    /// Everything persisted so far. The log must run contiguously from 1.
    pub fn load(&self) -> Result<(HardState, Vec<LogEntry>)> {
        let state = match self.store.get(STATE_KEY)? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => HardState::default(),
        };

        let mut indices = Vec::new();
        for name in self.store.list(LOG_PREFIX)? {
            let index: u64 = name
                .parse()
                .map_err(|_| BackendError::permanent(format!("stray raft log key {}", name)))?;
            indices.push(index);
        }
        indices.sort_unstable();

        let mut entries = Vec::with_capacity(indices.len());
        for (position, index) in indices.into_iter().enumerate() {
            if index != position as u64 + 1 {
                return Err(BackendError::permanent(format!("raft log gap before index {}", index)).into());
            }
            let bytes = self
                .store
                .get(&Self::entry_key(index))?
                .ok_or_else(|| BackendError::permanent(format!("raft log entry {} vanished", index)))?;
            let entry: LogEntry = serde_json::from_slice(&bytes)?;
            if entry.index != index {
                return Err(BackendError::permanent(format!("raft log entry {} mislabeled", index)).into());
            }
            entries.push(entry);
        }

        Ok((state, entries))
    }

    pub fn save_state(&self, state: &HardState) -> Result<()> {
        self.store.put(STATE_KEY, &serde_json::to_vec(state)?)
    }

    pub fn append(&self, entries: &[LogEntry]) -> Result<()> {
        for entry in entries {
            self.store
                .put(&Self::entry_key(entry.index), &serde_json::to_vec(entry)?)?;
        }
        Ok(())
    }

    /// Delete entries `from..=last`.
    pub fn truncate(&self, from: u64, last: u64) -> Result<()> {
        for index in (from..=last).rev() {
            self.store.delete(&Self::entry_key(index))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InmemBackend;

    fn entry(index: u64, term: u64) -> LogEntry {
        LogEntry {
            index,
            term,
            command: Command::Put {
                key: format!("k{}", index),
                value: vec![index as u8],
            },
        }
    }

    #[test]
    fn test_persist_and_reload() {
        let backing = InmemBackend::new();
        let store = LogStore::new(Arc::new(backing.clone()));

        store.append(&[entry(1, 1), entry(2, 1), entry(3, 2)]).unwrap();
        store
            .save_state(&HardState {
                term: 2,
                voted_for: Some("n1".into()),
                commit_index: 2,
            })
            .unwrap();
        store.truncate(3, 3).unwrap();

        let reopened = LogStore::new(Arc::new(backing));
        let (state, entries) = reopened.load().unwrap();
        assert_eq!(state.term, 2);
        assert_eq!(state.commit_index, 2);
        assert_eq!(entries, vec![entry(1, 1), entry(2, 1)]);
    }

    #[test]
    fn test_gap_is_permanent_error() {
        let backing = InmemBackend::new();
        let store = LogStore::new(Arc::new(backing));
        store.append(&[entry(1, 1), entry(3, 1)]).unwrap();
        assert!(store.load().is_err());
    }
}
