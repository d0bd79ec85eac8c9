//! Pluggable storage backends.
//!
//! A backend stores opaque bytes under `/`-separated string keys and lists
//! the immediate children of a prefix. It never sees plaintext: the barrier
//! encrypts everything before it gets here.
//!
//! Variants and their optional capabilities:
//!
//! | variant | HA lock | transactions | consensus |
//! |---------|---------|--------------|-----------|
//! | [`InmemBackend`] | no | yes | no |
//! | [`FileBackend`] | no | no | no |
//! | [`KvBackend`] | yes | no | no |
//! | [`crate::raft::RaftBackend`] | yes | yes | yes |

mod file;
mod inmem;
mod kv;
mod retry;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use file::FileBackend;
pub use inmem::InmemBackend;
pub use kv::{KvBackend, KvTransport, LoopbackKv};
pub use retry::RetryPolicy;

/// Optional features a backend advertises at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Exclusive locks usable for active/standby failover.
    pub ha_enabled: bool,
    /// Atomic multi-key writes.
    pub transactional: bool,
    /// Writes are quorum-committed to a replicated log before returning.
    pub consensus: bool,
}

/// The uniform backend contract.
pub trait Backend: Send + Sync {
    /// Short name for logs (`"inmem"`, `"file"`, ...).
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// `Ok(None)` when the key is absent.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Deleting an absent key succeeds.
    fn delete(&self, key: &str) -> Result<()>;

    /// Immediate children of `prefix`, sorted. Sub-directories end in `/`.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    fn as_ha(&self) -> Option<&dyn HaBackend> {
        None
    }

    fn as_transactional(&self) -> Option<&dyn Transactional> {
        None
    }
}

// ---------------------------------------------------------------------------
// Optional capabilities
// ---------------------------------------------------------------------------

/// One write inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnOp {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

impl TxnOp {
    pub fn key(&self) -> &str {
        match self {
            Self::Put { key, .. } | Self::Delete { key } => key,
        }
    }
}

/// Atomic multi-key writes: all ops land or none do.
pub trait Transactional {
    fn transaction(&self, ops: &[TxnOp]) -> Result<()>;
}

/// A held HA lock.
pub trait HaLock: Send + Sync {
    fn holder(&self) -> &str;

    /// Whether the lock is still held. Leadership can be lost at any time.
    fn is_held(&self) -> Result<bool>;

    fn release(&self) -> Result<()>;
}

/// Exclusive lock acquisition for active/standby failover.
pub trait HaBackend {
    /// `Ok(None)` when someone else holds the lock.
    fn try_lock(&self, key: &str, holder: &str) -> Result<Option<Box<dyn HaLock>>>;
}

// ---------------------------------------------------------------------------
// Helpers shared by variants
// ---------------------------------------------------------------------------

/// Immediate children of `prefix` among a sorted stream of flat keys.
pub(crate) fn immediate_children<'a, I>(keys: I, prefix: &str) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut children = BTreeSet::new();
    for key in keys {
        let Some(rest) = key.strip_prefix(prefix) else {
            continue;
        };
        if rest.is_empty() {
            continue;
        }
        match rest.find('/') {
            Some(pos) => children.insert(rest[..=pos].to_string()),
            None => children.insert(rest.to_string()),
        };
    }
    children.into_iter().collect()
}

/// Apply `ops` one by one. Used where the backend has no atomic path.
pub(crate) fn apply_sequentially(backend: &dyn Backend, ops: &[TxnOp]) -> Result<()> {
    for op in ops {
        match op {
            TxnOp::Put { key, value } => backend.put(key, value)?,
            TxnOp::Delete { key } => backend.delete(key)?,
        }
    }
    Ok(())
}
