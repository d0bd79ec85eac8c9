//! # sealvault
//!
//! A sealed encryption barrier over pluggable storage.
//!
//! Every persisted byte is encrypted under a keyring whose protection key is
//! derived from a single root key. The root key is never stored: it is split
//! into Shamir shares at initialization and exists in memory only between a
//! quorum of operators submitting their shares and the next reseal.
//!
//! The same seal and barrier logic runs unchanged on every storage variant:
//! process memory, a local file tree, an external key-value service, or a
//! Raft-replicated log with leader election and dynamic membership.
//!
//! ## Public API
//!
//! [`Core`] is the administrative surface. The storage, Raft and cluster
//! types are public so callers can assemble a node themselves or inject
//! transports. Raw key material never leaves the crate.

// Module declarations.
pub mod barrier;
pub mod cluster;
pub mod config;
pub mod core;
pub(crate) mod crypto;
pub mod error;
pub(crate) mod keys;
pub mod raft;
pub mod seal;
pub mod shamir;
pub mod storage;
pub(crate) mod token;

pub use crate::cluster::ClusterCoordinator;
pub use crate::config::{ClusterSettings, Collaborators, CoreConfig, StorageConfig};
pub use crate::core::Core;
pub use crate::error::{BackendError, Result, SealvaultError};
pub use crate::keys::RootKey;
pub use crate::seal::{InitResult, SealConfig, SealState, SealStatus};
pub use crate::shamir::KeyShare;

/// Generate a fresh random root key.
///
/// [`Core::initialize`] does this itself. This entry point exists for callers
/// that drive [`barrier::Barrier`] directly.
pub fn generate_root_key() -> Result<RootKey> {
    RootKey::generate()
}
