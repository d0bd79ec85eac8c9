//! The seal state machine.
//!
//! ```text
//! Sealed --share--> Unsealing(k) --share--> ... --threshold--> Unsealed
//!    ^                                                            |
//!    +----------------------------- reseal -----------------------+
//! ```
//!
//! One coordinator per node. Its state lives behind a single mutex, and no
//! backend call is made while that mutex is held. When the final share
//! arrives, the submitting caller moves the node into a transient
//! "combining" phase, releases the lock, reconstructs the root key and
//! unseals the barrier. Concurrent callers wait on a condition variable and
//! then observe the outcome instead of combining again.

use std::mem;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::barrier::Barrier;
use crate::crypto::KEY_LEN;
use crate::error::{Result, SealvaultError};
use crate::keys::RootKey;
use crate::shamir::{self, KeyShare, MAX_SHARES};
use crate::storage::{Backend, TxnOp};
use crate::token;

/// Where the plaintext seal configuration lives.
pub const SEAL_CONFIG_PATH: &str = "core/seal-config";

/// How the root key is split. Stored in the clear: it is needed before any
/// key material exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealConfig {
    pub threshold: usize,
    pub total_shares: usize,
}

impl SealConfig {
    pub fn new(threshold: usize, total_shares: usize) -> Result<Self> {
        if threshold < 1 || threshold > total_shares || total_shares > MAX_SHARES {
            return Err(SealvaultError::InvalidParameters(format!(
                "need 1 <= threshold ({}) <= shares ({}) <= {}",
                threshold, total_shares, MAX_SHARES
            )));
        }
        Ok(Self {
            threshold,
            total_shares,
        })
    }
}

/// Observable seal state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SealState {
    Sealed,
    /// Some shares accepted, fewer than the threshold.
    Unsealing { provided: usize },
    Unsealed,
}

/// Seal state together with the stored configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealStatus {
    pub initialized: bool,
    pub sealed: bool,
    pub threshold: usize,
    pub total_shares: usize,
    pub progress: usize,
}

/// What initialization hands back. The node keeps neither.
#[derive(Debug)]
pub struct InitResult {
    pub shares: Vec<KeyShare>,
    pub root_token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Sealed,
    /// The final share is in; one caller is reconstructing. Holds the count.
    Combining(usize),
    Unsealed,
}

struct Progress {
    phase: Phase,
    shares: Vec<KeyShare>,
}

/// Owns the seal state machine for one node.
pub struct SealCoordinator {
    backend: Arc<dyn Backend>,
    barrier: Arc<Barrier>,
    progress: Mutex<Progress>,
    transition: Condvar,
    /// Serializes initialize and rekey.
    admin: Mutex<()>,
}

impl SealCoordinator {
    /// A coordinator in the `Sealed` state, whatever the node was before.
    pub fn new(backend: Arc<dyn Backend>, barrier: Arc<Barrier>) -> Self {
        Self {
            backend,
            barrier,
            progress: Mutex::new(Progress {
                phase: Phase::Sealed,
                shares: Vec::new(),
            }),
            transition: Condvar::new(),
            admin: Mutex::new(()),
        }
    }

    pub fn seal_config(&self) -> Result<Option<SealConfig>> {
        match self.backend.get(SEAL_CONFIG_PATH)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Generate the root key, split it, and lay down keyring, root token and
    /// seal configuration. The node stays sealed.
    ///
    /// The seal configuration is what marks a node initialized, and it is
    /// written last. A failed attempt leaves the node uninitialized and can
    /// simply be retried.
    pub fn initialize(&self, config: SealConfig) -> Result<InitResult> {
        let _admin = self.admin.lock();
        if self.seal_config()?.is_some() {
            return Err(SealvaultError::AlreadyInitialized);
        }

        let root = RootKey::generate()?;
        let shares = shamir::split(root.as_bytes(), config.total_shares, config.threshold)?;
        let (root_token, token_record) = token::mint()?;

        self.barrier.initialize(
            &root,
            vec![(token::ROOT_TOKEN_PATH.to_string(), token_record)],
            vec![TxnOp::Put {
                key: SEAL_CONFIG_PATH.to_string(),
                value: serde_json::to_vec(&config)?,
            }],
        )?;

        info!(
            threshold = config.threshold,
            total_shares = config.total_shares,
            backend = self.backend.name(),
            "initialized"
        );
        Ok(InitResult { shares, root_token })
    }

    /// Accept one share. On the threshold-th distinct share, reconstruct the
    /// root key and unseal.
    ///
    /// A failed reconstruction discards every accumulated share and leaves
    /// the node `Sealed`.
    pub fn submit_share(&self, share: KeyShare) -> Result<SealState> {
        let config = self.seal_config()?.ok_or(SealvaultError::NotInitialized)?;
        let index = share.index() as usize;
        if index == 0 || index > config.total_shares {
            return Err(SealvaultError::InvalidParameters(format!(
                "share index {} outside 1..={}",
                index, config.total_shares
            )));
        }
        if share.payload().len() != KEY_LEN {
            return Err(SealvaultError::CorruptShare("unexpected share length".into()));
        }

        let shares = {
            let mut progress = self.progress.lock();
            while let Phase::Combining(_) = progress.phase {
                self.transition.wait(&mut progress);
            }
            if progress.phase == Phase::Unsealed {
                return Ok(SealState::Unsealed);
            }
            if progress.shares.iter().any(|s| s.index() == share.index()) {
                return Err(SealvaultError::InvalidParameters(format!(
                    "share {} already submitted",
                    index
                )));
            }

            progress.shares.push(share);
            let provided = progress.shares.len();
            info!(provided, threshold = config.threshold, "accepted unseal share");

            if provided < config.threshold {
                return Ok(SealState::Unsealing { provided });
            }
            progress.phase = Phase::Combining(provided);
            mem::take(&mut progress.shares)
        };

        let outcome = self.reconstruct(&config, &shares);
        drop(shares);

        let mut progress = self.progress.lock();
        progress.phase = match outcome {
            Ok(()) => Phase::Unsealed,
            Err(_) => Phase::Sealed,
        };
        self.transition.notify_all();
        drop(progress);

        match outcome {
            Ok(()) => {
                info!("unsealed");
                Ok(SealState::Unsealed)
            }
            Err(err) => {
                warn!(error = %err, "unseal attempt failed, shares discarded");
                Err(err)
            }
        }
    }

    fn reconstruct(&self, config: &SealConfig, shares: &[KeyShare]) -> Result<()> {
        let secret = shamir::combine(shares, config.threshold)?;
        let root = RootKey::from_slice(&secret)?;
        self.barrier.unseal(root)
    }

    /// Discard a partial unseal attempt.
    pub fn reset_unseal(&self) -> SealState {
        let mut progress = self.progress.lock();
        if progress.phase == Phase::Sealed && !progress.shares.is_empty() {
            progress.shares.clear();
            info!("unseal progress reset");
        }
        Self::observe(&progress)
    }

    /// Drop all key material from memory. Stored data is untouched.
    ///
    /// Resealing a sealed node only clears any partial unseal progress.
    pub fn reseal(&self) -> SealState {
        let mut progress = self.progress.lock();
        while let Phase::Combining(_) = progress.phase {
            self.transition.wait(&mut progress);
        }
        self.barrier.seal();
        if progress.phase == Phase::Unsealed {
            info!("resealed");
        }
        progress.phase = Phase::Sealed;
        progress.shares.clear();
        SealState::Sealed
    }

    pub fn state(&self) -> SealState {
        Self::observe(&self.progress.lock())
    }

    fn observe(progress: &Progress) -> SealState {
        match progress.phase {
            Phase::Unsealed => SealState::Unsealed,
            Phase::Combining(provided) => SealState::Unsealing { provided },
            Phase::Sealed if progress.shares.is_empty() => SealState::Sealed,
            Phase::Sealed => SealState::Unsealing {
                provided: progress.shares.len(),
            },
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.state() != SealState::Unsealed
    }

    pub fn status(&self) -> Result<SealStatus> {
        let config = self.seal_config()?;
        let state = self.state();
        let progress = match state {
            SealState::Unsealing { provided } => provided,
            _ => 0,
        };
        Ok(SealStatus {
            initialized: config.is_some(),
            sealed: state != SealState::Unsealed,
            threshold: config.map(|c| c.threshold).unwrap_or(0),
            total_shares: config.map(|c| c.total_shares).unwrap_or(0),
            progress,
        })
    }

    /// Replace the root key and hand out a new set of shares.
    ///
    /// Requires the node unsealed. Data keys and stored entries are untouched;
    /// only the keyring's protection and the seal configuration change.
    pub fn rekey(&self, config: SealConfig) -> Result<Vec<KeyShare>> {
        let _admin = self.admin.lock();
        if self.state() != SealState::Unsealed {
            return Err(SealvaultError::Sealed);
        }

        let root = RootKey::generate()?;
        let shares = shamir::split(root.as_bytes(), config.total_shares, config.threshold)?;
        let companions = vec![TxnOp::Put {
            key: SEAL_CONFIG_PATH.to_string(),
            value: serde_json::to_vec(&config)?,
        }];
        self.barrier.rekey(root, companions)?;

        info!(
            threshold = config.threshold,
            total_shares = config.total_shares,
            "rekeyed"
        );
        Ok(shares)
    }
}
