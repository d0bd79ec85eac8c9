//! Key ownership and derivation.
//!
//! This module owns two responsibilities:
//! 1. Holding root and data key material in types that are opaque,
//!    non-cloneable, and zeroised on drop.
//! 2. Deriving the keyring-protection key from the root key with
//!    HKDF-SHA256.
//!
//! ## Derivation structure
//!
//! ```text
//! HKDF-SHA256(
//!     ikm  = root_key,
//!     salt = None,
//!     info = "sealvault:{purpose}"
//! )
//! ```
//!
//! The root key never encrypts application data directly. It only protects the
//! keyring, and the keyring's per-term data keys protect everything else.

use ring::hkdf;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{self, KEY_LEN};
use crate::error::SealvaultError;

/// HKDF purpose tags.
pub(crate) mod purpose {
    pub const KEYRING: &str = "keyring";
}

// ---------------------------------------------------------------------------
// Root key
// ---------------------------------------------------------------------------

/// The root key. Reconstructed from shares on unseal, never persisted.
///
/// - Not `Clone`. Cannot be duplicated without explicit conversion.
/// - Zeroised on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct RootKey {
    bytes: [u8; KEY_LEN],
}

impl RootKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    /// Rebuild a root key from a recombined secret.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, SealvaultError> {
        let bytes: [u8; KEY_LEN] = bytes.try_into().map_err(|_| SealvaultError::InvalidKey)?;
        Ok(Self { bytes })
    }

    pub fn generate() -> Result<Self, SealvaultError> {
        Ok(Self::from_bytes(crypto::generate_random_key()?))
    }

    /// Explicit copy for a new keyring snapshot. Both copies zeroise on drop.
    pub(crate) fn duplicate(&self) -> Self {
        Self { bytes: self.bytes }
    }

    /// Raw bytes, used only for splitting into shares and HKDF input.
    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl std::fmt::Debug for RootKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RootKey(..)")
    }
}

// ---------------------------------------------------------------------------
// Data key
// ---------------------------------------------------------------------------

/// One keyring term's data-encryption key.
///
/// Zeroised on drop. Raw bytes stay inside the crate.
#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct DataKey {
    bytes: [u8; KEY_LEN],
}

impl DataKey {
    pub(crate) fn generate() -> Result<Self, SealvaultError> {
        Ok(Self {
            bytes: crypto::generate_random_key()?,
        })
    }

    pub(crate) fn from_slice(bytes: &[u8]) -> Result<Self, SealvaultError> {
        let bytes: [u8; KEY_LEN] = bytes.try_into().map_err(|_| SealvaultError::InvalidKey)?;
        Ok(Self { bytes })
    }

    /// Explicit copy. Used when a rotation builds the next keyring snapshot.
    pub(crate) fn duplicate(&self) -> Self {
        Self { bytes: self.bytes }
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

// ---------------------------------------------------------------------------
// Derivation
// ---------------------------------------------------------------------------

/// Derive a purpose-scoped key from the root key.
///
/// Different purposes produce statistically independent keys, and the
/// output reveals nothing about the root key.
pub(crate) fn derive_key(root: &RootKey, purpose: &str) -> Result<DataKey, SealvaultError> {
    let info = format!("sealvault:{}", purpose);

    let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, &[]);
    let prk = salt.extract(root.as_bytes());

    let info_slices = [info.as_bytes()];
    let okm = prk
        .expand(&info_slices, hkdf::HKDF_SHA256)
        .map_err(|_| SealvaultError::KeyDerivationFailure)?;

    let mut derived = [0u8; KEY_LEN];
    okm.fill(&mut derived)
        .map_err(|_| SealvaultError::KeyDerivationFailure)?;

    Ok(DataKey { bytes: derived })
}
