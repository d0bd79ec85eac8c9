//! Low-level cryptographic operations.
//!
//! This module and `keys` are the only places in the crate that import `ring`
//! directly. Everything else encrypts, decrypts and draws randomness through
//! the functions exposed here.
//!
//! Primitive choices:
//! - **Cipher**: AES-256-GCM (authenticated encryption with additional data)
//! - **Nonce**: 96-bit (12 bytes), generated fresh per operation via `SystemRandom`
//! - **Key size**: 256 bits (32 bytes)
//! - **Digest**: SHA-256

use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::SealvaultError;

/// The AEAD algorithm used throughout sealvault.
const ALGORITHM: &aead::Algorithm = &AES_256_GCM;

/// Size of the nonce in bytes (96 bits).
pub const NONCE_LEN: usize = 12;

/// Size of a root or data key in bytes (256 bits).
pub const KEY_LEN: usize = 32;

/// Size of the GCM authentication tag in bytes.
pub const TAG_LEN: usize = 16;

/// Fill `buf` from the system CSPRNG.
pub fn fill_random(buf: &mut [u8]) -> Result<(), SealvaultError> {
    SystemRandom::new()
        .fill(buf)
        .map_err(|_| SealvaultError::RandomnessFailure)
}

/// Generate a cryptographically secure random key.
pub fn generate_random_key() -> Result<[u8; KEY_LEN], SealvaultError> {
    let mut key = [0u8; KEY_LEN];
    fill_random(&mut key)?;
    Ok(key)
}

/// A uniformly random `u64`, used for election jitter.
pub fn random_u64() -> Result<u64, SealvaultError> {
    let mut buf = [0u8; 8];
    fill_random(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// SHA-256 of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let d = digest::digest(&digest::SHA256, data);
    let mut out = [0u8; 32];
    out.copy_from_slice(d.as_ref());
    out
}

fn bind_key(key_bytes: &[u8; KEY_LEN]) -> Result<LessSafeKey, SealvaultError> {
    let unbound = UnboundKey::new(ALGORITHM, key_bytes).map_err(|_| SealvaultError::InvalidKey)?;
    Ok(LessSafeKey::new(unbound))
}

/// Encrypt `plaintext` with AES-256-GCM, authenticating `aad` alongside it.
///
/// # Layout of returned bytes
/// ```text
/// [ nonce (12 bytes) ][ ciphertext ][ GCM tag (16 bytes) ]
/// ```
pub fn encrypt(
    key_bytes: &[u8; KEY_LEN],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, SealvaultError> {
    let key = bind_key(key_bytes)?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    fill_random(&mut nonce_bytes)?;
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let mut in_out = plaintext.to_vec();
    key.seal_in_place_append_tag(nonce, Aad::from(aad), &mut in_out)
        .map_err(|_| SealvaultError::EncryptionFailure)?;

    let mut output = Vec::with_capacity(NONCE_LEN + in_out.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&in_out);
    Ok(output)
}

/// Decrypt bytes produced by [`encrypt`].
///
/// A wrong key, a different `aad`, or any modified byte fails the GCM check
/// and yields `AuthenticationFailed`. No partial plaintext is returned.
pub fn decrypt(
    key_bytes: &[u8; KEY_LEN],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, SealvaultError> {
    if ciphertext.len() < NONCE_LEN + TAG_LEN {
        return Err(SealvaultError::AuthenticationFailed);
    }

    let (nonce_bytes, sealed) = ciphertext.split_at(NONCE_LEN);
    let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
        .map_err(|_| SealvaultError::AuthenticationFailed)?;

    let key = bind_key(key_bytes)?;
    let mut payload = sealed.to_vec();
    let plaintext = key
        .open_in_place(nonce, Aad::from(aad), &mut payload)
        .map_err(|_| SealvaultError::AuthenticationFailed)?;

    Ok(plaintext.to_vec())
}
