//! The root token.
//!
//! Created once at initialization and handed to the operator. Only its
//! SHA-256 digest is stored, and that record sits behind the barrier, so
//! checking a token needs the node unsealed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::barrier::Barrier;
use crate::crypto;
use crate::error::{Result, SealvaultError};

pub const ROOT_TOKEN_PATH: &str = "core/root-token";

const TOKEN_PREFIX: &str = "svr.";
const TOKEN_BYTES: usize = 24;

#[derive(Serialize, Deserialize)]
struct RootTokenRecord {
    digest: String,
    created_at: DateTime<Utc>,
}

/// Mint a root token. Returns the token and the record to store for it at
/// [`ROOT_TOKEN_PATH`], which must go through the barrier.
pub(crate) fn mint() -> Result<(String, Vec<u8>)> {
    let mut raw = Zeroizing::new([0u8; TOKEN_BYTES]);
    crypto::fill_random(&mut raw[..])?;
    let token = format!("{}{}", TOKEN_PREFIX, hex::encode(&raw[..]));

    let record = RootTokenRecord {
        digest: hex::encode(crypto::sha256(token.as_bytes())),
        created_at: Utc::now(),
    };
    Ok((token, serde_json::to_vec(&record)?))
}

/// Whether `token` is the root token.
pub(crate) fn verify(barrier: &Barrier, token: &str) -> Result<bool> {
    let stored = barrier
        .get(ROOT_TOKEN_PATH)?
        .ok_or_else(|| SealvaultError::NotFound(ROOT_TOKEN_PATH.to_string()))?;
    let record: RootTokenRecord = serde_json::from_slice(&stored)?;
    Ok(record.digest == hex::encode(crypto::sha256(token.as_bytes())))
}
