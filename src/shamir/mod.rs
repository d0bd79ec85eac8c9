//! Threshold key sharing.
//!
//! The root key is split with Shamir's scheme over GF(256), byte by byte:
//! each secret byte becomes the constant term of its own random polynomial
//! of degree `threshold - 1`, and share `i` carries that polynomial's value
//! at `x = i` for every byte.
//!
//! Any `threshold` distinct shares reconstruct the secret by Lagrange
//! interpolation at zero. Fewer reveal nothing about it. Callers always say
//! which threshold they expect, so an undersized set is rejected instead
//! of interpolating to a plausible wrong answer.

mod field;

use std::collections::BTreeMap;

use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto;
use crate::error::SealvaultError;
use field::Gf256;

/// Largest share count the field can address: every non-zero element.
pub const MAX_SHARES: usize = 255;

/// One operator's share of the root key.
///
/// The system hands these out at initialization and keeps none of them.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct KeyShare {
    index: u8,
    payload: Vec<u8>,
}

impl KeyShare {
    pub fn new(index: u8, payload: Vec<u8>) -> Self {
        Self { index, payload }
    }

    /// The evaluation point, in `1..=total`.
    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload followed by the one-byte evaluation point.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload.len() + 1);
        out.extend_from_slice(&self.payload);
        out.push(self.index);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SealvaultError> {
        match bytes.split_last() {
            Some((&index, payload)) if !payload.is_empty() => Ok(Self::new(index, payload.to_vec())),
            _ => Err(SealvaultError::CorruptShare("share too short".into())),
        }
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    pub fn from_hex(encoded: &str) -> Result<Self, SealvaultError> {
        let bytes = Zeroizing::new(
            hex::decode(encoded.trim())
                .map_err(|_| SealvaultError::CorruptShare("share is not valid hex".into()))?,
        );
        Self::from_bytes(&bytes)
    }
}

impl std::fmt::Debug for KeyShare {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyShare")
            .field("index", &self.index)
            .field("len", &self.payload.len())
            .finish()
    }
}

/// Split `secret` into `total` shares, any `threshold` of which rebuild it.
pub fn split(secret: &[u8], total: usize, threshold: usize) -> Result<Vec<KeyShare>, SealvaultError> {
    if secret.is_empty() {
        return Err(SealvaultError::InvalidParameters("secret is empty".into()));
    }
    if threshold < 1 {
        return Err(SealvaultError::InvalidParameters("threshold must be at least 1".into()));
    }
    if threshold > total {
        return Err(SealvaultError::InvalidParameters(
            "threshold exceeds share count".into(),
        ));
    }
    if total > MAX_SHARES {
        return Err(SealvaultError::InvalidParameters(format!(
            "at most {} shares are supported",
            MAX_SHARES
        )));
    }

    // Coefficients for x^1..x^(t-1), laid out per secret byte.
    let degree = threshold - 1;
    let mut coefficients = Zeroizing::new(vec![0u8; secret.len() * degree]);
    crypto::fill_random(&mut coefficients)?;

    let mut shares = Vec::with_capacity(total);
    for index in 1..=total as u8 {
        let x = Gf256(index);
        let payload = secret
            .iter()
            .enumerate()
            .map(|(i, &byte)| {
                let higher = &coefficients[i * degree..(i + 1) * degree];
                Gf256::eval_polynomial(byte, higher, x).0
            })
            .collect();
        shares.push(KeyShare::new(index, payload));
    }

    Ok(shares)
}

/// Rebuild the secret from at least `threshold` distinct shares.
///
/// - Fewer than `threshold` distinct indices: `InsufficientShares`.
/// - Index zero, empty or mismatched payload lengths, or one index carried
///   with two different payloads: `CorruptShare`.
/// - More than `threshold` shares: the secret is interpolated from the
///   lowest `threshold` indices and every extra share must lie on the same
///   polynomial, otherwise `CorruptShare`.
///
/// The result does not depend on which valid subset is supplied or in what
/// order.
pub fn combine(shares: &[KeyShare], threshold: usize) -> Result<Zeroizing<Vec<u8>>, SealvaultError> {
    if threshold < 1 {
        return Err(SealvaultError::InvalidParameters("threshold must be at least 1".into()));
    }

    let secret_len = shares.first().map(|s| s.payload.len()).unwrap_or(0);
    let mut distinct: BTreeMap<u8, &KeyShare> = BTreeMap::new();

    for share in shares {
        if share.index == 0 {
            return Err(SealvaultError::CorruptShare("share index zero".into()));
        }
        if share.payload.is_empty() || share.payload.len() != secret_len {
            return Err(SealvaultError::CorruptShare("share lengths differ".into()));
        }
        match distinct.get(&share.index) {
            Some(seen) if seen.payload != share.payload => {
                return Err(SealvaultError::CorruptShare(format!(
                    "conflicting payloads for share {}",
                    share.index
                )));
            }
            Some(_) => {}
            None => {
                distinct.insert(share.index, share);
            }
        }
    }

    if distinct.len() < threshold {
        return Err(SealvaultError::InsufficientShares {
            provided: distinct.len(),
            required: threshold,
        });
    }

    let ordered: Vec<&KeyShare> = distinct.into_values().collect();
    let (basis, extra) = ordered.split_at(threshold);

    let mut secret = Zeroizing::new(vec![0u8; secret_len]);
    let mut points = Vec::with_capacity(threshold);

    for (byte, out) in secret.iter_mut().enumerate() {
        points.clear();
        points.extend(
            basis
                .iter()
                .map(|s| (Gf256(s.index), Gf256(s.payload[byte]))),
        );

        *out = Gf256::interpolate(&points, Gf256::ZERO).0;

        for share in extra {
            let expected = Gf256::interpolate(&points, Gf256(share.index));
            if expected.0 != share.payload[byte] {
                return Err(SealvaultError::CorruptShare(format!(
                    "share {} is inconsistent with the others",
                    share.index
                )));
            }
        }
    }

    points.fill((Gf256::ZERO, Gf256::ZERO));
    Ok(secret)
}
