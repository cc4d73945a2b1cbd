//! SHA-256 and CSPRNG helpers.
//!
//! `sha256` backs the identity fingerprint (§3 of the spec this core
//! implements); `random_bytes` is the single CSPRNG entry point every
//! other module in this crate routes through, so there is exactly one
//! place that could ever fall back to a non-cryptographic source (it
//! never does).

use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::CryptoError;

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// `n` bytes from the OS CSPRNG. The only failure mode is the RNG being
/// unavailable, which is fatal — there is no non-cryptographic fallback.
pub fn random_bytes(n: usize) -> Result<Vec<u8>, CryptoError> {
    let mut buf = vec![0u8; n];
    rand::rngs::OsRng
        .try_fill_bytes(&mut buf)
        .map_err(|e| CryptoError::CryptoUnavailable(e.to_string()))?;
    Ok(buf)
}
