//! Error taxonomy (§7) — exhaustive, propagated as tagged variants, no
//! silent downgrade from encrypted to plaintext at this layer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    /// RNG or a cryptographic primitive is unavailable. Fatal to the process.
    #[error("cryptographic primitive unavailable: {0}")]
    CryptoUnavailable(String),

    /// AEAD-open of a persisted secret failed. Reset is the only recovery.
    #[error("storage corrupt: {0}")]
    StorageCorrupt(String),

    /// Signed-prekey signature failed to verify. Abort; do not retry with
    /// the same bundle.
    #[error("bad prekey bundle: {0}")]
    BadBundle(String),

    /// Peer has no prekey bundle published.
    #[error("recipient {0} has not provisioned prekeys")]
    RecipientNotProvisioned(String),

    /// Bundle fetch or upload failed at the transport layer. Retriable.
    #[error("network error: {0}")]
    NetworkError(String),

    /// Header's messageNumber exceeds the current chain by more than MaxSkip.
    #[error("too many skipped messages: {attempted} exceeds MaxSkip={max}")]
    TooManySkipped { attempted: u64, max: u64 },

    /// AEAD open failed for the message. State is not mutated.
    #[error("message decryption failed")]
    DecryptFailed,

    /// A decrypt arrived with no `x3dh` block and no prior session.
    #[error("no session for peer and envelope carries no X3DH handshake data")]
    SessionStateMissing,

    #[error("record not found: {0}")]
    NotFound(String),
}

/// Classifies a `dl_crypto::CryptoError` into the taxonomy above, rather
/// than wrapping it opaquely — callers match on `TooManySkipped` /
/// `BadBundle` / `DecryptFailed` to decide recovery, so the distinction
/// must survive the crate boundary.
impl From<dl_crypto::CryptoError> for SessionError {
    fn from(e: dl_crypto::CryptoError) -> Self {
        use dl_crypto::CryptoError as C;
        match e {
            C::CryptoUnavailable(msg) => SessionError::CryptoUnavailable(msg),
            C::BadBundle(msg) => SessionError::BadBundle(msg),
            C::SignatureVerification => SessionError::BadBundle("signature verification failed".into()),
            C::TooManySkipped { attempted, max } => SessionError::TooManySkipped { attempted, max },
            C::AeadDecrypt | C::DecryptFailed => SessionError::DecryptFailed,
            other => SessionError::CryptoUnavailable(other.to_string()),
        }
    }
}

impl From<dl_store::StoreError> for SessionError {
    fn from(e: dl_store::StoreError) -> Self {
        use dl_store::StoreError as S;
        match e {
            S::Corrupt(msg) => SessionError::StorageCorrupt(msg),
            S::NotFound(msg) => SessionError::NotFound(msg),
            S::Crypto(inner) => inner.into(),
            other => SessionError::StorageCorrupt(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for SessionError {
    fn from(e: reqwest::Error) -> Self {
        SessionError::NetworkError(e.to_string())
    }
}
