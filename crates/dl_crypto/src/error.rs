use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Signature verification failed")]
    SignatureVerification,

    #[error("AEAD encryption failed")]
    AeadEncrypt,

    #[error("AEAD decryption failed (authentication tag mismatch — possible tampering)")]
    AeadDecrypt,

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Ratchet step failed: {0}")]
    RatchetStep(String),

    #[error("Cryptographic primitive unavailable: {0}")]
    CryptoUnavailable(String),

    #[error("Bad prekey bundle: {0}")]
    BadBundle(String),

    #[error("Too many skipped messages: {attempted} exceeds MaxSkip={max}")]
    TooManySkipped { attempted: u64, max: u64 },

    #[error("Message decryption failed (authentication tag mismatch)")]
    DecryptFailed,

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}
