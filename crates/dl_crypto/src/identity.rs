//! Long-term identity key management.
//!
//! Each user has exactly one `IdentityKeyPair`, created once from a random
//! 32-byte seed and never mutated for the lifetime of the identity
//! (destroyed only by an explicit reset). From that seed two independent
//! keypairs are deterministically derived:
//! - an Ed25519 signing keypair, used to sign the current signed prekey;
//! - an X25519 key-agreement keypair, used as the identity's DH input to
//!   X3DH.
//!
//! These are derived via two domain-separated HKDF-SHA256 expansions of
//! the same seed rather than by converting one key's bit representation
//! into the other curve's — the conversion shortcut some Ed25519/X25519
//! dual-use schemes use is avoided so the two keypairs have no
//! cryptographic relationship beyond sharing a seed.
//!
//! Key-change policy (NON-NEGOTIABLE)
//! -----------------------------------
//! If a stored `IdentityPublicKey` for a verified contact changes, the
//! host application MUST block send/receive to that contact and require
//! explicit re-verification before resuming. This module only produces
//! and fingerprints key material; enforcement is the caller's
//! responsibility.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier as _, VerifyingKey};
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret as X25519Secret};
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;
use crate::hash::{random_bytes, sha256};
use crate::kdf::hkdf_sha256;

/// 32-byte public key, base64url-encoded on the wire. Used for both
/// Ed25519 and X25519 public keys — callers keep track of which is which
/// by context, matching the wire contract's untyped `b64` fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKeyBytes(pub [u8; 32]);

impl PublicKeyBytes {
    pub fn to_b64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    pub fn from_b64(s: &str) -> Result<Self, CryptoError> {
        let bytes = URL_SAFE_NO_PAD.decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("public key must be 32 bytes".into()))?;
        Ok(Self(arr))
    }
}

/// Identity fingerprint: SHA-256 of the identity's X25519 public key,
/// rendered as the first 60 hex characters, uppercase. A pure function of
/// the public key — it never changes during the identity's lifetime.
pub fn fingerprint(x25519_pub: &X25519Public) -> String {
    let digest = sha256(x25519_pub.as_bytes());
    let hex = hex::encode(digest).to_uppercase();
    hex[..60].to_string()
}

const ED25519_INFO: &[u8] = b"dl-identity-ed25519-v1";
const X25519_INFO: &[u8] = b"dl-identity-x25519-v1";

fn derive_subkey(seed: &[u8; 32], info: &[u8]) -> Result<[u8; 32], CryptoError> {
    let mut out = [0u8; 32];
    hkdf_sha256(seed, &[0u8; 32], info, &mut out)?;
    Ok(out)
}

/// Long-term identity. Holds only the 32-byte seed; the Ed25519 and
/// X25519 keypairs are re-derived on demand rather than cached, since
/// signing and DH operations are off the message-send hot path.
#[derive(ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    seed: [u8; 32],
}

impl IdentityKeyPair {
    /// Generate a fresh identity from 32 random bytes.
    pub fn generate() -> Result<Self, CryptoError> {
        let bytes = random_bytes(32)?;
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&bytes);
        Ok(Self { seed })
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self { seed }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey(format!("identity seed must be 32 bytes, got {}", bytes.len())))?;
        Ok(Self::from_seed(arr))
    }

    pub fn seed_bytes(&self) -> &[u8; 32] {
        &self.seed
    }

    fn signing_key(&self) -> Result<SigningKey, CryptoError> {
        Ok(SigningKey::from_bytes(&derive_subkey(&self.seed, ED25519_INFO)?))
    }

    fn x25519_secret(&self) -> Result<X25519Secret, CryptoError> {
        Ok(X25519Secret::from(derive_subkey(&self.seed, X25519_INFO)?))
    }

    /// Ed25519 signing public key — `signingKey` in the prekey-bundle wire
    /// payload; used to verify signed-prekey signatures.
    pub fn signing_public(&self) -> Result<PublicKeyBytes, CryptoError> {
        Ok(PublicKeyBytes(self.signing_key()?.verifying_key().to_bytes()))
    }

    /// X25519 DH public key — `identityKey` in the prekey-bundle wire
    /// payload; the identity's input to X3DH.
    pub fn x25519_public(&self) -> Result<X25519Public, CryptoError> {
        Ok(X25519Public::from(&self.x25519_secret()?))
    }

    pub fn fingerprint(&self) -> Result<String, CryptoError> {
        Ok(fingerprint(&self.x25519_public()?))
    }

    /// Sign arbitrary bytes with the identity's Ed25519 signing key.
    /// Returns a 64-byte raw signature.
    pub fn sign(&self, msg: &[u8]) -> Result<[u8; 64], CryptoError> {
        Ok(self.signing_key()?.sign(msg).to_bytes())
    }

    /// Verify a signature made by any Ed25519 public key.
    pub fn verify(public_bytes: &[u8; 32], msg: &[u8], sig_bytes: &[u8]) -> Result<(), CryptoError> {
        let vk = VerifyingKey::from_bytes(public_bytes)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let sig_arr: [u8; 64] = sig_bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("signature must be 64 bytes".into()))?;
        let sig = Signature::from_bytes(&sig_arr);
        vk.verify(msg, &sig).map_err(|_| CryptoError::SignatureVerification)
    }

    /// Compute the DH agreement between this identity's X25519 secret and a
    /// peer's X25519 public key.
    pub fn dh(&self, their_public: &X25519Public) -> Result<[u8; 32], CryptoError> {
        Ok(self.x25519_secret()?.diffie_hellman(their_public).to_bytes())
    }
}
