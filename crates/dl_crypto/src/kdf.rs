//! Key derivation functions
//!
//! `vault_key_from_password` — Argon2id, derives the 32-byte key used to
//!   encrypt the local SQLite vault. This resolves the "master key
//!   source" open design question: the key is derived from a user
//!   passphrase, never generated at random and persisted.
//!
//! `hkdf_sha256` / `hmac_sha256` — the two KDF primitives the X3DH and
//!   Double Ratchet wire contracts are built from. Every label and byte
//!   layout here (info strings, the 0x01/0x02 chain-advance inputs) is
//!   part of the wire contract, not an implementation detail — changing
//!   any of them breaks interop with a session established before the
//!   change.

use argon2::{Argon2, Params, Version};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

// ── Vault key (Argon2id) ──────────────────────────────────────────────────────

/// 32-byte vault key derived from user password. Zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct VaultKey(pub [u8; 32]);

/// Argon2id parameters — tuned for interactive (desktop) use.
fn argon2_params() -> Params {
    Params::new(
        64 * 1024, // m_cost: 64 MiB
        3,         // t_cost: 3 iterations
        1,         // p_cost: 1 thread
        Some(32),  // output len
    )
    .expect("Static Argon2 params are always valid")
}

/// Derive a vault key from a user password + 16-byte salt.
/// The salt should be stored alongside the encrypted vault (not secret).
pub fn vault_key_from_password(password: &[u8], salt: &[u8; 16]) -> Result<VaultKey, CryptoError> {
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, argon2_params());
    let mut output = [0u8; 32];
    argon2
        .hash_password_into(password, salt, &mut output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(VaultKey(output))
}

/// Generate a fresh random 16-byte salt (call once on first run; store in DB).
pub fn generate_salt() -> [u8; 16] {
    use rand::RngCore;
    let mut salt = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

// ── HKDF-SHA256 / HMAC-SHA256 primitives ──────────────────────────────────────

/// Extract-then-expand `ikm` into `output.len()` bytes, one call.
pub fn hkdf_sha256(
    ikm: &[u8],
    salt: &[u8],
    info: &[u8],
    output: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

/// HMAC-SHA256(key, input) → 32 bytes.
pub fn hmac_sha256(key: &[u8], input: &[u8]) -> Result<[u8; 32], CryptoError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    mac.update(input);
    Ok(mac.finalize().into_bytes().into())
}

// ── X3DH shared-secret derivation ─────────────────────────────────────────────

/// `HKDF-SHA256(ikm = DH1 || DH2 || DH3 [|| DH4], salt = 32 zero bytes,
/// info = "WHATSAPP-CLONE-X3DH", L = 32)`. The concatenation order of the
/// DH outputs is part of the wire contract — see `x3dh::initiate`/`respond`.
pub fn x3dh_shared_secret(dh_concat: &[u8]) -> Result<[u8; 32], CryptoError> {
    let mut out = [0u8; 32];
    hkdf_sha256(dh_concat, &[0u8; 32], b"WHATSAPP-CLONE-X3DH", &mut out)?;
    Ok(out)
}

// ── Double Ratchet root / chain KDFs ──────────────────────────────────────────

/// `KDF_RK(salt, ikm) = HKDF(ikm, salt, info="WhatsAppCloneRootKey", L=64)`,
/// split into `(new_root_key, new_chain_key)`. Used both for the initial
/// root-KDF call (`salt` = 32 zero bytes, `ikm` = the X3DH shared secret)
/// and for every subsequent DH-ratchet step (`salt` = current root key,
/// `ikm` = the fresh DH output).
pub fn root_kdf(salt: &[u8; 32], ikm: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let mut out = [0u8; 64];
    hkdf_sha256(ikm, salt, b"WhatsAppCloneRootKey", &mut out)?;
    let mut root = [0u8; 32];
    let mut chain = [0u8; 32];
    root.copy_from_slice(&out[..32]);
    chain.copy_from_slice(&out[32..]);
    Ok((root, chain))
}

/// `KDF_CK(ck) = (HMAC(ck, 0x01), HMAC(ck, 0x02)[..32])`, i.e.
/// `(next_chain_key, message_key)`. The symmetric-ratchet step used on
/// every send and every receive.
pub fn chain_step(ck: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let next_ck = hmac_sha256(ck, &[0x01])?;
    let mk = hmac_sha256(ck, &[0x02])?;
    Ok((next_ck, mk))
}
