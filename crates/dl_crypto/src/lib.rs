//! dl_crypto — Darklock Secure Channel cryptographic primitives
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - All public APIs return opaque newtypes to prevent accidental misuse.
//!
//! # Module layout
//! - `identity`         — long-term identity keypair (independent Ed25519 + X25519 derivation)
//! - `x3dh`             — asynchronous X3DH key agreement (SPK verification, DH1..DH4)
//! - `ratchet`          — Double Ratchet: DH ratchet steps, chain KDFs, skipped message keys
//! - `aead`             — XChaCha20-Poly1305 encrypt/decrypt helpers
//! - `kdf`              — HKDF-SHA256 / HMAC-SHA256 / Argon2id key derivation
//! - `hash`             — SHA-256 + CSPRNG helpers
//! - `error`            — unified error type

pub mod aead;
pub mod error;
pub mod hash;
pub mod identity;
pub mod kdf;
pub mod ratchet;
pub mod x3dh;

pub use error::CryptoError;
