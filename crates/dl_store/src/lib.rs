//! dl_store — encrypted local storage backing `KeyStorage`: identity,
//! signed_prekeys, one_time_prekeys, sessions, metadata.
//!
//! # Encryption strategy
//! SQLite does NOT natively encrypt. Application-level encryption instead:
//! - Every private scalar (identity seed, prekey secrets, ratchet state,
//!   X3DH send hints) is stored as XChaCha20-Poly1305 ciphertext
//!   (`nonce24 || ct+tag`), base64url-encoded.
//! - The vault key is derived from the user password via Argon2id and held
//!   in memory only while the app is unlocked.
//! - Non-sensitive metadata (key ids, timestamps, status) is stored in
//!   plaintext to allow efficient queries.
//!
//! # Migration
//! SQLx migrations in `migrations/` are run on first open.

pub mod db;
pub mod keystore;
pub mod models;
pub mod migrations;
pub mod vault;
pub mod error;

pub use db::Store;
pub use keystore::{OneTimePrekeyRecord, SessionRecord, SignedPrekeyRecord};
pub use vault::Vault;
pub use error::StoreError;
