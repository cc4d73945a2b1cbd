//! dl_session — orchestration layer binding `dl_crypto` (X3DH, Double
//! Ratchet, identity) and `dl_store` (encrypted `KeyStorage`) into the two
//! components a client actually calls: `KeyManager` (identity/prekey
//! lifecycle) and `SessionManager` (per-peer session establishment and
//! message encrypt/decrypt).
//!
//! Accounts/auth, transport delivery, presence, and group fan-out are not
//! this crate's concern — it produces envelopes and consumes them; getting
//! them to the peer is someone else's job.

pub mod config;
pub mod error;
pub mod key_manager;
pub mod prekey_server;
pub mod session_manager;

pub use config::SessionConfig;
pub use error::SessionError;
pub use key_manager::KeyManager;
pub use prekey_server::{PrekeyServer, PrekeyServerClient};
pub use session_manager::SessionManager;
