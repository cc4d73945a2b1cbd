//! dl_proto — Wire types, envelopes, and serialisation for Darklock Secure Channel
//!
//! All on-wire types are serialised to JSON.
//!
//! # Modules
//! - `envelope` — wire envelope: ratchet header, ciphertext, optional X3DH block
//! - `api`      — prekey-server request/response DTOs (§6)

pub mod api;
pub mod envelope;

pub use envelope::Envelope;
