//! Database row models — map to/from the five `KeyStorage` collections
//! (identity, signed_prekeys, one_time_prekeys, sessions, metadata).
//!
//! Columns ending in `_enc` hold `Store::encrypt_value` output; never a
//! plaintext private scalar.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct IdentityRow {
    pub id: i64,
    /// Vault-encrypted 32-byte identity seed.
    pub seed_enc: String,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SignedPrekeyRow {
    pub key_id: i64,
    pub public_key: String,
    /// Vault-encrypted X25519 secret scalar.
    pub secret_key_enc: String,
    pub signature: String,
    pub created_at: DateTime<Utc>,
    pub uploaded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OneTimePrekeyRow {
    pub key_id: i64,
    pub public_key: String,
    /// Vault-encrypted X25519 secret scalar.
    pub secret_key_enc: String,
    pub created_at: DateTime<Utc>,
    pub uploaded: bool,
}

/// One row per peer. `ratchet_state_enc` / `x3dh_send_hint_enc` are
/// `NULL` until the session reaches `ready` and, respectively, until the
/// initiator's first message has not yet been sent.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SessionRow {
    pub peer_user_id: String,
    pub session_id: String,
    pub remote_identity_pub: Option<String>,
    pub remote_signed_prekey_pub: Option<String>,
    pub remote_signed_prekey_id: Option<i64>,
    pub remote_fingerprint: Option<String>,
    pub ratchet_state_enc: Option<String>,
    pub x3dh_send_hint_enc: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Ready,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Error => "error",
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = crate::error::StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "ready" => Ok(Self::Ready),
            "error" => Ok(Self::Error),
            other => Err(crate::error::StoreError::Corrupt(format!("unknown session status {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MetadataRow {
    pub key: String,
    pub value: String,
}

pub const META_NEXT_PREKEY_ID: &str = "next_prekey_id";
pub const META_LAST_UPLOAD_AT: &str = "last_upload_at";
