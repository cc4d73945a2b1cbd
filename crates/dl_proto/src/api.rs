//! Prekey-server request/response DTOs (§6 external interfaces).
//!
//! These are the only HTTP shapes this core depends on: uploading a
//! user's own prekey bundle, checking its pool status, and fetching a
//! peer's bundle for X3DH. Accounts/auth and message-relay transport are
//! out of scope — their DTOs do not belong in this crate.

use serde::{Deserialize, Serialize};

/// `POST /users/prekeys` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrekeyBundlePayload {
    #[serde(rename = "identityKey")]
    pub identity_key: String,
    #[serde(rename = "signingKey")]
    pub signing_key: String,
    pub fingerprint: String,
    #[serde(rename = "signedPrekey")]
    pub signed_prekey: Option<SignedPrekeyPayload>,
    #[serde(rename = "oneTimePrekeys")]
    pub one_time_prekeys: Vec<OneTimePrekeyPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPrekeyPayload {
    #[serde(rename = "keyId")]
    pub key_id: u32,
    #[serde(rename = "publicKey")]
    pub public_key: String,
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneTimePrekeyPayload {
    #[serde(rename = "keyId")]
    pub key_id: u32,
    #[serde(rename = "publicKey")]
    pub public_key: String,
}

/// `GET /users/prekeys/status` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrekeyStatusResponse {
    #[serde(rename = "oneTimeCount")]
    pub one_time_count: u64,
    /// Seconds since the current signed prekey was created.
    #[serde(rename = "signedPrekeyAge")]
    pub signed_prekey_age: u64,
}

/// A remote signed prekey as returned by `GET /users/:peerId/prekeys` —
/// unlike the upload payload, this carries `createdAt` so the caller can
/// detect rotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSignedPrekey {
    #[serde(rename = "keyId")]
    pub key_id: u32,
    #[serde(rename = "publicKey")]
    pub public_key: String,
    pub signature: String,
    #[serde(rename = "createdAt")]
    pub created_at: u64,
}

/// `GET /users/:peerId/prekeys` response. `one_time_prekey` is `None`
/// when the peer's pool is exhausted — a session is still establishable,
/// with DH4 omitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemotePrekeyBundle {
    #[serde(rename = "identityKey")]
    pub identity_key: String,
    #[serde(rename = "signingKey")]
    pub signing_key: String,
    pub fingerprint: String,
    #[serde(rename = "signedPrekey")]
    pub signed_prekey: Option<RemoteSignedPrekey>,
    #[serde(rename = "oneTimePrekey")]
    pub one_time_prekey: Option<OneTimePrekeyPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}
