//! Prekey-server client (§6). `PrekeyServer` is the seam `SessionManager`
//! and `KeyManager` depend on; `PrekeyServerClient` is the real HTTP
//! implementation, built the way the wider application's relay client is
//! built — a bare `reqwest::Client`, bearer-token auth, JSON bodies.

use std::time::Duration;

use dl_proto::api::{PrekeyBundlePayload, PrekeyStatusResponse, RemotePrekeyBundle};

use crate::error::SessionError;

/// Abstracts the three prekey-server endpoints consumed by this core, so
/// `SessionManager`/`KeyManager` tests can supply an in-memory double
/// instead of making real HTTP calls.
#[async_trait::async_trait]
pub trait PrekeyServer: Send + Sync {
    async fn upload_bundle(&self, payload: &PrekeyBundlePayload) -> Result<(), SessionError>;
    async fn status(&self) -> Result<PrekeyStatusResponse, SessionError>;
    /// `None` means the peer has no prekey bundle published (404).
    async fn fetch_bundle(&self, peer_id: &str) -> Result<Option<RemotePrekeyBundle>, SessionError>;
}

/// Talks to the real prekey server over HTTP.
pub struct PrekeyServerClient {
    client: reqwest::Client,
    base_url: String,
    bearer_token: String,
}

impl PrekeyServerClient {
    pub fn new(base_url: impl Into<String>, bearer_token: impl Into<String>, timeout: Duration) -> Result<Self, SessionError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(SessionError::from)?;
        Ok(Self { client, base_url: base_url.into(), bearer_token: bearer_token.into() })
    }
}

#[async_trait::async_trait]
impl PrekeyServer for PrekeyServerClient {
    async fn upload_bundle(&self, payload: &PrekeyBundlePayload) -> Result<(), SessionError> {
        let resp = self
            .client
            .post(format!("{}/users/prekeys", self.base_url))
            .bearer_auth(&self.bearer_token)
            .json(payload)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            tracing::error!(target: "dl_session", event = "prekey_upload_bad_status", status = %status);
            return Err(SessionError::NetworkError(format!("upload_bundle: status {status}")));
        }
        Ok(())
    }

    async fn status(&self) -> Result<PrekeyStatusResponse, SessionError> {
        let resp = self
            .client
            .get(format!("{}/users/prekeys/status", self.base_url))
            .bearer_auth(&self.bearer_token)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(SessionError::NetworkError(format!("status: status {}", resp.status())));
        }
        Ok(resp.json().await?)
    }

    async fn fetch_bundle(&self, peer_id: &str) -> Result<Option<RemotePrekeyBundle>, SessionError> {
        let resp = self
            .client
            .get(format!("{}/users/{}/prekeys", self.base_url, peer_id))
            .bearer_auth(&self.bearer_token)
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            tracing::debug!(target: "dl_session", event = "prekey_bundle_not_found", peer_user_id = %peer_id);
            return Ok(None);
        }
        if !resp.status().is_success() {
            let status = resp.status();
            tracing::error!(target: "dl_session", event = "prekey_fetch_bad_status", peer_user_id = %peer_id, status = %status);
            return Err(SessionError::NetworkError(format!("fetch_bundle: status {status}")));
        }
        Ok(Some(resp.json().await?))
    }
}
