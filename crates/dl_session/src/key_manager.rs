//! `KeyManager` (§4.3): owns the local identity and keeps the one-time and
//! signed prekey pools provisioned, locally and on the prekey server.

use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use dl_proto::api::{OneTimePrekeyPayload, PrekeyBundlePayload, SignedPrekeyPayload};
use dl_store::Store;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::prekey_server::PrekeyServer;

fn b64_32(bytes: &[u8; 32]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

fn b64_pub(k: &X25519Public) -> String {
    b64_32(k.as_bytes())
}

pub struct KeyManager {
    store: Arc<Store>,
    server: Arc<dyn PrekeyServer>,
    config: SessionConfig,
}

impl KeyManager {
    pub fn new(store: Arc<Store>, server: Arc<dyn PrekeyServer>, config: SessionConfig) -> Self {
        Self { store, server, config }
    }

    /// Idempotent: safe to call on every app start. Generates an identity
    /// if one doesn't exist, rotates the signed prekey if it's missing or
    /// past its TTL, tops up the one-time-prekey pool if it's below
    /// target, and uploads whatever became newly pending.
    pub async fn initialize(&self) -> Result<(), SessionError> {
        let identity = self.ensure_identity().await?;
        self.ensure_signed_prekey().await?;
        self.ensure_one_time_prekey_pool().await?;
        self.sync_with_server().await?;
        tracing::info!(
            target: "dl_session",
            event = "key_manager_initialize_ok",
            fingerprint = %identity.fingerprint()?,
        );
        Ok(())
    }

    pub async fn get_fingerprint(&self) -> Result<String, SessionError> {
        Ok(self.ensure_identity().await?.fingerprint()?)
    }

    /// The local identity, generating one on first call.
    pub async fn identity(&self) -> Result<dl_crypto::identity::IdentityKeyPair, SessionError> {
        self.ensure_identity().await
    }

    /// Forces a fresh signed prekey regardless of age, then uploads it.
    pub async fn rotate_signed_prekey(&self) -> Result<(), SessionError> {
        let identity = self.ensure_identity().await?;
        self.generate_signed_prekey(&identity).await?;
        self.sync_with_server().await?;
        tracing::info!(target: "dl_session", event = "signed_prekey_rotated", fingerprint = %identity.fingerprint()?);
        Ok(())
    }

    /// The current pending bundle: any not-yet-uploaded signed prekey plus
    /// up to `maxUploadBatch` not-yet-uploaded one-time prekeys.
    pub async fn get_pending_bundle(&self) -> Result<PrekeyBundlePayload, SessionError> {
        let identity = self.ensure_identity().await?;
        let signed_prekey = self.store.load_current_signed_prekey().await?;
        let pending_otps = self.store.get_pending_one_time_prekeys(self.config.max_upload_batch).await?;

        Ok(PrekeyBundlePayload {
            identity_key: b64_pub(&identity.x25519_public()?),
            signing_key: b64_32(&identity.signing_public()?.0),
            fingerprint: identity.fingerprint()?,
            signed_prekey: signed_prekey.filter(|spk| !spk.uploaded).map(|spk| SignedPrekeyPayload {
                key_id: spk.key_id,
                public_key: b64_pub(&spk.public_key),
                signature: URL_SAFE_NO_PAD.encode(spk.signature),
            }),
            one_time_prekeys: pending_otps
                .into_iter()
                .map(|(key_id, public_key)| OneTimePrekeyPayload { key_id, public_key: b64_pub(&public_key) })
                .collect(),
        })
    }

    /// Flips `uploaded` on every key present in `bundle` and stamps
    /// `lastUploadAt`. Called after a successful upload so a retry doesn't
    /// resend keys the server already has.
    pub async fn mark_bundle_uploaded(&self, bundle: &PrekeyBundlePayload) -> Result<(), SessionError> {
        if let Some(spk) = &bundle.signed_prekey {
            self.store.mark_signed_prekey_uploaded(spk.key_id).await?;
        }
        let ids: Vec<u32> = bundle.one_time_prekeys.iter().map(|o| o.key_id).collect();
        if !ids.is_empty() {
            self.store.mark_one_time_prekeys_uploaded(&ids).await?;
        }
        self.store.set_last_upload_at(Utc::now()).await?;
        Ok(())
    }

    /// Tops the one-time-prekey pool back up to target and uploads the
    /// result, but only if it has fallen to or below `minPool`. Called by
    /// `SessionManager` after a one-time prekey is consumed.
    pub async fn refill_if_below_min(&self) -> Result<(), SessionError> {
        let count = self.store.count_one_time_prekeys().await?;
        if count >= self.config.min_pool {
            return Ok(());
        }
        tracing::info!(
            target: "dl_session",
            event = "one_time_prekey_pool_refill",
            count,
            min_pool = self.config.min_pool,
        );
        self.ensure_one_time_prekey_pool().await?;
        self.sync_with_server().await
    }

    /// Uploads whatever is currently pending, if anything is.
    pub async fn sync_with_server(&self) -> Result<(), SessionError> {
        let bundle = self.get_pending_bundle().await?;
        if bundle.signed_prekey.is_none() && bundle.one_time_prekeys.is_empty() {
            return Ok(());
        }
        let otp_count = bundle.one_time_prekeys.len();
        let has_spk = bundle.signed_prekey.is_some();
        match self.server.upload_bundle(&bundle).await {
            Ok(()) => {
                tracing::info!(
                    target: "dl_session",
                    event = "prekey_bundle_uploaded",
                    signed_prekey = has_spk,
                    one_time_prekeys = otp_count,
                );
                self.mark_bundle_uploaded(&bundle).await
            }
            Err(e) => {
                tracing::error!(target: "dl_session", event = "prekey_bundle_upload_failed", error = %e);
                Err(e)
            }
        }
    }

    // ── internal ─────────────────────────────────────────────────────────

    async fn ensure_identity(&self) -> Result<dl_crypto::identity::IdentityKeyPair, SessionError> {
        if let Some(identity) = self.store.load_identity().await? {
            return Ok(identity);
        }
        let identity = dl_crypto::identity::IdentityKeyPair::generate()?;
        self.store.save_identity(&identity).await?;
        Ok(identity)
    }

    async fn ensure_signed_prekey(&self) -> Result<(), SessionError> {
        let identity = self.ensure_identity().await?;
        let current = self.store.load_current_signed_prekey().await?;
        let needs_rotation = match &current {
            None => true,
            Some(spk) => {
                let age = Utc::now().signed_duration_since(spk.created_at);
                age.to_std().map(|d| d > self.config.signed_prekey_ttl).unwrap_or(false)
            }
        };
        if needs_rotation {
            self.generate_signed_prekey(&identity).await?;
        }
        Ok(())
    }

    async fn generate_signed_prekey(&self, identity: &dl_crypto::identity::IdentityKeyPair) -> Result<(), SessionError> {
        let key_id = self.store.ensure_next_prekey_id_increment(1).await?;
        let (secret, public, signature) = dl_crypto::x3dh::generate_signed_prekey(identity)?;
        self.store.save_signed_prekey(key_id, &public, &secret, signature).await?;
        Ok(())
    }

    async fn ensure_one_time_prekey_pool(&self) -> Result<(), SessionError> {
        let count = self.store.count_one_time_prekeys().await?;
        if count >= self.config.one_time_prekey_target {
            return Ok(());
        }
        let deficit = self.config.one_time_prekey_target - count;
        let start_id = self.store.ensure_next_prekey_id_increment(deficit).await?;
        let generated: Vec<(StaticSecret, X25519Public)> = dl_crypto::x3dh::generate_one_time_prekeys(deficit as usize);
        let keyed: Vec<(u32, StaticSecret, X25519Public)> = generated
            .into_iter()
            .enumerate()
            .map(|(offset, (secret, public))| (start_id + offset as u32, secret, public))
            .collect();
        self.store.save_one_time_prekeys(&keyed).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dl_proto::api::PrekeyStatusResponse;
    use dl_store::Vault;
    use std::path::PathBuf;
    use uuid::Uuid;

    /// Accepts every upload without modelling a remote store — these tests
    /// only care about the local pool count that drives the refill decision.
    struct NullPrekeyServer;

    #[async_trait]
    impl PrekeyServer for NullPrekeyServer {
        async fn upload_bundle(&self, _payload: &PrekeyBundlePayload) -> Result<(), SessionError> {
            Ok(())
        }
        async fn status(&self) -> Result<PrekeyStatusResponse, SessionError> {
            Ok(PrekeyStatusResponse { one_time_count: 0, signed_prekey_age: 0 })
        }
        async fn fetch_bundle(&self, _peer_id: &str) -> Result<Option<dl_proto::api::RemotePrekeyBundle>, SessionError> {
            Ok(None)
        }
    }

    async fn build(config: SessionConfig) -> (KeyManager, PathBuf) {
        let path = PathBuf::from(format!("/tmp/dl-key-manager-test-{}.db", Uuid::new_v4()));
        let store = Store::open(&path, Vault::new()).await.expect("open store");
        store.vault.unlock(b"password", &dl_crypto::kdf::generate_salt()).await.unwrap();
        let store = Arc::new(store);
        let key_manager = KeyManager::new(store, Arc::new(NullPrekeyServer), config);
        (key_manager, path)
    }

    fn cleanup(path: &std::path::Path) {
        let _ = std::fs::remove_file(path);
        let _ = std::fs::remove_file(path.with_extension("db-wal"));
        let _ = std::fs::remove_file(path.with_extension("db-shm"));
    }

    /// spec.md: "A one-time-prekey count at MinPool − 1 triggers refill; at
    /// MinPool does not."
    #[tokio::test]
    async fn refill_triggers_below_min_pool_not_at_it() {
        let config = SessionConfig { one_time_prekey_target: 20, min_pool: 5, ..SessionConfig::default() };
        let (km, path) = build(config).await;
        km.initialize().await.expect("initialize");

        // Drain down to exactly min_pool (5) — must NOT refill.
        while km.store.count_one_time_prekeys().await.unwrap() > 5 {
            let (id, _) = km.store.get_pending_one_time_prekeys(1).await.unwrap().into_iter().next().unwrap();
            km.store.delete_one_time_prekey(id).await.unwrap();
        }
        km.refill_if_below_min().await.expect("refill at min_pool");
        assert_eq!(km.store.count_one_time_prekeys().await.unwrap(), 5, "count == min_pool must not trigger a refill");

        // One more consumption drops to min_pool - 1 — must refill back to target.
        let (id, _) = km.store.get_pending_one_time_prekeys(1).await.unwrap().into_iter().next().unwrap();
        km.store.delete_one_time_prekey(id).await.unwrap();
        km.refill_if_below_min().await.expect("refill below min_pool");
        assert_eq!(km.store.count_one_time_prekeys().await.unwrap(), 20, "count == min_pool - 1 must refill to target");

        cleanup(&path);
    }
}
