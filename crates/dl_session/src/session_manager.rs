//! `SessionManager` (§4.6): establishes per-peer sessions over X3DH and
//! drives the Double Ratchet for every subsequent send/receive.
//!
//! Concurrency model (§5): a lazily-created `tokio::sync::Mutex` per peer
//! serializes every session-mutating operation for that peer —
//! `ensureSession`, `encryptMessage`, and `decryptMessage` all take the
//! same lock, so a concurrent pair of first-message sends collapses into
//! one `establishSession` and the loser observes the winner's result
//! instead of racing it. State is persisted only after every fallible step
//! (network, crypto, AEAD) has already succeeded — a failure leaves the
//! prior persisted state untouched.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use uuid::Uuid;
use x25519_dalek::PublicKey as X25519Public;

use dl_crypto::identity::{self, IdentityKeyPair};
use dl_crypto::ratchet::{self, RatchetSession};
use dl_crypto::x3dh::{self, PrekeyBundle, X3DHHeader};
use dl_proto::api::RemotePrekeyBundle;
use dl_proto::envelope::Envelope;
use dl_store::keystore::SessionRecord;
use dl_store::models::SessionStatus;
use dl_store::Store;

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::key_manager::KeyManager;
use crate::prekey_server::PrekeyServer;

fn decode_pub32(s: &str) -> Result<[u8; 32], SessionError> {
    let bytes = URL_SAFE_NO_PAD.decode(s).map_err(|e| SessionError::BadBundle(e.to_string()))?;
    bytes.try_into().map_err(|_| SessionError::BadBundle("expected 32-byte key".into()))
}

fn decode_x25519(s: &str) -> Result<X25519Public, SessionError> {
    Ok(X25519Public::from(decode_pub32(s)?))
}

fn decode_bundle(remote: RemotePrekeyBundle) -> Result<PrekeyBundle, SessionError> {
    let signed = remote
        .signed_prekey
        .ok_or_else(|| SessionError::BadBundle("bundle carries no signed prekey".into()))?;
    let signature: [u8; 64] = URL_SAFE_NO_PAD
        .decode(&signed.signature)
        .map_err(|e| SessionError::BadBundle(e.to_string()))?
        .try_into()
        .map_err(|_| SessionError::BadBundle("signature must be 64 bytes".into()))?;

    Ok(PrekeyBundle {
        identity_key: decode_x25519(&remote.identity_key)?,
        signing_key: decode_pub32(&remote.signing_key)?,
        signed_prekey: decode_x25519(&signed.public_key)?,
        signed_prekey_sig: signature,
        signed_prekey_id: signed.key_id,
        one_time_prekey: remote.one_time_prekey.as_ref().map(|o| decode_x25519(&o.public_key)).transpose()?,
        one_time_prekey_id: remote.one_time_prekey.as_ref().map(|o| o.key_id),
    })
}

pub struct SessionManager {
    store: Arc<Store>,
    server: Arc<dyn PrekeyServer>,
    key_manager: Arc<KeyManager>,
    config: SessionConfig,
    peer_locks: StdMutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionManager {
    pub fn new(store: Arc<Store>, server: Arc<dyn PrekeyServer>, key_manager: Arc<KeyManager>, config: SessionConfig) -> Self {
        Self { store, server, key_manager, config, peer_locks: StdMutex::new(HashMap::new()) }
    }

    fn peer_lock(&self, peer_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.peer_locks.lock().expect("peer lock map poisoned");
        locks.entry(peer_id.to_string()).or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))).clone()
    }

    /// Establishes a session with `peer_id` if one isn't already `ready`.
    /// Concurrent callers for the same peer serialize on the peer lock; the
    /// second caller observes the first's completed session instead of
    /// running X3DH twice.
    pub async fn ensure_session(&self, peer_id: &str) -> Result<(), SessionError> {
        let lock = self.peer_lock(peer_id);
        let _guard = lock.lock().await;
        self.ensure_session_locked(peer_id).await
    }

    async fn ensure_session_locked(&self, peer_id: &str) -> Result<(), SessionError> {
        if let Some(existing) = self.store.load_session(peer_id).await? {
            if existing.status == SessionStatus::Ready {
                return Ok(());
            }
        }
        self.establish_session(peer_id).await
    }

    async fn establish_session(&self, peer_id: &str) -> Result<(), SessionError> {
        let remote = tokio::time::timeout(self.config.network_timeout, self.server.fetch_bundle(peer_id))
            .await
            .map_err(|_| SessionError::NetworkError(format!("prekey bundle fetch for {peer_id} timed out")))??
            .ok_or_else(|| {
                tracing::warn!(target: "dl_session", event = "recipient_not_provisioned", peer_user_id = %peer_id);
                SessionError::RecipientNotProvisioned(peer_id.to_string())
            })?;

        let remote_fingerprint = remote.fingerprint.clone();
        let bundle = decode_bundle(remote)?;

        let identity = self.key_manager.identity().await?;
        let result = x3dh::initiate(&identity, &bundle)?;
        let session_id = Uuid::new_v4().to_string();
        let ratchet = RatchetSession::init_sender(session_id.clone(), peer_id.to_string(), result.shared_key, &bundle.signed_prekey)?;

        tracing::info!(
            target: "dl_session",
            event = "session_established",
            role = "initiator",
            peer_user_id = %peer_id,
            session_id = %session_id,
        );

        let record = SessionRecord {
            peer_user_id: peer_id.to_string(),
            session_id,
            remote_identity_pub: Some(bundle.identity_key),
            remote_signed_prekey_pub: Some(bundle.signed_prekey),
            remote_signed_prekey_id: Some(bundle.signed_prekey_id),
            remote_fingerprint: Some(remote_fingerprint),
            ratchet: Some(ratchet),
            x3dh_send_hint: Some(result.header),
            status: SessionStatus::Ready,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.store.save_session(&record).await?;
        Ok(())
    }

    /// Tears down the session for `peer_id` and re-establishes it from
    /// scratch. Called when the peer's published signed prekey has rotated
    /// (there is no in-place transition from an old signed prekey to a new
    /// one; X3DH must be re-run).
    pub async fn refresh_session(&self, peer_id: &str) -> Result<(), SessionError> {
        let lock = self.peer_lock(peer_id);
        let _guard = lock.lock().await;
        tracing::info!(target: "dl_session", event = "session_refresh", peer_user_id = %peer_id);
        self.store.delete_session(peer_id).await?;
        self.establish_session(peer_id).await
    }

    /// Encrypts `plaintext` for `peer_id`, establishing a session first if
    /// none exists. The `x3dh` block is attached and then cleared from
    /// storage only after this call returns successfully.
    pub async fn encrypt_message(&self, peer_id: &str, plaintext: &[u8]) -> Result<Envelope, SessionError> {
        let lock = self.peer_lock(peer_id);
        let _guard = lock.lock().await;
        self.ensure_session_locked(peer_id).await?;

        let mut record = self
            .store
            .load_session(peer_id)
            .await?
            .ok_or(SessionError::SessionStateMissing)?;
        let mut rs = record.ratchet.take().ok_or(SessionError::SessionStateMissing)?;

        let (header, message_key) = rs.encrypt_step()?;
        let ciphertext = dl_crypto::aead::encrypt(&message_key, plaintext, record.session_id.as_bytes())?;

        // Every fallible step above succeeded — persist now, not before.
        self.store.update_session_ratchet_state(peer_id, &rs).await?;
        let x3dh = record.x3dh_send_hint.take();
        if x3dh.is_some() {
            self.store.clear_session_x3dh_data(peer_id).await?;
        }

        let my_id = self.key_manager.identity().await?;
        let envelope_id = Uuid::new_v4().to_string();
        tracing::debug!(
            target: "dl_session",
            event = "message_encrypted",
            peer_user_id = %peer_id,
            envelope_id = %envelope_id,
            message_number = header.message_number,
        );
        Ok(Envelope {
            envelope_id,
            sender_id: my_id.fingerprint()?,
            recipient_id: peer_id.to_string(),
            sent_at: Utc::now(),
            session_id: record.session_id,
            header,
            ciphertext: URL_SAFE_NO_PAD.encode(ciphertext),
            x3dh,
        })
    }

    /// Decrypts `envelope` from `peer_id`. If no `ready` session exists and
    /// the envelope carries an `x3dh` block, this runs the responder half
    /// of X3DH and initializes a fresh receiving ratchet — the first
    /// message a session ever sees. Otherwise it advances the existing
    /// ratchet.
    pub async fn decrypt_message(&self, peer_id: &str, envelope: &Envelope) -> Result<Vec<u8>, SessionError> {
        let lock = self.peer_lock(peer_id);
        let _guard = lock.lock().await;

        let existing = self.store.load_session(peer_id).await?;
        let needs_bootstrap = existing.as_ref().map(|r| r.ratchet.is_none()).unwrap_or(true);

        if needs_bootstrap {
            return self.bootstrap_and_decrypt(peer_id, envelope).await;
        }

        let mut record = existing.expect("needs_bootstrap is false implies a session row exists");
        let mut rs = record.ratchet.take().expect("needs_bootstrap is false implies a ratchet is present");

        let message_key = rs.decrypt_step(&envelope.header).map_err(|e| {
            tracing::warn!(target: "dl_session", event = "decrypt_step_failed", peer_user_id = %peer_id, error = %e);
            e
        })?;
        let ciphertext = URL_SAFE_NO_PAD.decode(&envelope.ciphertext).map_err(|_| SessionError::DecryptFailed)?;
        let plaintext = dl_crypto::aead::decrypt(&message_key, &ciphertext, record.session_id.as_bytes())?;

        self.store.update_session_ratchet_state(peer_id, &rs).await?;
        tracing::debug!(
            target: "dl_session",
            event = "message_decrypted",
            peer_user_id = %peer_id,
            envelope_id = %envelope.envelope_id,
        );
        Ok(plaintext.to_vec())
    }

    async fn bootstrap_and_decrypt(&self, peer_id: &str, envelope: &Envelope) -> Result<Vec<u8>, SessionError> {
        let x3dh_header: &X3DHHeader = envelope.x3dh.as_ref().ok_or(SessionError::SessionStateMissing)?;

        let my_identity: IdentityKeyPair = self.key_manager.identity().await?;
        let spk_secret = self.store.get_signed_prekey_secret(x3dh_header.used_signed_prekey_id).await?;
        let opk_record = match x3dh_header.used_one_time_prekey_id {
            Some(id) => Some(
                self.store
                    .load_one_time_prekey(id)
                    .await?
                    .ok_or_else(|| SessionError::BadBundle(format!("unknown one-time prekey {id}")))?,
            ),
            None => None,
        };

        let shared_secret = x3dh::respond(&my_identity, &spk_secret, opk_record.as_ref().map(|r| &r.secret), x3dh_header)?;
        let peer_ratchet_pub = ratchet::decode_pub(&envelope.header.ratchet_pub)?;
        let mut rs = RatchetSession::init_receiver(envelope.session_id.clone(), peer_id.to_string(), shared_secret, &peer_ratchet_pub)?;

        let message_key = rs.decrypt_step(&envelope.header)?;
        let ciphertext = URL_SAFE_NO_PAD.decode(&envelope.ciphertext).map_err(|_| SessionError::DecryptFailed)?;
        let plaintext = dl_crypto::aead::decrypt(&message_key, &ciphertext, envelope.session_id.as_bytes())?;

        let record = SessionRecord {
            peer_user_id: peer_id.to_string(),
            session_id: envelope.session_id.clone(),
            remote_identity_pub: Some(x3dh_header.sender_identity_pub),
            remote_signed_prekey_pub: None,
            remote_signed_prekey_id: None,
            remote_fingerprint: Some(identity::fingerprint(&x3dh_header.sender_identity_pub)),
            ratchet: Some(rs),
            x3dh_send_hint: None,
            status: SessionStatus::Ready,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.store.save_session(&record).await?;
        tracing::info!(
            target: "dl_session",
            event = "session_established",
            role = "responder",
            peer_user_id = %peer_id,
            session_id = %envelope.session_id,
        );

        if let Some(id) = x3dh_header.used_one_time_prekey_id {
            self.store.delete_one_time_prekey(id).await?;
            self.key_manager.refill_if_below_min().await?;
        }

        Ok(plaintext.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::key_manager::KeyManager;
    use crate::prekey_server::PrekeyServer;
    use async_trait::async_trait;
    use dl_proto::api::{OneTimePrekeyPayload, PrekeyBundlePayload, PrekeyStatusResponse};
    use dl_store::Vault;
    use std::path::PathBuf;
    use tokio::sync::Mutex as AsyncMutex;

    /// An in-memory prekey server shared by a pair of simulated clients,
    /// standing in for the real HTTP relay in these tests.
    #[derive(Default)]
    struct FakePrekeyServer {
        bundles: AsyncMutex<HashMap<String, RemotePrekeyBundle>>,
    }

    #[async_trait]
    impl PrekeyServer for FakePrekeyServer {
        async fn upload_bundle(&self, payload: &PrekeyBundlePayload) -> Result<(), SessionError> {
            let mut bundles = self.bundles.lock().await;
            bundles.insert(
                payload.fingerprint.clone(),
                RemotePrekeyBundle {
                    identity_key: payload.identity_key.clone(),
                    signing_key: payload.signing_key.clone(),
                    fingerprint: payload.fingerprint.clone(),
                    signed_prekey: payload.signed_prekey.as_ref().map(|s| dl_proto::api::RemoteSignedPrekey {
                        key_id: s.key_id,
                        public_key: s.public_key.clone(),
                        signature: s.signature.clone(),
                        created_at: 0,
                    }),
                    one_time_prekey: payload.one_time_prekeys.first().map(|o| OneTimePrekeyPayload {
                        key_id: o.key_id,
                        public_key: o.public_key.clone(),
                    }),
                },
            );
            Ok(())
        }

        async fn status(&self) -> Result<PrekeyStatusResponse, SessionError> {
            Ok(PrekeyStatusResponse { one_time_count: 0, signed_prekey_age: 0 })
        }

        async fn fetch_bundle(&self, peer_id: &str) -> Result<Option<RemotePrekeyBundle>, SessionError> {
            Ok(self.bundles.lock().await.get(peer_id).cloned())
        }
    }

    async fn open_store() -> (Arc<Store>, PathBuf) {
        let path = PathBuf::from(format!("/tmp/dl-session-test-{}.db", Uuid::new_v4()));
        let store = Store::open(&path, Vault::new()).await.expect("open store");
        store.vault.unlock(b"password", &dl_crypto::kdf::generate_salt()).await.unwrap();
        (Arc::new(store), path)
    }

    fn cleanup(path: &std::path::Path) {
        let _ = std::fs::remove_file(path);
        let _ = std::fs::remove_file(path.with_extension("db-wal"));
        let _ = std::fs::remove_file(path.with_extension("db-shm"));
    }

    async fn build(server: Arc<FakePrekeyServer>) -> (SessionManager, Arc<Store>, PathBuf, String) {
        let (store, path) = open_store().await;
        let config = SessionConfig::default();
        let key_manager = Arc::new(KeyManager::new(store.clone(), server.clone(), config.clone()));
        key_manager.initialize().await.expect("initialize key manager");
        let fingerprint = key_manager.get_fingerprint().await.unwrap();
        let session_manager = SessionManager::new(store.clone(), server, key_manager, config);
        (session_manager, store, path, fingerprint)
    }

    #[tokio::test]
    async fn happy_path_round_trip_with_one_time_prekey() {
        let server = Arc::new(FakePrekeyServer::default());
        let (alice_sm, alice_store, alice_path, _alice_fp) = build(server.clone()).await;
        let (bob_sm, bob_store, bob_path, bob_fp) = build(server.clone()).await;

        let envelope = alice_sm.encrypt_message(&bob_fp, b"hello bob").await.expect("alice encrypt");
        assert!(envelope.x3dh.is_some(), "first envelope in a session must carry the x3dh handshake block");

        let plaintext = bob_sm.decrypt_message("alice", &envelope).await.expect("bob decrypt");
        assert_eq!(plaintext, b"hello bob");

        let reply = bob_sm.encrypt_message("alice", b"hi alice").await.expect("bob encrypt reply");
        assert!(reply.x3dh.is_none(), "bob is the responder; his first send carries no x3dh block");
        let reply_plain = alice_sm.decrypt_message(&bob_fp, &reply).await.expect("alice decrypt reply");
        assert_eq!(reply_plain, b"hi alice");

        cleanup(&alice_path);
        cleanup(&bob_path);
        let _ = alice_store;
        let _ = bob_store;
    }

    #[tokio::test]
    async fn out_of_order_delivery_still_decrypts() {
        let server = Arc::new(FakePrekeyServer::default());
        let (alice_sm, _alice_store, alice_path, _alice_fp) = build(server.clone()).await;
        let (bob_sm, _bob_store, bob_path, bob_fp) = build(server.clone()).await;

        let e1 = alice_sm.encrypt_message(&bob_fp, b"m1").await.unwrap();
        let e2 = alice_sm.encrypt_message(&bob_fp, b"m2").await.unwrap();
        let e3 = alice_sm.encrypt_message(&bob_fp, b"m3").await.unwrap();

        let p1 = bob_sm.decrypt_message("alice", &e1).await.unwrap();
        let p3 = bob_sm.decrypt_message("alice", &e3).await.unwrap();
        let p2 = bob_sm.decrypt_message("alice", &e2).await.unwrap();

        assert_eq!(p1, b"m1");
        assert_eq!(p2, b"m2");
        assert_eq!(p3, b"m3");

        cleanup(&alice_path);
        cleanup(&bob_path);
    }

    #[tokio::test]
    async fn recipient_without_published_bundle_is_rejected() {
        let server = Arc::new(FakePrekeyServer::default());
        let (alice_sm, _store, path, _fp) = build(server).await;

        let err = alice_sm.encrypt_message("nobody", b"hi").await.unwrap_err();
        assert!(matches!(err, SessionError::RecipientNotProvisioned(_)));

        cleanup(&path);
    }

    #[tokio::test]
    async fn concurrent_first_sends_establish_exactly_one_session() {
        let server = Arc::new(FakePrekeyServer::default());
        let (alice_sm, _store, path, _fp) = build(server.clone()).await;
        let (_bob_sm, _bob_store, bob_path, bob_fp) = build(server.clone()).await;

        let alice_sm = Arc::new(alice_sm);
        let a1 = alice_sm.clone();
        let a2 = alice_sm.clone();
        let fp1 = bob_fp.clone();
        let fp2 = bob_fp.clone();

        let (r1, r2) = tokio::join!(
            tokio::spawn(async move { a1.ensure_session(&fp1).await }),
            tokio::spawn(async move { a2.ensure_session(&fp2).await }),
        );
        r1.unwrap().unwrap();
        r2.unwrap().unwrap();

        let sessions = alice_sm.store.list_sessions().await.unwrap();
        assert_eq!(sessions.iter().filter(|p| *p == &bob_fp).count(), 1);

        cleanup(&path);
        cleanup(&bob_path);
    }
}
