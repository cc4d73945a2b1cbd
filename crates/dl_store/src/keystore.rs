//! `KeyStorage` (§4.2): the five-collection, at-rest-encrypted operations
//! `KeyManager` and `SessionManager` are built on. Every operation here
//! is atomic and every private field is encrypted on write, decrypted on
//! read — callers above this module never see a plaintext scalar.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use dl_crypto::identity::IdentityKeyPair;
use dl_crypto::ratchet::RatchetSession;
use dl_crypto::x3dh::X3DHHeader;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::db::Store;
use crate::error::StoreError;
use crate::models::{
    IdentityRow, MetadataRow, OneTimePrekeyRow, SessionRow, SessionStatus, SignedPrekeyRow, META_LAST_UPLOAD_AT,
    META_NEXT_PREKEY_ID,
};

pub struct SignedPrekeyRecord {
    pub key_id: u32,
    pub public_key: X25519Public,
    pub secret: StaticSecret,
    pub signature: [u8; 64],
    pub created_at: DateTime<Utc>,
    pub uploaded: bool,
}

pub struct OneTimePrekeyRecord {
    pub key_id: u32,
    pub public_key: X25519Public,
    pub secret: StaticSecret,
    pub created_at: DateTime<Utc>,
    pub uploaded: bool,
}

/// Decrypted, in-memory view of a `sessions` row (§3 `SessionRecord`).
pub struct SessionRecord {
    pub peer_user_id: String,
    pub session_id: String,
    pub remote_identity_pub: Option<X25519Public>,
    pub remote_signed_prekey_pub: Option<X25519Public>,
    pub remote_signed_prekey_id: Option<u32>,
    pub remote_fingerprint: Option<String>,
    pub ratchet: Option<RatchetSession>,
    /// Present iff we were the initiator and have not yet sent the first message.
    pub x3dh_send_hint: Option<X3DHHeader>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn encode_pub(k: &X25519Public) -> String {
    URL_SAFE_NO_PAD.encode(k.as_bytes())
}

fn decode_pub(s: &str) -> Result<X25519Public, StoreError> {
    let bytes = URL_SAFE_NO_PAD.decode(s).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    let arr: [u8; 32] = bytes.try_into().map_err(|_| StoreError::Corrupt("public key must be 32 bytes".into()))?;
    Ok(X25519Public::from(arr))
}

impl Store {
    // ── identity ─────────────────────────────────────────────────────────

    pub async fn load_identity(&self) -> Result<Option<IdentityKeyPair>, StoreError> {
        let row: Option<IdentityRow> =
            sqlx::query_as("SELECT id, seed_enc, fingerprint, created_at FROM identity WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;
        let Some(row) = row else { return Ok(None) };
        let seed = self.decrypt_value(&row.seed_enc).await?;
        Ok(Some(IdentityKeyPair::from_bytes(&seed)?))
    }

    /// Idempotent: a no-op if an identity row already exists.
    pub async fn save_identity(&self, identity: &IdentityKeyPair) -> Result<(), StoreError> {
        if self.load_identity().await?.is_some() {
            return Ok(());
        }
        let seed_enc = self.encrypt_value(identity.seed_bytes()).await?;
        let fingerprint = identity.fingerprint()?;
        sqlx::query("INSERT INTO identity (id, seed_enc, fingerprint, created_at) VALUES (1, ?, ?, datetime('now'))")
            .bind(seed_enc)
            .bind(fingerprint)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── signed prekeys ───────────────────────────────────────────────────

    pub async fn load_current_signed_prekey(&self) -> Result<Option<SignedPrekeyRecord>, StoreError> {
        let row: Option<SignedPrekeyRow> = sqlx::query_as(
            "SELECT key_id, public_key, secret_key_enc, signature, created_at, uploaded \
             FROM signed_prekeys ORDER BY key_id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(self.decode_signed_prekey(row).await?))
    }

    pub async fn get_signed_prekey_secret(&self, key_id: u32) -> Result<StaticSecret, StoreError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT secret_key_enc FROM signed_prekeys WHERE key_id = ?")
            .bind(key_id as i64)
            .fetch_optional(&self.pool)
            .await?;
        let Some((secret_enc,)) = row else {
            return Err(StoreError::NotFound(format!("signed prekey {key_id}")));
        };
        let bytes = self.decrypt_value(&secret_enc).await?;
        let arr: [u8; 32] = bytes.try_into().map_err(|_| StoreError::Corrupt("signed prekey secret must be 32 bytes".into()))?;
        Ok(StaticSecret::from(arr))
    }

    /// Assigns `key_id` as the new current signed prekey. The previous one
    /// remains readable by id until no session references it.
    pub async fn save_signed_prekey(
        &self,
        key_id: u32,
        public_key: &X25519Public,
        secret: &StaticSecret,
        signature: [u8; 64],
    ) -> Result<(), StoreError> {
        let secret_enc = self.encrypt_value(&secret.to_bytes()).await?;
        sqlx::query(
            "INSERT INTO signed_prekeys (key_id, public_key, secret_key_enc, signature, created_at, uploaded) \
             VALUES (?, ?, ?, ?, datetime('now'), 0)",
        )
        .bind(key_id as i64)
        .bind(encode_pub(public_key))
        .bind(secret_enc)
        .bind(URL_SAFE_NO_PAD.encode(signature))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn decode_signed_prekey(&self, row: SignedPrekeyRow) -> Result<SignedPrekeyRecord, StoreError> {
        let secret_bytes = self.decrypt_value(&row.secret_key_enc).await?;
        let secret_arr: [u8; 32] =
            secret_bytes.try_into().map_err(|_| StoreError::Corrupt("signed prekey secret must be 32 bytes".into()))?;
        let sig_bytes = URL_SAFE_NO_PAD.decode(&row.signature).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let sig_arr: [u8; 64] = sig_bytes.try_into().map_err(|_| StoreError::Corrupt("signature must be 64 bytes".into()))?;
        Ok(SignedPrekeyRecord {
            key_id: row.key_id as u32,
            public_key: decode_pub(&row.public_key)?,
            secret: StaticSecret::from(secret_arr),
            signature: sig_arr,
            created_at: row.created_at,
            uploaded: row.uploaded,
        })
    }

    // ── one-time prekeys ─────────────────────────────────────────────────

    pub async fn save_one_time_prekeys(&self, keys: &[(u32, StaticSecret, X25519Public)]) -> Result<(), StoreError> {
        for (key_id, secret, public) in keys {
            let secret_enc = self.encrypt_value(&secret.to_bytes()).await?;
            sqlx::query(
                "INSERT INTO one_time_prekeys (key_id, public_key, secret_key_enc, created_at, uploaded) \
                 VALUES (?, ?, ?, datetime('now'), 0)",
            )
            .bind(*key_id as i64)
            .bind(encode_pub(public))
            .bind(secret_enc)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn mark_signed_prekey_uploaded(&self, key_id: u32) -> Result<(), StoreError> {
        sqlx::query("UPDATE signed_prekeys SET uploaded = 1 WHERE key_id = ?")
            .bind(key_id as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_pending_one_time_prekeys(&self, limit: u32) -> Result<Vec<(u32, X25519Public)>, StoreError> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT key_id, public_key FROM one_time_prekeys WHERE uploaded = 0 ORDER BY key_id ASC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(|(id, pk)| Ok((id as u32, decode_pub(&pk)?))).collect()
    }

    pub async fn mark_one_time_prekeys_uploaded(&self, ids: &[u32]) -> Result<(), StoreError> {
        for id in ids {
            sqlx::query("UPDATE one_time_prekeys SET uploaded = 1 WHERE key_id = ?")
                .bind(*id as i64)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    pub async fn load_one_time_prekey(&self, key_id: u32) -> Result<Option<OneTimePrekeyRecord>, StoreError> {
        let row: Option<OneTimePrekeyRow> = sqlx::query_as(
            "SELECT key_id, public_key, secret_key_enc, created_at, uploaded FROM one_time_prekeys WHERE key_id = ?",
        )
        .bind(key_id as i64)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else { return Ok(None) };
        let secret_bytes = self.decrypt_value(&row.secret_key_enc).await?;
        let secret_arr: [u8; 32] =
            secret_bytes.try_into().map_err(|_| StoreError::Corrupt("one-time prekey secret must be 32 bytes".into()))?;
        Ok(Some(OneTimePrekeyRecord {
            key_id: row.key_id as u32,
            public_key: decode_pub(&row.public_key)?,
            secret: StaticSecret::from(secret_arr),
            created_at: row.created_at,
            uploaded: row.uploaded,
        }))
    }

    pub async fn delete_one_time_prekey(&self, key_id: u32) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM one_time_prekeys WHERE key_id = ?").bind(key_id as i64).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn count_one_time_prekeys(&self) -> Result<u32, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM one_time_prekeys").fetch_one(&self.pool).await?;
        Ok(count as u32)
    }

    // ── metadata / id counter ────────────────────────────────────────────

    /// Reserves `n` contiguous ids atomically and returns the first one.
    pub async fn ensure_next_prekey_id_increment(&self, n: u32) -> Result<u32, StoreError> {
        let mut tx = self.pool.begin().await?;
        let current: Option<MetadataRow> = sqlx::query_as("SELECT key, value FROM metadata WHERE key = ?")
            .bind(META_NEXT_PREKEY_ID)
            .fetch_optional(&mut *tx)
            .await?;
        let start: u32 = match current {
            Some(row) => row.value.parse().map_err(|_| StoreError::Corrupt("next_prekey_id is not a number".into()))?,
            None => 1,
        };
        let next = start + n;
        sqlx::query("INSERT INTO metadata (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value")
            .bind(META_NEXT_PREKEY_ID)
            .bind(next.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(start)
    }

    pub async fn set_last_upload_at(&self, ts: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO metadata (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value")
            .bind(META_LAST_UPLOAD_AT)
            .bind(ts.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── sessions ─────────────────────────────────────────────────────────

    pub async fn save_session(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let ratchet_enc = match &record.ratchet {
            Some(r) => Some(self.encrypt_value(&serde_json::to_vec(r)?).await?),
            None => None,
        };
        let hint_enc = match &record.x3dh_send_hint {
            Some(h) => Some(self.encrypt_value(&serde_json::to_vec(h)?).await?),
            None => None,
        };

        sqlx::query(
            "INSERT INTO sessions \
             (peer_user_id, session_id, remote_identity_pub, remote_signed_prekey_pub, remote_signed_prekey_id, \
              remote_fingerprint, ratchet_state_enc, x3dh_send_hint_enc, status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(peer_user_id) DO UPDATE SET \
               session_id = excluded.session_id, \
               remote_identity_pub = excluded.remote_identity_pub, \
               remote_signed_prekey_pub = excluded.remote_signed_prekey_pub, \
               remote_signed_prekey_id = excluded.remote_signed_prekey_id, \
               remote_fingerprint = excluded.remote_fingerprint, \
               ratchet_state_enc = excluded.ratchet_state_enc, \
               x3dh_send_hint_enc = excluded.x3dh_send_hint_enc, \
               status = excluded.status, \
               updated_at = excluded.updated_at",
        )
        .bind(&record.peer_user_id)
        .bind(&record.session_id)
        .bind(record.remote_identity_pub.as_ref().map(encode_pub))
        .bind(record.remote_signed_prekey_pub.as_ref().map(encode_pub))
        .bind(record.remote_signed_prekey_id.map(|v| v as i64))
        .bind(&record.remote_fingerprint)
        .bind(ratchet_enc)
        .bind(hint_enc)
        .bind(record.status.as_str())
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_session(&self, peer_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let row: Option<SessionRow> = sqlx::query_as(
            "SELECT peer_user_id, session_id, remote_identity_pub, remote_signed_prekey_pub, remote_signed_prekey_id, \
                    remote_fingerprint, ratchet_state_enc, x3dh_send_hint_enc, status, created_at, updated_at \
             FROM sessions WHERE peer_user_id = ?",
        )
        .bind(peer_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let ratchet = match row.ratchet_state_enc {
            Some(enc) => Some(serde_json::from_slice(&self.decrypt_value(&enc).await?)?),
            None => None,
        };
        let x3dh_send_hint = match row.x3dh_send_hint_enc {
            Some(enc) => Some(serde_json::from_slice(&self.decrypt_value(&enc).await?)?),
            None => None,
        };

        Ok(Some(SessionRecord {
            peer_user_id: row.peer_user_id,
            session_id: row.session_id,
            remote_identity_pub: row.remote_identity_pub.as_deref().map(decode_pub).transpose()?,
            remote_signed_prekey_pub: row.remote_signed_prekey_pub.as_deref().map(decode_pub).transpose()?,
            remote_signed_prekey_id: row.remote_signed_prekey_id.map(|v| v as u32),
            remote_fingerprint: row.remote_fingerprint,
            ratchet,
            x3dh_send_hint,
            status: row.status.parse()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }))
    }

    pub async fn list_sessions(&self) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT peer_user_id FROM sessions ORDER BY peer_user_id ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn delete_session(&self, peer_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sessions WHERE peer_user_id = ?").bind(peer_id).execute(&self.pool).await?;
        Ok(())
    }

    /// Atomic replacement of the ratchet blob only.
    pub async fn update_session_ratchet_state(&self, peer_id: &str, ratchet: &RatchetSession) -> Result<(), StoreError> {
        let enc = self.encrypt_value(&serde_json::to_vec(ratchet)?).await?;
        sqlx::query("UPDATE sessions SET ratchet_state_enc = ?, status = 'ready', updated_at = datetime('now') WHERE peer_user_id = ?")
            .bind(enc)
            .bind(peer_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Strips the initiator-side X3DHSendHint after the first message is sent.
    pub async fn clear_session_x3dh_data(&self, peer_id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE sessions SET x3dh_send_hint_enc = NULL, updated_at = datetime('now') WHERE peer_user_id = ?")
            .bind(peer_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Wipes all five collections. Used by reset.
    pub async fn clear_all_e2ee_data(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM sessions").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM one_time_prekeys").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM signed_prekeys").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM identity").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM metadata").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }
}
