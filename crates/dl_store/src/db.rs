//! Database abstraction over SQLite via sqlx.

use std::path::Path;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool},
    SqlitePool as Pool,
};

use crate::{error::StoreError, vault::Vault};

/// Central store handle.  Cheap to clone (Arc internally).
#[derive(Clone)]
pub struct Store {
    pub pool: Pool,
    pub vault: Vault,
}

impl Store {
    /// Open (or create) the SQLite database at `db_path`.
    /// Runs all pending migrations automatically.
    ///
    /// WAL journal mode and foreign-key enforcement are configured at connection
    /// time here — NOT inside a migration, because SQLite forbids changing
    /// `journal_mode` inside a transaction and sqlx wraps every migration in
    /// one (which produced SQLITE_ERROR code 1 during the first login).
    pub async fn open(db_path: &Path, vault: Vault) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePool::connect_with(opts).await?;
        crate::migrations::run::run_migrations(&pool).await?;

        Ok(Self { pool, vault })
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    /// Encrypt a plaintext value with the vault key.
    pub async fn encrypt_value(&self, plaintext: &[u8]) -> Result<String, StoreError> {
        self.vault
            .with_key(|key| {
                let ct = dl_crypto::aead::encrypt(key, plaintext, b"dl-store-v1")
                    .map_err(StoreError::Crypto)?;
                Ok(base64::Engine::encode(
                    &base64::engine::general_purpose::URL_SAFE_NO_PAD,
                    &ct,
                ))
            })
            .await
    }

    /// Decrypt a vault-encrypted value. A failed AEAD open means the
    /// persisted secret is corrupt (tampered, or encrypted under a
    /// different vault key) and surfaces as `StoreError::Corrupt`, never
    /// `StoreError::Crypto` — callers distinguish "this record is
    /// unrecoverable" from "the vault isn't unlocked".
    pub async fn decrypt_value(&self, b64: &str) -> Result<Vec<u8>, StoreError> {
        let ct = base64::Engine::decode(
            &base64::engine::general_purpose::URL_SAFE_NO_PAD,
            b64,
        )
        .map_err(|e| StoreError::Corrupt(format!("invalid base64: {e}")))?;

        self.vault
            .with_key(|key| {
                dl_crypto::aead::decrypt(key, &ct, b"dl-store-v1")
                    .map(|pt| pt.to_vec())
                    .map_err(|_| StoreError::Corrupt("AEAD open failed on persisted secret".into()))
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::Store;
    use crate::error::StoreError;
    use crate::vault::Vault;
    use std::path::PathBuf;
    use uuid::Uuid;

    async fn open_temp_store() -> (Store, PathBuf) {
        let db_path = PathBuf::from(format!("/tmp/dl-store-test-{}.db", Uuid::new_v4()));
        let store = Store::open(&db_path, Vault::new()).await.expect("open store");
        (store, db_path)
    }

    fn cleanup(db_path: &std::path::Path) {
        let _ = std::fs::remove_file(db_path);
        let _ = std::fs::remove_file(db_path.with_extension("db-wal"));
        let _ = std::fs::remove_file(db_path.with_extension("db-shm"));
    }

    #[tokio::test]
    async fn migrations_create_one_session_row_per_peer() {
        let (store, db_path) = open_temp_store().await;

        sqlx::query(
            "INSERT INTO sessions (peer_user_id, session_id, status, created_at, updated_at) \
             VALUES (?, ?, 'pending', datetime('now'), datetime('now'))",
        )
        .bind("bob")
        .bind("sess-1")
        .execute(&store.pool)
        .await
        .expect("insert session");

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sessions WHERE peer_user_id = ?")
            .bind("bob")
            .fetch_one(&store.pool)
            .await
            .expect("count sessions");
        assert_eq!(count, 1);

        cleanup(&db_path);
    }

    #[tokio::test]
    async fn bad_base64_on_decrypt_surfaces_as_corrupt() {
        let (store, db_path) = open_temp_store().await;
        store.vault.unlock(b"password", &dl_crypto::kdf::generate_salt()).await.unwrap();

        let err = store.decrypt_value("not valid base64!!").await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));

        cleanup(&db_path);
    }

    #[tokio::test]
    async fn encrypt_decrypt_roundtrip() {
        let (store, db_path) = open_temp_store().await;
        store.vault.unlock(b"password", &dl_crypto::kdf::generate_salt()).await.unwrap();

        let plaintext = b"identity seed bytes go here";
        let sealed = store.encrypt_value(plaintext).await.unwrap();
        let opened = store.decrypt_value(&sealed).await.unwrap();
        assert_eq!(opened, plaintext);

        cleanup(&db_path);
    }
}
