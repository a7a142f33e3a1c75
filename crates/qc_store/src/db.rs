//! Database abstraction over SQLite via sqlx.

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::{error::StoreError, migrations, vault::Vault};

/// Central store handle. Cheap to clone (Arc internally).
#[derive(Clone)]
pub struct Store {
    pub pool: SqlitePool,
    pub vault: Vault,
}

impl Store {
    /// Open (or create) the SQLite database at `db_path` and run pending
    /// migrations.
    ///
    /// WAL journal mode and foreign keys are set at connection time, not in a
    /// migration — SQLite forbids changing `journal_mode` inside a
    /// transaction and sqlx wraps every migration in one.
    pub async fn open(db_path: &Path, vault: Vault) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePool::connect_with(opts).await?;
        migrations::run::run_migrations(&pool).await?;
        Ok(Self { pool, vault })
    }

    /// In-memory store for tests. Single connection: SQLite memory databases
    /// are per-connection.
    pub async fn open_in_memory(vault: Vault) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        migrations::run::run_migrations(&pool).await?;
        Ok(Self { pool, vault })
    }

    // ── Sealed values ────────────────────────────────────────────────────

    /// Seal a plaintext value under the master key with the given info tag.
    /// Returns the opaque envelope string stored in slots/payloads.
    pub async fn seal_value(&self, plaintext: &[u8], info_tag: &str) -> Result<String, StoreError> {
        self.vault.seal(plaintext, info_tag).await
    }

    /// Unseal an envelope string; the caller names the info tags it accepts.
    pub async fn unseal_value(
        &self,
        sealed: &str,
        allowed_tags: &[&str],
    ) -> Result<Vec<u8>, StoreError> {
        self.vault.unseal(sealed, allowed_tags).await
    }

    // ── KV slots ─────────────────────────────────────────────────────────

    pub async fn put_slot(&self, slot_key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO kv_slots (slot_key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(slot_key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(slot_key)
        .bind(value)
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_slot(&self, slot_key: &str) -> Result<Option<String>, StoreError> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM kv_slots WHERE slot_key = ?")
                .bind(slot_key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value)
    }

    pub async fn delete_slot(&self, slot_key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM kv_slots WHERE slot_key = ?")
            .bind(slot_key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove every slot except the given key-family prefixes. Used by secure
    /// logout, which must preserve contact secrets for the next login.
    pub async fn clear_slots_except(&self, keep_prefixes: &[&str]) -> Result<u64, StoreError> {
        let keys: Vec<String> = sqlx::query_scalar("SELECT slot_key FROM kv_slots")
            .fetch_all(&self.pool)
            .await?;
        let mut removed = 0;
        for key in keys {
            if keep_prefixes.iter().any(|p| key.starts_with(p)) {
                continue;
            }
            sqlx::query("DELETE FROM kv_slots WHERE slot_key = ?")
                .bind(&key)
                .execute(&self.pool)
                .await?;
            removed += 1;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qc_crypto::aead::{INFO_TAG_OUTBOX_DR, INFO_TAG_SETTINGS};

    async fn unlocked_store() -> Store {
        let vault = Vault::new();
        vault.unlock_with_key([1u8; 32]).await;
        Store::open_in_memory(vault).await.expect("open store")
    }

    #[tokio::test]
    async fn sealed_value_roundtrip() {
        let store = unlocked_store().await;
        let sealed = store.seal_value(b"secret", INFO_TAG_OUTBOX_DR).await.unwrap();
        let back = store.unseal_value(&sealed, &[INFO_TAG_OUTBOX_DR]).await.unwrap();
        assert_eq!(back, b"secret");
    }

    #[tokio::test]
    async fn unseal_enforces_allow_list() {
        let store = unlocked_store().await;
        let sealed = store.seal_value(b"secret", INFO_TAG_SETTINGS).await.unwrap();
        let err = store.unseal_value(&sealed, &[INFO_TAG_OUTBOX_DR]).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Crypto(qc_crypto::CryptoError::EnvelopeInfoTagMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn slots_upsert_and_selective_clear() {
        let store = unlocked_store().await;
        store.put_slot("contactSecrets-AB", "v1").await.unwrap();
        store.put_slot("contactSecrets-AB", "v2").await.unwrap();
        store.put_slot("settings-AB", "s").await.unwrap();

        assert_eq!(store.get_slot("contactSecrets-AB").await.unwrap().as_deref(), Some("v2"));

        let removed = store.clear_slots_except(&["contactSecrets"]).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_slot("settings-AB").await.unwrap().is_none());
        assert!(store.get_slot("contactSecrets-AB").await.unwrap().is_some());
    }
}
