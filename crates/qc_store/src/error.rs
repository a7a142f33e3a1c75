use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Vault is locked — unlock with password first")]
    VaultLocked,

    #[error("Crypto error: {0}")]
    Crypto(#[from] qc_crypto::CryptoError),

    #[error("Snapshot checksum mismatch for {slot_key} (stored {stored}, computed {computed})")]
    ChecksumMismatch {
        slot_key: String,
        stored: String,
        computed: String,
    },

    #[error("Snapshot rejected: {reason}")]
    SnapshotRejected { reason: &'static str },

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Migration error: {0}")]
    Migration(String),
}
