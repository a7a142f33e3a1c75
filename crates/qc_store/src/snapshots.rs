//! Contact-secrets snapshot persistence.
//!
//! The sealed session map is written to two redundant slots (a primary slot
//! and a per-login "latest" slot) plus a metadata record and a SHA-256
//! checksum over the sealed payload. Restore walks an ordered list of
//! locators — primary, latest, then a legacy layout — and returns the first
//! non-empty hit, verifying the checksum where one exists. A checksum
//! mismatch marks the snapshot corrupt rather than silently discarding keys.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{error::StoreError, Store};

pub fn primary_slot(account_digest: &str) -> String {
    format!("contactSecrets-{account_digest}")
}

pub fn latest_slot(account_digest: &str) -> String {
    format!("contactSecrets-v2-{account_digest}")
}

pub fn meta_slot(account_digest: &str) -> String {
    format!("contactSecrets-meta-{account_digest}")
}

pub fn checksum_slot(account_digest: &str) -> String {
    format!("contactSecrets-checksum-{account_digest}")
}

/// Pre-v1 layout, still probed on restore so an interrupted upgrade cannot
/// strand a user's sessions.
pub fn legacy_slot(account_digest: &str) -> String {
    format!("contact-secrets:{account_digest}")
}

/// The key-family prefixes secure logout must preserve.
pub const CONTACT_SECRETS_PREFIXES: &[&str] = &["contactSecrets-", "contact-secrets:"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub entries: usize,
    pub bytes: usize,
    pub with_dr_state: bool,
    pub source: String,
    pub ts: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksumRecord {
    pub checksum: String,
    pub algorithm: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotSource {
    Primary,
    Latest,
    Legacy,
}

impl SnapshotSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotSource::Primary => "primary",
            SnapshotSource::Latest => "latest",
            SnapshotSource::Legacy => "legacy",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestoredSnapshot {
    /// The sealed payload string, exactly as written.
    pub payload: String,
    pub source: SnapshotSource,
    pub bytes: usize,
}

fn sha256_hex(payload: &str) -> String {
    hex::encode(Sha256::digest(payload.as_bytes()))
}

impl Store {
    /// Persist a sealed contact-secrets snapshot to both redundant slots,
    /// with meta and checksum records.
    pub async fn save_contact_secrets(
        &self,
        account_digest: &str,
        sealed_payload: &str,
        entries: usize,
        with_dr_state: bool,
        source: &str,
    ) -> Result<(), StoreError> {
        let checksum = ChecksumRecord {
            checksum: sha256_hex(sealed_payload),
            algorithm: "sha-256".into(),
        };
        let meta = SnapshotMeta {
            entries,
            bytes: sealed_payload.len(),
            with_dr_state,
            source: source.into(),
            ts: chrono::Utc::now().timestamp_millis(),
        };

        self.put_slot(&primary_slot(account_digest), sealed_payload).await?;
        self.put_slot(&latest_slot(account_digest), sealed_payload).await?;
        self.put_slot(&meta_slot(account_digest), &serde_json::to_string(&meta)?).await?;
        self.put_slot(&checksum_slot(account_digest), &serde_json::to_string(&checksum)?)
            .await?;

        tracing::debug!(
            target: "quiet_channel",
            event = "contact_secrets_saved",
            account_digest,
            entries,
            bytes = meta.bytes,
            with_dr_state,
            source
        );
        Ok(())
    }

    /// Restore from the locator cascade. Returns `Ok(None)` when no slot
    /// holds a snapshot; `ChecksumMismatch` when a slot's payload disagrees
    /// with the stored checksum (the caller marks the owner corrupt);
    /// `SnapshotRejected` for a pre-encryption legacy record.
    pub async fn restore_contact_secrets(
        &self,
        account_digest: &str,
    ) -> Result<Option<RestoredSnapshot>, StoreError> {
        let locators = [
            (SnapshotSource::Primary, primary_slot(account_digest)),
            (SnapshotSource::Latest, latest_slot(account_digest)),
            (SnapshotSource::Legacy, legacy_slot(account_digest)),
        ];

        let checksum: Option<ChecksumRecord> = match self.get_slot(&checksum_slot(account_digest)).await? {
            Some(raw) => serde_json::from_str(&raw).ok(),
            None => None,
        };

        for (source, slot_key) in locators {
            let Some(payload) = self.get_slot(&slot_key).await? else {
                tracing::debug!(
                    target: "quiet_channel",
                    event = "snapshot_slot_empty",
                    slot = %slot_key
                );
                continue;
            };
            tracing::info!(
                target: "quiet_channel",
                event = "snapshot_slot_hit",
                slot = %slot_key,
                source = source.as_str(),
                bytes = payload.len()
            );
            if payload.is_empty() {
                continue;
            }

            // A record that parses as a bare DR object (identified by its
            // pre-encryption bookkeeping keys) predates sealed storage.
            if looks_like_plaintext_dr(&payload) {
                return Err(StoreError::SnapshotRejected {
                    reason: "LEGACY_PLAINTEXT_SNAPSHOT",
                });
            }

            // Legacy slots never carried checksums; primary/latest must match
            // when a checksum record exists.
            if source != SnapshotSource::Legacy {
                if let Some(ref record) = checksum {
                    let computed = sha256_hex(&payload);
                    if computed != record.checksum {
                        return Err(StoreError::ChecksumMismatch {
                            slot_key,
                            stored: record.checksum.clone(),
                            computed,
                        });
                    }
                }
            }

            let bytes = payload.len();
            return Ok(Some(RestoredSnapshot { payload, source, bytes }));
        }

        Ok(None)
    }
}

/// Detect the pre-encryption snapshot layout: a JSON object exposing raw
/// ratchet bookkeeping (`snapshotBefore` / `snapshotAfter`) instead of a
/// sealed envelope.
fn looks_like_plaintext_dr(payload: &str) -> bool {
    match serde_json::from_str::<serde_json::Value>(payload) {
        Ok(serde_json::Value::Object(map)) => {
            map.contains_key("snapshotBefore") || map.contains_key("snapshotAfter")
        }
        _ => false,
    }
}
