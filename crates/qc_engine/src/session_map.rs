//! The session store: `peerKey → DrState`.
//!
//! Single-writer discipline: encrypt/decrypt go through the store's write
//! lock, so concurrent encrypts against one peer cannot interleave. Teardown
//! always runs the before-clear flush first, so a crash between flush and
//! clear loses nothing.
//!
//! Snapshots persist as a map `peerKey → sealed envelope` (one `outbox-dr/v1`
//! envelope per session), written through the store's redundant slots with a
//! checksum. A checksum mismatch or unsealable entry lands in the
//! corrupt-contacts map instead of being discarded — the UI surfaces
//! "backup damaged, re-sync required".

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::RwLock;
use zeroize::Zeroizing;

use qc_crypto::aead::INFO_TAG_OUTBOX_DR;
use qc_crypto::ratchet::{DecryptContext, DrState, EncryptContext, Packet};
use qc_store::{snapshots::SnapshotSource, Store, StoreError};

use crate::error::{EngineError, ReasonCode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HydrateOutcome {
    /// No snapshot in any slot.
    Empty,
    Restored {
        entries: usize,
        source: &'static str,
    },
    /// Snapshot present but unusable; details in the corrupt-contacts map.
    Corrupt {
        reason: ReasonCode,
    },
}

/// A packet produced by an outgoing encrypt, together with the counter the
/// outbox orders it by.
pub struct SealedSend {
    pub packet: Packet,
    /// The session's NsTotal after this encrypt — strictly monotonic.
    pub counter: u64,
}

#[derive(Clone, Default)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<String, DrState>>>,
    corrupt_contacts: Arc<RwLock<HashMap<String, String>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, state: DrState) {
        self.sessions.write().await.insert(state.peer_key.clone(), state);
    }

    pub async fn contains(&self, peer_key: &str) -> bool {
        self.sessions.read().await.contains_key(peer_key)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn corrupt_contacts(&self) -> HashMap<String, String> {
        self.corrupt_contacts.read().await.clone()
    }

    // ── Engine entry points ──────────────────────────────────────────────

    pub async fn encrypt_for(
        &self,
        peer_key: &str,
        plaintext: &[u8],
        ctx: &EncryptContext,
    ) -> Result<SealedSend, EngineError> {
        let mut sessions = self.sessions.write().await;
        let state = sessions
            .get_mut(peer_key)
            .ok_or_else(|| EngineError::SessionMissing { peer_key: peer_key.into() })?;
        let packet = state.encrypt(plaintext, ctx)?;
        Ok(SealedSend { packet, counter: state.ns_total })
    }

    pub async fn decrypt_from(
        &self,
        peer_key: &str,
        packet: &Packet,
        ctx: &DecryptContext,
    ) -> Result<Zeroizing<Vec<u8>>, EngineError> {
        let mut sessions = self.sessions.write().await;
        let state = sessions
            .get_mut(peer_key)
            .ok_or_else(|| EngineError::SessionMissing { peer_key: peer_key.into() })?;
        Ok(state.decrypt(packet, ctx)?)
    }

    // ── Snapshot / restore ───────────────────────────────────────────────

    /// Seal every in-memory session and write the snapshot through the
    /// store's redundant slots. Returns the number of entries flushed.
    pub async fn persist_snapshots(
        &self,
        store: &Store,
        account_digest: &str,
        source: &str,
    ) -> Result<usize, EngineError> {
        let sessions = self.sessions.read().await;
        let mut sealed_map: BTreeMap<String, String> = BTreeMap::new();
        for (peer_key, state) in sessions.iter() {
            let bytes = serde_json::to_vec(state)?;
            let sealed = store.seal_value(&bytes, INFO_TAG_OUTBOX_DR).await?;
            sealed_map.insert(peer_key.clone(), sealed);
        }
        drop(sessions);

        let payload = serde_json::to_string(&sealed_map)?;
        store
            .save_contact_secrets(account_digest, &payload, sealed_map.len(), true, source)
            .await?;
        Ok(sealed_map.len())
    }

    /// Restore sessions from the slot cascade. Existing in-memory sessions
    /// win over the snapshot — they are always at least as fresh.
    pub async fn hydrate_from_store(
        &self,
        store: &Store,
        account_digest: &str,
    ) -> Result<HydrateOutcome, EngineError> {
        let restored = match store.restore_contact_secrets(account_digest).await {
            Ok(None) => return Ok(HydrateOutcome::Empty),
            Ok(Some(restored)) => restored,
            Err(StoreError::ChecksumMismatch { slot_key, stored, computed }) => {
                tracing::warn!(
                    target: "quiet_channel",
                    reason = ReasonCode::ChecksumMismatch.as_str(),
                    slot = %slot_key,
                    %stored,
                    %computed,
                    "contact-secrets snapshot corrupt"
                );
                self.corrupt_contacts
                    .write()
                    .await
                    .insert(account_digest.to_string(), ReasonCode::ChecksumMismatch.as_str().into());
                return Ok(HydrateOutcome::Corrupt { reason: ReasonCode::ChecksumMismatch });
            }
            Err(StoreError::SnapshotRejected { reason }) => {
                tracing::warn!(
                    target: "quiet_channel",
                    reason = ReasonCode::LegacyPlaintextSnapshot.as_str(),
                    detail = reason,
                    "contact-secrets snapshot rejected"
                );
                self.corrupt_contacts
                    .write()
                    .await
                    .insert(account_digest.to_string(), reason.into());
                return Ok(HydrateOutcome::Corrupt { reason: ReasonCode::LegacyPlaintextSnapshot });
            }
            Err(e) => return Err(e.into()),
        };

        let entries = self.merge_sealed_payload(store, &restored.payload).await?;

        let source = match restored.source {
            SnapshotSource::Primary => "primary",
            SnapshotSource::Latest => "latest",
            SnapshotSource::Legacy => "legacy",
        };
        Ok(HydrateOutcome::Restored { entries, source })
    }

    /// Merge a `peerKey → sealed envelope` payload into memory. Existing
    /// in-memory sessions win; unusable entries land in the corrupt map.
    /// Used both by the local restore and by the remote-backup reconcile.
    pub async fn hydrate_from_sealed_payload(
        &self,
        store: &Store,
        payload: &str,
    ) -> Result<usize, EngineError> {
        self.merge_sealed_payload(store, payload).await
    }

    async fn merge_sealed_payload(
        &self,
        store: &Store,
        payload: &str,
    ) -> Result<usize, EngineError> {
        let sealed_map: BTreeMap<String, String> = serde_json::from_str(payload)?;
        let mut entries = 0;
        for (peer_key, sealed) in sealed_map {
            if self.contains(&peer_key).await {
                continue;
            }
            let unsealed = store.unseal_value(&sealed, &[INFO_TAG_OUTBOX_DR]).await;
            match unsealed.and_then(|bytes| {
                serde_json::from_slice::<DrState>(&bytes).map_err(StoreError::from)
            }) {
                Ok(state) => {
                    self.insert(state).await;
                    entries += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        target: "quiet_channel",
                        reason = ReasonCode::ChecksumMismatch.as_str(),
                        peer_key = %peer_key,
                        error = %e,
                        "session snapshot entry unusable"
                    );
                    self.corrupt_contacts.write().await.insert(peer_key, e.to_string());
                }
            }
        }
        Ok(entries)
    }

    /// Plain serialisation of one session, for embedding into an outbox job
    /// (the outbox seals it before it reaches durable storage).
    pub async fn snapshot_peer(&self, peer_key: &str) -> Result<Option<Vec<u8>>, EngineError> {
        let sessions = self.sessions.read().await;
        match sessions.get(peer_key) {
            Some(state) => Ok(Some(serde_json::to_vec(state)?)),
            None => Ok(None),
        }
    }

    /// Tear down one session. The before-clear flush runs first so no state
    /// is lost between flush and scrub; the removed state zeroizes on drop.
    pub async fn clear_dr_state(
        &self,
        store: &Store,
        account_digest: &str,
        peer_key: &str,
    ) -> Result<(), EngineError> {
        self.persist_snapshots(store, account_digest, "before-clear").await?;
        self.sessions.write().await.remove(peer_key);
        Ok(())
    }

    /// Drop every session (logout). Caller is responsible for the flush —
    /// `secure_logout` sequences flush → scrub explicitly.
    pub async fn scrub_all(&self) {
        self.sessions.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qc_crypto::x3dh;
    use qc_crypto::identity::IdentityKeyPair;
    use qc_store::snapshots::primary_slot;
    use qc_store::Vault;

    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

    async fn unlocked_store() -> Store {
        let vault = Vault::new();
        vault.unlock_with_key([4u8; 32]).await;
        Store::open_in_memory(vault).await.expect("open store")
    }

    fn bootstrap_pair() -> (DrState, DrState) {
        let alice_ik = IdentityKeyPair::generate();
        let bob_ik = IdentityKeyPair::generate();
        let (bob_spk_secret, bob_spk_pub, bob_spk_sig) = x3dh::generate_signed_prekey(&bob_ik);
        let bundle = x3dh::KeyBundle {
            ik_pub: bob_ik.public_b64(),
            spk_pub: URL_SAFE_NO_PAD.encode(bob_spk_pub.as_bytes()),
            spk_sig: URL_SAFE_NO_PAD.encode(&bob_spk_sig),
            opks: vec![],
        };
        let outcome = x3dh::initiate(&alice_ik, &bundle).unwrap();
        let alice_ik_ed: [u8; 32] = alice_ik.public.0.clone().try_into().unwrap();
        let mut no_opks: std::collections::HashMap<String, x25519_dalek::StaticSecret> =
            Default::default();
        let sk_bob =
            x3dh::respond(&bob_ik, &bob_spk_secret, &mut no_opks, &alice_ik_ed, &outcome.header)
                .unwrap();
        let alice =
            DrState::new_initiator("BOB::dev-b".into(), outcome.shared_key, &bob_spk_pub).unwrap();
        let bob = DrState::new_responder("ALICE::dev-a".into(), sk_bob, &bob_spk_secret);
        (alice, bob)
    }

    fn ectx() -> EncryptContext {
        EncryptContext { device_id: "dev-a".into(), v: 1, conversation_id: None }
    }

    #[tokio::test]
    async fn encrypt_counter_is_monotonic_across_snapshot_roundtrip() {
        let store = unlocked_store().await;
        let sessions = SessionStore::new();
        let (alice, _bob) = bootstrap_pair();
        sessions.insert(alice).await;

        let s1 = sessions.encrypt_for("BOB::dev-b", b"one", &ectx()).await.unwrap();
        let s2 = sessions.encrypt_for("BOB::dev-b", b"two", &ectx()).await.unwrap();
        assert!(s2.counter > s1.counter);

        sessions.persist_snapshots(&store, "AB12", "test").await.unwrap();

        // Fresh process: hydrate from disk, counter keeps rising.
        let restored = SessionStore::new();
        let outcome = restored.hydrate_from_store(&store, "AB12").await.unwrap();
        assert!(matches!(outcome, HydrateOutcome::Restored { entries: 1, .. }));
        let s3 = restored.encrypt_for("BOB::dev-b", b"three", &ectx()).await.unwrap();
        assert!(s3.counter > s2.counter);
    }

    #[tokio::test]
    async fn snapshot_restore_decrypts_next_live_packet() {
        let store = unlocked_store().await;
        let sessions = SessionStore::new();
        let (alice, bob) = bootstrap_pair();
        sessions.insert(alice).await;
        sessions.insert(bob).await;

        let send = sessions.encrypt_for("BOB::dev-b", b"hello", &ectx()).await.unwrap();
        sessions.persist_snapshots(&store, "AB12", "test").await.unwrap();

        let restored = SessionStore::new();
        restored.hydrate_from_store(&store, "AB12").await.unwrap();
        let pt = restored
            .decrypt_from("ALICE::dev-a", &send.packet, &DecryptContext::default())
            .await
            .unwrap();
        assert_eq!(&pt[..], b"hello");
    }

    #[tokio::test]
    async fn in_memory_sessions_win_over_snapshot() {
        let store = unlocked_store().await;
        let sessions = SessionStore::new();
        let (alice, _bob) = bootstrap_pair();
        sessions.insert(alice).await;
        sessions.persist_snapshots(&store, "AB12", "test").await.unwrap();

        // Advance in memory beyond the snapshot.
        sessions.encrypt_for("BOB::dev-b", b"newer", &ectx()).await.unwrap();
        let before = sessions.encrypt_for("BOB::dev-b", b"x", &ectx()).await.unwrap().counter;

        sessions.hydrate_from_store(&store, "AB12").await.unwrap();
        let after = sessions.encrypt_for("BOB::dev-b", b"y", &ectx()).await.unwrap().counter;
        assert!(after > before, "hydrate must not roll a live session back");
    }

    #[tokio::test]
    async fn corrupt_snapshot_marks_contact_instead_of_discarding() {
        let store = unlocked_store().await;
        let sessions = SessionStore::new();
        let (alice, _bob) = bootstrap_pair();
        sessions.insert(alice).await;
        sessions.persist_snapshots(&store, "AB12", "test").await.unwrap();

        store.put_slot(&primary_slot("AB12"), "garbage").await.unwrap();

        let fresh = SessionStore::new();
        let outcome = fresh.hydrate_from_store(&store, "AB12").await.unwrap();
        assert!(matches!(outcome, HydrateOutcome::Corrupt { reason: ReasonCode::ChecksumMismatch }));
        assert!(fresh.corrupt_contacts().await.contains_key("AB12"));
        assert!(fresh.is_empty().await);
    }

    #[tokio::test]
    async fn clear_dr_state_flushes_before_scrub() {
        let store = unlocked_store().await;
        let sessions = SessionStore::new();
        let (alice, _bob) = bootstrap_pair();
        sessions.insert(alice).await;
        sessions.encrypt_for("BOB::dev-b", b"x", &ectx()).await.unwrap();

        sessions.clear_dr_state(&store, "AB12", "BOB::dev-b").await.unwrap();
        assert!(!sessions.contains("BOB::dev-b").await);

        // The pre-clear flush preserved the session on disk.
        let restored = SessionStore::new();
        let outcome = restored.hydrate_from_store(&store, "AB12").await.unwrap();
        assert!(matches!(outcome, HydrateOutcome::Restored { entries: 1, .. }));
    }
}
