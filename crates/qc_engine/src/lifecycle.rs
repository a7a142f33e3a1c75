//! Lifecycle coordinator: login hydrate, visibility flush, secure logout,
//! conversation deletion, and the self-heal loop.
//!
//! Hydrate ordering is fixed: local snapshot restore comes first so WS
//! traffic arriving during the remote reconcile already finds sessions, and
//! the WS pump stays gated until `hydrationComplete` — a push with no session
//! would otherwise be dropped on the floor.
//!
//! Logout never pushes a remote DR backup; the next login pulls instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use qc_crypto::ratchet::EncryptContext;
use qc_proto::api::WsFrame;
use qc_proto::endpoint::Endpoint;
use qc_proto::message::{ControlMessage, MessageBody, MessagePayload};
use qc_store::models::JobKind;
use qc_store::snapshots::CONTACT_SECRETS_PREFIXES;
use qc_store::Store;

use crate::error::{EngineError, ReasonCode};
use crate::events::{EventBus, LifecycleEvent};
use crate::inbox::{Reconciler, TimelineRecord};
use crate::outbox::{JobPayload, NewJob, Outbox};
use crate::session_map::{HydrateOutcome, SessionStore};
use crate::transport::RelayTransport;

const DEFAULT_LOGOUT_REDIRECT: &str = "https://quietchannel.app/logged-out";

pub struct Coordinator {
    store: Store,
    sessions: SessionStore,
    outbox: Outbox,
    reconciler: Reconciler,
    relay: Arc<dyn RelayTransport>,
    events: EventBus,
    account_digest: String,
    device_id: String,
    hydration_complete: Arc<AtomicBool>,
    /// User-configured auto-logout on hide; None disables it.
    auto_logout_redirect: Option<String>,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        sessions: SessionStore,
        outbox: Outbox,
        reconciler: Reconciler,
        relay: Arc<dyn RelayTransport>,
        events: EventBus,
        account_digest: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            sessions,
            outbox,
            reconciler,
            relay,
            events,
            account_digest: account_digest.into(),
            device_id: device_id.into(),
            hydration_complete: Arc::new(AtomicBool::new(false)),
            auto_logout_redirect: None,
        }
    }

    pub fn set_auto_logout(&mut self, redirect: Option<String>) {
        self.auto_logout_redirect = redirect;
    }

    pub fn is_hydrated(&self) -> bool {
        self.hydration_complete.load(Ordering::SeqCst)
    }

    // ── Login hydrate ────────────────────────────────────────────────────

    /// The fixed login sequence. Progress events fire per step; the final
    /// `HydrationComplete` releases the WS pump.
    pub async fn login_hydrate(&self) -> Result<(), EngineError> {
        // 1+2: restore local snapshot, hydrating sessions optimistically so
        // any traffic arriving during the remote fetch has a session.
        let outcome = self
            .sessions
            .hydrate_from_store(&self.store, &self.account_digest)
            .await?;
        self.events.emit(LifecycleEvent::HydrationProgress { step: "restore-local" });
        if let HydrateOutcome::Restored { entries, .. } = outcome {
            self.events.emit(LifecycleEvent::ContactSecretsRestored { entries });
        }

        // 3: remote contact backup.
        let remote = match self.relay.fetch_contact_backup(&self.account_digest).await {
            Ok(remote) => remote,
            Err(e) => {
                tracing::warn!(
                    target: "quiet_channel",
                    event = "remote_backup_unavailable",
                    error = %e
                );
                None
            }
        };
        self.events.emit(LifecycleEvent::HydrationProgress { step: "fetch-remote" });

        // 4: reconcile — local in-memory sessions win; remote fills holes —
        // then persist the merged set back through the redundant slots.
        if let Some(payload) = remote {
            self.sessions
                .hydrate_from_sealed_payload(&self.store, &payload)
                .await?;
            self.sessions
                .persist_snapshots(&self.store, &self.account_digest, "login-merge")
                .await?;
        }
        self.events.emit(LifecycleEvent::HydrationProgress { step: "reconcile" });

        // 5: load contacts.
        let conversations = self.store.list_conversations().await?;
        self.events.emit(LifecycleEvent::HydrationProgress { step: "load-contacts" });

        // 6: catch-up pulls, then drain the outbox.
        for conversation in &conversations {
            if conversation.tombstoned {
                continue;
            }
            self.reconciler.catch_up(&conversation.conversation_id).await?;
        }
        self.run_pending_backfills().await?;
        self.outbox.flush_outbox("login-hydrate").await?;
        self.events.emit(LifecycleEvent::HydrationProgress { step: "catch-up" });

        // 7: open the gate.
        self.hydration_complete.store(true, Ordering::SeqCst);
        self.events.emit(LifecycleEvent::HydrationComplete);
        Ok(())
    }

    // ── WS pump ──────────────────────────────────────────────────────────

    /// Frames arriving before hydration completes are dropped: they would
    /// find no DR session, and the relay keeps them for the catch-up pull.
    pub async fn on_ws_frame(&self, frame: WsFrame) -> Result<Vec<TimelineRecord>, EngineError> {
        if !self.is_hydrated() {
            tracing::debug!(
                target: "quiet_channel",
                reason = ReasonCode::HydrationGateClosed.as_str(),
                frame = ?std::mem::discriminant(&frame)
            );
            return Ok(vec![]);
        }
        match frame {
            WsFrame::ForceLogout { target_device_id, reason } => {
                if target_device_id == self.device_id {
                    self.events.emit(LifecycleEvent::ForceLogout { reason });
                }
                Ok(vec![])
            }
            other => {
                let mut records = self.reconciler.handle_frame(other).await?;
                records.extend(self.run_pending_backfills().await?);
                Ok(records)
            }
        }
    }

    /// Drain the spans gap detection queued.
    pub async fn run_pending_backfills(&self) -> Result<Vec<TimelineRecord>, EngineError> {
        let mut records = Vec::new();
        for span in self.reconciler.take_pending_backfills().await {
            records.extend(self.reconciler.run_backfill(&span).await?);
        }
        Ok(records)
    }

    // ── Sending ──────────────────────────────────────────────────────────

    /// Encrypt and enqueue a text message, then kick a flush. The sealed
    /// post-encrypt session snapshot rides along in the job so a crash after
    /// enqueue cannot roll the counter back.
    pub async fn send_text(
        &self,
        conversation_id: &str,
        text: &str,
    ) -> Result<String, EngineError> {
        let conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| EngineError::ConversationMissing {
                conversation_id: conversation_id.into(),
            })?;
        let peer_key =
            Endpoint::new(&conversation.peer_account_digest, &conversation.peer_device_id)
                .peer_key();

        let now = chrono::Utc::now();
        let body = MessageBody::Text { body: text.to_string() };
        let body_bytes = serde_json::to_vec(&body)?;
        let message_id = qc_crypto::hash::message_id(
            &self.account_digest,
            &conversation.peer_account_digest,
            &body_bytes,
            now.timestamp_nanos_opt().unwrap_or(0),
        );
        let payload = MessagePayload {
            v: 1,
            message_id: message_id.clone(),
            sent_at: now,
            sender_device_id: self.device_id.clone(),
            body,
        };

        let sealed = self
            .sessions
            .encrypt_for(
                &peer_key,
                &serde_json::to_vec(&payload)?,
                &EncryptContext {
                    device_id: self.device_id.clone(),
                    v: 1,
                    conversation_id: Some(conversation_id.to_string()),
                },
            )
            .await?;

        let request = qc_proto::api::SendMessageRequest {
            conversation_id: conversation_id.to_string(),
            conversation_token: conversation.conversation_token.clone(),
            message_id: message_id.clone(),
            counter: sealed.counter,
            sender_device_id: self.device_id.clone(),
            receiver_account_digest: conversation.peer_account_digest.clone(),
            receiver_device_id: conversation.peer_device_id.clone(),
            packet: sealed.packet,
        };

        // Snapshot the advanced session into the job before anything else can
        // observe the new counter.
        let snapshot = self.sessions.snapshot_peer(&peer_key).await?;
        self.outbox
            .enqueue(NewJob {
                kind: JobKind::Message,
                conversation_id: conversation_id.to_string(),
                message_id: message_id.clone(),
                counter: Some(sealed.counter),
                payload: JobPayload::Message {
                    request,
                    vault: None,
                    backup: None,
                    dr_snapshot: None,
                },
                dr_snapshot_plain: snapshot,
            })
            .await?;
        self.sessions
            .persist_snapshots(&self.store, &self.account_digest, "send")
            .await?;
        self.outbox.flush_outbox("send").await?;
        Ok(message_id)
    }

    // ── Conversation deletion ────────────────────────────────────────────

    /// Delete the conversation locally up to `cursor`, push the monotone
    /// cursor to the relay, and signal the peer through the DR path.
    pub async fn delete_conversation(
        &self,
        conversation_id: &str,
        cursor: u64,
        tombstone: bool,
    ) -> Result<(), EngineError> {
        let conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| EngineError::ConversationMissing {
                conversation_id: conversation_id.into(),
            })?;

        self.store.raise_deletion_cursor(conversation_id, cursor as i64, false).await?;
        if tombstone {
            self.store.set_conversation_tombstoned(conversation_id).await?;
        }
        if let Err(e) = self.relay.push_deletion_cursor(conversation_id, cursor).await {
            // The cursor is already durable locally; the relay learns on the
            // next successful push.
            tracing::warn!(
                target: "quiet_channel",
                event = "deletion_cursor_push_failed",
                conversation_id,
                error = %e
            );
        }

        // Peer-side signal rides the ordinary DR message path.
        let peer_key =
            Endpoint::new(&conversation.peer_account_digest, &conversation.peer_device_id)
                .peer_key();
        let now = chrono::Utc::now();
        let body = MessageBody::Control(ControlMessage::ConversationDeleted {
            conversation_id: conversation_id.to_string(),
            deletion_cursor: Some(cursor),
            tombstone,
        });
        let body_bytes = serde_json::to_vec(&body)?;
        let message_id = qc_crypto::hash::message_id(
            &self.account_digest,
            &conversation.peer_account_digest,
            &body_bytes,
            now.timestamp_nanos_opt().unwrap_or(0),
        );
        let payload = MessagePayload {
            v: 1,
            message_id: message_id.clone(),
            sent_at: now,
            sender_device_id: self.device_id.clone(),
            body,
        };
        let sealed = self
            .sessions
            .encrypt_for(
                &peer_key,
                &serde_json::to_vec(&payload)?,
                &EncryptContext {
                    device_id: self.device_id.clone(),
                    v: 1,
                    conversation_id: Some(conversation_id.to_string()),
                },
            )
            .await?;
        let request = qc_proto::api::SendMessageRequest {
            conversation_id: conversation_id.to_string(),
            conversation_token: conversation.conversation_token.clone(),
            message_id: message_id.clone(),
            counter: sealed.counter,
            sender_device_id: self.device_id.clone(),
            receiver_account_digest: conversation.peer_account_digest.clone(),
            receiver_device_id: conversation.peer_device_id.clone(),
            packet: sealed.packet,
        };
        self.outbox
            .enqueue(NewJob {
                kind: JobKind::Message,
                conversation_id: conversation_id.to_string(),
                message_id,
                counter: Some(sealed.counter),
                payload: JobPayload::Message { request, vault: None, backup: None, dr_snapshot: None },
                dr_snapshot_plain: None,
            })
            .await?;
        self.outbox.flush_outbox("delete-conversation").await?;

        if tombstone {
            self.sessions
                .clear_dr_state(&self.store, &self.account_digest, &peer_key)
                .await?;
        }
        Ok(())
    }

    // ── Visibility / logout ──────────────────────────────────────────────

    /// `visibilitychange(hidden)` handler: seal and persist every live
    /// session, then run the optional user-configured auto-logout.
    pub async fn on_visibility_hidden(&self) -> Result<Option<String>, EngineError> {
        self.flush_dr_snapshots_before_logout().await?;
        if self.auto_logout_redirect.is_some() {
            let redirect = self.auto_logout_redirect.clone();
            return Ok(Some(self.secure_logout(redirect.as_deref()).await?));
        }
        Ok(None)
    }

    pub async fn flush_dr_snapshots_before_logout(&self) -> Result<usize, EngineError> {
        self.sessions
            .persist_snapshots(&self.store, &self.account_digest, "before-logout")
            .await
    }

    /// Flush, zeroise, clear caches (contact secrets excluded so re-login can
    /// restore), and hand back the redirect target.
    pub async fn secure_logout(&self, redirect: Option<&str>) -> Result<String, EngineError> {
        self.flush_dr_snapshots_before_logout().await?;
        self.sessions.scrub_all().await;
        self.store.vault.lock().await;
        self.store.clear_slots_except(CONTACT_SECRETS_PREFIXES).await?;
        self.hydration_complete.store(false, Ordering::SeqCst);

        let target = match redirect {
            Some(url) if url.starts_with("https://") => url.to_string(),
            Some(other) => {
                tracing::warn!(
                    target: "quiet_channel",
                    event = "logout_redirect_rejected",
                    url = other
                );
                DEFAULT_LOGOUT_REDIRECT.to_string()
            }
            None => DEFAULT_LOGOUT_REDIRECT.to_string(),
        };
        Ok(target)
    }

    // ── Self-heal ────────────────────────────────────────────────────────

    /// Recover a conversation whose session state went stale: restore the
    /// snapshot, then re-pull the range. Decrypt of already-processed
    /// counters is a no-op, so over-pulling is safe.
    pub async fn self_heal(&self, conversation_id: &str) -> Result<Vec<TimelineRecord>, EngineError> {
        self.sessions
            .hydrate_from_store(&self.store, &self.account_digest)
            .await?;
        self.reconciler.catch_up(conversation_id).await
    }
}
