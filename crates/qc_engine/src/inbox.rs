//! Inbox / gap reconciler.
//!
//! Messages arrive through live push and through b-route catch-up pulls.
//! Either way the reconciler: dedupes on `(conversation, serverMessageId,
//! messageId)`, feeds packets to the ratchet in `(ts, counter, id)` order,
//! emits placeholders for counter gaps and schedules pulls to fill them,
//! honours deletion cursors, and consumes control messages before anything
//! reaches the UI.
//!
//! Replayed packets are a no-op, not an error: the relay keeps messages
//! regardless of downloads, so any stale-state decrypt failure is recoverable
//! by restoring a snapshot and pulling the range again.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;

use qc_crypto::ratchet::{DecryptContext, EncryptContext};
use qc_crypto::CryptoError;
use qc_proto::api::{RelayMessage, SendMessageRequest, WsFrame};
use qc_proto::endpoint::Endpoint;
use qc_proto::message::{ControlMessage, MessageBody, MessagePayload, ReceiptType};
use qc_store::models::ConversationRow;
use qc_store::Store;

use crate::error::{EngineError, ReasonCode};
use crate::session_map::SessionStore;
use crate::transport::{RelayTransport, TransportError};

/// How long the UI waits before fading a placeholder in.
pub const PLACEHOLDER_REVEAL_MS: i64 = 1500;

/// Page size for b-route pulls.
const PULL_PAGE_LIMIT: u32 = 100;

#[derive(Debug, Clone)]
pub enum TimelineRecord {
    Message {
        conversation_id: String,
        message_id: String,
        counter: u64,
        ts: i64,
        sender_device_id: String,
        body: MessageBody,
    },
    /// A gap being reconciled; reveal after `reveal_at_ms`.
    Placeholder {
        conversation_id: String,
        counter: u64,
        reveal_at_ms: i64,
    },
    /// A placeholder whose backfill terminally failed.
    PlaceholderFailed {
        conversation_id: String,
        counter: u64,
        reason: ReasonCode,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackfillSpan {
    pub conversation_id: String,
    pub from_counter: u64,
    pub to_counter: u64,
}

#[derive(Clone)]
pub struct Reconciler {
    store: Store,
    sessions: SessionStore,
    relay: Arc<dyn RelayTransport>,
    account_digest: String,
    local_device_id: String,
    /// conversation → next expected counter.
    next_expected: Arc<Mutex<HashMap<String, u64>>>,
    /// (conversation, counter) → reveal deadline for open placeholders.
    placeholders: Arc<Mutex<HashMap<(String, u64), i64>>>,
    /// Idempotency for receipts: (message_id, type) pairs already sent.
    receipts_sent: Arc<Mutex<HashSet<(String, ReceiptType)>>>,
    /// Spans waiting for a b-route pull; drained by the coordinator.
    pending_backfills: Arc<Mutex<Vec<BackfillSpan>>>,
}

impl Reconciler {
    pub fn new(
        store: Store,
        sessions: SessionStore,
        relay: Arc<dyn RelayTransport>,
        account_digest: impl Into<String>,
        local_device_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            sessions,
            relay,
            account_digest: account_digest.into(),
            local_device_id: local_device_id.into(),
            next_expected: Arc::new(Mutex::new(HashMap::new())),
            placeholders: Arc::new(Mutex::new(HashMap::new())),
            receipts_sent: Arc::new(Mutex::new(HashSet::new())),
            pending_backfills: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Spans queued by gap detection or decrypt-refetch. Draining takes
    /// ownership; the caller runs them through [`Reconciler::run_backfill`].
    pub async fn take_pending_backfills(&self) -> Vec<BackfillSpan> {
        std::mem::take(&mut *self.pending_backfills.lock().await)
    }

    // ── Entry points ─────────────────────────────────────────────────────

    /// Live-push entry. Frames for other devices are dropped outright.
    pub async fn handle_frame(&self, frame: WsFrame) -> Result<Vec<TimelineRecord>, EngineError> {
        if frame.target_device_id() != self.local_device_id {
            tracing::debug!(
                target: "quiet_channel",
                reason = ReasonCode::WrongTargetDevice.as_str(),
                target = frame.target_device_id()
            );
            return Ok(vec![]);
        }
        match frame.into_relay_message() {
            Some(message) => self.ingest_batch(vec![message]).await,
            None => Ok(vec![]),
        }
    }

    /// Feed a batch of stored messages through the ratchet in
    /// `(ts, counter, id)` order, then persist the advanced session state.
    pub async fn ingest_batch(
        &self,
        mut items: Vec<RelayMessage>,
    ) -> Result<Vec<TimelineRecord>, EngineError> {
        items.sort_by(|a, b| {
            (a.ts, a.counter, a.id.as_str()).cmp(&(b.ts, b.counter, b.id.as_str()))
        });
        let mut records = Vec::new();
        let mut decrypted_any = false;
        for item in &items {
            let mut out = self.ingest_one(item, &mut decrypted_any).await?;
            records.append(&mut out);
        }
        if decrypted_any {
            self.sessions
                .persist_snapshots(&self.store, &self.account_digest, "inbox")
                .await?;
        }
        Ok(records)
    }

    async fn ingest_one(
        &self,
        item: &RelayMessage,
        decrypted_any: &mut bool,
    ) -> Result<Vec<TimelineRecord>, EngineError> {
        let Some(conversation) = self.store.get_conversation(&item.conversation_id).await? else {
            tracing::warn!(
                target: "quiet_channel",
                event = "inbox_unknown_conversation",
                conversation_id = %item.conversation_id
            );
            return Ok(vec![]);
        };

        // Deletion cursor: nothing at or below it ever surfaces again.
        let thread = conversation.clone().into_thread();
        if thread.is_tombstoned_counter(item.counter) {
            self.store
                .mark_inbox_seen(&item.conversation_id, &item.id, &item.message_id)
                .await?;
            return Ok(vec![]);
        }

        // Dedupe across push and pull deliveries. The triple is only MARKED
        // seen after a successful decrypt (ack-after-decrypt), so a refetch
        // of a not-yet-decryptable item is never skipped.
        if self
            .store
            .is_inbox_seen(&item.conversation_id, &item.id, &item.message_id)
            .await?
        {
            return Ok(vec![]);
        }

        let mut records = self.detect_gap(&thread, item).await;

        let peer_key =
            Endpoint::new(&thread.peer_account_digest, &thread.peer_device_id).peer_key();
        let ctx = DecryptContext { conversation_id: Some(item.conversation_id.clone()) };

        let plaintext = match self.sessions.decrypt_from(&peer_key, &item.packet, &ctx).await {
            Ok(pt) => pt,
            Err(EngineError::Crypto(CryptoError::ReplayDetected { ek_pub, n })) => {
                tracing::debug!(
                    target: "quiet_channel",
                    reason = ReasonCode::ReplayDetected.as_str(),
                    conversation_id = %item.conversation_id,
                    %ek_pub,
                    n
                );
                // Already consumed once; nothing left to refetch.
                self.store
                    .mark_inbox_seen(&item.conversation_id, &item.id, &item.message_id)
                    .await?;
                return Ok(records);
            }
            Err(EngineError::Crypto(CryptoError::MessageKeyUnavailable { n })) => {
                tracing::warn!(
                    target: "quiet_channel",
                    reason = ReasonCode::DecryptRefetch.as_str(),
                    conversation_id = %item.conversation_id,
                    counter = item.counter,
                    n
                );
                self.schedule_backfill(&item.conversation_id, item.counter, item.counter).await;
                return Ok(records);
            }
            Err(EngineError::Crypto(err @ CryptoError::PnGapExceedsLimit { .. })) => {
                tracing::error!(
                    target: "quiet_channel",
                    reason = ReasonCode::PnGapExceedsLimit.as_str(),
                    conversation_id = %item.conversation_id,
                    error = %err
                );
                return Ok(records);
            }
            Err(EngineError::Crypto(err @ CryptoError::SkipLimitExceeded { .. })) => {
                tracing::error!(
                    target: "quiet_channel",
                    reason = ReasonCode::SkipLimitExceeded.as_str(),
                    conversation_id = %item.conversation_id,
                    error = %err
                );
                return Ok(records);
            }
            Err(EngineError::SessionMissing { .. }) => {
                // Self-heal: a stale or missing session is recoverable from
                // the snapshot; retry once after restoring.
                self.sessions.hydrate_from_store(&self.store, &self.account_digest).await?;
                match self.sessions.decrypt_from(&peer_key, &item.packet, &ctx).await {
                    Ok(pt) => pt,
                    Err(e) => {
                        tracing::warn!(
                            target: "quiet_channel",
                            reason = ReasonCode::DecryptRefetch.as_str(),
                            conversation_id = %item.conversation_id,
                            error = %e,
                            "no session even after restore"
                        );
                        return Ok(records);
                    }
                }
            }
            Err(e) => return Err(e),
        };
        *decrypted_any = true;
        self.store
            .mark_inbox_seen(&item.conversation_id, &item.id, &item.message_id)
            .await?;

        let payload: MessagePayload = serde_json::from_slice(&plaintext)?;
        if payload.sender_device_id != item.packet.header.device_id {
            tracing::error!(
                target: "quiet_channel",
                event = "sender_device_mismatch",
                payload_device = %payload.sender_device_id,
                header_device = %item.packet.header.device_id
            );
            return Ok(records);
        }

        self.resolve_placeholder(&item.conversation_id, item.counter).await;
        {
            let mut expected = self.next_expected.lock().await;
            let entry = expected.entry(item.conversation_id.clone()).or_insert(1);
            *entry = (*entry).max(item.counter + 1);
        }

        match payload.body {
            MessageBody::Control(control) => {
                self.consume_control(&conversation, control).await?;
            }
            body => {
                records.push(TimelineRecord::Message {
                    conversation_id: item.conversation_id.clone(),
                    message_id: payload.message_id.clone(),
                    counter: item.counter,
                    ts: item.ts,
                    sender_device_id: payload.sender_device_id.clone(),
                    body,
                });
                // Delivery receipt, best-effort and outside the outbox.
                self.send_receipt(&item.conversation_id, &payload.message_id, ReceiptType::Delivered)
                    .await;
            }
        }
        Ok(records)
    }

    // ── Gap handling ─────────────────────────────────────────────────────

    async fn detect_gap(
        &self,
        thread: &qc_proto::ConversationThread,
        item: &RelayMessage,
    ) -> Vec<TimelineRecord> {
        let baseline = thread.deletion_cursor.map(|c| c + 1).unwrap_or(1);
        let mut expected_map = self.next_expected.lock().await;
        let expected = *expected_map
            .entry(item.conversation_id.clone())
            .or_insert(baseline);
        drop(expected_map);

        // A gap exists only when the observed counter runs ahead of the next
        // expected one by more than 1; a single missing message is left to
        // the skip-key cache rather than a placeholder + pull.
        if item.counter <= expected + 1 {
            return vec![];
        }

        tracing::info!(
            target: "quiet_channel",
            reason = ReasonCode::GapDetected.as_str(),
            conversation_id = %item.conversation_id,
            expected,
            highest = item.counter
        );

        let reveal_at = chrono::Utc::now().timestamp_millis() + PLACEHOLDER_REVEAL_MS;
        let mut records = Vec::new();
        let mut placeholders = self.placeholders.lock().await;
        for missing in expected..item.counter {
            if placeholders.insert((item.conversation_id.clone(), missing), reveal_at).is_none() {
                records.push(TimelineRecord::Placeholder {
                    conversation_id: item.conversation_id.clone(),
                    counter: missing,
                    reveal_at_ms: reveal_at,
                });
            }
        }
        drop(placeholders);

        self.schedule_backfill(&item.conversation_id, expected, item.counter).await;
        records
    }

    async fn schedule_backfill(&self, conversation_id: &str, from: u64, to: u64) {
        let span = BackfillSpan {
            conversation_id: conversation_id.to_string(),
            from_counter: from,
            to_counter: to,
        };
        let mut pending = self.pending_backfills.lock().await;
        if !pending.contains(&span) {
            pending.push(span);
        }
    }

    async fn resolve_placeholder(&self, conversation_id: &str, counter: u64) {
        self.placeholders
            .lock()
            .await
            .remove(&(conversation_id.to_string(), counter));
    }

    /// Run one b-route pull over a span. Placeholders in the span either
    /// resolve into real messages or, on terminal failure, flip to failed.
    /// Transient failures (including 423 LOCKED) requeue the span.
    pub async fn run_backfill(
        &self,
        span: &BackfillSpan,
    ) -> Result<Vec<TimelineRecord>, EngineError> {
        let mut collected: Vec<RelayMessage> = Vec::new();
        let mut cursor_ts: Option<i64> = None;
        loop {
            let page = match self
                .relay
                .pull_messages(&span.conversation_id, PULL_PAGE_LIMIT, cursor_ts)
                .await
            {
                Ok(page) => page,
                Err(e) if e.is_transient() => {
                    tracing::warn!(
                        target: "quiet_channel",
                        event = "backfill_transient",
                        conversation_id = %span.conversation_id,
                        status = e.status()
                    );
                    self.schedule_backfill(&span.conversation_id, span.from_counter, span.to_counter)
                        .await;
                    return Ok(vec![]);
                }
                Err(e) => {
                    return Ok(self.fail_placeholders(span, e).await);
                }
            };
            let done = page.next_cursor_ts.is_none();
            collected.extend(
                page.items
                    .into_iter()
                    .filter(|m| m.counter >= span.from_counter && m.counter <= span.to_counter),
            );
            if done {
                break;
            }
            cursor_ts = page.next_cursor_ts;
        }

        let mut records = self.ingest_batch(collected).await?;

        // Whatever the relay no longer holds is gone for good.
        let mut placeholders = self.placeholders.lock().await;
        for counter in span.from_counter..=span.to_counter {
            let key = (span.conversation_id.clone(), counter);
            if placeholders.remove(&key).is_some() {
                records.push(TimelineRecord::PlaceholderFailed {
                    conversation_id: span.conversation_id.clone(),
                    counter,
                    reason: ReasonCode::PlaceholderFailed,
                });
            }
        }
        Ok(records)
    }

    async fn fail_placeholders(
        &self,
        span: &BackfillSpan,
        error: TransportError,
    ) -> Vec<TimelineRecord> {
        tracing::error!(
            target: "quiet_channel",
            reason = ReasonCode::PlaceholderFailed.as_str(),
            conversation_id = %span.conversation_id,
            error = %error
        );
        let mut placeholders = self.placeholders.lock().await;
        let mut records = Vec::new();
        for counter in span.from_counter..=span.to_counter {
            if placeholders.remove(&(span.conversation_id.clone(), counter)).is_some() {
                records.push(TimelineRecord::PlaceholderFailed {
                    conversation_id: span.conversation_id.clone(),
                    counter,
                    reason: ReasonCode::PlaceholderFailed,
                });
            }
        }
        records
    }

    /// Catch-up pull used at login: one page from the newest cursor.
    pub async fn catch_up(&self, conversation_id: &str) -> Result<Vec<TimelineRecord>, EngineError> {
        let page = match self.relay.pull_messages(conversation_id, PULL_PAGE_LIMIT, None).await {
            Ok(page) => page,
            Err(e) if e.is_transient() => {
                tracing::warn!(
                    target: "quiet_channel",
                    event = "catch_up_transient",
                    conversation_id,
                    status = e.status()
                );
                return Ok(vec![]);
            }
            Err(e) => return Err(e.into()),
        };
        self.ingest_batch(page.items).await
    }

    // ── Control traffic ──────────────────────────────────────────────────

    async fn consume_control(
        &self,
        conversation: &ConversationRow,
        control: ControlMessage,
    ) -> Result<(), EngineError> {
        match control {
            ControlMessage::Receipt { message_id, receipt_type } => {
                tracing::debug!(
                    target: "quiet_channel",
                    event = "receipt_received",
                    message_id = %message_id,
                    receipt_type = ?receipt_type
                );
            }
            ControlMessage::ConversationDeleted { conversation_id, deletion_cursor, tombstone } => {
                if let Some(cursor) = deletion_cursor {
                    self.store
                        .raise_deletion_cursor(&conversation_id, cursor as i64, true)
                        .await?;
                }
                if tombstone {
                    self.store.set_conversation_tombstoned(&conversation_id).await?;
                }
                tracing::info!(
                    target: "quiet_channel",
                    event = "peer_deleted_conversation",
                    conversation_id = %conversation_id,
                    cursor = ?deletion_cursor,
                    tombstone
                );
            }
            ControlMessage::ProfileUpdate { .. } => {
                tracing::debug!(
                    target: "quiet_channel",
                    event = "profile_update",
                    peer = %conversation.peer_account_digest
                );
            }
            ControlMessage::ContactRemoved => {
                let peer_key = Endpoint::new(
                    &conversation.peer_account_digest,
                    &conversation.peer_device_id,
                )
                .peer_key();
                self.sessions
                    .clear_dr_state(&self.store, &self.account_digest, &peer_key)
                    .await?;
                self.store.set_conversation_tombstoned(&conversation.conversation_id).await?;
            }
        }
        Ok(())
    }

    // ── Receipts ─────────────────────────────────────────────────────────

    /// Send a receipt straight through the ratchet path. Best-effort:
    /// idempotent on `(message_id, type)`, failures are logged and dropped.
    pub async fn send_receipt(
        &self,
        conversation_id: &str,
        target_message_id: &str,
        receipt_type: ReceiptType,
    ) {
        {
            let mut sent = self.receipts_sent.lock().await;
            if !sent.insert((target_message_id.to_string(), receipt_type)) {
                return;
            }
        }
        if let Err(e) = self
            .try_send_receipt(conversation_id, target_message_id, receipt_type)
            .await
        {
            tracing::debug!(
                target: "quiet_channel",
                event = "receipt_send_failed",
                conversation_id,
                error = %e
            );
        }
    }

    async fn try_send_receipt(
        &self,
        conversation_id: &str,
        target_message_id: &str,
        receipt_type: ReceiptType,
    ) -> Result<(), EngineError> {
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
        let body = MessageBody::Control(ControlMessage::Receipt {
            message_id: target_message_id.to_string(),
            receipt_type,
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
            sender_device_id: self.local_device_id.clone(),
            body,
        };

        let sealed = self
            .sessions
            .encrypt_for(
                &peer_key,
                &serde_json::to_vec(&payload)?,
                &EncryptContext {
                    device_id: self.local_device_id.clone(),
                    v: 1,
                    conversation_id: Some(conversation_id.to_string()),
                },
            )
            .await?;

        let request = SendMessageRequest {
            conversation_id: conversation_id.to_string(),
            conversation_token: conversation.conversation_token.clone(),
            message_id,
            counter: sealed.counter,
            sender_device_id: self.local_device_id.clone(),
            receiver_account_digest: conversation.peer_account_digest.clone(),
            receiver_device_id: conversation.peer_device_id.clone(),
            packet: sealed.packet,
        };
        self.relay.send_message(&request).await?;
        Ok(())
    }
}
