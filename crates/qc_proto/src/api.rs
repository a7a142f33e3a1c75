//! Relay API request/response types. These map directly to JSON bodies on
//! the wire; the relay never sees inside the ratchet ciphertext.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use qc_crypto::ratchet::Packet;

// ── WS token ─────────────────────────────────────────────────────────────────

/// `POST /api/v1/ws/token`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsTokenRequest {
    pub account_token: String,
    pub account_digest: String,
    pub session_ts: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsTokenGrant {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

// ── Send ─────────────────────────────────────────────────────────────────────

/// `POST /api/v1/messages`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub conversation_id: String,
    pub conversation_token: String,
    pub message_id: String,
    /// Sender-device-monotonic counter (the session's NsTotal at encrypt).
    pub counter: u64,
    pub sender_device_id: String,
    pub receiver_account_digest: String,
    pub receiver_device_id: String,
    pub packet: Packet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendAccepted {
    pub accepted: bool,
    pub id: String,
}

/// 409 body for a counter the relay has already moved past.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterTooLowBody {
    pub error: String,
    /// Highest counter the relay has accepted from this device (inclusive).
    #[serde(rename = "maxCounter")]
    pub max_counter: u64,
}

/// `POST /api/v1/messages/atomic` — a send with vault/backup companions that
/// must land together or not at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtomicSendRequest {
    #[serde(flatten)]
    pub message: SendMessageRequest,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vault: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<String>,
}

// ── Pull (b-route) ───────────────────────────────────────────────────────────

/// One stored item returned by `GET /api/v1/messages`. Pages are ordered by
/// `(ts asc, id asc)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayMessage {
    /// Server-assigned id, distinct from the end-to-end message id.
    pub id: String,
    pub conversation_id: String,
    /// End-to-end message id, echoed from the send request.
    pub message_id: String,
    pub ts: i64,
    pub counter: u64,
    pub sender_device_id: String,
    pub packet: Packet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePage {
    pub items: Vec<RelayMessage>,
    pub next_cursor_ts: Option<i64>,
}

// ── Deletion cursor ──────────────────────────────────────────────────────────

/// `POST /api/v1/conversations/:id/deletion-cursor` — monotone; the server
/// rejects regressions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletionCursorUpdate {
    pub cursor: u64,
}

// ── WS inbound frames ────────────────────────────────────────────────────────

/// Frames pushed over the transport. Every frame carries a `target_device_id`
/// and is dropped unless it matches the local device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WsFrame {
    Auth { target_device_id: String },
    Pong { target_device_id: String },
    Presence { target_device_id: String, peers: Vec<String> },
    PresenceUpdate { target_device_id: String, peer: String, online: bool },
    SecureMessage { target_device_id: String, message: RelayMessage },
    MessageNew { target_device_id: String, message: RelayMessage },
    VaultAck { target_device_id: String, id: String },
    InviteDelivered { target_device_id: String, invite_id: String },
    ContactsReload { target_device_id: String },
    ContactRemoved { target_device_id: String, account_digest: String },
    ForceLogout { target_device_id: String, reason: String },
    Hello { target_device_id: String },
}

impl WsFrame {
    pub fn target_device_id(&self) -> &str {
        match self {
            WsFrame::Auth { target_device_id }
            | WsFrame::Pong { target_device_id }
            | WsFrame::Presence { target_device_id, .. }
            | WsFrame::PresenceUpdate { target_device_id, .. }
            | WsFrame::SecureMessage { target_device_id, .. }
            | WsFrame::MessageNew { target_device_id, .. }
            | WsFrame::VaultAck { target_device_id, .. }
            | WsFrame::InviteDelivered { target_device_id, .. }
            | WsFrame::ContactsReload { target_device_id }
            | WsFrame::ContactRemoved { target_device_id, .. }
            | WsFrame::ForceLogout { target_device_id, .. }
            | WsFrame::Hello { target_device_id } => target_device_id,
        }
    }

    /// Both push frame spellings carry a stored relay message.
    pub fn into_relay_message(self) -> Option<RelayMessage> {
        match self {
            WsFrame::SecureMessage { message, .. } | WsFrame::MessageNew { message, .. } => {
                Some(message)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_too_low_body_uses_wire_field_name() {
        let body: CounterTooLowBody =
            serde_json::from_str(r#"{"error":"CounterTooLow","maxCounter":10}"#).unwrap();
        assert_eq!(body.max_counter, 10);
    }

    #[test]
    fn ws_frames_use_kebab_case_tags() {
        let json = r#"{"type":"force-logout","target_device_id":"dev-1","reason":"revoked"}"#;
        let frame: WsFrame = serde_json::from_str(json).unwrap();
        assert!(matches!(frame, WsFrame::ForceLogout { .. }));
        assert_eq!(frame.target_device_id(), "dev-1");
    }

    #[test]
    fn both_push_spellings_yield_a_message() {
        let msg = RelayMessage {
            id: "srv-1".into(),
            conversation_id: "c1".into(),
            message_id: "m1".into(),
            ts: 1,
            counter: 1,
            sender_device_id: "dev-2".into(),
            packet: Packet {
                header: qc_crypto::ratchet::PacketHeader {
                    dr: 1,
                    v: 1,
                    device_id: "dev-2".into(),
                    ek_pub_b64: "AA".into(),
                    pn: 0,
                    n: 0,
                    meta: None,
                },
                iv_b64: "AA".into(),
                ciphertext_b64: "AA".into(),
            },
        };
        let a = WsFrame::SecureMessage { target_device_id: "d".into(), message: msg.clone() };
        let b = WsFrame::MessageNew { target_device_id: "d".into(), message: msg };
        assert!(a.into_relay_message().is_some());
        assert!(b.into_relay_message().is_some());
    }
}
