//! Plaintext message types — what lives inside the ratchet envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Deserialised plaintext carried inside a packet's ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    /// Payload format version (currently 1).
    pub v: u8,
    /// Deterministic message id (BLAKE3 of content + addressing).
    pub message_id: String,
    pub sent_at: DateTime<Utc>,
    /// Sender's device id — cross-checked against the packet header.
    pub sender_device_id: String,
    pub body: MessageBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessageBody {
    Text {
        body: String,
    },
    /// Reference to a media object uploaded out of band; the manifest key is
    /// sealed under the conversation's shared material.
    Media {
        manifest_ref: String,
        mime_type: String,
        size_bytes: u64,
    },
    /// Control traffic: consumed by the reconciler before UI fan-out.
    Control(ControlMessage),
}

/// The closed control-message vocabulary. Anything unrecognised fails
/// deserialisation rather than passing through as text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "subtype", rename_all = "kebab-case")]
pub enum ControlMessage {
    /// Best-effort delivery/read receipt; idempotent on
    /// `(message_id, receipt_type)`. Never routed through the outbox.
    Receipt {
        message_id: String,
        receipt_type: ReceiptType,
    },
    /// The peer deleted the conversation up to `deletion_cursor` on their
    /// side (or entirely, when `tombstone` is set).
    ConversationDeleted {
        conversation_id: String,
        deletion_cursor: Option<u64>,
        #[serde(default)]
        tombstone: bool,
    },
    ProfileUpdate {
        display_name: Option<String>,
        avatar_ref: Option<String>,
    },
    ContactRemoved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptType {
    Delivered,
    Read,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    #[default]
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}
