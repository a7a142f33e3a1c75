//! Database row models and the outbox vocabulary stored in them.

use serde::{Deserialize, Serialize};

/// What an outbox job carries. `Message` and `MediaMeta` require a counter;
/// `MediaUpload` is ordered FIFO by creation time. Receipts never enter the
/// outbox at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    Message,
    Receipt,
    MediaUpload,
    MediaMeta,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Message => "message",
            JobKind::Receipt => "receipt",
            JobKind::MediaUpload => "media-upload",
            JobKind::MediaMeta => "media-meta",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "message" => Some(JobKind::Message),
            "receipt" => Some(JobKind::Receipt),
            "media-upload" => Some(JobKind::MediaUpload),
            "media-meta" => Some(JobKind::MediaMeta),
            _ => None,
        }
    }

    /// Whether the relay orders this kind by the sender-device counter.
    pub fn requires_counter(&self) -> bool {
        matches!(self, JobKind::Message | JobKind::MediaMeta)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    Queued,
    Inflight,
    Sent,
    DeadLetter,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Inflight => "inflight",
            JobState::Sent => "sent",
            JobState::DeadLetter => "dead-letter",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobState::Queued),
            "inflight" => Some(JobState::Inflight),
            "sent" => Some(JobState::Sent),
            "dead-letter" => Some(JobState::DeadLetter),
            _ => None,
        }
    }
}

/// Canonical job id: `kind ":" conversationId ":" messageId`.
pub fn job_id(kind: JobKind, conversation_id: &str, message_id: &str) -> String {
    format!("{}:{}:{}", kind.as_str(), conversation_id, message_id)
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OutboxJobRow {
    pub job_id: String,
    pub conversation_id: String,
    pub message_id: String,
    pub kind: String,
    pub state: String,
    pub counter: Option<i64>,
    pub retry_count: i64,
    pub next_attempt_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
    /// Serialized variant body; any embedded DR snapshot is a sealed
    /// `outbox-dr/v1` envelope string inside it.
    pub payload: String,
    pub last_error: Option<String>,
    pub last_error_code: Option<String>,
    pub last_status: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ConversationRow {
    pub conversation_id: String,
    pub conversation_token: String,
    pub peer_account_digest: String,
    pub peer_device_id: String,
    pub deletion_cursor: Option<i64>,
    pub peer_deletion_cursor: Option<i64>,
    pub tombstoned: bool,
}

impl ConversationRow {
    pub fn into_thread(self) -> qc_proto::ConversationThread {
        qc_proto::ConversationThread {
            conversation_id: self.conversation_id,
            conversation_token: self.conversation_token,
            peer_account_digest: self.peer_account_digest,
            peer_device_id: self.peer_device_id,
            deletion_cursor: self.deletion_cursor.map(|c| c as u64),
            peer_deletion_cursor: self.peer_deletion_cursor.map(|c| c as u64),
            tombstoned: self.tombstoned,
        }
    }
}
