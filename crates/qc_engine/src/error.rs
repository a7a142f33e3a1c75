use thiserror::Error;

use crate::transport::TransportError;

/// Closed reason vocabulary. Every logged failure and every dead-letter
/// carries one of these, so tests and dashboards can match on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReasonCode {
    OutboxWaitLowerCounter,
    OutboxNotDue,
    OutboxMissingCounter,
    CounterTooLowReplaced,
    OutboxTransientRetry,
    OutboxRetryExhausted,
    TransportPermanent,
    ReceiptBypassesOutbox,
    ReplayDetected,
    PnGapExceedsLimit,
    SkipLimitExceeded,
    DecryptRefetch,
    GapDetected,
    PlaceholderFailed,
    ChecksumMismatch,
    LegacyPlaintextSnapshot,
    HydrationGateClosed,
    WrongTargetDevice,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::OutboxWaitLowerCounter => "OUTBOX_WAIT_LOWER_COUNTER",
            ReasonCode::OutboxNotDue => "OUTBOX_NOT_DUE",
            ReasonCode::OutboxMissingCounter => "OUTBOX_MISSING_COUNTER",
            ReasonCode::CounterTooLowReplaced => "COUNTER_TOO_LOW_REPLACED",
            ReasonCode::OutboxTransientRetry => "OUTBOX_TRANSIENT_RETRY",
            ReasonCode::OutboxRetryExhausted => "OUTBOX_RETRY_EXHAUSTED",
            ReasonCode::TransportPermanent => "TRANSPORT_PERMANENT",
            ReasonCode::ReceiptBypassesOutbox => "RECEIPT_BYPASSES_OUTBOX",
            ReasonCode::ReplayDetected => "REPLAY_DETECTED",
            ReasonCode::PnGapExceedsLimit => "PN_GAP_EXCEEDS_LIMIT",
            ReasonCode::SkipLimitExceeded => "SKIP_LIMIT_EXCEEDED",
            ReasonCode::DecryptRefetch => "DECRYPT_REFETCH",
            ReasonCode::GapDetected => "GAP_DETECTED",
            ReasonCode::PlaceholderFailed => "PLACEHOLDER_FAILED",
            ReasonCode::ChecksumMismatch => "CHECKSUM_MISMATCH",
            ReasonCode::LegacyPlaintextSnapshot => "LEGACY_PLAINTEXT_SNAPSHOT",
            ReasonCode::HydrationGateClosed => "HYDRATION_GATE_CLOSED",
            ReasonCode::WrongTargetDevice => "WRONG_TARGET_DEVICE",
        }
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] qc_crypto::CryptoError),

    #[error("Store error: {0}")]
    Store(#[from] qc_store::StoreError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Receipts bypass the outbox; send them through the ratchet path directly")]
    ReceiptNotQueueable,

    #[error("Job {job_id} requires a counter and none could be derived")]
    MissingCounter { job_id: String },

    #[error("No session for peer {peer_key}")]
    SessionMissing { peer_key: String },

    #[error("Conversation {conversation_id} unknown")]
    ConversationMissing { conversation_id: String },

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}
