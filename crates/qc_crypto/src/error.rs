use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Crypto operation failed: {0}")]
    CryptoOpFailed(String),

    #[error("Sealed envelope info tag {found:?} not in allow-list {allowed:?}")]
    EnvelopeInfoTagMismatch { found: String, allowed: Vec<String> },

    #[error("Key unavailable: {0}")]
    KeyUnavailable(String),

    #[error("AAD unavailable: {0}")]
    AadUnavailable(String),

    #[error("Signature verification failed")]
    SignatureVerification,

    #[error("X3DH signed-prekey signature did not verify")]
    X3dhBadSignature,

    #[error("X3DH one-time prekey {0} is no longer held")]
    X3dhOpkMissing(String),

    #[error("pn gap of {gap} exceeds limit {limit}")]
    PnGapExceedsLimit { gap: u64, limit: u64 },

    #[error("skipped-key cache for chain would exceed limit {limit}")]
    SkipLimitExceeded { limit: u64 },

    #[error("message key unavailable for counter {n} (tampered or too-old message)")]
    MessageKeyUnavailable { n: u64 },

    #[error("replay detected for ({ek_pub}, {n})")]
    ReplayDetected { ek_pub: String, n: u64 },

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}
