//! BLAKE3 hash utilities — deterministic message ids.

/// Derive a deterministic message id from content and addressing.
/// Hex-encoded 32 bytes; stable across retries of the same logical send.
pub fn message_id(
    sender_digest: &str,
    receiver_digest: &str,
    plaintext: &[u8],
    ts_nanos: i64,
) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"qc-msg-id/v1\x00");
    hasher.update(sender_digest.as_bytes());
    hasher.update(b"\x00");
    hasher.update(receiver_digest.as_bytes());
    hasher.update(b"\x00");
    hasher.update(&ts_nanos.to_le_bytes());
    hasher.update(b"\x00");
    hasher.update(plaintext);
    hex::encode(hasher.finalize().as_bytes())
}
