//! Authenticated encryption and sealed envelopes.
//!
//! Two layers:
//!
//! 1. Raw AES-256-GCM with a 96-bit IV and caller-supplied AAD — used by the
//!    Double Ratchet for per-message sealing.
//! 2. `SealedEnvelope` — a self-describing JSON record for at-rest material
//!    (session snapshots, settings, media keys). The AEAD key is derived per
//!    seal through HKDF(key, salt, info_tag), so an envelope only decrypts
//!    under the info tag it was written with, and unseal refuses tags outside
//!    the caller's allow-list before touching any key material.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, Zeroizing};

use crate::{error::CryptoError, kdf};

pub const IV_LEN: usize = 12;

/// The closed info-tag vocabulary. Anything else is rejected at unseal.
pub const INFO_TAG_OUTBOX_DR: &str = "outbox-dr/v1";
pub const INFO_TAG_SETTINGS: &str = "settings/v1";
pub const INFO_TAG_MEDIA: &str = "media/v1";
pub const INFO_TAG_MEDIA_CHUNK: &str = "media/chunk-v1";
pub const INFO_TAG_MEDIA_MANIFEST: &str = "media/manifest-v1";

pub const KNOWN_INFO_TAGS: &[&str] = &[
    INFO_TAG_OUTBOX_DR,
    INFO_TAG_SETTINGS,
    INFO_TAG_MEDIA,
    INFO_TAG_MEDIA_CHUNK,
    INFO_TAG_MEDIA_MANIFEST,
];

pub fn random_iv() -> [u8; IV_LEN] {
    use rand::RngCore;
    let mut iv = [0u8; IV_LEN];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    iv
}

// ── Raw AEAD ─────────────────────────────────────────────────────────────────

/// Encrypt `plaintext` under a 32-byte key with the given IV and AAD.
/// Returns ciphertext || tag.
pub fn seal(
    key: &[u8; 32],
    iv: &[u8; IV_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| CryptoError::CryptoOpFailed(e.to_string()))?;
    cipher
        .encrypt(Nonce::from_slice(iv), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::CryptoOpFailed("AEAD seal failed".into()))
}

/// Decrypt ciphertext || tag. Tag mismatch (tampering, wrong key, wrong AAD)
/// is a `CryptoOpFailed` — the caller must not retry with mutated state.
pub fn open(
    key: &[u8; 32],
    iv: &[u8; IV_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| CryptoError::CryptoOpFailed(e.to_string()))?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(iv), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::CryptoOpFailed("AEAD open failed (tag mismatch)".into()))?;
    Ok(Zeroizing::new(plaintext))
}

// ── Sealed envelope ──────────────────────────────────────────────────────────

/// Which key the envelope was sealed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    /// Derived from the master key; used for everything private at rest.
    Mk,
    /// Caller-supplied shared key (e.g. a media chunk key).
    Shared,
}

/// Self-describing sealed record. Serialised as JSON and stored/shipped as an
/// opaque string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedEnvelope {
    pub v: u8,
    pub aead: String,
    pub iv_b64: String,
    pub hkdf_salt_b64: String,
    pub info_tag: String,
    pub ct_b64: String,
    pub key_type: KeyType,
}

const ENVELOPE_AEAD: &str = "aes-256-gcm";

/// Seal `plaintext` under `key` (the master key for `KeyType::Mk`, a shared
/// key otherwise) with a fresh random HKDF salt, domain-separated by
/// `info_tag`.
pub fn seal_envelope(
    key: &[u8; 32],
    plaintext: &[u8],
    info_tag: &str,
    key_type: KeyType,
) -> Result<SealedEnvelope, CryptoError> {
    let mut salt = [0u8; 32];
    {
        use rand::RngCore;
        rand::rngs::OsRng.fill_bytes(&mut salt);
    }
    let mut derived = [0u8; 32];
    kdf::hkdf_expand(key, Some(&salt), info_tag.as_bytes(), &mut derived)?;

    let iv = random_iv();
    let ct = seal(&derived, &iv, plaintext, info_tag.as_bytes())?;
    derived.zeroize();

    Ok(SealedEnvelope {
        v: 1,
        aead: ENVELOPE_AEAD.into(),
        iv_b64: URL_SAFE_NO_PAD.encode(iv),
        hkdf_salt_b64: URL_SAFE_NO_PAD.encode(salt),
        info_tag: info_tag.into(),
        ct_b64: URL_SAFE_NO_PAD.encode(&ct),
        key_type,
    })
}

/// Unseal an envelope. `allowed_tags` is the caller's allow-list; an envelope
/// whose tag is outside it fails with `EnvelopeInfoTagMismatch` before any
/// key derivation runs.
pub fn unseal_envelope(
    key: &[u8; 32],
    envelope: &SealedEnvelope,
    allowed_tags: &[&str],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if !allowed_tags.contains(&envelope.info_tag.as_str()) {
        return Err(CryptoError::EnvelopeInfoTagMismatch {
            found: envelope.info_tag.clone(),
            allowed: allowed_tags.iter().map(|s| s.to_string()).collect(),
        });
    }
    if envelope.aead != ENVELOPE_AEAD {
        return Err(CryptoError::CryptoOpFailed(format!(
            "unsupported envelope aead {}",
            envelope.aead
        )));
    }

    let salt = URL_SAFE_NO_PAD.decode(&envelope.hkdf_salt_b64)?;
    let iv_bytes = URL_SAFE_NO_PAD.decode(&envelope.iv_b64)?;
    let iv: [u8; IV_LEN] = iv_bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("envelope IV must be 12 bytes".into()))?;
    let ct = URL_SAFE_NO_PAD.decode(&envelope.ct_b64)?;

    let mut derived = [0u8; 32];
    kdf::hkdf_expand(key, Some(&salt), envelope.info_tag.as_bytes(), &mut derived)?;
    let out = open(&derived, &iv, &ct, envelope.info_tag.as_bytes());
    derived.zeroize();
    out
}

/// Convenience: serialise the envelope to the opaque string form used in
/// storage slots and job payloads.
pub fn envelope_to_string(envelope: &SealedEnvelope) -> Result<String, CryptoError> {
    Ok(serde_json::to_string(envelope)?)
}

pub fn envelope_from_string(s: &str) -> Result<SealedEnvelope, CryptoError> {
    Ok(serde_json::from_str(s)?)
}
