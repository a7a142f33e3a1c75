//! Key derivation functions
//!
//! `wrap_master_key` / `unwrap_master_key` / `rewrap_master_key` — the
//!   password wrap of the random 32-byte master key (mk). The KEK comes from
//!   `master_key_from_password` (Argon2id over a domain-separated salt).
//!
//! `advance_root` / `chain_step` — HKDF-SHA256 ratchet steps with the
//!   protocol's fixed info strings (`dr-root/v1`, `dr-chain/v1`).

use argon2::{Argon2, Params, Version};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

/// HKDF info string for the root-key advance on a DH ratchet step.
pub const INFO_DR_ROOT: &[u8] = b"dr-root/v1";
/// HKDF info string for the symmetric chain step.
pub const INFO_DR_CHAIN: &[u8] = b"dr-chain/v1";

/// Version tag stored next to the Argon2id salt so a future parameter bump
/// can re-wrap lazily on login.
pub const MASTER_KEY_WRAP_VERSION: u32 = 1;

// ── Master key (Argon2id) ─────────────────────────────────────────────────────

/// A 32-byte key, zeroized on drop. Either the random master key itself or
/// the password-derived KEK that wraps it.
#[derive(ZeroizeOnDrop)]
pub struct MasterKey(pub [u8; 32]);

/// Argon2id parameters — tuned for interactive (desktop) use.
fn argon2_params() -> Params {
    Params::new(
        64 * 1024, // m_cost: 64 MiB
        3,         // t_cost: 3 iterations
        1,         // p_cost: 1 thread
        Some(32),  // output len
    )
    .expect("static Argon2 params are always valid")
}

/// Derive a 32-byte key-encryption key from a user password + 16-byte salt.
///
/// The salt is domain-separated before hashing so the same password cannot
/// produce a related key in another context. The salt itself is stored
/// alongside the wrapped material (not secret).
pub fn master_key_from_password(
    password: &[u8],
    salt: &[u8; 16],
) -> Result<MasterKey, CryptoError> {
    let mut domain_salt = [0u8; 32];
    domain_salt[..16].copy_from_slice(b"qc-mk-wrap/v1\x00\x00\x00");
    domain_salt[16..].copy_from_slice(salt);

    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, argon2_params());
    let mut output = [0u8; 32];
    argon2
        .hash_password_into(password, &domain_salt, &mut output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(MasterKey(output))
}

/// Generate a fresh random 16-byte salt. Called on account creation and again
/// on every password change so the re-wrap never reuses a salt.
pub fn generate_salt() -> [u8; 16] {
    use rand::RngCore;
    let mut salt = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

// ── Password wrap ─────────────────────────────────────────────────────────────

/// The master key at rest: a random 32-byte key sealed under a KEK derived
/// from the user password. Password change re-wraps with a fresh salt; the
/// version tag lets a future parameter bump re-wrap lazily.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WrappedMasterKey {
    pub wrap_version: u32,
    pub salt_hex: String,
    pub iv_b64: String,
    pub ct_b64: String,
}

const WRAP_AAD: &[u8] = b"qc-mk-wrap/v1";

/// Generate a fresh random master key.
pub fn generate_master_key() -> MasterKey {
    use rand::RngCore;
    let mut key = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key);
    MasterKey(key)
}

/// Wrap the master key under a password-derived KEK with a fresh salt.
pub fn wrap_master_key(password: &[u8], mk: &MasterKey) -> Result<WrappedMasterKey, CryptoError> {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    let salt = generate_salt();
    let kek = master_key_from_password(password, &salt)?;
    let iv = crate::aead::random_iv();
    let ct = crate::aead::seal(&kek.0, &iv, &mk.0, WRAP_AAD)?;
    Ok(WrappedMasterKey {
        wrap_version: MASTER_KEY_WRAP_VERSION,
        salt_hex: hex::encode(salt),
        iv_b64: URL_SAFE_NO_PAD.encode(iv),
        ct_b64: URL_SAFE_NO_PAD.encode(&ct),
    })
}

/// Unwrap with the user password. A wrong password surfaces as a generic
/// crypto failure (tag mismatch), indistinguishable from tampering.
pub fn unwrap_master_key(
    password: &[u8],
    wrapped: &WrappedMasterKey,
) -> Result<MasterKey, CryptoError> {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    let salt: [u8; 16] = hex::decode(&wrapped.salt_hex)?
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("wrap salt must be 16 bytes".into()))?;
    let kek = master_key_from_password(password, &salt)?;
    let iv: [u8; 12] = URL_SAFE_NO_PAD
        .decode(&wrapped.iv_b64)?
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("wrap IV must be 12 bytes".into()))?;
    let ct = URL_SAFE_NO_PAD.decode(&wrapped.ct_b64)?;
    let plain = crate::aead::open(&kek.0, &iv, &ct, WRAP_AAD)?;
    let key: [u8; 32] = plain
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("unwrapped master key wrong length".into()))?;
    Ok(MasterKey(key))
}

/// Password change: same master key, fresh salt and ciphertext.
pub fn rewrap_master_key(
    old_password: &[u8],
    new_password: &[u8],
    wrapped: &WrappedMasterKey,
) -> Result<WrappedMasterKey, CryptoError> {
    let mk = unwrap_master_key(old_password, wrapped)?;
    wrap_master_key(new_password, &mk)
}

// ── HKDF-SHA256 ───────────────────────────────────────────────────────────────

/// Expand `ikm` + `info` into `output.len()` bytes of key material.
pub fn hkdf_expand(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    output: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

/// Root-key advance: `(rk', ck') = HKDF(rk, DH, info = "dr-root/v1")`.
///
/// Returns (new_root_key, new_chain_key). Called once per ratchet direction
/// (receive side with DH(myPriv, theirNewPub), then send side with the fresh
/// local keypair).
pub fn advance_root(
    rk: &[u8; 32],
    dh_output: &[u8],
) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(rk), dh_output);
    let mut new_rk = [0u8; 32];
    let mut ck = [0u8; 32];
    let mut info_rk = INFO_DR_ROOT.to_vec();
    info_rk.extend_from_slice(b"\x00rk");
    let mut info_ck = INFO_DR_ROOT.to_vec();
    info_ck.extend_from_slice(b"\x00ck");
    hk.expand(&info_rk, &mut new_rk)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    hk.expand(&info_ck, &mut ck)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok((new_rk, ck))
}

/// Chain step: `(ck', mk) = HKDF(ck, "", info = "dr-chain/v1")`.
///
/// HMAC-based per the Signal spec: distinct single-byte constants separate
/// the next chain key from the message key.
pub fn chain_step(ck: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    use hmac::{Hmac, Mac};
    type HmacSha256 = Hmac<Sha256>;

    let mut mac_ck = HmacSha256::new_from_slice(ck)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    mac_ck.update(INFO_DR_CHAIN);
    mac_ck.update(&[0x01]);
    let new_ck: [u8; 32] = mac_ck.finalize().into_bytes().into();

    let mut mac_mk = HmacSha256::new_from_slice(ck)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    mac_mk.update(INFO_DR_CHAIN);
    mac_mk.update(&[0x02]);
    let mk: [u8; 32] = mac_mk.finalize().into_bytes().into();

    Ok((new_ck, mk))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_step_is_deterministic_and_separating() {
        let ck = [7u8; 32];
        let (ck1a, mk1a) = chain_step(&ck).unwrap();
        let (ck1b, mk1b) = chain_step(&ck).unwrap();
        assert_eq!(ck1a, ck1b);
        assert_eq!(mk1a, mk1b);
        assert_ne!(ck1a, mk1a, "chain key and message key must differ");
    }

    #[test]
    fn root_advance_changes_both_outputs() {
        let rk = [1u8; 32];
        let (rk1, ck1) = advance_root(&rk, &[2u8; 32]).unwrap();
        let (rk2, ck2) = advance_root(&rk, &[3u8; 32]).unwrap();
        assert_ne!(rk1, rk2);
        assert_ne!(ck1, ck2);
        assert_ne!(rk1, ck1);
    }

    #[test]
    fn master_key_depends_on_salt() {
        let s1 = [0u8; 16];
        let mut s2 = [0u8; 16];
        s2[0] = 1;
        let k1 = master_key_from_password(b"hunter2", &s1).unwrap();
        let k2 = master_key_from_password(b"hunter2", &s2).unwrap();
        assert_ne!(k1.0, k2.0);
    }

    #[test]
    fn wrap_unwrap_roundtrip_and_wrong_password_fails() {
        let mk = generate_master_key();
        let wrapped = wrap_master_key(b"correct horse", &mk).unwrap();
        assert_eq!(wrapped.wrap_version, MASTER_KEY_WRAP_VERSION);

        let back = unwrap_master_key(b"correct horse", &wrapped).unwrap();
        assert_eq!(back.0, mk.0);
        assert!(unwrap_master_key(b"wrong", &wrapped).is_err());
    }

    #[test]
    fn rewrap_changes_salt_but_preserves_key() {
        let mk = generate_master_key();
        let wrapped = wrap_master_key(b"old", &mk).unwrap();
        let rewrapped = rewrap_master_key(b"old", b"new", &wrapped).unwrap();
        assert_ne!(wrapped.salt_hex, rewrapped.salt_hex, "re-wrap must use a fresh salt");
        assert!(unwrap_master_key(b"old", &rewrapped).is_err());
        assert_eq!(unwrap_master_key(b"new", &rewrapped).unwrap().0, mk.0);
    }
}
