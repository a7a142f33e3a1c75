//! X3DH asynchronous key agreement.
//!
//! The initiator fetches the peer's published bundle:
//!   IK_B  (identity, Ed25519 public → converted to X25519)
//!   SPK_B (signed prekey, X25519) + IK_B signature over SPK_B
//!   OPKs  (one-time prekeys, X25519, each with an opaque id)
//!
//! One ephemeral keypair EK_A is generated, then:
//!   DH1 = DH(IK_A, SPK_B)
//!   DH2 = DH(EK_A, IK_B)
//!   DH3 = DH(EK_A, SPK_B)
//!   DH4 = DH(EK_A, OPK_B)   [when the bundle carries one]
//!
//!   SK = HKDF(salt=0, ikm = 0xFF*32 || DH1 || DH2 || DH3 [|| DH4], info="qc-x3dh/v1")
//!
//! The SPK signature MUST verify before any DH is computed. The responder
//! consumes the named OPK secret; an id it no longer holds is a hard error,
//! never a silent downgrade.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

use crate::{
    error::CryptoError,
    identity::{ed25519_pub_to_x25519, ed25519_secret_to_x25519, IdentityKeyPair},
    kdf,
};

const X3DH_INFO: &[u8] = b"qc-x3dh/v1";

fn b64d(s: &str) -> Result<Vec<u8>, CryptoError> {
    URL_SAFE_NO_PAD.decode(s).map_err(CryptoError::Base64Decode)
}

fn to_32(bytes: &[u8]) -> Result<[u8; 32], CryptoError> {
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("expected 32-byte key".into()))
}

// ── Published material ───────────────────────────────────────────────────────

/// A single one-time prekey as published: opaque id + X25519 public (base64).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneTimePrekey {
    pub id: String,
    #[serde(rename = "pub")]
    pub public: String,
}

/// Published by each endpoint, consumed by session initiators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyBundle {
    /// Ed25519 identity public key (base64)
    pub ik_pub: String,
    /// X25519 signed prekey (base64)
    pub spk_pub: String,
    /// Ed25519 signature over the raw SPK bytes (base64)
    pub spk_sig: String,
    /// One-time prekeys; the initiator consumes at most one.
    #[serde(default)]
    pub opks: Vec<OneTimePrekey>,
}

/// Generate a signed prekey: an X25519 keypair with the public half signed by
/// the identity key.
pub fn generate_signed_prekey(identity: &IdentityKeyPair) -> (StaticSecret, X25519Public, Vec<u8>) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = X25519Public::from(&secret);
    let sig = identity.sign(public.as_bytes());
    (secret, public, sig)
}

/// Generate a batch of one-time prekeys. Returns (id, secret, public) triples;
/// the secrets stay with the owner, keyed by id.
pub fn generate_one_time_prekeys(count: usize) -> Vec<(String, StaticSecret, X25519Public)> {
    (0..count)
        .map(|_| {
            let s = StaticSecret::random_from_rng(OsRng);
            let p = X25519Public::from(&s);
            (uuid::Uuid::new_v4().to_string(), s, p)
        })
        .collect()
}

// ── Handshake header ─────────────────────────────────────────────────────────

/// Sent alongside the first packet so the responder can derive SK.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeHeader {
    /// Initiator's Ed25519 identity public key (base64)
    pub ik_pub: String,
    /// Initiator's ephemeral X25519 public key (base64)
    pub ek_pub: String,
    /// Which OPK was consumed (`None` when the bundle had none left)
    pub opk_id: Option<String>,
}

/// Result of the initiator side: the shared secret, the handshake header to
/// ship, and the peer SPK the Double Ratchet seeds its first send step with.
#[derive(Debug)]
pub struct InitiateOutcome {
    /// 32-byte shared key → initial Double Ratchet root key
    pub shared_key: [u8; 32],
    pub header: HandshakeHeader,
    pub peer_spk_pub: X25519Public,
}

// ── Initiator ────────────────────────────────────────────────────────────────

pub fn initiate(my_ik: &IdentityKeyPair, bundle: &KeyBundle) -> Result<InitiateOutcome, CryptoError> {
    // SPK signature first; nothing else runs on an unverified bundle.
    let ik_b_ed = to_32(&b64d(&bundle.ik_pub)?)?;
    let spk_b_raw = to_32(&b64d(&bundle.spk_pub)?)?;
    let spk_sig = b64d(&bundle.spk_sig)?;
    IdentityKeyPair::verify(&ik_b_ed, &spk_b_raw, &spk_sig)
        .map_err(|_| CryptoError::X3dhBadSignature)?;

    let ik_a_x = ed25519_secret_to_x25519(my_ik.secret_bytes());
    let ik_b_x = ed25519_pub_to_x25519(&ik_b_ed)?;
    let spk_b = X25519Public::from(spk_b_raw);

    let ek_a = StaticSecret::random_from_rng(OsRng);
    let ek_a_pub = X25519Public::from(&ek_a);

    let dh1 = ik_a_x.diffie_hellman(&spk_b);
    let dh2 = ek_a.diffie_hellman(&ik_b_x);
    let dh3 = ek_a.diffie_hellman(&spk_b);

    let mut ikm = vec![0xFFu8; 32]; // domain separation pad
    ikm.extend_from_slice(dh1.as_bytes());
    ikm.extend_from_slice(dh2.as_bytes());
    ikm.extend_from_slice(dh3.as_bytes());

    let mut opk_id = None;
    if let Some(opk) = bundle.opks.first() {
        let opk_b = X25519Public::from(to_32(&b64d(&opk.public)?)?);
        let dh4 = ek_a.diffie_hellman(&opk_b);
        ikm.extend_from_slice(dh4.as_bytes());
        opk_id = Some(opk.id.clone());
    }

    let mut sk = [0u8; 32];
    kdf::hkdf_expand(&ikm, Some(&[0u8; 32]), X3DH_INFO, &mut sk)?;
    ikm.zeroize();

    Ok(InitiateOutcome {
        shared_key: sk,
        header: HandshakeHeader {
            ik_pub: my_ik.public_b64(),
            ek_pub: URL_SAFE_NO_PAD.encode(ek_a_pub.as_bytes()),
            opk_id,
        },
        peer_spk_pub: spk_b,
    })
}

// ── Responder ────────────────────────────────────────────────────────────────

/// Resolves the OPK secret a handshake names. Ordinarily backed by the
/// responder's prekey store; consumption must remove the secret.
pub trait OpkSecrets {
    fn take(&mut self, opk_id: &str) -> Option<StaticSecret>;
}

impl OpkSecrets for std::collections::HashMap<String, StaticSecret> {
    fn take(&mut self, opk_id: &str) -> Option<StaticSecret> {
        self.remove(opk_id)
    }
}

/// The responder recomputes SK from the handshake header.
///
/// `sender_ik_ed_pub` comes from the responder's contact record for the
/// sender (or a directory lookup) — the header's claimed key alone is not
/// trusted for authentication.
pub fn respond(
    my_ik: &IdentityKeyPair,
    my_spk_secret: &StaticSecret,
    opk_secrets: &mut dyn OpkSecrets,
    sender_ik_ed_pub: &[u8; 32],
    header: &HandshakeHeader,
) -> Result<[u8; 32], CryptoError> {
    let ek_a = X25519Public::from(to_32(&b64d(&header.ek_pub)?)?);
    let sender_ik_x = ed25519_pub_to_x25519(sender_ik_ed_pub)?;
    let ik_b_x = ed25519_secret_to_x25519(my_ik.secret_bytes());

    // Mirror the initiator's DH order exactly (commutativity per pair):
    //   DH1 = IK_A × SPK_B, DH2 = EK_A × IK_B, DH3 = EK_A × SPK_B
    let dh1 = my_spk_secret.diffie_hellman(&sender_ik_x);
    let dh2 = ik_b_x.diffie_hellman(&ek_a);
    let dh3 = my_spk_secret.diffie_hellman(&ek_a);

    let mut ikm = vec![0xFFu8; 32];
    ikm.extend_from_slice(dh1.as_bytes());
    ikm.extend_from_slice(dh2.as_bytes());
    ikm.extend_from_slice(dh3.as_bytes());

    if let Some(ref opk_id) = header.opk_id {
        let opk_secret = opk_secrets
            .take(opk_id)
            .ok_or_else(|| CryptoError::X3dhOpkMissing(opk_id.clone()))?;
        let dh4 = opk_secret.diffie_hellman(&ek_a);
        ikm.extend_from_slice(dh4.as_bytes());
    }

    let mut sk = [0u8; 32];
    kdf::hkdf_expand(&ikm, Some(&[0u8; 32]), X3DH_INFO, &mut sk)?;
    ikm.zeroize();

    Ok(sk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn publish(ik: &IdentityKeyPair, opk_count: usize) -> (KeyBundle, StaticSecret, HashMap<String, StaticSecret>) {
        let (spk_secret, spk_pub, spk_sig) = generate_signed_prekey(ik);
        let mut opk_secrets = HashMap::new();
        let mut opks = Vec::new();
        for (id, secret, public) in generate_one_time_prekeys(opk_count) {
            opks.push(OneTimePrekey {
                id: id.clone(),
                public: URL_SAFE_NO_PAD.encode(public.as_bytes()),
            });
            opk_secrets.insert(id, secret);
        }
        let bundle = KeyBundle {
            ik_pub: ik.public_b64(),
            spk_pub: URL_SAFE_NO_PAD.encode(spk_pub.as_bytes()),
            spk_sig: URL_SAFE_NO_PAD.encode(&spk_sig),
            opks,
        };
        (bundle, spk_secret, opk_secrets)
    }

    #[test]
    fn roundtrip_with_opk() {
        let alice_ik = IdentityKeyPair::generate();
        let bob_ik = IdentityKeyPair::generate();
        let (bundle, bob_spk, mut bob_opks) = publish(&bob_ik, 3);

        let outcome = initiate(&alice_ik, &bundle).unwrap();
        assert!(outcome.header.opk_id.is_some());

        let alice_ik_ed: [u8; 32] = alice_ik.public.0.clone().try_into().unwrap();
        let sk_bob = respond(&bob_ik, &bob_spk, &mut bob_opks, &alice_ik_ed, &outcome.header).unwrap();
        assert_eq!(outcome.shared_key, sk_bob);
        // Consumed: the same id cannot be used twice.
        assert_eq!(bob_opks.len(), 2);
    }

    #[test]
    fn roundtrip_without_opk() {
        let alice_ik = IdentityKeyPair::generate();
        let bob_ik = IdentityKeyPair::generate();
        let (bundle, bob_spk, mut bob_opks) = publish(&bob_ik, 0);

        let outcome = initiate(&alice_ik, &bundle).unwrap();
        assert!(outcome.header.opk_id.is_none());

        let alice_ik_ed: [u8; 32] = alice_ik.public.0.clone().try_into().unwrap();
        let sk_bob = respond(&bob_ik, &bob_spk, &mut bob_opks, &alice_ik_ed, &outcome.header).unwrap();
        assert_eq!(outcome.shared_key, sk_bob);
    }

    #[test]
    fn rejects_spk_signed_by_wrong_identity() {
        let alice_ik = IdentityKeyPair::generate();
        let bob_ik = IdentityKeyPair::generate();
        let evil_ik = IdentityKeyPair::generate();

        let (_, spk_pub, _) = generate_signed_prekey(&bob_ik);
        let evil_sig = evil_ik.sign(spk_pub.as_bytes());
        let bundle = KeyBundle {
            ik_pub: bob_ik.public_b64(),
            spk_pub: URL_SAFE_NO_PAD.encode(spk_pub.as_bytes()),
            spk_sig: URL_SAFE_NO_PAD.encode(&evil_sig),
            opks: vec![],
        };

        let err = initiate(&alice_ik, &bundle).unwrap_err();
        assert!(matches!(err, CryptoError::X3dhBadSignature));
    }

    #[test]
    fn respond_fails_on_unknown_opk_id() {
        let alice_ik = IdentityKeyPair::generate();
        let bob_ik = IdentityKeyPair::generate();
        let (bundle, bob_spk, _) = publish(&bob_ik, 1);

        let outcome = initiate(&alice_ik, &bundle).unwrap();
        let alice_ik_ed: [u8; 32] = alice_ik.public.0.clone().try_into().unwrap();

        // Responder lost its OPK secrets (e.g. restored an older store).
        let mut empty: HashMap<String, StaticSecret> = HashMap::new();
        let err =
            respond(&bob_ik, &bob_spk, &mut empty, &alice_ik_ed, &outcome.header).unwrap_err();
        assert!(matches!(err, CryptoError::X3dhOpkMissing(_)));
    }
}
