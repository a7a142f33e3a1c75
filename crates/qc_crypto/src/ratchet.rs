//! Double Ratchet session engine.
//!
//! References:
//!   - Signal Double Ratchet spec: <https://signal.org/docs/specifications/doubleratchet/>
//!
//! State separation (non-negotiable):
//!   rk   — root key (advanced on every DH ratchet step)
//!   ckS  — sending chain key (advanced per message; empty at epoch boundary)
//!   ckR  — receiving chain key (advanced per message)
//!   mk   — message key (derived from a chain key, used once, then deleted)
//!
//! Counters:
//!   Ns / Nr reset to 0 on every ratchet step; PN records the previous send
//!   chain's length; NsTotal is strictly monotonic across all epochs and is
//!   what the outbox orders sends by.
//!
//! Decrypt never mutates live state on failure: the algorithm runs against a
//! staged copy that is committed only after the AEAD opens.

use std::collections::HashMap;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use crate::{aead, error::CryptoError, kdf};

/// Maximum number of skipped message keys cached per receive chain. A header
/// implying a larger jump is rejected before any key derivation.
pub const SKIPPED_KEYS_PER_CHAIN_MAX: u64 = 100;

/// Bound on the replay-guard recency set.
pub const PROCESSED_IDS_MAX: usize = 512;

// ── Wire packet ──────────────────────────────────────────────────────────────

/// Plaintext packet header. `ek_pub_b64` is the sender's current ratchet
/// public key; consecutive sends in one direction share it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketHeader {
    pub dr: u8,
    pub v: u8,
    pub device_id: String,
    pub ek_pub_b64: String,
    pub pn: u64,
    pub n: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

/// On-wire record: header in the clear, body sealed under the message key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Packet {
    pub header: PacketHeader,
    pub iv_b64: String,
    pub ciphertext_b64: String,
}

/// Per-call encryption context. `device_id` is mandatory — it is bound into
/// the AAD and its absence is a programmer error, not a soft default.
#[derive(Debug, Clone)]
pub struct EncryptContext {
    pub device_id: String,
    pub v: u8,
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DecryptContext {
    pub conversation_id: Option<String>,
}

/// Canonical AAD: JSON with sorted keys over `{v, device_id, conversation_id?}`.
/// serde_json's default map is a BTreeMap, so the encoding is stable.
fn canonical_aad(
    v: u8,
    device_id: &str,
    conversation_id: Option<&str>,
) -> Result<Vec<u8>, CryptoError> {
    if device_id.trim().is_empty() {
        return Err(CryptoError::AadUnavailable(
            "AAD requires a device_id; refusing to encrypt without one".into(),
        ));
    }
    let mut map = serde_json::Map::new();
    if let Some(cid) = conversation_id {
        map.insert("conversation_id".into(), serde_json::Value::from(cid));
    }
    map.insert("device_id".into(), serde_json::Value::from(device_id));
    map.insert("v".into(), serde_json::Value::from(v));
    Ok(serde_json::to_vec(&serde_json::Value::Object(map))?)
}

// ── Session state ────────────────────────────────────────────────────────────

/// Complete Double Ratchet state for one peer endpoint.
/// Stored only inside sealed snapshots (`outbox-dr/v1` envelopes).
#[derive(Clone, Serialize, Deserialize)]
pub struct DrState {
    /// Normalised `accountDigest::deviceId` of the peer.
    pub peer_key: String,

    rk: [u8; 32],
    ck_s: Option<[u8; 32]>,
    ck_r: Option<[u8; 32]>,

    my_ratchet_secret: [u8; 32],
    #[serde(with = "pub_key_serde")]
    my_ratchet_pub: X25519Public,
    #[serde(with = "option_pub_key_serde")]
    peer_ratchet_pub: Option<X25519Public>,

    /// Message counter within the current send chain.
    pub ns: u64,
    /// Next expected counter within the current receive chain.
    pub nr: u64,
    /// Length of the previous send chain at the last ratchet step.
    pub pn: u64,
    /// Strictly monotonic total of outgoing messages across all epochs.
    pub ns_total: u64,

    /// (peer ratchet pub b64, counter) → message key. Consumed on use,
    /// bounded per chain.
    #[serde(with = "skipped_serde")]
    skipped: HashMap<(String, u64), [u8; 32]>,

    /// Recently consumed (ek_pub b64, counter) pairs — the replay guard.
    /// Snapshots carry it as a bounded recency set.
    processed: Vec<(String, u64)>,
}

impl Drop for DrState {
    fn drop(&mut self) {
        self.rk.zeroize();
        if let Some(ref mut ck) = self.ck_s {
            ck.zeroize();
        }
        if let Some(ref mut ck) = self.ck_r {
            ck.zeroize();
        }
        self.my_ratchet_secret.zeroize();
        for (_, mk) in self.skipped.iter_mut() {
            mk.zeroize();
        }
    }
}

impl DrState {
    /// Initiator state after X3DH: the send chain is primed by an immediate
    /// DH ratchet against the peer's signed prekey; the receive chain waits
    /// for the peer's first reply.
    pub fn new_initiator(
        peer_key: String,
        shared_key: [u8; 32],
        peer_spk_pub: &X25519Public,
    ) -> Result<Self, CryptoError> {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        let dh = secret.diffie_hellman(peer_spk_pub);
        let (rk, ck_s) = kdf::advance_root(&shared_key, dh.as_bytes())?;

        Ok(Self {
            peer_key,
            rk,
            ck_s: Some(ck_s),
            ck_r: None,
            my_ratchet_secret: secret.to_bytes(),
            my_ratchet_pub: public,
            peer_ratchet_pub: Some(*peer_spk_pub),
            ns: 0,
            nr: 0,
            pn: 0,
            ns_total: 0,
            skipped: HashMap::new(),
            processed: Vec::new(),
        })
    }

    /// Responder state after X3DH: the signed prekey acts as the first local
    /// ratchet key; both chains stay empty until the initiator's first packet
    /// triggers a ratchet step.
    pub fn new_responder(
        peer_key: String,
        shared_key: [u8; 32],
        my_spk_secret: &StaticSecret,
    ) -> Self {
        let public = X25519Public::from(my_spk_secret);
        Self {
            peer_key,
            rk: shared_key,
            ck_s: None,
            ck_r: None,
            my_ratchet_secret: my_spk_secret.to_bytes(),
            my_ratchet_pub: public,
            peer_ratchet_pub: None,
            ns: 0,
            nr: 0,
            pn: 0,
            ns_total: 0,
            skipped: HashMap::new(),
            processed: Vec::new(),
        }
    }

    pub fn ratchet_pub(&self) -> X25519Public {
        self.my_ratchet_pub
    }

    pub fn skipped_len(&self) -> usize {
        self.skipped.len()
    }

    // ── Encrypt ──────────────────────────────────────────────────────────

    pub fn encrypt(&mut self, plaintext: &[u8], ctx: &EncryptContext) -> Result<Packet, CryptoError> {
        let aad = canonical_aad(ctx.v, &ctx.device_id, ctx.conversation_id.as_deref())?;

        // Post-ratchet receive-only state: derive a fresh root + send chain.
        if self.ck_s.is_none() {
            let peer = self.peer_ratchet_pub.ok_or_else(|| {
                CryptoError::KeyUnavailable("no peer ratchet key to derive a send chain".into())
            })?;
            let secret = StaticSecret::random_from_rng(OsRng);
            let public = X25519Public::from(&secret);
            let dh = secret.diffie_hellman(&peer);
            let (rk, ck_s) = kdf::advance_root(&self.rk, dh.as_bytes())?;
            self.rk = rk;
            self.ck_s = Some(ck_s);
            self.my_ratchet_secret = secret.to_bytes();
            self.my_ratchet_pub = public;
            self.pn = self.ns;
            self.ns = 0;
        }

        let ck = self.ck_s.expect("send chain primed above");
        let (next_ck, mut mk) = kdf::chain_step(&ck)?;
        let n = self.ns;
        self.ck_s = Some(next_ck);
        self.ns += 1;
        self.ns_total += 1;

        let header = PacketHeader {
            dr: 1,
            v: ctx.v,
            device_id: ctx.device_id.clone(),
            ek_pub_b64: URL_SAFE_NO_PAD.encode(self.my_ratchet_pub.as_bytes()),
            pn: self.pn,
            n,
            meta: None,
        };

        let iv = aead::random_iv();
        let ct = aead::seal(&mk, &iv, plaintext, &aad)?;
        mk.zeroize();

        Ok(Packet {
            header,
            iv_b64: URL_SAFE_NO_PAD.encode(iv),
            ciphertext_b64: URL_SAFE_NO_PAD.encode(&ct),
        })
    }

    // ── Decrypt ──────────────────────────────────────────────────────────

    /// Decrypt a packet. Handles, in order: replay rejection, epoch change
    /// (pn-gap guard, old-chain skip caching, DH ratchet), skipped-key
    /// lookup, in-chain skip caching, AEAD open, and only then the state
    /// commit. A failure at any point leaves `self` untouched.
    pub fn decrypt(
        &mut self,
        packet: &Packet,
        ctx: &DecryptContext,
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let header = &packet.header;
        let ek_bytes: [u8; 32] = URL_SAFE_NO_PAD
            .decode(&header.ek_pub_b64)?
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("ratchet pub must be 32 bytes".into()))?;
        let ek = X25519Public::from(ek_bytes);
        let replay_key = (header.ek_pub_b64.clone(), header.n);

        if self.processed.contains(&replay_key) {
            return Err(CryptoError::ReplayDetected {
                ek_pub: header.ek_pub_b64.clone(),
                n: header.n,
            });
        }

        let aad = canonical_aad(header.v, &header.device_id, ctx.conversation_id.as_deref())?;
        let iv: [u8; aead::IV_LEN] = URL_SAFE_NO_PAD
            .decode(&packet.iv_b64)?
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("IV must be 12 bytes".into()))?;
        let ct = URL_SAFE_NO_PAD.decode(&packet.ciphertext_b64)?;

        let mut staged = self.clone();
        let mut mk = staged.derive_receive_key(&ek, header)?;
        let plaintext = aead::open(&mk, &iv, &ct, &aad)?;
        mk.zeroize();

        staged.processed.push(replay_key);
        if staged.processed.len() > PROCESSED_IDS_MAX {
            let excess = staged.processed.len() - PROCESSED_IDS_MAX;
            staged.processed.drain(..excess);
        }
        *self = staged;
        Ok(plaintext)
    }

    /// Ratchet bookkeeping for one received header; returns the message key.
    /// Runs on the staged copy only.
    fn derive_receive_key(
        &mut self,
        ek: &X25519Public,
        header: &PacketHeader,
    ) -> Result<[u8; 32], CryptoError> {
        let ek_b64 = URL_SAFE_NO_PAD.encode(ek.as_bytes());
        let new_epoch = match self.peer_ratchet_pub {
            Some(ref current) => current.as_bytes() != ek.as_bytes(),
            None => true,
        };

        if new_epoch {
            // Reject oversized pn gaps before any key derivation.
            let gap = header.pn.saturating_sub(self.nr);
            if gap > SKIPPED_KEYS_PER_CHAIN_MAX {
                return Err(CryptoError::PnGapExceedsLimit {
                    gap,
                    limit: SKIPPED_KEYS_PER_CHAIN_MAX,
                });
            }

            // Cache the remainder of the old receive chain.
            if self.peer_ratchet_pub.is_some() && self.ck_r.is_some() {
                self.cache_skipped_keys(header.pn)?;
            }

            // Receive-side ratchet.
            let dh_recv =
                StaticSecret::from(self.my_ratchet_secret).diffie_hellman(ek);
            let (rk, ck_r) = kdf::advance_root(&self.rk, dh_recv.as_bytes())?;
            self.rk = rk;
            self.ck_r = Some(ck_r);
            self.nr = 0;
            self.peer_ratchet_pub = Some(*ek);

            // Send-side ratchet: fresh keypair, fresh send chain.
            self.pn = self.ns;
            self.ns = 0;
            let secret = StaticSecret::random_from_rng(OsRng);
            let public = X25519Public::from(&secret);
            let dh_send = secret.diffie_hellman(ek);
            let (rk2, ck_s) = kdf::advance_root(&self.rk, dh_send.as_bytes())?;
            self.rk = rk2;
            self.ck_s = Some(ck_s);
            self.my_ratchet_secret = secret.to_bytes();
            self.my_ratchet_pub = public;
        }

        if header.n < self.nr {
            // Out-of-order within a chain already advanced past: the key is
            // either cached or gone.
            return self
                .skipped
                .remove(&(ek_b64, header.n))
                .ok_or(CryptoError::MessageKeyUnavailable { n: header.n });
        }

        // Cache intermediate keys up to header.n, then derive its key.
        self.cache_skipped_keys(header.n)?;
        let ck = self
            .ck_r
            .ok_or_else(|| CryptoError::KeyUnavailable("receive chain not established".into()))?;
        let (next_ck, mk) = kdf::chain_step(&ck)?;
        self.ck_r = Some(next_ck);
        self.nr = header.n + 1;
        Ok(mk)
    }

    /// Cache message keys for counters `nr..until` of the current receive
    /// chain, enforcing the per-chain cap.
    fn cache_skipped_keys(&mut self, until: u64) -> Result<(), CryptoError> {
        if until <= self.nr {
            return Ok(());
        }
        let chain_id = self
            .peer_ratchet_pub
            .map(|k| URL_SAFE_NO_PAD.encode(k.as_bytes()))
            .unwrap_or_default();
        let existing = self.skipped.keys().filter(|(ek, _)| *ek == chain_id).count() as u64;
        if existing + (until - self.nr) > SKIPPED_KEYS_PER_CHAIN_MAX {
            return Err(CryptoError::SkipLimitExceeded {
                limit: SKIPPED_KEYS_PER_CHAIN_MAX,
            });
        }

        let mut ck = self
            .ck_r
            .ok_or_else(|| CryptoError::KeyUnavailable("receive chain not established".into()))?;
        while self.nr < until {
            let (next_ck, mk) = kdf::chain_step(&ck)?;
            ck = next_ck;
            self.skipped.insert((chain_id.clone(), self.nr), mk);
            self.nr += 1;
        }
        self.ck_r = Some(ck);
        Ok(())
    }
}

// ── Serde helpers ────────────────────────────────────────────────────────────

mod pub_key_serde {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};
    use x25519_dalek::PublicKey as X25519Public;

    pub fn serialize<S: Serializer>(key: &X25519Public, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&URL_SAFE_NO_PAD.encode(key.as_bytes()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<X25519Public, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = URL_SAFE_NO_PAD.decode(&s).map_err(serde::de::Error::custom)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))?;
        Ok(X25519Public::from(arr))
    }
}

mod option_pub_key_serde {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};
    use x25519_dalek::PublicKey as X25519Public;

    pub fn serialize<S: Serializer>(
        key: &Option<X25519Public>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match key {
            Some(k) => serializer.serialize_some(&URL_SAFE_NO_PAD.encode(k.as_bytes())),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<X25519Public>, D::Error> {
        let opt: Option<String> = Option::deserialize(deserializer)?;
        opt.map(|s| {
            let bytes = URL_SAFE_NO_PAD.decode(&s).map_err(serde::de::Error::custom)?;
            let arr: [u8; 32] = bytes
                .try_into()
                .map_err(|_| serde::de::Error::custom("expected 32 bytes"))?;
            Ok(X25519Public::from(arr))
        })
        .transpose()
    }
}

/// JSON maps need string keys; the skipped-key cache serialises as a list of
/// `(chain, counter, key)` entries.
mod skipped_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::HashMap;

    pub fn serialize<S: Serializer>(
        map: &HashMap<(String, u64), [u8; 32]>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let entries: Vec<(&String, u64, &[u8; 32])> =
            map.iter().map(|((ek, n), mk)| (ek, *n, mk)).collect();
        entries.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<HashMap<(String, u64), [u8; 32]>, D::Error> {
        let entries: Vec<(String, u64, [u8; 32])> = Vec::deserialize(deserializer)?;
        Ok(entries.into_iter().map(|(ek, n, mk)| ((ek, n), mk)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x3dh;
    use crate::identity::IdentityKeyPair;

    fn ctx(device: &str) -> EncryptContext {
        EncryptContext {
            device_id: device.into(),
            v: 1,
            conversation_id: Some("conv-1".into()),
        }
    }

    fn dctx() -> DecryptContext {
        DecryptContext { conversation_id: Some("conv-1".into()) }
    }

    /// Bootstrap a pair of sessions through a real X3DH handshake.
    fn bootstrap() -> (DrState, DrState) {
        let alice_ik = IdentityKeyPair::generate();
        let bob_ik = IdentityKeyPair::generate();
        let (bob_spk_secret, bob_spk_pub, bob_spk_sig) = x3dh::generate_signed_prekey(&bob_ik);
        let bundle = x3dh::KeyBundle {
            ik_pub: bob_ik.public_b64(),
            spk_pub: URL_SAFE_NO_PAD.encode(bob_spk_pub.as_bytes()),
            spk_sig: URL_SAFE_NO_PAD.encode(&bob_spk_sig),
            opks: vec![],
        };
        let outcome = x3dh::initiate(&alice_ik, &bundle).unwrap();
        let alice_ik_ed: [u8; 32] = alice_ik.public.0.clone().try_into().unwrap();
        let mut no_opks: std::collections::HashMap<String, StaticSecret> = Default::default();
        let sk_bob = x3dh::respond(&bob_ik, &bob_spk_secret, &mut no_opks, &alice_ik_ed, &outcome.header)
            .unwrap();

        let alice = DrState::new_initiator("BOB::dev-b".into(), outcome.shared_key, &bob_spk_pub)
            .unwrap();
        let bob = DrState::new_responder("ALICE::dev-a".into(), sk_bob, &bob_spk_secret);
        (alice, bob)
    }

    #[test]
    fn ping_pong_twenty_messages() {
        let (mut alice, mut bob) = bootstrap();
        for i in 0..10 {
            let pkt = alice.encrypt(format!("a-{i}").as_bytes(), &ctx("dev-a")).unwrap();
            let pt = bob.decrypt(&pkt, &dctx()).unwrap();
            assert_eq!(&pt[..], format!("a-{i}").as_bytes());

            let pkt = bob.encrypt(format!("b-{i}").as_bytes(), &ctx("dev-b")).unwrap();
            let pt = alice.decrypt(&pkt, &dctx()).unwrap();
            assert_eq!(&pt[..], format!("b-{i}").as_bytes());
        }
        assert_eq!(alice.ns_total, 10);
        assert_eq!(bob.ns_total, 10);
        assert_eq!(alice.skipped_len(), 0);
        assert_eq!(bob.skipped_len(), 0);
    }

    #[test]
    fn burst_exchange_rotates_ratchet_keys() {
        let (mut alice, mut bob) = bootstrap();
        let mut alice_eks = std::collections::HashSet::new();
        let mut bob_eks = std::collections::HashSet::new();

        for round in 0..3 {
            for i in 0..3 {
                let pkt = alice
                    .encrypt(format!("a-{round}-{i}").as_bytes(), &ctx("dev-a"))
                    .unwrap();
                alice_eks.insert(pkt.header.ek_pub_b64.clone());
                bob.decrypt(&pkt, &dctx()).unwrap();
            }
            for i in 0..2 {
                let pkt = bob
                    .encrypt(format!("b-{round}-{i}").as_bytes(), &ctx("dev-b"))
                    .unwrap();
                bob_eks.insert(pkt.header.ek_pub_b64.clone());
                alice.decrypt(&pkt, &dctx()).unwrap();
            }
        }
        assert!(alice_eks.len() >= 3, "alice used {} distinct ratchet keys", alice_eks.len());
        assert!(bob_eks.len() >= 3, "bob used {} distinct ratchet keys", bob_eks.len());
    }

    #[test]
    fn out_of_order_within_chain_uses_skip_cache() {
        let (mut alice, mut bob) = bootstrap();
        let p0 = alice.encrypt(b"m0", &ctx("dev-a")).unwrap();
        let p1 = alice.encrypt(b"m1", &ctx("dev-a")).unwrap();
        let p2 = alice.encrypt(b"m2", &ctx("dev-a")).unwrap();

        assert_eq!(&bob.decrypt(&p2, &dctx()).unwrap()[..], b"m2");
        assert_eq!(bob.skipped_len(), 2);
        assert_eq!(bob.nr, 3, "nr advances to max(nr, n+1)");
        assert_eq!(&bob.decrypt(&p0, &dctx()).unwrap()[..], b"m0");
        assert_eq!(&bob.decrypt(&p1, &dctx()).unwrap()[..], b"m1");
        assert_eq!(bob.skipped_len(), 0, "skipped keys are consumed on use");
    }

    #[test]
    fn replay_is_detected_without_state_change() {
        let (mut alice, mut bob) = bootstrap();
        let pkt = alice.encrypt(b"original", &ctx("dev-a")).unwrap();
        assert_eq!(&bob.decrypt(&pkt, &dctx()).unwrap()[..], b"original");

        let nr_before = bob.nr;
        let err = bob.decrypt(&pkt, &dctx()).unwrap_err();
        assert!(matches!(err, CryptoError::ReplayDetected { .. }));
        assert_eq!(bob.nr, nr_before, "replay must not advance counters");
    }

    #[test]
    fn pn_gap_is_rejected_before_any_derivation() {
        let (mut alice, mut bob) = bootstrap();
        let pkt = alice.encrypt(b"warmup", &ctx("dev-a")).unwrap();
        bob.decrypt(&pkt, &dctx()).unwrap();

        let crafted = Packet {
            header: PacketHeader {
                dr: 1,
                v: 1,
                device_id: "dev-a".into(),
                ek_pub_b64: URL_SAFE_NO_PAD.encode([0xAB; 32]),
                pn: 9999,
                n: 1,
                meta: None,
            },
            iv_b64: URL_SAFE_NO_PAD.encode([0u8; 12]),
            ciphertext_b64: URL_SAFE_NO_PAD.encode([0u8; 32]),
        };
        let nr_before = bob.nr;
        let err = bob.decrypt(&crafted, &dctx()).unwrap_err();
        let msg = err.to_string();
        assert!(
            msg.contains("pn gap") || msg.contains("exceeds limit"),
            "unexpected error: {msg}"
        );
        assert_eq!(bob.nr, nr_before);
    }

    #[test]
    fn encrypt_without_device_id_fails_with_aad_error() {
        let (mut alice, _) = bootstrap();
        let err = alice
            .encrypt(
                b"x",
                &EncryptContext { device_id: "".into(), v: 1, conversation_id: None },
            )
            .unwrap_err();
        assert!(err.to_string().contains("AAD"), "error must mention AAD: {err}");
        assert_eq!(alice.ns_total, 0, "no packet may be emitted");
    }

    #[test]
    fn first_message_of_new_chain_carries_previous_chain_length() {
        let (mut alice, mut bob) = bootstrap();
        // Alice sends 3 in her first chain.
        for i in 0..3 {
            let pkt = alice.encrypt(format!("a{i}").as_bytes(), &ctx("dev-a")).unwrap();
            bob.decrypt(&pkt, &dctx()).unwrap();
        }
        // Direction flip, then Alice's next chain must announce pn = 3.
        let pkt = bob.encrypt(b"b0", &ctx("dev-b")).unwrap();
        alice.decrypt(&pkt, &dctx()).unwrap();
        let pkt = alice.encrypt(b"a-next", &ctx("dev-a")).unwrap();
        assert_eq!(pkt.header.pn, 3);
        assert_eq!(pkt.header.n, 0);
        bob.decrypt(&pkt, &dctx()).unwrap();
    }

    #[test]
    fn direction_flip_with_empty_previous_chain_reports_pn_zero() {
        let (mut alice, mut bob) = bootstrap();
        let pkt = alice.encrypt(b"a0", &ctx("dev-a")).unwrap();
        bob.decrypt(&pkt, &dctx()).unwrap();
        // Bob's very first send chain follows zero sends.
        let pkt = bob.encrypt(b"b0", &ctx("dev-b")).unwrap();
        assert_eq!(pkt.header.pn, 0);
        alice.decrypt(&pkt, &dctx()).unwrap();
    }

    #[test]
    fn ratchet_key_differs_after_direction_flip() {
        let (mut alice, mut bob) = bootstrap();
        let first = alice.encrypt(b"a0", &ctx("dev-a")).unwrap();
        bob.decrypt(&first, &dctx()).unwrap();
        let reply = bob.encrypt(b"b0", &ctx("dev-b")).unwrap();
        alice.decrypt(&reply, &dctx()).unwrap();
        let second = alice.encrypt(b"a1", &ctx("dev-a")).unwrap();
        assert_ne!(first.header.ek_pub_b64, second.header.ek_pub_b64);
        bob.decrypt(&second, &dctx()).unwrap();
    }

    #[test]
    fn tampered_ciphertext_leaves_state_unchanged() {
        let (mut alice, mut bob) = bootstrap();
        let mut pkt = alice.encrypt(b"payload", &ctx("dev-a")).unwrap();
        let mut ct = URL_SAFE_NO_PAD.decode(&pkt.ciphertext_b64).unwrap();
        ct[0] ^= 0xFF;
        pkt.ciphertext_b64 = URL_SAFE_NO_PAD.encode(&ct);

        let nr_before = bob.nr;
        let skipped_before = bob.skipped_len();
        assert!(bob.decrypt(&pkt, &dctx()).is_err());
        assert_eq!(bob.nr, nr_before);
        assert_eq!(bob.skipped_len(), skipped_before);
    }

    #[test]
    fn snapshot_roundtrip_decrypts_next_packet() {
        let (mut alice, mut bob) = bootstrap();
        for i in 0..3 {
            let pkt = alice.encrypt(format!("a{i}").as_bytes(), &ctx("dev-a")).unwrap();
            bob.decrypt(&pkt, &dctx()).unwrap();
        }

        let snapshot = serde_json::to_vec(&bob).unwrap();
        let mut restored: DrState = serde_json::from_slice(&snapshot).unwrap();

        let pkt = alice.encrypt(b"after-restore", &ctx("dev-a")).unwrap();
        let pt = restored.decrypt(&pkt, &dctx()).unwrap();
        assert_eq!(&pt[..], b"after-restore");
    }

    #[test]
    fn consumed_key_outside_replay_window_is_unavailable() {
        let (mut alice, mut bob) = bootstrap();
        let p0 = alice.encrypt(b"m0", &ctx("dev-a")).unwrap();
        bob.decrypt(&p0, &dctx()).unwrap();

        // Push message 0 out of the bounded replay window.
        for i in 1..(PROCESSED_IDS_MAX as u64 + 8) {
            let pkt = alice.encrypt(format!("m{i}").as_bytes(), &ctx("dev-a")).unwrap();
            bob.decrypt(&pkt, &dctx()).unwrap();
        }

        let err = bob.decrypt(&p0, &dctx()).unwrap_err();
        assert!(matches!(err, CryptoError::MessageKeyUnavailable { n: 0 }));
    }

    #[test]
    fn skip_limit_is_enforced_within_a_chain() {
        let (mut alice, mut bob) = bootstrap();
        // Advance alice far beyond the cap without delivering.
        let mut last = None;
        for i in 0..(SKIPPED_KEYS_PER_CHAIN_MAX + 2) {
            last = Some(alice.encrypt(format!("m{i}").as_bytes(), &ctx("dev-a")).unwrap());
        }
        let err = bob.decrypt(&last.unwrap(), &dctx()).unwrap_err();
        assert!(matches!(err, CryptoError::SkipLimitExceeded { .. }));
        assert_eq!(bob.skipped_len(), 0, "failed decrypt must not cache keys");
    }
}
