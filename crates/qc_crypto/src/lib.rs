//! qc_crypto — Quiet Channel cryptographic core
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - Failures are errors, never nulls: a primitive that cannot complete
//!   returns a `CryptoError` variant and leaves its inputs untouched.
//!
//! # Module layout
//! - `identity` — long-term Ed25519 identity keys + prekey generation
//! - `x3dh`     — asynchronous key agreement (SPK verification, OPK consumption)
//! - `ratchet`  — Double Ratchet sessions: header encryption of counters,
//!                skipped-message-key cache, replay guard
//! - `aead`     — AES-256-GCM helpers + sealed envelopes with info tags
//! - `kdf`      — HKDF-SHA256 root/chain derivation, Argon2id master-key wrap
//! - `hash`     — BLAKE3 utilities (deterministic message ids)
//! - `error`    — unified error type

pub mod aead;
pub mod error;
pub mod hash;
pub mod identity;
pub mod kdf;
pub mod ratchet;
pub mod x3dh;

pub use error::CryptoError;
