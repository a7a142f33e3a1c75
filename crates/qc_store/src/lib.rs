//! qc_store — encrypted local persistence for Quiet Channel
//!
//! # Encryption strategy
//! SQLite does not natively encrypt. Sensitive values (DR session snapshots,
//! settings) are stored as sealed-envelope strings: AES-256-GCM under a key
//! HKDF-derived from the master key, domain-separated by info tag. Scheduling
//! metadata (job states, counters, timestamps) stays plaintext so the outbox
//! can query it efficiently.
//!
//! The master key itself is random, stored only as an Argon2id password-wrap
//! record, and held unwrapped in the in-memory [`vault::Vault`] while the
//! app is unlocked.

pub mod db;
pub mod error;
pub mod migrations;
pub mod models;
pub mod outbox_store;
pub mod snapshots;
pub mod vault;

pub use db::Store;
pub use error::StoreError;
pub use vault::Vault;
