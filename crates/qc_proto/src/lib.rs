//! qc_proto — wire types and relay API shapes for Quiet Channel
//!
//! All on-wire types serialise to JSON and are versioned. The relay is a dumb
//! ordered queue: it sees addressing, counters and opaque ciphertext, nothing
//! else.
//!
//! # Modules
//! - `endpoint` — `(accountDigest, deviceId)` addressing and conversation threads
//! - `message`  — plaintext payloads inside the ratchet envelope, incl. the
//!                closed control-message set
//! - `api`      — relay HTTP request/response bodies and WS inbound frames

pub mod api;
pub mod endpoint;
pub mod message;

pub use endpoint::{Endpoint, ConversationThread};
pub use message::{ControlMessage, MessageBody, MessagePayload, ReceiptType};

// The DR packet itself is defined next to the engine that produces it.
pub use qc_crypto::ratchet::{Packet, PacketHeader};
