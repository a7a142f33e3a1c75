//! qc_engine — the messaging pipeline of Quiet Channel
//!
//! Components, leaves first:
//! - `session_map` — peer-keyed Double Ratchet sessions with snapshot flush
//! - `outbox`      — per-conversation ordered durable queue with retry
//! - `inbox`       — ordered delivery, gap reconciliation, tombstones
//! - `lifecycle`   — login hydrate, logout flush, self-heal
//! - `transport`   — the relay seam (trait + HTTP implementation)
//! - `events`      — lifecycle events emitted to the shell
//!
//! Concurrency model: cooperative async on tokio. Ratchet arithmetic runs to
//! completion between suspension points; the session map has a single writer
//! (the engine) and the outbox serialises sends per conversation.

pub mod error;
pub mod events;
pub mod inbox;
pub mod lifecycle;
pub mod outbox;
pub mod session_map;
pub mod transport;

pub use error::{EngineError, ReasonCode};
pub use events::{EventBus, LifecycleEvent};
pub use inbox::{Reconciler, TimelineRecord};
pub use lifecycle::Coordinator;
pub use outbox::Outbox;
pub use session_map::SessionStore;
pub use transport::{HttpRelay, RelayTransport};
