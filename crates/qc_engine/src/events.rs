//! Lifecycle events emitted by the core to the surrounding shell.

use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// One hydrate step finished; the shell may render progress.
    HydrationProgress { step: &'static str },
    /// The WS message pump may start consuming pushes.
    HydrationComplete,
    /// A transient-capable error chain exhausted its retries; the shell must
    /// require re-login. Emitted at most once per outbox instance.
    OutboxFatal { error: String },
    ForceLogout { reason: String },
    SubscriptionGate,
    ContactSecretsRestored { entries: usize },
}

/// Broadcast fan-out. Cheap to clone; subscribers that lag are dropped by
/// the channel, which is acceptable for UI-facing signals.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub fn emit(&self, event: LifecycleEvent) {
        tracing::debug!(target: "quiet_channel", event = ?event, "lifecycle event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
