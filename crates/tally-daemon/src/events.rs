//! Daemon events.
//!
//! Events are how components tell each other about things that happened.
//! Record changes do not travel here; they go through the typed stores in
//! [`crate::stores`], which gRPC streams subscribe to directly.

use time::OffsetDateTime;

use crate::afk::AfkEvent;

/// Events that flow through the daemon's event bus.
///
/// Events are broadcast to all components. Each component decides which
/// events it cares about in its `handle_event` implementation.
#[derive(Debug, Clone)]
pub enum DaemonEvent {
    // ---- Presence ----
    /// The user went away from the keyboard.
    AfkStarted { at: OffsetDateTime },

    /// The user came back after being away since `afk_since`.
    AfkStopped { afk_since: OffsetDateTime },

    // ---- Lifecycle ----
    /// Request graceful shutdown of the daemon.
    ShutdownRequested,
}

impl From<AfkEvent> for DaemonEvent {
    fn from(event: AfkEvent) -> Self {
        match event {
            AfkEvent::Started { at } => DaemonEvent::AfkStarted { at },
            AfkEvent::Stopped { afk_since } => DaemonEvent::AfkStopped { afk_since },
        }
    }
}
