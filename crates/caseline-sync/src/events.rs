//! # Sync Events
//!
//! Everything the engine tells the rest of the application.
//!
//! ## Event Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Event Dispatch                                  │
//! │                                                                         │
//! │  router / supervisor                                                    │
//! │        │  (state mutation finished)                                     │
//! │        ▼                                                                │
//! │   EventBus::emit(event)                                                 │
//! │        │                                                                │
//! │        ├──► SyncHooks (registered listener, called inline)              │
//! │        │                                                                │
//! │        └──► broadcast::Sender<SyncEvent> ──► SyncClient::events()       │
//! │                                                                         │
//! │  Events from one source are emitted in the order they happened.         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use caseline_core::{PresenceRecord, SyncOperation};

use crate::transport::ConnectionState;

/// Capacity of the event broadcast channel. Slow subscribers see `Lagged`.
const EVENT_CHANNEL_CAPACITY: usize = 256;

// =============================================================================
// Event Types
// =============================================================================

/// Why an operation was discarded without delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum AbandonReason {
    /// Retried past the configured attempt bound.
    RetriesExhausted { attempts: u32 },
    /// Evicted to keep the offline queue under its cap.
    QueueOverflow,
}

impl std::fmt::Display for AbandonReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbandonReason::RetriesExhausted { attempts } => {
                write!(f, "retries exhausted after {} attempts", attempts)
            }
            AbandonReason::QueueOverflow => write!(f, "offline queue overflow"),
        }
    }
}

/// Active users of one session after a presence change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceUpdate {
    pub session_id: String,
    pub active_users: Vec<PresenceRecord>,
}

/// A notification from the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A remote operation for a subscribed session.
    Sync(SyncOperation),

    /// The active user list of a session changed.
    Presence(PresenceUpdate),

    ConnectionChanged(ConnectionState),

    /// An operation was dropped for good. Reported once per operation.
    OperationAbandoned {
        operation: SyncOperation,
        reason: AbandonReason,
    },

    /// A remote operation skipped ahead of the last applied version.
    /// The operation itself is still delivered.
    VersionGap {
        session_id: String,
        expected: u64,
        received: u64,
    },

    /// The server reported an error frame.
    ServerError(String),
}

// =============================================================================
// Hooks
// =============================================================================

/// Listener interface for engine events.
///
/// Every method defaults to a no-op, so implementors override only what
/// they need. Hooks run on the engine's tasks: keep them short and never
/// block.
pub trait SyncHooks: Send + Sync {
    fn on_sync(&self, _operation: &SyncOperation) {}

    fn on_presence_update(&self, _update: &PresenceUpdate) {}

    fn on_connection_change(&self, _state: ConnectionState) {}

    fn on_operation_abandoned(&self, _operation: &SyncOperation, _reason: AbandonReason) {}

    fn on_version_gap(&self, _session_id: &str, _expected: u64, _received: u64) {}

    fn on_error(&self, _message: &str) {}
}

/// Hooks that ignore every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpHooks;

impl SyncHooks for NoOpHooks {}

// =============================================================================
// Event Bus
// =============================================================================

/// Fans each event out to the hooks and the broadcast channel.
#[derive(Clone)]
pub struct EventBus {
    hooks: Arc<dyn SyncHooks>,
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(hooks: Arc<dyn SyncHooks>) -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        EventBus { hooks, tx }
    }

    /// Delivers `event` to the hooks, then to broadcast subscribers.
    pub fn emit(&self, event: SyncEvent) {
        match &event {
            SyncEvent::Sync(operation) => self.hooks.on_sync(operation),
            SyncEvent::Presence(update) => self.hooks.on_presence_update(update),
            SyncEvent::ConnectionChanged(state) => self.hooks.on_connection_change(*state),
            SyncEvent::OperationAbandoned { operation, reason } => {
                self.hooks.on_operation_abandoned(operation, *reason)
            }
            SyncEvent::VersionGap {
                session_id,
                expected,
                received,
            } => self.hooks.on_version_gap(session_id, *expected, *received),
            SyncEvent::ServerError(message) => self.hooks.on_error(message),
        }

        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}
