//! # caseline-core: Data Model for the Caseline Sync Engine
//!
//! This crate holds the records that travel between collaborating clients
//! and the coordination service. It has zero I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Caseline Architecture                            │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │         Domain layer (comments, evidence, assignments)          │   │
//! │  │   creates SyncOperations ──►       ◄── consumes SyncOperations  │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    caseline-sync (engine)                       │   │
//! │  │   SyncClient ─ OfflineQueue ─ PresenceTracker ─ Supervisor      │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │              ★ caseline-core (THIS CRATE) ★                     │   │
//! │  │                                                                 │   │
//! │  │   ┌─────────────┐  ┌──────────────┐  ┌──────────────┐          │   │
//! │  │   │  operation  │  │   presence   │  │  validation  │          │   │
//! │  │   │ SyncOperation│ │PresenceRecord│  │  identifiers │          │   │
//! │  │   │  EventType  │  │  is_active   │  │              │          │   │
//! │  │   └─────────────┘  └──────────────┘  └──────────────┘          │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO STORAGE • NO NETWORK • PURE FUNCTIONS            │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`operation`] - `SyncOperation`, `EventType`, `OperationClock`
//! - [`presence`] - `PresenceRecord` and the liveness invariant
//! - [`error`] - Domain error types
//! - [`validation`] - Session and user identifier rules
//!
//! ## Example Usage
//!
//! ```rust
//! use caseline_core::{EventType, OperationClock, SyncOperation};
//! use serde_json::json;
//!
//! let mut clock = OperationClock::new();
//! let op = SyncOperation::new(
//!     "case-42",
//!     EventType::EvidenceAdded,
//!     json!({ "evidenceId": "ev-1" }),
//!     "analyst-7",
//!     clock.next_timestamp(),
//! );
//!
//! assert_eq!(op.version, 0); // assigned by the server
//! assert_eq!(op.event_type.to_string(), "evidence-added");
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod operation;
pub mod presence;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, ValidationError};
pub use operation::{now_millis, EventType, OperationClock, SyncOperation};
pub use presence::PresenceRecord;

// =============================================================================
// Engine Defaults
// =============================================================================
// These are the defaults for every tunable named by the engine. The sync crate
// exposes each of them through its configuration file and environment.

use std::time::Duration;

/// First reconnect delay after an abnormal close.
pub const WS_RECONNECT_DELAY_MIN: Duration = Duration::from_secs(1);

/// Upper bound for the reconnect delay.
pub const WS_RECONNECT_DELAY_MAX: Duration = Duration::from_secs(30);

/// Multiplier applied to the reconnect delay after each failed attempt.
pub const WS_RECONNECT_BACKOFF: f64 = 1.5;

/// Interval between keepalive pings while connected.
pub const WS_PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a pong before declaring the connection dead.
pub const WS_PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on the `connect` handshake.
pub const WS_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Presence broadcast debounce and stale-sweep period.
pub const PRESENCE_UPDATE_INTERVAL: Duration = Duration::from_secs(30);

/// A presence record older than this is inactive.
pub const PRESENCE_TIMEOUT: Duration = Duration::from_secs(60);

/// Maximum number of unacknowledged operations kept offline.
///
/// ## Trade-off
/// When the cap is exceeded the OLDEST operation is evicted. Bounded memory
/// wins over completeness during very long outages.
pub const OFFLINE_QUEUE_MAX: usize = 1000;

/// Retries allowed per operation before it is abandoned.
pub const SYNC_RETRY_ATTEMPTS: u32 = 3;

/// Operations sent per flush batch.
pub const SYNC_BATCH_SIZE: usize = 50;

/// Period of the queue-flush retry timer.
pub const QUEUE_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// An in-flight operation without an echo after this long counts as failed.
pub const SYNC_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Number of recent inbound operation ids remembered for de-duplication.
pub const DEDUP_WINDOW: usize = 1024;
