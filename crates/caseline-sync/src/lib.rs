//! # caseline-sync: Real-Time Sync Engine for Caseline
//!
//! This crate keeps every collaborator on an investigation session in step:
//! local changes are queued durably and streamed to the coordination
//! service, remote changes are delivered exactly once, and presence shows
//! who is active where.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Engine Architecture                         │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                    SyncClient (public façade)                    │  │
//! │  │                                                                  │  │
//! │  │  connect / disconnect / subscribe / queue_operation / presence   │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │  OfflineQueue  │  │   Supervisor   │  │   Message router       │    │
//! │  │                │  │                │  │                        │    │
//! │  │ FIFO, durable, │  │ Owns the link: │  │ Echo = acknowledgment  │    │
//! │  │ bounded,       │  │ keepalive,     │  │ Dedup, version gaps    │    │
//! │  │ retry-limited  │  │ backoff,       │  │ Remote presence        │    │
//! │  │                │  │ batch flushes  │  │                        │    │
//! │  └────────────────┘  └───────┬────────┘  └────────────────────────┘    │
//! │                               │                                         │
//! │                               ▼                                         │
//! │                  TransportFactory (WebSocket)                           │
//! │                               │                                         │
//! │                               ▼                                         │
//! │                    Coordination service                                 │
//! │                                                                         │
//! │  Events: SyncHooks callbacks + broadcast channel (SyncClient::events)   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`client`] - `SyncClient`, its builder and the inbound router
//! - [`config`] - TOML configuration with environment overrides
//! - [`error`] - Sync error types
//! - [`events`] - `SyncEvent`, `SyncHooks` and the event bus
//! - [`presence`] - Local heartbeats and remote presence tracking
//! - [`protocol`] - Wire frames, JSON tagged by `type`
//! - [`queue`] - Durable offline queue
//! - [`session`] - Subscriptions, de-duplication, version cursors
//! - [`supervisor`] - Connection lifecycle actor
//! - [`transport`] - WebSocket transport and connection state
//!
//! ## Usage
//!
//! ```rust,ignore
//! use caseline_sync::{EventType, SyncClient, SyncConfig, SyncEvent};
//! use serde_json::json;
//!
//! let mut config = SyncConfig::load_or_default(None);
//! config.apply_env_overrides();
//!
//! let client = SyncClient::new(config)?;
//! let mut events = client.events();
//!
//! client.connect(None).await?;
//! client.subscribe_to_session("case-42", "analyst-7").await?;
//! client
//!     .queue_operation("case-42", EventType::EvidenceAdded, json!({ "evidenceId": "ev-9" }))
//!     .await?;
//!
//! while let Ok(event) = events.recv().await {
//!     if let SyncEvent::Sync(op) = event {
//!         println!("{} from {}", op.event_type, op.origin_user_id);
//!     }
//! }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod presence;
pub mod protocol;
pub mod queue;
pub mod session;
pub mod supervisor;
pub mod transport;

#[cfg(test)]
mod test_support;

// =============================================================================
// Re-exports
// =============================================================================

pub use client::{SyncClient, SyncClientBuilder, SyncStatus};
pub use config::SyncConfig;
pub use error::{SyncError, SyncResult};
pub use events::{AbandonReason, NoOpHooks, PresenceUpdate, SyncEvent, SyncHooks};
pub use protocol::WireMessage;
pub use queue::QueuedOperation;
pub use supervisor::ReconnectPolicy;
pub use transport::{ConnectionState, TransportFactory, WebSocketTransport};

pub use caseline_core::{EventType, PresenceRecord, SyncOperation};
pub use caseline_store::{KeyValueStore, MemoryStore, SqliteStore};
