//! # caseline-store: Storage Boundary for the Sync Engine
//!
//! The engine persists exactly two kinds of state: the offline queue and a
//! small per-session sync cursor. Both go through [`KeyValueStore`].
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Caseline Data Flow                               │
//! │                                                                         │
//! │  OfflineQueue::enqueue / confirm        SessionRegistry (cursor)       │
//! │       │                                       │                         │
//! │       ▼                                       ▼                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                caseline-store (THIS CRATE)                      │   │
//! │  │                                                                 │   │
//! │  │                 trait KeyValueStore { get, set }                │   │
//! │  │                   │                        │                    │   │
//! │  │         ┌─────────▼────────┐     ┌─────────▼────────┐          │   │
//! │  │         │   MemoryStore    │     │   SqliteStore    │          │   │
//! │  │         │ (tests, ephemeral│     │ (sqlite.rs, WAL, │          │   │
//! │  │         │  embeddings)     │     │  kv_store table) │          │   │
//! │  │         └──────────────────┘     └──────────────────┘          │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`memory`] - Process-local store
//! - [`sqlite`] - SQLite store and pool configuration
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Storage error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use caseline_store::{KeyValueStore, SqliteStore, StoreConfig, OFFLINE_QUEUE_KEY};
//!
//! let store = SqliteStore::open(StoreConfig::new("./caseline.db")).await?;
//! store.set(OFFLINE_QUEUE_KEY, "[]".to_string()).await?;
//! assert_eq!(store.get(OFFLINE_QUEUE_KEY).await?.as_deref(), Some("[]"));
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod memory;
pub mod migrations;
pub mod sqlite;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use sqlite::{SqliteStore, StoreConfig};

use async_trait::async_trait;

// =============================================================================
// Storage Keys
// =============================================================================

/// Key holding the serialized offline queue.
pub const OFFLINE_QUEUE_KEY: &str = "sync:offline-queue";

/// Prefix for per-session sync state.
pub const SESSION_STATE_PREFIX: &str = "sync:session:";

/// Key holding the persisted sync state of one session.
pub fn session_state_key(session_id: &str) -> String {
    format!("{SESSION_STATE_PREFIX}{session_id}")
}

// =============================================================================
// Store Trait
// =============================================================================

/// Durable string key/value storage.
///
/// ## Contract
/// - `set` replaces the whole value atomically; a concurrent `get` sees
///   either the old value or the new one, never a mix.
/// - `get` of a key never written returns `Ok(None)`.
///
/// Object-safe through `async_trait`, so the engine can hold an
/// `Arc<dyn KeyValueStore>`.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Reads the value stored under `key`.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Stores `value` under `key`, replacing any previous value.
    async fn set(&self, key: &str, value: String) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_state_key() {
        assert_eq!(session_state_key("case-42"), "sync:session:case-42");
        assert!(session_state_key("S").starts_with(SESSION_STATE_PREFIX));
        assert_ne!(session_state_key("offline-queue"), OFFLINE_QUEUE_KEY);
    }
}
