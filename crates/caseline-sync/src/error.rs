//! # Sync Error Types
//!
//! Error types for the sync engine.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │     Misuse      │  │      Transport          │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  NotConnected   │  │  ConnectionFailed       │ │
//! │  │  InvalidUrl     │  │  NotSubscribed  │  │  Timeout                │ │
//! │  │  ConfigLoad/Save│  │  Validation     │  │  Disconnected, WebSocket│ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │    Protocol     │  │     Storage     │  │      Internal           │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidMessage │  │  Storage        │  │  ChannelClosed          │ │
//! │  │  Serialization  │  │                 │  │  ShuttingDown           │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  Only Configuration and Misuse errors ever reach a caller of the       │
//! │  public API. Transport errors are retried and surface as connection    │
//! │  state changes; exhausted operations surface as events.                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;

use thiserror::Error;

use caseline_core::{CoreError, ValidationError};
use caseline_store::StoreError;

use crate::transport::TransportError;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all possible sync failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    ///
    /// ## When This Occurs
    /// - `connect(None)` with no URL configured
    /// - Out-of-range tunables (zero batch size, backoff below 1.0)
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Invalid coordination service URL.
    #[error("Invalid sync URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Misuse Errors
    // =========================================================================
    /// Identifier validation failed.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The call needs a live connection.
    ///
    /// ## When This Occurs
    /// - `subscribe_to_session` before `connect` succeeded
    /// - `subscribe_to_session` while reconnecting
    #[error("Not connected to the sync service")]
    NotConnected,

    /// The call needs an active subscription to the session.
    #[error("Not subscribed to session {0}")]
    NotSubscribed(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Failed to establish the connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Handshake or keepalive timed out.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Connection closed unexpectedly.
    #[error("Disconnected from sync service")]
    Disconnected,

    /// WebSocket protocol error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Invalid frame received.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Failed to serialize or deserialize.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Durable storage failed.
    #[error("Storage error: {0}")]
    Storage(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// An internal channel closed.
    #[error("Channel error: {0}")]
    ChannelClosed(String),

    /// Engine is shutting down.
    #[error("Sync engine is shutting down")]
    ShuttingDown,
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        SyncError::Storage(err.to_string())
    }
}

impl From<CoreError> for SyncError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(e) => SyncError::Validation(e),
            other => SyncError::InvalidMessage(other.to_string()),
        }
    }
}

impl From<TransportError> for SyncError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ConnectionFailed(msg) => SyncError::ConnectionFailed(msg),
            TransportError::ConnectionClosed => SyncError::Disconnected,
            TransportError::SendFailed(msg) | TransportError::ReceiveFailed(msg) => {
                SyncError::WebSocket(msg)
            }
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => SyncError::Disconnected,
            WsError::Io(io) => SyncError::ConnectionFailed(io.to_string()),
            WsError::Url(url) => SyncError::InvalidUrl(url.to_string()),
            other => SyncError::WebSocket(other.to_string()),
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// Returns true if the engine recovers from this error on its own.
    ///
    /// ## Retryable Errors
    /// - Connection failures, timeouts, abnormal closes
    ///
    /// ## Non-Retryable Errors
    /// - Configuration errors
    /// - Caller misuse
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::ConnectionFailed(_)
                | SyncError::Disconnected
                | SyncError::Timeout(_)
                | SyncError::WebSocket(_)
        )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }

    /// Returns true if the caller used the API in a state that forbids it.
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            SyncError::NotConnected | SyncError::NotSubscribed(_) | SyncError::Validation(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::ConnectionFailed("refused".into()).is_retryable());
        assert!(SyncError::Disconnected.is_retryable());
        assert!(SyncError::Timeout(Duration::from_secs(10)).is_retryable());

        assert!(!SyncError::InvalidConfig("bad config".into()).is_retryable());
        assert!(!SyncError::NotConnected.is_retryable());
    }

    #[test]
    fn test_categories_are_disjoint() {
        let misuse = SyncError::NotConnected;
        assert!(misuse.is_misuse());
        assert!(!misuse.is_config_error());

        let config = SyncError::InvalidUrl("http://x".into());
        assert!(config.is_config_error());
        assert!(!config.is_misuse());
    }

    #[test]
    fn test_transport_error_mapping() {
        assert!(matches!(
            SyncError::from(TransportError::ConnectionClosed),
            SyncError::Disconnected
        ));
        assert!(matches!(
            SyncError::from(TransportError::ConnectionFailed("refused".into())),
            SyncError::ConnectionFailed(_)
        ));
    }

    #[test]
    fn test_validation_error_is_misuse() {
        let err: SyncError = ValidationError::Required {
            field: "session_id".into(),
        }
        .into();
        assert!(err.is_misuse());
        assert_eq!(err.to_string(), "Validation error: session_id is required");
    }
}
