//! # Wire Protocol
//!
//! Frames exchanged with the coordination service.
//!
//! ## Protocol Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Caseline Wire Frames                               │
//! │                                                                         │
//! │  SESSION MEMBERSHIP                                                    │
//! │  ──────────────────                                                    │
//! │  client ───► subscribe   { sessionId, userId, timestamp }              │
//! │  client ───► unsubscribe { sessionId, userId, timestamp }              │
//! │                                                                         │
//! │  OPERATIONS                                                            │
//! │  ──────────                                                            │
//! │  client ───► sync { operation }                                        │
//! │  client ◄─── sync { operation (version assigned) }  echo / remote op   │
//! │                                                                         │
//! │  PRESENCE                                                              │
//! │  ────────                                                              │
//! │  both   ◄──► presence { presence }                                     │
//! │                                                                         │
//! │  AUTH                                                                  │
//! │  ────                                                                  │
//! │  client ───► auth { token }                                            │
//! │  client ◄─── auth-ack                                                  │
//! │                                                                         │
//! │  KEEPALIVE                                                             │
//! │  ─────────                                                             │
//! │  both   ◄──► ping / pong                                               │
//! │                                                                         │
//! │  ERROR                                                                 │
//! │  ─────                                                                 │
//! │  client ◄─── error { error }                                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Format
//! One JSON object per frame, internally tagged by `type`:
//! ```json
//! { "type": "subscribe", "sessionId": "case-42", "userId": "analyst-7", "timestamp": 1760000000000 }
//! ```
//!
//! The message set is a closed enum. Adding a frame kind is a compile-time
//! visible change for every `match` in the engine.

use serde::{Deserialize, Serialize};

use caseline_core::{PresenceRecord, SyncOperation};

// =============================================================================
// Wire Message
// =============================================================================

/// Every frame that can cross the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WireMessage {
    /// Join a session's fan-out.
    Subscribe {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "userId")]
        user_id: String,
        timestamp: i64,
    },

    /// Leave a session's fan-out.
    Unsubscribe {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "userId")]
        user_id: String,
        timestamp: i64,
    },

    /// One operation, outbound or relayed.
    Sync { operation: SyncOperation },

    /// One user's presence in one session.
    Presence { presence: PresenceRecord },

    /// Authentication handshake, sent first on every connection.
    Auth { token: String },

    /// Server accepted the `auth` frame.
    AuthAck,

    Ping,

    Pong,

    /// Server-side failure report. Never fatal to the connection.
    Error { error: String },
}

// =============================================================================
// Helper Functions
// =============================================================================

impl WireMessage {
    /// Returns the `type` discriminator (for logging).
    pub fn type_name(&self) -> &'static str {
        match self {
            WireMessage::Subscribe { .. } => "subscribe",
            WireMessage::Unsubscribe { .. } => "unsubscribe",
            WireMessage::Sync { .. } => "sync",
            WireMessage::Presence { .. } => "presence",
            WireMessage::Auth { .. } => "auth",
            WireMessage::AuthAck => "auth-ack",
            WireMessage::Ping => "ping",
            WireMessage::Pong => "pong",
            WireMessage::Error { .. } => "error",
        }
    }

    /// Creates a subscribe frame.
    pub fn subscribe(session_id: &str, user_id: &str, timestamp: i64) -> Self {
        WireMessage::Subscribe {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            timestamp,
        }
    }

    /// Creates an unsubscribe frame.
    pub fn unsubscribe(session_id: &str, user_id: &str, timestamp: i64) -> Self {
        WireMessage::Unsubscribe {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            timestamp,
        }
    }

    /// Wraps an operation in a sync frame.
    pub fn sync(operation: SyncOperation) -> Self {
        WireMessage::Sync { operation }
    }

    /// Wraps a presence record in a presence frame.
    pub fn presence(presence: PresenceRecord) -> Self {
        WireMessage::Presence { presence }
    }

    /// Creates an auth frame.
    pub fn auth(token: &str) -> Self {
        WireMessage::Auth {
            token: token.to_string(),
        }
    }

    /// Creates an error frame.
    pub fn error(error: &str) -> Self {
        WireMessage::Error {
            error: error.to_string(),
        }
    }

    /// Serializes to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserializes from JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
