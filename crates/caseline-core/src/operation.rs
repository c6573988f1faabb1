//! # Sync Operations
//!
//! A [`SyncOperation`] is one state change propagated between collaborators.
//!
//! ## Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     SyncOperation Lifecycle                             │
//! │                                                                         │
//! │  OUTBOUND                                                               │
//! │  domain change ──► SyncOperation::new ──► OfflineQueue ──► transport   │
//! │                     (id, timestamp)        (persisted)        │         │
//! │                                                               ▼         │
//! │                                   server assigns version, relays it     │
//! │                                                               │         │
//! │  ◄── echo (origin == me) ── confirm(id), removed from queue ──┘         │
//! │                                                                         │
//! │  INBOUND                                                                │
//! │  transport ──► dedup by id ──► gap check (version) ──► listeners       │
//! │                                                         (not persisted) │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Shape
//! ```json
//! {
//!   "id": "0b6f7c9e-...",
//!   "sessionId": "case-42",
//!   "eventType": "comment-added",
//!   "payload": { "commentId": "c-1", "body": "..." },
//!   "originUserId": "analyst-7",
//!   "timestamp": 1760000000000,
//!   "version": 12
//! }
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ts_rs::TS;
use uuid::Uuid;

use crate::error::CoreError;

// =============================================================================
// Event Type
// =============================================================================

/// The closed set of changes a session can carry.
///
/// Serialized as kebab-case (`evidence-added`, `member-left`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "kebab-case")]
#[ts(export)]
pub enum EventType {
    EvidenceAdded,
    EvidenceUpdated,
    EvidenceRemoved,
    CommentAdded,
    CommentUpdated,
    CommentRemoved,
    AssignmentCreated,
    AssignmentUpdated,
    SessionUpdated,
    MemberJoined,
    MemberLeft,
}

impl EventType {
    /// Every event type, in declaration order.
    pub const ALL: [EventType; 11] = [
        EventType::EvidenceAdded,
        EventType::EvidenceUpdated,
        EventType::EvidenceRemoved,
        EventType::CommentAdded,
        EventType::CommentUpdated,
        EventType::CommentRemoved,
        EventType::AssignmentCreated,
        EventType::AssignmentUpdated,
        EventType::SessionUpdated,
        EventType::MemberJoined,
        EventType::MemberLeft,
    ];

    /// Returns the wire name of this event type.
    pub const fn as_str(&self) -> &'static str {
        match self {
            EventType::EvidenceAdded => "evidence-added",
            EventType::EvidenceUpdated => "evidence-updated",
            EventType::EvidenceRemoved => "evidence-removed",
            EventType::CommentAdded => "comment-added",
            EventType::CommentUpdated => "comment-updated",
            EventType::CommentRemoved => "comment-removed",
            EventType::AssignmentCreated => "assignment-created",
            EventType::AssignmentUpdated => "assignment-updated",
            EventType::SessionUpdated => "session-updated",
            EventType::MemberJoined => "member-joined",
            EventType::MemberLeft => "member-left",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .iter()
            .copied()
            .find(|event_type| event_type.as_str() == s)
            .ok_or_else(|| CoreError::UnknownEventType(s.to_string()))
    }
}

// =============================================================================
// Sync Operation
// =============================================================================

/// One propagated state change.
///
/// The engine never inspects `payload`; it belongs to the domain layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct SyncOperation {
    /// Unique identifier (UUID v4), used for de-duplication and ack matching.
    pub id: String,

    /// Collaboration session this operation belongs to.
    pub session_id: String,

    /// What kind of change this is.
    pub event_type: EventType,

    /// Opaque domain data.
    pub payload: serde_json::Value,

    /// Author of the change. Used to recognise echoes of our own operations.
    pub origin_user_id: String,

    /// Creation time in Unix milliseconds. Non-decreasing per origin client.
    #[ts(type = "number")]
    pub timestamp: i64,

    /// Session-scoped sequence number, assigned by the server. `0` until then.
    #[serde(default)]
    #[ts(type = "number")]
    pub version: u64,
}

impl SyncOperation {
    /// Creates a new operation with a fresh id and an unassigned version.
    pub fn new(
        session_id: impl Into<String>,
        event_type: EventType,
        payload: serde_json::Value,
        origin_user_id: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            event_type,
            payload,
            origin_user_id: origin_user_id.into(),
            timestamp,
            version: 0,
        }
    }

    /// Returns true if this operation was authored by `user_id`.
    #[inline]
    pub fn is_from(&self, user_id: &str) -> bool {
        self.origin_user_id == user_id
    }
}

// =============================================================================
// Operation Clock
// =============================================================================

/// Current wall-clock time in Unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Issues operation timestamps that never go backwards.
///
/// ## Why
/// Wall clocks step (NTP corrections, manual changes). Peers rely on a
/// client's timestamps being non-decreasing, so a backwards step is clamped
/// to the last issued value.
#[derive(Debug, Default, Clone)]
pub struct OperationClock {
    last: i64,
}

impl OperationClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `max(now_ms, last issued)` and records it.
    pub fn next(&mut self, now_ms: i64) -> i64 {
        self.last = self.last.max(now_ms);
        self.last
    }

    /// Same as [`next`](Self::next) using the current wall clock.
    pub fn next_timestamp(&mut self) -> i64 {
        self.next(now_millis())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_type_wire_names() {
        for event_type in EventType::ALL {
            let json = serde_json::to_string(&event_type).unwrap();
            assert_eq!(json, format!("\"{}\"", event_type));
            assert_eq!(event_type.as_str().parse::<EventType>().unwrap(), event_type);
        }
        assert_eq!(EventType::AssignmentCreated.to_string(), "assignment-created");
    }

    #[test]
    fn test_unknown_event_type() {
        let err = "evidence-exploded".parse::<EventType>().unwrap_err();
        assert!(matches!(err, CoreError::UnknownEventType(s) if s == "evidence-exploded"));
    }

    #[test]
    fn test_operation_serializes_camel_case() {
        let op = SyncOperation::new(
            "S",
            EventType::EvidenceAdded,
            json!({ "evidenceId": "ev-1" }),
            "alice",
            1_000,
        );
        let value = serde_json::to_value(&op).unwrap();

        assert_eq!(value["sessionId"], "S");
        assert_eq!(value["eventType"], "evidence-added");
        assert_eq!(value["originUserId"], "alice");
        assert_eq!(value["timestamp"], 1_000);
        assert_eq!(value["version"], 0);
        assert_eq!(value["payload"]["evidenceId"], "ev-1");
    }

    #[test]
    fn test_missing_version_defaults_to_zero() {
        let raw = json!({
            "id": "op-1",
            "sessionId": "S",
            "eventType": "member-joined",
            "payload": null,
            "originUserId": "bob",
            "timestamp": 5
        });
        let op: SyncOperation = serde_json::from_value(raw).unwrap();
        assert_eq!(op.version, 0);
        assert_eq!(op.event_type, EventType::MemberJoined);
    }

    #[test]
    fn test_new_operations_get_distinct_ids() {
        let a = SyncOperation::new("S", EventType::CommentAdded, json!({}), "u", 1);
        let b = SyncOperation::new("S", EventType::CommentAdded, json!({}), "u", 1);
        assert_ne!(a.id, b.id);
        assert!(a.is_from("u"));
        assert!(!a.is_from("v"));
    }

    #[test]
    fn test_clock_never_goes_backwards() {
        let mut clock = OperationClock::new();
        assert_eq!(clock.next(100), 100);
        assert_eq!(clock.next(90), 100);
        assert_eq!(clock.next(100), 100);
        assert_eq!(clock.next(150), 150);
    }
}
