//! # Presence Records
//!
//! A [`PresenceRecord`] says "this user was seen in this session at this
//! time, doing this". Liveness is derived, never stored:
//!
//! ```text
//!   active  ⇔  now - last_seen_at < timeout
//!
//!   last_seen_at          last_seen_at + timeout
//!        │◄──────── active ────────►│◄──── stale (evictable) ────
//! ───────┼──────────────────────────┼─────────────────────────────► time
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// One user's liveness in one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct PresenceRecord {
    pub user_id: String,

    pub session_id: String,

    /// Free-form activity label (`viewing`, `editing`, ...).
    pub status: String,

    /// Unix milliseconds of the last refresh.
    #[ts(type = "number")]
    pub last_seen_at: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub current_page: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub current_item: Option<String>,
}

impl PresenceRecord {
    /// Creates a record seen at `now_ms` with no page/item pointers.
    pub fn new(
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        status: impl Into<String>,
        now_ms: i64,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
            status: status.into(),
            last_seen_at: now_ms,
            current_page: None,
            current_item: None,
        }
    }

    /// Returns true while `now_ms - last_seen_at < timeout`.
    pub fn is_active(&self, now_ms: i64, timeout: Duration) -> bool {
        let timeout_ms = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
        now_ms.saturating_sub(self.last_seen_at) < timeout_ms
    }
}
