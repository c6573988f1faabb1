//! # Presence Tracker
//!
//! Local and remote presence per session.
//!
//! ## Timing
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Presence Timing                                   │
//! │                                                                         │
//! │  LOCAL RECORDS                                                         │
//! │  ─────────────                                                         │
//! │  subscribe ──► register_local ──► broadcast immediately                │
//! │  touch / update_local ──► last_seen_at = now                           │
//! │        broadcast only if the last one is ≥ update_interval old         │
//! │  ticker (every update_interval) ──► heartbeat: refresh + broadcast all │
//! │                                                                         │
//! │  REMOTE RECORDS                                                        │
//! │  ──────────────                                                        │
//! │  presence frame ──► apply_remote (own user ignored)                    │
//! │  ticker ──► sweep: drop records with now - last_seen_at ≥ timeout      │
//! │                                                                         │
//! │  active_users(S) = local record of S (if active)                       │
//! │                  ∪ active remote records of S, ordered by user id      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All times are Unix milliseconds passed in by the caller, so the tracker
//! itself never reads a clock. The engine reads `PresenceClock`.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use caseline_core::{now_millis, PresenceRecord};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Presence Clock
// =============================================================================

/// Unix-millisecond clock that advances with the Tokio timer.
///
/// Anchored to the wall clock once at construction and driven by
/// `tokio::time::Instant` afterwards, so record ages and the heartbeat
/// ticker agree (including under paused test time).
#[derive(Debug, Clone, Copy)]
pub(crate) struct PresenceClock {
    base: Instant,
    base_ms: i64,
}

impl PresenceClock {
    pub fn new() -> Self {
        PresenceClock {
            base: Instant::now(),
            base_ms: now_millis(),
        }
    }

    pub fn now_ms(&self) -> i64 {
        let elapsed = i64::try_from(self.base.elapsed().as_millis()).unwrap_or(i64::MAX);
        self.base_ms.saturating_add(elapsed)
    }
}

// =============================================================================
// Presence Tracker
// =============================================================================

#[derive(Debug, Clone)]
struct LocalPresence {
    record: PresenceRecord,
    last_broadcast_at: i64,
}

/// Presence bookkeeping for every subscribed session.
#[derive(Debug)]
pub struct PresenceTracker {
    local_user: String,
    local: HashMap<String, LocalPresence>,
    remote: HashMap<String, HashMap<String, PresenceRecord>>,
    update_interval_ms: i64,
    timeout: Duration,
}

impl PresenceTracker {
    pub fn new(local_user: impl Into<String>, update_interval: Duration, timeout: Duration) -> Self {
        PresenceTracker {
            local_user: local_user.into(),
            local: HashMap::new(),
            remote: HashMap::new(),
            update_interval_ms: i64::try_from(update_interval.as_millis()).unwrap_or(i64::MAX),
            timeout,
        }
    }

    // =========================================================================
    // Local Presence
    // =========================================================================

    /// Creates the local record for a newly subscribed session.
    ///
    /// Returns the record to broadcast right away.
    pub fn register_local(
        &mut self,
        session_id: &str,
        user_id: &str,
        status: &str,
        now_ms: i64,
    ) -> PresenceRecord {
        let record = PresenceRecord::new(user_id, session_id, status, now_ms);
        self.local.insert(
            session_id.to_string(),
            LocalPresence {
                record: record.clone(),
                last_broadcast_at: now_ms,
            },
        );
        record
    }

    /// Updates the local record's activity.
    ///
    /// Returns the record when a broadcast is due (debounced by the update
    /// interval).
    ///
    /// ## Errors
    /// [`SyncError::NotSubscribed`] if the session has no local record.
    pub fn update_local(
        &mut self,
        session_id: &str,
        status: &str,
        current_page: Option<String>,
        current_item: Option<String>,
        now_ms: i64,
    ) -> SyncResult<Option<PresenceRecord>> {
        let update_interval_ms = self.update_interval_ms;
        let local = self
            .local
            .get_mut(session_id)
            .ok_or_else(|| SyncError::NotSubscribed(session_id.to_string()))?;

        local.record.status = status.to_string();
        local.record.current_page = current_page;
        local.record.current_item = current_item;

        Ok(Self::refresh(local, now_ms, update_interval_ms))
    }

    /// Refreshes `last_seen_at` without changing the activity.
    ///
    /// Same debounce as [`update_local`](Self::update_local).
    pub fn touch(&mut self, session_id: &str, now_ms: i64) -> SyncResult<Option<PresenceRecord>> {
        let update_interval_ms = self.update_interval_ms;
        let local = self
            .local
            .get_mut(session_id)
            .ok_or_else(|| SyncError::NotSubscribed(session_id.to_string()))?;
        Ok(Self::refresh(local, now_ms, update_interval_ms))
    }

    fn refresh(local: &mut LocalPresence, now_ms: i64, update_interval_ms: i64) -> Option<PresenceRecord> {
        local.record.last_seen_at = local.record.last_seen_at.max(now_ms);

        if now_ms.saturating_sub(local.last_broadcast_at) >= update_interval_ms {
            local.last_broadcast_at = now_ms;
            Some(local.record.clone())
        } else {
            None
        }
    }

    /// Refreshes every local record and returns them all for broadcast.
    pub fn heartbeat(&mut self, now_ms: i64) -> Vec<PresenceRecord> {
        let mut records: Vec<PresenceRecord> = self
            .local
            .values_mut()
            .map(|local| {
                local.record.last_seen_at = local.record.last_seen_at.max(now_ms);
                local.last_broadcast_at = now_ms;
                local.record.clone()
            })
            .collect();
        records.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        records
    }

    /// Drops the local record and everything known about the session.
    pub fn remove_local(&mut self, session_id: &str) -> Option<PresenceRecord> {
        self.remote.remove(session_id);
        self.local.remove(session_id).map(|local| local.record)
    }

    /// Whether any session has a local record, i.e. the heartbeat has work.
    pub fn has_local_records(&self) -> bool {
        !self.local.is_empty()
    }

    // =========================================================================
    // Remote Presence
    // =========================================================================

    /// Inserts or replaces a remote record.
    ///
    /// Records from the local user and for sessions this client is not in are
    /// ignored. Returns the session whose active list changed.
    pub fn apply_remote(&mut self, record: PresenceRecord) -> Option<String> {
        let local = self.local.get(&record.session_id)?;

        if record.user_id == self.local_user || record.user_id == local.record.user_id {
            debug!(session_id = %record.session_id, "Ignoring own presence echo");
            return None;
        }

        let session_id = record.session_id.clone();
        self.remote
            .entry(session_id.clone())
            .or_default()
            .insert(record.user_id.clone(), record);

        Some(session_id)
    }

    /// Evicts stale remote records. Returns the sessions that lost a user.
    pub fn sweep(&mut self, now_ms: i64) -> Vec<String> {
        let timeout = self.timeout;
        let mut changed = Vec::new();

        for (session_id, users) in self.remote.iter_mut() {
            let before = users.len();
            users.retain(|_, record| record.is_active(now_ms, timeout));
            if users.len() != before {
                debug!(session_id = %session_id, evicted = before - users.len(), "Swept stale presence");
                changed.push(session_id.clone());
            }
        }

        self.remote.retain(|_, users| !users.is_empty());
        changed.sort();
        changed
    }

    /// Active users of a session: the local record first, then remote users
    /// ordered by user id.
    pub fn active_users(&self, session_id: &str, now_ms: i64) -> Vec<PresenceRecord> {
        let mut users = Vec::new();

        if let Some(local) = self.local.get(session_id) {
            if local.record.is_active(now_ms, self.timeout) {
                users.push(local.record.clone());
            }
        }

        if let Some(remote) = self.remote.get(session_id) {
            let mut active: Vec<&PresenceRecord> = remote
                .values()
                .filter(|r| r.is_active(now_ms, self.timeout))
                .collect();
            active.sort_by(|a, b| a.user_id.cmp(&b.user_id));
            users.extend(active.into_iter().cloned());
        }

        users
    }

    pub fn clear(&mut self) {
        self.local.clear();
        self.remote.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_secs(30);
    const TIMEOUT: Duration = Duration::from_secs(60);

    fn tracker() -> PresenceTracker {
        let mut tracker = PresenceTracker::new("alice", INTERVAL, TIMEOUT);
        tracker.register_local("S", "alice", "viewing", 0);
        tracker
    }

    #[test]
    fn test_touch_is_debounced() {
        let mut tracker = tracker();

        assert!(tracker.touch("S", 1_000).unwrap().is_none());
        assert!(tracker.touch("S", 29_999).unwrap().is_none());
        assert_eq!(tracker.active_users("S", 29_999)[0].last_seen_at, 29_999);

        let broadcast = tracker.touch("S", 30_000).unwrap().unwrap();
        assert_eq!(broadcast.last_seen_at, 30_000);
        assert!(tracker.touch("S", 30_001).unwrap().is_none());

        let err = tracker.touch("unknown", 90_000).unwrap_err();
        assert!(matches!(err, SyncError::NotSubscribed(ref s) if s == "unknown"));
    }

    #[test]
    fn test_update_local_requires_subscription() {
        let mut tracker = tracker();

        let err = tracker
            .update_local("other", "editing", None, None, 5)
            .unwrap_err();
        assert!(matches!(err, SyncError::NotSubscribed(ref s) if s == "other"));

        let pending = tracker
            .update_local("S", "editing", Some("timeline".into()), Some("ev-3".into()), 5)
            .unwrap();
        assert!(pending.is_none());

        let local = &tracker.active_users("S", 5)[0];
        assert_eq!(local.status, "editing");
        assert_eq!(local.current_item.as_deref(), Some("ev-3"));
    }

    #[test]
    fn test_remote_self_echo_ignored() {
        let mut tracker = tracker();

        assert_eq!(tracker.apply_remote(PresenceRecord::new("alice", "S", "editing", 10)), None);
        assert_eq!(tracker.apply_remote(PresenceRecord::new("bob", "X", "viewing", 10)), None);
        assert_eq!(
            tracker.apply_remote(PresenceRecord::new("bob", "S", "viewing", 10)),
            Some("S".to_string())
        );

        let users: Vec<_> = tracker
            .active_users("S", 10)
            .into_iter()
            .map(|r| r.user_id)
            .collect();
        assert_eq!(users, vec!["alice", "bob"]);
    }

    #[test]
    fn test_stale_records_excluded_then_swept() {
        let mut tracker = tracker();
        tracker.apply_remote(PresenceRecord::new("carol", "S", "viewing", 0));
        tracker.apply_remote(PresenceRecord::new("bob", "S", "viewing", 50_000));

        let at_timeout = TIMEOUT.as_millis() as i64;
        let users: Vec<_> = tracker
            .active_users("S", at_timeout)
            .into_iter()
            .map(|r| r.user_id)
            .collect();
        // local record (seen at 0) and carol are exactly at the timeout
        assert_eq!(users, vec!["bob"]);

        assert_eq!(tracker.sweep(at_timeout), vec!["S".to_string()]);
        assert!(tracker.sweep(at_timeout).is_empty());
        assert_eq!(tracker.active_users("S", at_timeout).len(), 1);
    }

    #[test]
    fn test_heartbeat_refreshes_all_sessions() {
        let mut tracker = tracker();
        tracker.register_local("T", "alice", "viewing", 0);

        let records = tracker.heartbeat(45_000);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].session_id, "S");
        assert!(records.iter().all(|r| r.last_seen_at == 45_000));
        assert!(tracker.touch("S", 46_000).unwrap().is_none());
    }

    #[test]
    fn test_remove_local_forgets_session() {
        let mut tracker = tracker();
        tracker.apply_remote(PresenceRecord::new("bob", "S", "viewing", 0));

        assert!(tracker.remove_local("S").is_some());
        assert!(!tracker.has_local_records());
        assert!(tracker.active_users("S", 0).is_empty());
        assert_eq!(tracker.apply_remote(PresenceRecord::new("bob", "S", "viewing", 1)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_presence_clock_follows_tokio_time() {
        let clock = PresenceClock::new();
        let start = clock.now_ms();

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(clock.now_ms() - start, 61_000);
    }
}
