//! # Session Registry
//!
//! Which sessions this client is subscribed to, which inbound operations it
//! has already seen, and the last applied version per session.
//!
//! Subscriptions are connection-scoped: they are replayed after every
//! reconnect and cleared on explicit disconnect. Version cursors are
//! persisted under [`caseline_store::session_state_key`].

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

/// Persisted per-session sync state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub last_version: u64,
}

/// Outcome of checking an inbound operation's version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionCheck {
    /// Next expected version, or the first one seen for the session.
    InOrder,
    /// Versions between the cursor and this one were never seen.
    Gap { expected: u64, received: u64 },
    /// At or below the cursor (replay or resend).
    Stale,
    /// The server did not assign a version.
    Unversioned,
}

#[derive(Debug)]
pub struct SessionRegistry {
    /// session id -> subscribing user id
    subscriptions: BTreeMap<String, String>,
    cursors: HashMap<String, u64>,
    seen_order: VecDeque<String>,
    seen: HashSet<String>,
    dedup_window: usize,
}

impl SessionRegistry {
    pub fn new(dedup_window: usize) -> Self {
        SessionRegistry {
            subscriptions: BTreeMap::new(),
            cursors: HashMap::new(),
            seen_order: VecDeque::new(),
            seen: HashSet::new(),
            dedup_window,
        }
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Registers a subscription. Returns false if it already existed.
    pub fn subscribe(&mut self, session_id: &str, user_id: &str) -> bool {
        self.subscriptions
            .insert(session_id.to_string(), user_id.to_string())
            .is_none()
    }

    /// Removes a subscription, returning the user that held it.
    pub fn unsubscribe(&mut self, session_id: &str) -> Option<String> {
        self.subscriptions.remove(session_id)
    }

    pub fn is_subscribed(&self, session_id: &str) -> bool {
        self.subscriptions.contains_key(session_id)
    }

    /// `(session_id, user_id)` pairs, ordered by session id.
    pub fn subscriptions(&self) -> Vec<(String, String)> {
        self.subscriptions
            .iter()
            .map(|(s, u)| (s.clone(), u.clone()))
            .collect()
    }

    pub fn sessions(&self) -> Vec<String> {
        self.subscriptions.keys().cloned().collect()
    }

    pub fn clear_subscriptions(&mut self) {
        self.subscriptions.clear();
    }

    // =========================================================================
    // De-duplication
    // =========================================================================

    /// Records an inbound operation id. Returns false if it was seen within
    /// the window.
    pub fn observe(&mut self, operation_id: &str) -> bool {
        if self.seen.contains(operation_id) {
            return false;
        }

        self.seen.insert(operation_id.to_string());
        self.seen_order.push_back(operation_id.to_string());

        while self.seen_order.len() > self.dedup_window {
            if let Some(oldest) = self.seen_order.pop_front() {
                self.seen.remove(&oldest);
            }
        }

        true
    }

    // =========================================================================
    // Version Cursors
    // =========================================================================

    /// Compares `version` with the session's cursor and advances it.
    pub fn check_version(&mut self, session_id: &str, version: u64) -> VersionCheck {
        if version == 0 {
            return VersionCheck::Unversioned;
        }

        match self.cursors.get(session_id).copied() {
            None => {
                self.cursors.insert(session_id.to_string(), version);
                VersionCheck::InOrder
            }
            Some(last) if version <= last => VersionCheck::Stale,
            Some(last) => {
                self.cursors.insert(session_id.to_string(), version);
                if version == last + 1 {
                    VersionCheck::InOrder
                } else {
                    VersionCheck::Gap {
                        expected: last + 1,
                        received: version,
                    }
                }
            }
        }
    }

    /// Seeds the cursor from persisted state unless one is already known.
    pub fn restore_cursor(&mut self, session_id: &str, state: SessionState) {
        if state.last_version > 0 {
            self.cursors
                .entry(session_id.to_string())
                .or_insert(state.last_version);
        }
    }

    #[cfg(test)]
    pub fn cursor(&self, session_id: &str) -> Option<u64> {
        self.cursors.get(session_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscriptions_are_ordered() {
        let mut registry = SessionRegistry::new(8);

        assert!(registry.subscribe("S2", "alice"));
        assert!(registry.subscribe("S1", "alice"));
        assert!(!registry.subscribe("S1", "alice"));

        assert_eq!(registry.sessions(), vec!["S1", "S2"]);
        assert_eq!(registry.unsubscribe("S2").as_deref(), Some("alice"));
        assert!(!registry.is_subscribed("S2"));
    }

    #[test]
    fn test_dedup_window_is_bounded() {
        let mut registry = SessionRegistry::new(2);

        assert!(registry.observe("a"));
        assert!(!registry.observe("a"));
        assert!(registry.observe("b"));
        assert!(registry.observe("c"));

        // "a" fell out of the window
        assert!(registry.observe("a"));
        assert!(!registry.observe("c"));
    }

    #[test]
    fn test_version_checks() {
        let mut registry = SessionRegistry::new(8);

        assert_eq!(registry.check_version("S", 0), VersionCheck::Unversioned);
        assert_eq!(registry.check_version("S", 4), VersionCheck::InOrder);
        assert_eq!(registry.check_version("S", 5), VersionCheck::InOrder);
        assert_eq!(registry.check_version("S", 5), VersionCheck::Stale);
        assert_eq!(
            registry.check_version("S", 8),
            VersionCheck::Gap {
                expected: 6,
                received: 8
            }
        );
        assert_eq!(registry.cursor("S"), Some(8));
    }

    #[test]
    fn test_restore_cursor_keeps_newer_value() {
        let mut registry = SessionRegistry::new(8);

        registry.restore_cursor("S", SessionState { last_version: 3 });
        assert_eq!(registry.check_version("S", 5), VersionCheck::Gap { expected: 4, received: 5 });

        registry.restore_cursor("S", SessionState { last_version: 1 });
        assert_eq!(registry.cursor("S"), Some(5));

        let json = serde_json::to_string(&SessionState { last_version: 5 }).unwrap();
        assert_eq!(json, r#"{"lastVersion":5}"#);
    }
}
