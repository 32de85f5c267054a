//! Live connection bookkeeping.
//!
//! A user may hold several simultaneous connections (multiple devices or
//! tabs). Presence is per user: the user is online while at least one
//! connection is registered, and goes offline only when the last one
//! unregisters.

use common::types::PresenceStatus;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Registry of live connections, keyed by profile id.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    inner: Mutex<HashMap<String, HashSet<String>>>,
}

impl ConnectionTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connection for a user. Returns `true` if this is the
    /// user's first live connection (they just came online).
    pub fn register(&self, profile_id: &str, connection_id: &str) -> bool {
        let mut inner = lock_ignoring_poison(&self.inner);
        let connections = inner.entry(profile_id.to_string()).or_default();
        let was_offline = connections.is_empty();
        connections.insert(connection_id.to_string());
        was_offline
    }

    /// Remove a connection. Returns `true` if the user has no remaining
    /// connections (they just went offline).
    pub fn unregister(&self, profile_id: &str, connection_id: &str) -> bool {
        let mut inner = lock_ignoring_poison(&self.inner);
        let Some(connections) = inner.get_mut(profile_id) else {
            return false;
        };
        connections.remove(connection_id);
        if connections.is_empty() {
            inner.remove(profile_id);
            true
        } else {
            false
        }
    }

    /// Current presence of a user across all their connections.
    #[must_use]
    pub fn presence(&self, profile_id: &str) -> PresenceStatus {
        let inner = lock_ignoring_poison(&self.inner);
        if inner.get(profile_id).is_some_and(|c| !c.is_empty()) {
            PresenceStatus::Online
        } else {
            PresenceStatus::Offline
        }
    }

    /// Total number of live connections, for the status endpoint.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        let inner = lock_ignoring_poison(&self.inner);
        inner.values().map(HashSet::len).sum()
    }
}

// A poisoned mutex here means a panic while holding the lock; the map is
// plain inserts/removes, so the data is still coherent.
fn lock_ignoring_poison<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_first_and_last_connection_flip_presence() {
        let table = ConnectionTable::new();
        assert_eq!(table.presence("u1"), PresenceStatus::Offline);

        assert!(table.register("u1", "c1"));
        assert_eq!(table.presence("u1"), PresenceStatus::Online);

        assert!(table.unregister("u1", "c1"));
        assert_eq!(table.presence("u1"), PresenceStatus::Offline);
    }

    #[test]
    fn test_second_device_does_not_flip_presence() {
        let table = ConnectionTable::new();
        assert!(table.register("u1", "phone"));
        assert!(!table.register("u1", "laptop"));

        // Still online after one device drops.
        assert!(!table.unregister("u1", "phone"));
        assert_eq!(table.presence("u1"), PresenceStatus::Online);

        assert!(table.unregister("u1", "laptop"));
        assert_eq!(table.presence("u1"), PresenceStatus::Offline);
    }

    #[test]
    fn test_unregister_unknown_is_noop() {
        let table = ConnectionTable::new();
        assert!(!table.unregister("ghost", "c1"));
    }

    #[test]
    fn test_connection_count() {
        let table = ConnectionTable::new();
        table.register("u1", "c1");
        table.register("u1", "c2");
        table.register("u2", "c3");
        assert_eq!(table.connection_count(), 3);
    }
}
