//! Bidirectional binding between user ids and live connections.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Opaque handle for one live WebSocket link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0.simple())
    }
}

/// Outcome of [`ConnectionRegistry::register`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Older connection that was bound to the same user and is no longer addressable.
    pub superseded: Option<ConnectionId>,
    /// User previously bound to this same connection, now released.
    pub released_user: Option<String>,
}

/// user id ↔ connection map.
///
/// Holds at most one connection per user and one user per connection.
/// Not synchronised on its own; the hub owns it behind its lock.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    by_user: HashMap<String, ConnectionId>,
    by_connection: HashMap<ConnectionId, String>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `user_id` to `connection`, superseding any older binding.
    ///
    /// The superseded connection stays open; it just stops resolving to the user.
    pub fn register(&mut self, user_id: &str, connection: ConnectionId) -> Registration {
        let mut outcome = Registration::default();

        if let Some(previous) = self.by_connection.get(&connection) {
            if previous != user_id {
                let previous = previous.clone();
                self.by_user.remove(&previous);
                outcome.released_user = Some(previous);
            }
        }

        if let Some(old) = self.by_user.insert(user_id.to_string(), connection) {
            if old != connection {
                self.by_connection.remove(&old);
                outcome.superseded = Some(old);
            }
        }
        self.by_connection.insert(connection, user_id.to_string());
        outcome
    }

    /// Drop the binding of `connection` if it is still the user's current one.
    ///
    /// Returns the user that went offline. A stale connection whose user has
    /// since reconnected elsewhere is a no-op.
    pub fn unregister(&mut self, connection: ConnectionId) -> Option<String> {
        let user_id = self.by_connection.remove(&connection)?;
        if self.by_user.get(&user_id) == Some(&connection) {
            self.by_user.remove(&user_id);
            Some(user_id)
        } else {
            None
        }
    }

    pub fn resolve_connection(&self, user_id: &str) -> Option<ConnectionId> {
        self.by_user.get(user_id).copied()
    }

    pub fn resolve_user(&self, connection: ConnectionId) -> Option<&str> {
        self.by_connection.get(&connection).map(String::as_str)
    }

    /// Every user with a live binding, sorted.
    pub fn online_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.by_user.keys().cloned().collect();
        users.sort();
        users
    }

    pub fn len(&self) -> usize {
        self.by_user.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_user.is_empty()
    }
}
