//! Room membership: which connections are subscribed to which rooms.

use std::collections::{BTreeSet, HashMap};

use crate::registry::ConnectionId;

/// Two-way room index. Empty rooms are dropped.
#[derive(Debug, Default)]
pub struct RoomMembership {
    rooms: HashMap<String, BTreeSet<ConnectionId>>,
    by_connection: HashMap<ConnectionId, BTreeSet<String>>,
}

impl RoomMembership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `connection` to `room_id`. Returns false if it already was.
    pub fn join(&mut self, connection: ConnectionId, room_id: &str) -> bool {
        let added = self
            .rooms
            .entry(room_id.to_string())
            .or_default()
            .insert(connection);
        self.by_connection
            .entry(connection)
            .or_default()
            .insert(room_id.to_string());
        added
    }

    /// Unsubscribe. Returns false if the connection was not a member.
    pub fn leave(&mut self, connection: ConnectionId, room_id: &str) -> bool {
        let removed = match self.rooms.get_mut(room_id) {
            Some(members) => {
                let removed = members.remove(&connection);
                if members.is_empty() {
                    self.rooms.remove(room_id);
                }
                removed
            }
            None => false,
        };
        if let Some(joined) = self.by_connection.get_mut(&connection) {
            joined.remove(room_id);
            if joined.is_empty() {
                self.by_connection.remove(&connection);
            }
        }
        removed
    }

    /// Remove `connection` from every room. Returns the rooms it left.
    pub fn leave_all(&mut self, connection: ConnectionId) -> Vec<String> {
        let Some(joined) = self.by_connection.remove(&connection) else {
            return Vec::new();
        };
        for room_id in &joined {
            if let Some(members) = self.rooms.get_mut(room_id) {
                members.remove(&connection);
                if members.is_empty() {
                    self.rooms.remove(room_id);
                }
            }
        }
        joined.into_iter().collect()
    }

    /// Members of `room_id` except `exclude`.
    pub fn recipients(&self, room_id: &str, exclude: Option<ConnectionId>) -> Vec<ConnectionId> {
        self.rooms
            .get(room_id)
            .map(|members| {
                members
                    .iter()
                    .copied()
                    .filter(|c| Some(*c) != exclude)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_member(&self, connection: ConnectionId, room_id: &str) -> bool {
        self.rooms
            .get(room_id)
            .is_some_and(|members| members.contains(&connection))
    }

    /// Rooms `connection` is subscribed to, sorted.
    pub fn rooms_of(&self, connection: ConnectionId) -> Vec<String> {
        self.by_connection
            .get(&connection)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
