//! Persistent record types shared by the storage facade and the workflows.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The shared room every registered connection joins.
pub const GENERAL_ROOM: &str = "general";

/// Separator used when deriving a direct-chat id from two user ids.
pub const CHAT_ID_SEPARATOR: char = '-';

/// Canonical id for the two-party chat between `a` and `b`.
///
/// Order-independent: `chat_id(a, b) == chat_id(b, a)`.
pub fn chat_id(a: &str, b: &str) -> String {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    format!("{first}{CHAT_ID_SEPARATOR}{second}")
}

/// User ids must be non-empty and free of [`CHAT_ID_SEPARATOR`], so every
/// direct-chat id names exactly one pair.
pub fn is_valid_user_id(id: &str) -> bool {
    !id.is_empty() && !id.contains(CHAT_ID_SEPARATOR)
}

/// The two users a canonical direct-chat id belongs to, if `id` is one.
pub fn direct_participants(id: &str) -> Option<(&str, &str)> {
    let (a, b) = id.split_once(CHAT_ID_SEPARATOR)?;
    (is_valid_user_id(a) && is_valid_user_id(b) && a <= b).then_some((a, b))
}

/// A registered user. Also the public profile sent to other users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
}

/// A conversation record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: String,
    pub participants: Vec<String>,
    pub is_private: bool,
}

impl Chat {
    /// Private chat between exactly two users, keyed by [`chat_id`].
    pub fn direct(a: &str, b: &str) -> Self {
        let mut participants = vec![a.to_string(), b.to_string()];
        participants.sort();
        Self {
            id: chat_id(a, b),
            participants,
            is_private: true,
        }
    }

    /// Public room that every user may read and post to.
    pub fn public(id: &str) -> Self {
        Self {
            id: id.to_string(),
            participants: Vec::new(),
            is_private: false,
        }
    }

    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p == user_id)
    }
}

/// A persisted chat message. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: i64,
    pub chat_id: String,
    pub sender_id: String,
    pub content: String,
    /// Milliseconds since the Unix epoch, assigned by storage.
    pub timestamp: u64,
}

/// Lifecycle state of a friend request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FriendRequestStatus {
    Pending,
    Accepted,
    Rejected,
}

impl FriendRequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FriendRequestStatus::Pending => "pending",
            FriendRequestStatus::Accepted => "accepted",
            FriendRequestStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for FriendRequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FriendRequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(FriendRequestStatus::Pending),
            "accepted" => Ok(FriendRequestStatus::Accepted),
            "rejected" => Ok(FriendRequestStatus::Rejected),
            other => Err(format!("unknown friend request status '{other}'")),
        }
    }
}

/// A friend request record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendRequest {
    pub id: i64,
    pub sender_id: String,
    pub receiver_id: String,
    pub status: FriendRequestStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_id_is_symmetric() {
        let pairs = [("alice", "bob"), ("bob", "alice"), ("u1", "u10"), ("x", "x"), ("", "z")];
        for (a, b) in pairs {
            assert_eq!(chat_id(a, b), chat_id(b, a), "chat_id({a}, {b})");
        }
        assert_eq!(chat_id("bob", "alice"), "alice-bob");
    }

    #[test]
    fn direct_chat_uses_canonical_id() {
        let chat = Chat::direct("zoe", "adam");
        assert_eq!(chat.id, "adam-zoe");
        assert_eq!(chat.participants, vec!["adam", "zoe"]);
        assert!(chat.is_private);
        assert!(chat.has_participant("zoe"));
        assert!(!chat.has_participant("eve"));
    }

    #[test]
    fn user_ids_cannot_carry_the_separator() {
        assert!(is_valid_user_id("alice"));
        assert!(!is_valid_user_id(""));
        assert!(!is_valid_user_id("a-b"));
    }

    #[test]
    fn direct_participants_only_match_canonical_pairs() {
        assert_eq!(direct_participants("alice-bob"), Some(("alice", "bob")));
        assert_eq!(direct_participants(&chat_id("zoe", "adam")), Some(("adam", "zoe")));
        assert_eq!(direct_participants("bob-alice"), None);
        assert_eq!(direct_participants("a-b-c"), None);
        assert_eq!(direct_participants("-b"), None);
        assert_eq!(direct_participants("general"), None);
    }

    #[test]
    fn status_parses_only_known_values() {
        for status in [
            FriendRequestStatus::Pending,
            FriendRequestStatus::Accepted,
            FriendRequestStatus::Rejected,
        ] {
            assert_eq!(status.as_str().parse::<FriendRequestStatus>(), Ok(status));
        }
        assert!("PENDING".parse::<FriendRequestStatus>().is_err());
        assert!("blocked".parse::<FriendRequestStatus>().is_err());
    }
}
