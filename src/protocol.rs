//! Wire events exchanged over the relay WebSocket.
//!
//! Every frame is a JSON text message of the form
//! `{"event": "<name>", "data": <payload>}`. Events without a payload omit
//! `data`.

use serde::{Deserialize, Serialize};

use crate::model::{Chat, FriendRequest, Message, User};

/// Identity claimed by a connection on `register`.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterPayload {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// Body of `send_message`. Either `chatId` or `targetUserId` names the chat.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    #[serde(default)]
    pub chat_id: Option<String>,
    #[serde(default)]
    pub target_user_id: Option<String>,
    #[serde(alias = "content")]
    pub message: String,
}

/// Which chat a history request refers to.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum HistoryTarget {
    Chat(String),
    #[serde(rename_all = "camelCase")]
    User { target_user_id: String },
}

/// Events sent by clients.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    #[serde(alias = "user_connect")]
    Register(RegisterPayload),
    JoinRoom(String),
    LeaveRoom(String),
    SendMessage(SendMessagePayload),
    RequestChatHistory(HistoryTarget),
    SendFriendRequest(String),
    AcceptFriendRequest(String),
    RejectFriendRequest(String),
    RemoveFriend(String),
    RequestFriends,
    RequestFriendRequests,
    RequestChats,
}

/// One roster entry in a presence snapshot or friend list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub id: String,
    pub name: String,
    pub online: bool,
}

/// Full roster annotated with online state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceSnapshot {
    pub users: Vec<PresenceEntry>,
    /// Ids of the users with a live binding, sorted.
    pub online: Vec<String>,
}

impl PresenceSnapshot {
    pub fn is_online(&self, user_id: &str) -> bool {
        self.online.iter().any(|id| id == user_id)
    }
}

/// A persisted message as delivered to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: i64,
    pub chat_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    pub timestamp: u64,
}

impl ChatMessage {
    pub fn new(message: Message, sender_name: String) -> Self {
        Self {
            id: message.id,
            chat_id: message.chat_id,
            sender_id: message.sender_id,
            sender_name,
            content: message.content,
            timestamp: message.timestamp,
        }
    }
}

/// Events sent by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// Acknowledges `register` with the bound profile.
    Registered { user: User },
    OnlineUsers(PresenceSnapshot),
    NewMessage(ChatMessage),
    ChatHistory { chat_id: String, messages: Vec<Message> },
    ChatError { reason: String },
    FriendRequestReceived { sender: User },
    FriendRequestSentSuccess { receiver_id: String },
    /// Sent to both parties; `friend` is the other side's profile.
    FriendRequestAccepted { friend: User },
    FriendRequestRejected { receiver_id: String },
    FriendRemoved { friend_id: String },
    FriendList { friends: Vec<PresenceEntry> },
    FriendRequests { incoming: Vec<FriendRequest>, outgoing: Vec<FriendRequest> },
    ChatList { chats: Vec<Chat> },
}
