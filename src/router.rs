//! Message routing: validate, persist, then deliver.
//!
//! Persistence is the durability point. Nothing is delivered unless the
//! message was stored, and every recipient sees the stored record (id and
//! timestamp included), the sender's echo too. Participants who are offline
//! pick the message up from `request_chat_history`; nothing is queued for them.

use tracing::{debug, info};

use crate::error::{RelayError, Result};
use crate::model::{self, Chat, Message};
use crate::protocol::{ChatMessage, HistoryTarget, SendMessagePayload, ServerEvent};
use crate::registry::ConnectionId;
use crate::relay::RelayState;

/// Identity bound to `connection`. Never taken from client payloads.
pub async fn require_user(state: &RelayState, connection: ConnectionId) -> Result<String> {
    state
        .hub
        .resolve_user(connection)
        .await
        .ok_or(RelayError::Unauthenticated)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn target_user(value: Option<String>) -> Result<Option<String>> {
    match non_empty(value) {
        Some(target) if !model::is_valid_user_id(&target) => Err(RelayError::InvalidPayload(format!(
            "targetUserId must not contain '{}'",
            model::CHAT_ID_SEPARATOR
        ))),
        target => Ok(target),
    }
}

/// The chat `chat_id` refers to: its stored record, or the direct chat a
/// canonical pair id names before its first message.
fn effective_chat(stored: Option<Chat>, chat_id: &str) -> Option<Chat> {
    stored.or_else(|| model::direct_participants(chat_id).map(|(a, b)| Chat::direct(a, b)))
}

/// Private chats are only visible to their participants. Public rooms, and
/// other rooms without a record, are open to every registered user.
fn check_access(chat: Option<&Chat>, user_id: &str, chat_id: &str) -> Result<()> {
    match chat {
        Some(chat) if chat.is_private && !chat.has_participant(user_id) => {
            Err(RelayError::NotFound(format!("chat '{chat_id}'")))
        }
        _ => Ok(()),
    }
}

/// Route a chat message from `sender_connection`.
pub async fn send_message(
    state: &RelayState,
    sender_connection: ConnectionId,
    payload: SendMessagePayload,
) -> Result<ChatMessage> {
    let sender_id = require_user(state, sender_connection).await?;

    if payload.message.trim().is_empty() {
        return Err(RelayError::InvalidPayload("message must not be empty".to_string()));
    }
    let content = payload.message;

    let (chat_id, stored) = match (target_user(payload.target_user_id)?, non_empty(payload.chat_id)) {
        (Some(target), _) => {
            let chat_id = model::chat_id(&sender_id, &target);
            let stored = state.store.get_chat(&chat_id)?;
            if let Some(chat) = &stored {
                if !(chat.is_private && chat.has_participant(&sender_id) && chat.has_participant(&target)) {
                    return Err(RelayError::Conflict(format!("chat id '{chat_id}' is already in use")));
                }
            }
            (chat_id, stored)
        }
        (None, Some(chat_id)) => {
            let stored = state.store.get_chat(&chat_id)?;
            (chat_id, stored)
        }
        (None, None) => {
            return Err(RelayError::InvalidPayload("chatId must not be empty".to_string()));
        }
    };
    let is_new = stored.is_none();
    let chat = effective_chat(stored, &chat_id);
    check_access(chat.as_ref(), &sender_id, &chat_id)?;

    let sender_name = state
        .store
        .get_user(&sender_id)?
        .map(|u| u.name)
        .unwrap_or_else(|| sender_id.clone());

    let stored = match chat.as_ref().filter(|c| is_new && c.is_private) {
        Some(chat) => state.store.insert_message_creating_chat(chat, &sender_id, &content)?,
        None => state.store.insert_message(&chat_id, &sender_id, &content)?,
    };
    let message = ChatMessage::new(stored, sender_name);

    // Only the participants' current connections may hear a private chat,
    // and both of them do without an explicit join.
    if let Some(chat) = chat.as_ref().filter(|c| c.is_private) {
        let evicted = state.hub.restrict_room(&chat_id, &chat.participants).await;
        if evicted > 0 {
            info!(chat = %chat_id, evicted, "removed non-participants from private chat");
        }
    }

    let event = ServerEvent::NewMessage(message.clone());
    let delivered = state
        .hub
        .broadcast(&chat_id, &event, Some(sender_connection))
        .await;
    state.hub.send_to(sender_connection, event).await;

    info!(chat = %chat_id, sender = %sender_id, id = message.id, delivered, "message routed");
    Ok(message)
}

/// Full stored log of a chat, oldest first.
///
/// Returns the resolved chat id alongside the messages.
pub async fn request_chat_history(
    state: &RelayState,
    connection: ConnectionId,
    target: HistoryTarget,
) -> Result<(String, Vec<Message>)> {
    let user_id = require_user(state, connection).await?;

    let chat_id = match target {
        HistoryTarget::Chat(chat_id) => non_empty(Some(chat_id))
            .ok_or_else(|| RelayError::InvalidPayload("chatId must not be empty".to_string()))?,
        HistoryTarget::User { target_user_id } => {
            let target = target_user(Some(target_user_id))?.ok_or_else(|| {
                RelayError::InvalidPayload("targetUserId must not be empty".to_string())
            })?;
            model::chat_id(&user_id, &target)
        }
    };

    let chat = effective_chat(state.store.get_chat(&chat_id)?, &chat_id);
    check_access(chat.as_ref(), &user_id, &chat_id)?;

    let messages = state.store.chat_messages(&chat_id)?;
    debug!(chat = %chat_id, user = %user_id, count = messages.len(), "chat history served");
    Ok((chat_id, messages))
}

/// Subscribe the caller's connection to `room_id`. Idempotent.
///
/// Direct chats are refused to non-participants even before their record exists.
pub async fn join_room(state: &RelayState, connection: ConnectionId, room_id: &str) -> Result<()> {
    let user_id = require_user(state, connection).await?;
    let room_id = non_empty(Some(room_id.to_string()))
        .ok_or_else(|| RelayError::InvalidPayload("roomId must not be empty".to_string()))?;
    let chat = effective_chat(state.store.get_chat(&room_id)?, &room_id);
    check_access(chat.as_ref(), &user_id, &room_id)?;

    if state.hub.join(connection, &room_id).await {
        debug!(%connection, room = %room_id, "joined room");
    }
    Ok(())
}

/// Unsubscribe the caller's connection from `room_id`. Leaving a room the
/// connection is not in is a no-op.
pub async fn leave_room(state: &RelayState, connection: ConnectionId, room_id: &str) -> Result<()> {
    require_user(state, connection).await?;
    if state.hub.leave(connection, room_id.trim()).await {
        debug!(%connection, room = %room_id, "left room");
    }
    Ok(())
}

/// Chats visible to the caller: their private chats and every public room.
pub async fn list_chats(state: &RelayState, connection: ConnectionId) -> Result<Vec<Chat>> {
    let user_id = require_user(state, connection).await?;
    Ok(state.store.chats_for_user(&user_id)?)
}
