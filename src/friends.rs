//! Friend request workflow: request, accept or reject, remove.
//!
//! Every transition is persisted first; notifications go only to parties
//! that are online at that moment. Offline parties see the outcome through
//! `list_friends` and `list_requests` after they register again.

use tracing::info;

use crate::error::{RelayError, Result};
use crate::model::{FriendRequest, User};
use crate::protocol::{PresenceEntry, ServerEvent};
use crate::relay::RelayState;

fn other_party(value: &str, field: &str, self_id: &str) -> Result<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(RelayError::InvalidPayload(format!("{field} must not be empty")));
    }
    if value == self_id {
        return Err(RelayError::InvalidPayload(format!("{field} must not be yourself")));
    }
    Ok(value.to_string())
}

fn profile(state: &RelayState, user_id: &str) -> Result<User> {
    Ok(state.store.get_user(user_id)?.unwrap_or_else(|| User {
        id: user_id.to_string(),
        name: user_id.to_string(),
    }))
}

fn no_pending(sender_id: &str) -> RelayError {
    RelayError::NotFound(format!("no pending friend request from '{sender_id}'"))
}

/// Record a pending request from `sender_id` to `receiver_id`.
///
/// The receiver gets `friend_request_received` if online; the sender gets
/// `friend_request_sent_success`.
pub async fn send_request(state: &RelayState, sender_id: &str, receiver_id: &str) -> Result<FriendRequest> {
    let receiver_id = other_party(receiver_id, "receiverId", sender_id)?;

    if state.store.get_user(&receiver_id)?.is_none() {
        return Err(RelayError::NotFound(format!("user '{receiver_id}'")));
    }
    if state.store.are_friends(sender_id, &receiver_id)? {
        return Err(RelayError::Conflict(format!("already friends with '{receiver_id}'")));
    }
    let request = state
        .store
        .create_friend_request(sender_id, &receiver_id)?
        .ok_or_else(|| {
            RelayError::Conflict(format!("a friend request to '{receiver_id}' is already pending"))
        })?;

    let sender = profile(state, sender_id)?;
    let notified = state
        .hub
        .send_to_user(&receiver_id, ServerEvent::FriendRequestReceived { sender })
        .await;
    state
        .hub
        .send_to_user(sender_id, ServerEvent::FriendRequestSentSuccess { receiver_id: receiver_id.clone() })
        .await;

    info!(sender = %sender_id, receiver = %receiver_id, notified, "friend request sent");
    Ok(request)
}

/// `receiver_id` accepts the pending request from `sender_id`. Both parties,
/// if online, get `friend_request_accepted` carrying the other's profile.
pub async fn accept_request(state: &RelayState, sender_id: &str, receiver_id: &str) -> Result<()> {
    let sender_id = other_party(sender_id, "senderId", receiver_id)?;
    let pending = state
        .store
        .pending_request(&sender_id, receiver_id)?
        .ok_or_else(|| no_pending(&sender_id))?;
    if !state.store.accept_friend_request(pending.id)? {
        return Err(no_pending(&sender_id));
    }

    let sender = profile(state, &sender_id)?;
    let receiver = profile(state, receiver_id)?;
    state
        .hub
        .send_to_user(&sender_id, ServerEvent::FriendRequestAccepted { friend: receiver })
        .await;
    state
        .hub
        .send_to_user(receiver_id, ServerEvent::FriendRequestAccepted { friend: sender })
        .await;

    info!(sender = %sender_id, receiver = %receiver_id, "friend request accepted");
    Ok(())
}

/// `receiver_id` declines the pending request from `sender_id`. The sender
/// may ask again afterwards.
pub async fn reject_request(state: &RelayState, sender_id: &str, receiver_id: &str) -> Result<()> {
    let sender_id = other_party(sender_id, "senderId", receiver_id)?;
    let pending = state
        .store
        .pending_request(&sender_id, receiver_id)?
        .ok_or_else(|| no_pending(&sender_id))?;
    if !state.store.reject_friend_request(pending.id)? {
        return Err(no_pending(&sender_id));
    }

    state
        .hub
        .send_to_user(
            &sender_id,
            ServerEvent::FriendRequestRejected { receiver_id: receiver_id.to_string() },
        )
        .await;

    info!(sender = %sender_id, receiver = %receiver_id, "friend request rejected");
    Ok(())
}

/// Dissolve the friendship between `user_id` and `friend_id`, in either
/// stored order. Returns false if they were not friends.
pub async fn remove_friend(state: &RelayState, user_id: &str, friend_id: &str) -> Result<bool> {
    let friend_id = other_party(friend_id, "friendId", user_id)?;
    let removed = state.store.remove_friendship(user_id, &friend_id)?;
    if removed {
        state
            .hub
            .send_to_user(user_id, ServerEvent::FriendRemoved { friend_id: friend_id.clone() })
            .await;
        state
            .hub
            .send_to_user(&friend_id, ServerEvent::FriendRemoved { friend_id: user_id.to_string() })
            .await;
        info!(user = %user_id, friend = %friend_id, "friendship removed");
    }
    Ok(removed)
}

/// Friends of `user_id`, each with current online state.
pub async fn list_friends(state: &RelayState, user_id: &str) -> Result<Vec<PresenceEntry>> {
    let friends = state.store.friends_of(user_id)?;
    let online = state.hub.online_users().await;
    Ok(friends
        .into_iter()
        .map(|u| PresenceEntry {
            online: online.binary_search(&u.id).is_ok(),
            id: u.id,
            name: u.name,
        })
        .collect())
}

/// Pending requests involving `user_id`, split into (incoming, outgoing).
pub async fn list_requests(state: &RelayState, user_id: &str) -> Result<(Vec<FriendRequest>, Vec<FriendRequest>)> {
    Ok(state
        .store
        .pending_requests_for(user_id)?
        .into_iter()
        .partition(|r| r.receiver_id == user_id))
}
