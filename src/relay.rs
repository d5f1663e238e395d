//! Core relay logic: connection lifecycle and event dispatch.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::{RelayError, Result, StorageError};
use crate::friends;
use crate::hub::Hub;
use crate::model::{self, Chat, GENERAL_ROOM, User};
use crate::presence;
use crate::protocol::{ClientEvent, RegisterPayload, ServerEvent};
use crate::registry::ConnectionId;
use crate::router::{self, require_user};
use crate::storage::Store;

/// Shared relay state.
pub struct RelayState {
    /// Live connections, bindings and room membership.
    pub hub: Hub,
    /// Durable users, chats, messages and friendships.
    pub store: Arc<dyn Store>,
}

impl RelayState {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { hub: Hub::new(), store }
    }

    /// Build the state and make sure the default public room exists.
    pub fn open(store: Arc<dyn Store>) -> std::result::Result<Self, StorageError> {
        store.ensure_chat(&Chat::public(GENERAL_ROOM))?;
        Ok(Self::new(store))
    }

    /// Push a fresh presence snapshot to everyone. Failures are logged only;
    /// the binding change that triggered it has already happened.
    pub async fn publish_presence(&self) {
        if let Err(e) = presence::publish(&self.hub, self.store.as_ref()).await {
            error!("Presence publish failed: {e}");
        }
    }
}

/// Drive one WebSocket from upgrade to close.
pub async fn handle_connection(socket: WebSocket, state: Arc<RelayState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (connection, mut outbound_rx) = state.hub.attach().await;
    info!(%connection, "connection opened");

    // Drain this connection's queue onto the socket.
    let mut send_task = tokio::spawn(async move {
        while let Some(event) = outbound_rx.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    error!(%connection, "Failed to encode outbound event: {e}");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // Inbound frames are handled one at a time, in arrival order.
    let recv_state = state.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                Message::Text(text) => handle_frame(&recv_state, connection, text.as_str()).await,
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    if let Some(user_id) = state.hub.disconnect(connection).await {
        info!(%connection, user = %user_id, "user went offline");
        state.publish_presence().await;
    }
    info!(%connection, "connection closed");
}

/// Decode and dispatch one text frame. Any failure becomes a `chat_error`
/// for this connection only.
pub async fn handle_frame(state: &RelayState, connection: ConnectionId, text: &str) {
    let outcome = match serde_json::from_str::<ClientEvent>(text) {
        Ok(event) => dispatch(state, connection, event).await,
        Err(e) => Err(RelayError::InvalidPayload(e.to_string())),
    };
    if let Err(err) = outcome {
        match &err {
            RelayError::Persistence(e) => error!(%connection, "Storage failure: {e}"),
            other => warn!(%connection, "Request refused: {other}"),
        }
        state
            .hub
            .send_to(connection, ServerEvent::ChatError { reason: err.client_reason() })
            .await;
    }
}

async fn dispatch(state: &RelayState, connection: ConnectionId, event: ClientEvent) -> Result<()> {
    match event {
        ClientEvent::Register(payload) => register(state, connection, payload).await,
        ClientEvent::JoinRoom(room_id) => router::join_room(state, connection, &room_id).await,
        ClientEvent::LeaveRoom(room_id) => router::leave_room(state, connection, &room_id).await,
        ClientEvent::SendMessage(payload) => {
            router::send_message(state, connection, payload).await?;
            Ok(())
        }
        ClientEvent::RequestChatHistory(target) => {
            let (chat_id, messages) = router::request_chat_history(state, connection, target).await?;
            state
                .hub
                .send_to(connection, ServerEvent::ChatHistory { chat_id, messages })
                .await;
            Ok(())
        }
        ClientEvent::SendFriendRequest(receiver_id) => {
            let me = require_user(state, connection).await?;
            friends::send_request(state, &me, &receiver_id).await?;
            Ok(())
        }
        ClientEvent::AcceptFriendRequest(sender_id) => {
            let me = require_user(state, connection).await?;
            friends::accept_request(state, &sender_id, &me).await
        }
        ClientEvent::RejectFriendRequest(sender_id) => {
            let me = require_user(state, connection).await?;
            friends::reject_request(state, &sender_id, &me).await
        }
        ClientEvent::RemoveFriend(friend_id) => {
            let me = require_user(state, connection).await?;
            friends::remove_friend(state, &me, &friend_id).await?;
            Ok(())
        }
        ClientEvent::RequestFriends => {
            let me = require_user(state, connection).await?;
            let friends = friends::list_friends(state, &me).await?;
            state.hub.send_to(connection, ServerEvent::FriendList { friends }).await;
            Ok(())
        }
        ClientEvent::RequestFriendRequests => {
            let me = require_user(state, connection).await?;
            let (incoming, outgoing) = friends::list_requests(state, &me).await?;
            state
                .hub
                .send_to(connection, ServerEvent::FriendRequests { incoming, outgoing })
                .await;
            Ok(())
        }
        ClientEvent::RequestChats => {
            let chats = router::list_chats(state, connection).await?;
            state.hub.send_to(connection, ServerEvent::ChatList { chats }).await;
            Ok(())
        }
    }
}

/// Bind the claimed identity to `connection`.
///
/// The user record is upserted, the connection joins `general` plus every
/// chat the user belongs to, and everyone gets a fresh presence snapshot.
async fn register(state: &RelayState, connection: ConnectionId, payload: RegisterPayload) -> Result<()> {
    let id = payload.id.trim();
    if id.is_empty() {
        return Err(RelayError::InvalidPayload("id must not be empty".to_string()));
    }
    if !model::is_valid_user_id(id) {
        return Err(RelayError::InvalidPayload(format!(
            "id must not contain '{}'",
            model::CHAT_ID_SEPARATOR
        )));
    }
    let name = match payload.name.trim() {
        "" => id,
        name => name,
    };
    let user = User { id: id.to_string(), name: name.to_string() };

    state.store.upsert_user(&user)?;
    let mut rooms: Vec<String> = state
        .store
        .chats_for_user(&user.id)?
        .into_iter()
        .map(|chat| chat.id)
        .collect();
    if !rooms.iter().any(|r| r == GENERAL_ROOM) {
        rooms.push(GENERAL_ROOM.to_string());
    }

    let Some(registration) = state.hub.register(&user.id, connection, &rooms).await else {
        debug!(%connection, "register on a closed connection ignored");
        return Ok(());
    };
    if let Some(old) = registration.superseded {
        info!(user = %user.id, %old, new = %connection, "binding moved to newer connection");
    }
    if let Some(released) = registration.released_user {
        info!(%connection, user = %released, "connection switched identity");
    }

    info!(%connection, user = %user.id, rooms = rooms.len(), "user registered");
    state.hub.send_to(connection, ServerEvent::Registered { user }).await;
    state.publish_presence().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::OutboundRx;
    use crate::storage::SqliteStore;

    fn relay() -> (RelayState, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        (RelayState::open(store.clone()).unwrap(), store)
    }

    fn drain(rx: &mut OutboundRx) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn chat_errors(events: &[ServerEvent]) -> Vec<&str> {
        events
            .iter()
            .filter_map(|e| match e {
                ServerEvent::ChatError { reason } => Some(reason.as_str()),
                _ => None,
            })
            .collect()
    }

    async fn registered(state: &RelayState, id: &str) -> (ConnectionId, OutboundRx) {
        let (conn, mut rx) = state.hub.attach().await;
        let frame = format!(r#"{{"event":"register","data":{{"id":"{id}","name":"{id}"}}}}"#);
        handle_frame(state, conn, &frame).await;
        drain(&mut rx);
        (conn, rx)
    }

    #[tokio::test]
    async fn register_acks_and_publishes_presence_to_everyone() {
        let (state, store) = relay();
        let (_anon, mut rx_anon) = state.hub.attach().await;
        let (conn, mut rx) = state.hub.attach().await;

        handle_frame(&state, conn, r#"{"event":"register","data":{"id":"ann","name":"Ann"}}"#).await;

        let events = drain(&mut rx);
        assert_eq!(
            events[0],
            ServerEvent::Registered { user: User { id: "ann".into(), name: "Ann".into() } }
        );
        let ServerEvent::OnlineUsers(snap) = &events[1] else {
            panic!("expected presence snapshot, got {:?}", events[1]);
        };
        assert!(snap.is_online("ann"));

        let anon = drain(&mut rx_anon);
        assert!(matches!(&anon[..], [ServerEvent::OnlineUsers(s)] if s.is_online("ann")));

        assert_eq!(store.get_user("ann").unwrap().unwrap().name, "Ann");
        assert_eq!(state.hub.rooms_of(conn).await, vec![GENERAL_ROOM]);
    }

    #[tokio::test]
    async fn register_joins_stored_private_chats() {
        let (state, store) = relay();
        store.ensure_chat(&Chat::direct("ann", "bob")).unwrap();

        let (conn, _rx) = registered(&state, "ann").await;
        assert_eq!(state.hub.rooms_of(conn).await, vec!["ann-bob", GENERAL_ROOM]);
    }

    #[tokio::test]
    async fn blank_name_defaults_to_id() {
        let (state, store) = relay();
        let (conn, _rx) = state.hub.attach().await;
        handle_frame(&state, conn, r#"{"event":"user_connect","data":{"id":"zed"}}"#).await;
        assert_eq!(store.get_user("zed").unwrap().unwrap().name, "zed");
    }

    #[tokio::test]
    async fn ids_with_the_chat_separator_are_refused() {
        let (state, store) = relay();
        let (conn, mut rx) = state.hub.attach().await;

        handle_frame(&state, conn, r#"{"event":"register","data":{"id":"a-b","name":"Dash"}}"#).await;

        let events = drain(&mut rx);
        assert_eq!(chat_errors(&events), vec!["invalid payload: id must not contain '-'"]);
        assert_eq!(state.hub.resolve_user(conn).await, None);
        assert_eq!(store.get_user("a-b").unwrap(), None);
    }

    #[tokio::test]
    async fn undecodable_frame_gets_invalid_payload() {
        let (state, _store) = relay();
        let (conn, mut rx) = state.hub.attach().await;

        handle_frame(&state, conn, "not json").await;
        handle_frame(&state, conn, r#"{"event":"fly_to_moon"}"#).await;

        let events = drain(&mut rx);
        let reasons = chat_errors(&events);
        assert_eq!(reasons.len(), 2);
        assert!(reasons.iter().all(|r| r.starts_with("invalid payload")));
    }

    #[tokio::test]
    async fn unbound_connection_cannot_send() {
        let (state, store) = relay();
        let (conn, mut rx) = state.hub.attach().await;

        handle_frame(
            &state,
            conn,
            r#"{"event":"send_message","data":{"chatId":"general","message":"hi"}}"#,
        )
        .await;

        let events = drain(&mut rx);
        assert_eq!(chat_errors(&events), vec!["please register your user id first"]);
        assert!(store.chat_messages(GENERAL_ROOM).unwrap().is_empty());
    }

    #[tokio::test]
    async fn storage_failure_yields_one_generic_error() {
        let (state, store) = relay();
        let (a, mut rxa) = registered(&state, "ann").await;
        let (_b, mut rxb) = registered(&state, "bob").await;
        drain(&mut rxa);
        store.execute_raw("DROP TABLE messages").unwrap();

        handle_frame(
            &state,
            a,
            r#"{"event":"send_message","data":{"chatId":"general","message":"hi"}}"#,
        )
        .await;

        assert_eq!(drain(&mut rxa), vec![ServerEvent::ChatError {
            reason: "Internal error, please try again.".into()
        }]);
        assert!(drain(&mut rxb).is_empty());
    }

    #[tokio::test]
    async fn history_and_lists_are_unicast() {
        let (state, _store) = relay();
        let (a, mut rxa) = registered(&state, "ann").await;
        let (_b, mut rxb) = registered(&state, "bob").await;
        drain(&mut rxa);

        handle_frame(
            &state,
            a,
            r#"{"event":"send_message","data":{"targetUserId":"bob","message":"yo"}}"#,
        )
        .await;
        drain(&mut rxa);
        drain(&mut rxb);

        handle_frame(&state, a, r#"{"event":"request_chat_history","data":"ann-bob"}"#).await;
        handle_frame(&state, a, r#"{"event":"request_chats"}"#).await;
        handle_frame(&state, a, r#"{"event":"request_friends"}"#).await;

        let events = drain(&mut rxa);
        assert!(matches!(&events[0], ServerEvent::ChatHistory { chat_id, messages }
            if chat_id == "ann-bob" && messages.len() == 1));
        assert!(matches!(&events[1], ServerEvent::ChatList { chats } if chats.len() == 2));
        assert_eq!(events[2], ServerEvent::FriendList { friends: vec![] });
        assert!(drain(&mut rxb).is_empty());
    }

    #[tokio::test]
    async fn friend_events_use_bound_identity() {
        let (state, store) = relay();
        let (a, mut rxa) = registered(&state, "ann").await;
        let (b, mut rxb) = registered(&state, "bob").await;
        drain(&mut rxa);

        handle_frame(&state, a, r#"{"event":"send_friend_request","data":"bob"}"#).await;
        handle_frame(&state, b, r#"{"event":"request_friend_requests"}"#).await;
        let events = drain(&mut rxb);
        assert!(matches!(&events[0], ServerEvent::FriendRequestReceived { sender } if sender.id == "ann"));
        assert!(matches!(&events[1], ServerEvent::FriendRequests { incoming, outgoing }
            if incoming.len() == 1 && outgoing.is_empty()));

        handle_frame(&state, b, r#"{"event":"accept_friend_request","data":"ann"}"#).await;
        assert!(store.are_friends("ann", "bob").unwrap());

        handle_frame(&state, a, r#"{"event":"remove_friend","data":"bob"}"#).await;
        assert!(!store.are_friends("ann", "bob").unwrap());
        assert!(chat_errors(&drain(&mut rxa)).is_empty());
    }

    #[tokio::test]
    async fn disconnect_then_publish_marks_user_offline() {
        let (state, _store) = relay();
        let (a, _rxa) = registered(&state, "ann").await;
        let (_b, mut rxb) = registered(&state, "bob").await;

        assert_eq!(state.hub.disconnect(a).await.as_deref(), Some("ann"));
        state.publish_presence().await;

        let events = drain(&mut rxb);
        let Some(ServerEvent::OnlineUsers(snap)) = events.last() else {
            panic!("expected presence snapshot");
        };
        assert!(!snap.is_online("ann"));
        assert!(snap.is_online("bob"));
    }
}
