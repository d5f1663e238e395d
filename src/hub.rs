//! Shared in-memory connection state.
//!
//! The hub owns the [`ConnectionRegistry`], the [`RoomMembership`] index and
//! each connection's outbound queue behind a single `RwLock`. Every
//! registry or membership change happens inside one write section, so other
//! connections never observe a half-applied binding or a partial cleanup.
//!
//! Outbound delivery is a push onto the target connection's unbounded
//! queue; a slow socket only delays its own writer task.

use std::collections::HashMap;
use tokio::sync::{RwLock, mpsc};
use tracing::debug;

use crate::protocol::ServerEvent;
use crate::registry::{ConnectionId, ConnectionRegistry, Registration};
use crate::rooms::RoomMembership;

pub type OutboundTx = mpsc::UnboundedSender<ServerEvent>;
pub type OutboundRx = mpsc::UnboundedReceiver<ServerEvent>;

#[derive(Default)]
struct HubInner {
    registry: ConnectionRegistry,
    rooms: RoomMembership,
    outbound: HashMap<ConnectionId, OutboundTx>,
}

impl HubInner {
    fn deliver(&self, connection: ConnectionId, event: ServerEvent) -> bool {
        match self.outbound.get(&connection) {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }
}

#[derive(Default)]
pub struct Hub {
    inner: RwLock<HubInner>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a freshly opened link. The receiver yields everything
    /// addressed to the connection until [`Hub::disconnect`].
    pub async fn attach(&self) -> (ConnectionId, OutboundRx) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = ConnectionId::new();
        self.inner.write().await.outbound.insert(connection, tx);
        debug!(%connection, "connection attached");
        (connection, rx)
    }

    /// Bind `user_id` to `connection` and subscribe it to `rooms`.
    ///
    /// Returns `None` if the connection is no longer attached.
    pub async fn register(&self, user_id: &str, connection: ConnectionId, rooms: &[String]) -> Option<Registration> {
        let mut inner = self.inner.write().await;
        if !inner.outbound.contains_key(&connection) {
            return None;
        }
        let registration = inner.registry.register(user_id, connection);
        if registration.released_user.is_some() {
            inner.rooms.leave_all(connection);
        }
        // The older link stays open but must stop hearing the user's rooms.
        if let Some(old) = registration.superseded {
            inner.rooms.leave_all(old);
        }
        for room_id in rooms {
            inner.rooms.join(connection, room_id);
        }
        Some(registration)
    }

    /// Cleanup for a closed link: leave every room, release the binding if
    /// it is still current, and drop the outbound queue.
    ///
    /// Returns the user that went offline, if any.
    pub async fn disconnect(&self, connection: ConnectionId) -> Option<String> {
        let mut inner = self.inner.write().await;
        inner.rooms.leave_all(connection);
        inner.outbound.remove(&connection);
        inner.registry.unregister(connection)
    }

    pub async fn resolve_user(&self, connection: ConnectionId) -> Option<String> {
        self.inner.read().await.registry.resolve_user(connection).map(str::to_string)
    }

    pub async fn resolve_connection(&self, user_id: &str) -> Option<ConnectionId> {
        self.inner.read().await.registry.resolve_connection(user_id)
    }

    pub async fn online_users(&self) -> Vec<String> {
        self.inner.read().await.registry.online_users()
    }

    pub async fn join(&self, connection: ConnectionId, room_id: &str) -> bool {
        self.inner.write().await.rooms.join(connection, room_id)
    }

    pub async fn leave(&self, connection: ConnectionId, room_id: &str) -> bool {
        self.inner.write().await.rooms.leave(connection, room_id)
    }

    /// Make the subscribers of private room `room_id` exactly the current
    /// connections of its online `participants`.
    ///
    /// Returns how many foreign subscribers were removed.
    pub async fn restrict_room(&self, room_id: &str, participants: &[String]) -> usize {
        let mut inner = self.inner.write().await;
        let HubInner { registry, rooms, .. } = &mut *inner;

        let mut evicted = 0;
        for connection in rooms.recipients(room_id, None) {
            let allowed = registry
                .resolve_user(connection)
                .is_some_and(|user| participants.iter().any(|p| p == user));
            if !allowed {
                rooms.leave(connection, room_id);
                evicted += 1;
            }
        }
        for user_id in participants {
            if let Some(connection) = registry.resolve_connection(user_id) {
                rooms.join(connection, room_id);
            }
        }
        evicted
    }

    pub async fn rooms_of(&self, connection: ConnectionId) -> Vec<String> {
        self.inner.read().await.rooms.rooms_of(connection)
    }

    /// Deliver `event` to every subscriber of `room_id` except `exclude`.
    /// Returns how many queues accepted it.
    pub async fn broadcast(&self, room_id: &str, event: &ServerEvent, exclude: Option<ConnectionId>) -> usize {
        let inner = self.inner.read().await;
        inner
            .rooms
            .recipients(room_id, exclude)
            .into_iter()
            .filter(|c| inner.deliver(*c, event.clone()))
            .count()
    }

    pub async fn send_to(&self, connection: ConnectionId, event: ServerEvent) -> bool {
        self.inner.read().await.deliver(connection, event)
    }

    /// Deliver to the user's current connection. False if the user is offline.
    pub async fn send_to_user(&self, user_id: &str, event: ServerEvent) -> bool {
        let inner = self.inner.read().await;
        match inner.registry.resolve_connection(user_id) {
            Some(connection) => inner.deliver(connection, event),
            None => false,
        }
    }

    /// Build an event from the current online set and deliver it to every
    /// attached connection, registered or not.
    ///
    /// The online set is read and the event enqueued under the same lock, so
    /// the last event a connection receives reflects the latest registry state.
    pub async fn publish_to_all<F>(&self, build: F) -> usize
    where
        F: FnOnce(&[String]) -> ServerEvent,
    {
        let inner = self.inner.read().await;
        let online = inner.registry.online_users();
        let event = build(&online);
        inner
            .outbound
            .values()
            .filter(|tx| tx.send(event.clone()).is_ok())
            .count()
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.outbound.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::GENERAL_ROOM;

    fn error(reason: &str) -> ServerEvent {
        ServerEvent::ChatError { reason: reason.to_string() }
    }

    fn general() -> Vec<String> {
        vec![GENERAL_ROOM.to_string()]
    }

    #[tokio::test]
    async fn register_resolves_and_joins_rooms() {
        let hub = Hub::new();
        let (c, _rx) = hub.attach().await;

        hub.register("alice", c, &general()).await.unwrap();
        assert_eq!(hub.resolve_connection("alice").await, Some(c));
        assert_eq!(hub.resolve_user(c).await.as_deref(), Some("alice"));
        assert_eq!(hub.rooms_of(c).await, general());
    }

    #[tokio::test]
    async fn register_after_disconnect_is_refused() {
        let hub = Hub::new();
        let (c, _rx) = hub.attach().await;
        hub.disconnect(c).await;

        assert!(hub.register("alice", c, &general()).await.is_none());
        assert_eq!(hub.resolve_connection("alice").await, None);
    }

    #[tokio::test]
    async fn switching_identity_drops_previous_rooms() {
        let hub = Hub::new();
        let (c, _rx) = hub.attach().await;
        hub.register("alice", c, &["alice-bob".to_string()]).await.unwrap();

        let registration = hub.register("carol", c, &general()).await.unwrap();
        assert_eq!(registration.released_user.as_deref(), Some("alice"));
        assert_eq!(hub.rooms_of(c).await, general());
    }

    #[tokio::test]
    async fn stale_disconnect_keeps_newer_binding() {
        let hub = Hub::new();
        let (c1, _rx1) = hub.attach().await;
        let (c2, _rx2) = hub.attach().await;

        hub.register("alice", c1, &general()).await.unwrap();
        let registration = hub.register("alice", c2, &general()).await.unwrap();
        assert_eq!(registration.superseded, Some(c1));

        assert!(hub.rooms_of(c1).await.is_empty());
        assert_eq!(hub.broadcast(GENERAL_ROOM, &error("x"), None).await, 1);

        assert_eq!(hub.disconnect(c1).await, None);
        assert_eq!(hub.resolve_connection("alice").await, Some(c2));
        assert_eq!(hub.online_users().await, vec!["alice"]);
    }

    #[tokio::test]
    async fn disconnect_cleans_up_everything() {
        let hub = Hub::new();
        let (a, _rxa) = hub.attach().await;
        let (b, mut rxb) = hub.attach().await;
        hub.register("alice", a, &general()).await.unwrap();
        hub.register("bob", b, &general()).await.unwrap();
        hub.join(a, "side").await;

        assert_eq!(hub.disconnect(a).await.as_deref(), Some("alice"));
        assert_eq!(hub.resolve_connection("alice").await, None);
        assert!(hub.rooms_of(a).await.is_empty());
        assert_eq!(hub.connection_count().await, 1);

        assert_eq!(hub.broadcast(GENERAL_ROOM, &error("x"), None).await, 1);
        assert_eq!(rxb.try_recv().unwrap(), error("x"));
    }

    #[tokio::test]
    async fn broadcast_honours_exclude_and_membership() {
        let hub = Hub::new();
        let (a, mut rxa) = hub.attach().await;
        let (b, mut rxb) = hub.attach().await;
        let (_outsider, mut rxo) = hub.attach().await;
        hub.join(a, "room").await;
        hub.join(b, "room").await;

        assert_eq!(hub.broadcast("room", &error("hi"), Some(a)).await, 1);
        assert!(rxa.try_recv().is_err());
        assert_eq!(rxb.try_recv().unwrap(), error("hi"));
        assert!(rxo.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_subscriber_does_not_block_others() {
        let hub = Hub::new();
        let (a, rxa) = hub.attach().await;
        let (b, mut rxb) = hub.attach().await;
        hub.join(a, "room").await;
        hub.join(b, "room").await;
        drop(rxa);

        assert_eq!(hub.broadcast("room", &error("still here"), None).await, 1);
        assert_eq!(rxb.try_recv().unwrap(), error("still here"));
    }

    #[tokio::test]
    async fn send_to_user_follows_current_binding() {
        let hub = Hub::new();
        let (c1, mut rx1) = hub.attach().await;
        let (c2, mut rx2) = hub.attach().await;
        hub.register("alice", c1, &[]).await.unwrap();
        hub.register("alice", c2, &[]).await.unwrap();

        assert!(hub.send_to_user("alice", error("ping")).await);
        assert!(!hub.send_to_user("bob", error("ping")).await);
        assert!(rx1.try_recv().is_err());
        assert_eq!(rx2.try_recv().unwrap(), error("ping"));
    }

    #[tokio::test]
    async fn restrict_room_keeps_only_online_participants() {
        let hub = Hub::new();
        let (a, _rxa) = hub.attach().await;
        let (eve, _rxe) = hub.attach().await;
        let (anon, _rxn) = hub.attach().await;
        hub.register("alice", a, &[]).await.unwrap();
        hub.register("eve", eve, &[]).await.unwrap();
        hub.join(eve, "alice-bob").await;
        hub.join(anon, "alice-bob").await;

        let participants = ["alice".to_string(), "bob".to_string()];
        assert_eq!(hub.restrict_room("alice-bob", &participants).await, 2);
        assert_eq!(hub.rooms_of(a).await, vec!["alice-bob"]);
        assert!(hub.rooms_of(eve).await.is_empty());
        assert!(hub.rooms_of(anon).await.is_empty());
        assert_eq!(hub.restrict_room("alice-bob", &participants).await, 0);
    }

    #[tokio::test]
    async fn publish_reaches_unregistered_connections() {
        let hub = Hub::new();
        let (a, mut rxa) = hub.attach().await;
        let (_anon, mut rx_anon) = hub.attach().await;
        hub.register("alice", a, &[]).await.unwrap();

        let sent = hub
            .publish_to_all(|online| error(&online.join(",")))
            .await;
        assert_eq!(sent, 2);
        assert_eq!(rxa.try_recv().unwrap(), error("alice"));
        assert_eq!(rx_anon.try_recv().unwrap(), error("alice"));
    }
}
