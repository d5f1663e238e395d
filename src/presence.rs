//! Presence snapshots: the full roster annotated with online state.
//!
//! A complete snapshot is published on every binding change instead of
//! join/leave deltas, so a client that missed an event is corrected by the
//! next one.

use std::collections::BTreeMap;
use tracing::debug;

use crate::error::StorageError;
use crate::hub::Hub;
use crate::model::User;
use crate::protocol::{PresenceEntry, PresenceSnapshot, ServerEvent};
use crate::storage::Store;

/// Merge the stored roster with the online set.
///
/// Online users missing from the roster are still listed, named by id.
pub fn build_snapshot(roster: &[User], online: &[String]) -> PresenceSnapshot {
    let mut entries: BTreeMap<&str, PresenceEntry> = roster
        .iter()
        .map(|u| {
            (
                u.id.as_str(),
                PresenceEntry { id: u.id.clone(), name: u.name.clone(), online: false },
            )
        })
        .collect();
    for id in online {
        entries
            .entry(id.as_str())
            .or_insert_with(|| PresenceEntry { id: id.clone(), name: id.clone(), online: false })
            .online = true;
    }

    let mut online: Vec<String> = online.to_vec();
    online.sort();
    online.dedup();
    PresenceSnapshot { users: entries.into_values().collect(), online }
}

/// Current snapshot, for on-demand reads such as the HTTP API.
pub async fn snapshot(hub: &Hub, store: &dyn Store) -> Result<PresenceSnapshot, StorageError> {
    let roster = store.list_users()?;
    let online = hub.online_users().await;
    Ok(build_snapshot(&roster, &online))
}

/// Recompute presence and push `online_users` to every attached connection.
pub async fn publish(hub: &Hub, store: &dyn Store) -> Result<(), StorageError> {
    // Roster first: storage is slow and must not run under the hub lock.
    let roster = store.list_users()?;
    let delivered = hub
        .publish_to_all(|online| ServerEvent::OnlineUsers(build_snapshot(&roster, online)))
        .await;
    debug!(delivered, "presence snapshot published");
    Ok(())
}
