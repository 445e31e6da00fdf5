use std::{collections::HashMap, sync::Mutex, time::Duration};

use parley_core::{RoomId, UserId};
use tokio::sync::{mpsc, watch, RwLock};
use uuid::Uuid;

use super::{presence::PresenceTracker, typing::TypingRegistry};
use crate::server::core::ConnectionControl;

/// Fanout target. Every admitted connection listens on `Everyone` and on its
/// own `User` channel; `Room` channels are joined per membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ChannelKey {
    Everyone,
    User(UserId),
    Room(RoomId),
}

impl ChannelKey {
    pub(crate) fn scope_label(self) -> &'static str {
        match self {
            Self::Everyone => "broadcast",
            Self::User(_) => "user",
            Self::Room(_) => "room",
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Listener {
    pub(crate) user_id: UserId,
    pub(crate) sender: mpsc::Sender<String>,
}

struct ConnectionEntry {
    user_id: UserId,
    sender: mpsc::Sender<String>,
    control: watch::Sender<ConnectionControl>,
}

/// Live connection state for one gateway process. Constructed once per
/// router and shared through `AppState`.
pub(crate) struct RealtimeRegistry {
    connections: RwLock<HashMap<Uuid, ConnectionEntry>>,
    pub(super) channels: RwLock<HashMap<ChannelKey, HashMap<Uuid, Listener>>>,
    pub(super) presence: PresenceTracker,
    pub(super) typing: Mutex<TypingRegistry>,
    pub(super) max_event_bytes: usize,
}

impl RealtimeRegistry {
    pub(crate) fn new(typing_ttl: Duration, max_event_bytes: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            channels: RwLock::new(HashMap::new()),
            presence: PresenceTracker::default(),
            typing: Mutex::new(TypingRegistry::new(typing_ttl)),
            max_event_bytes,
        }
    }

    /// Admits a connection and subscribes it to the broadcast channel, its
    /// private user channel and each of `room_ids`.
    pub(crate) async fn register(
        &self,
        connection_id: Uuid,
        user_id: UserId,
        sender: mpsc::Sender<String>,
        control: watch::Sender<ConnectionControl>,
        room_ids: &[RoomId],
    ) {
        self.connections.write().await.insert(
            connection_id,
            ConnectionEntry {
                user_id,
                sender: sender.clone(),
                control,
            },
        );

        let listener = Listener { user_id, sender };
        let mut channels = self.channels.write().await;
        let keys = [ChannelKey::Everyone, ChannelKey::User(user_id)]
            .into_iter()
            .chain(room_ids.iter().copied().map(ChannelKey::Room));
        for key in keys {
            channels
                .entry(key)
                .or_default()
                .insert(connection_id, listener.clone());
        }
    }

    /// Adds one more channel to a live connection. Returns `false` when the
    /// connection is no longer registered.
    pub(crate) async fn subscribe(&self, connection_id: Uuid, key: ChannelKey) -> bool {
        let listener = {
            let connections = self.connections.read().await;
            let Some(entry) = connections.get(&connection_id) else {
                return false;
            };
            Listener {
                user_id: entry.user_id,
                sender: entry.sender.clone(),
            }
        };
        self.channels
            .write()
            .await
            .entry(key)
            .or_default()
            .insert(connection_id, listener);
        true
    }

    /// Detaches every live connection of `user_id` from `key`.
    pub(crate) async fn unsubscribe_user(&self, user_id: UserId, key: ChannelKey) -> usize {
        let mut channels = self.channels.write().await;
        let Some(listeners) = channels.get_mut(&key) else {
            return 0;
        };
        let before = listeners.len();
        listeners.retain(|_, listener| listener.user_id != user_id);
        let removed = before - listeners.len();
        if listeners.is_empty() {
            channels.remove(&key);
        }
        removed
    }

    /// Forgets a connection entirely and returns the user it belonged to.
    pub(crate) async fn remove(&self, connection_id: Uuid) -> Option<UserId> {
        let entry = self.connections.write().await.remove(&connection_id)?;
        let mut channels = self.channels.write().await;
        channels.retain(|_, listeners| {
            listeners.remove(&connection_id);
            !listeners.is_empty()
        });
        Some(entry.user_id)
    }

    pub(crate) async fn is_subscribed(&self, connection_id: Uuid, key: ChannelKey) -> bool {
        self.channels
            .read()
            .await
            .get(&key)
            .is_some_and(|listeners| listeners.contains_key(&connection_id))
    }

    pub(crate) async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub(super) async fn signal_close(&self, connection_ids: Vec<Uuid>) {
        if connection_ids.is_empty() {
            return;
        }
        let connections = self.connections.read().await;
        for connection_id in connection_ids {
            if let Some(entry) = connections.get(&connection_id) {
                let _ = entry.control.send(ConnectionControl::Close);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parley_core::{RoomId, UserId};
    use tokio::sync::{mpsc, watch};
    use uuid::Uuid;

    use super::{ChannelKey, RealtimeRegistry};
    use crate::server::core::ConnectionControl;

    fn registry() -> RealtimeRegistry {
        RealtimeRegistry::new(Duration::from_secs(6), 1024)
    }

    async fn connect(
        registry: &RealtimeRegistry,
        user_id: UserId,
        rooms: &[RoomId],
    ) -> (Uuid, mpsc::Receiver<String>, watch::Receiver<ConnectionControl>) {
        let connection_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(8);
        let (control_tx, control_rx) = watch::channel(ConnectionControl::Open);
        registry
            .register(connection_id, user_id, tx, control_tx, rooms)
            .await;
        (connection_id, rx, control_rx)
    }

    #[tokio::test]
    async fn register_subscribes_everyone_user_and_rooms() {
        let registry = registry();
        let user_id = UserId::new();
        let room_id = RoomId::new();
        let (connection_id, _rx, _control) = connect(&registry, user_id, &[room_id]).await;

        for key in [
            ChannelKey::Everyone,
            ChannelKey::User(user_id),
            ChannelKey::Room(room_id),
        ] {
            assert!(registry.is_subscribed(connection_id, key).await);
        }
        assert!(
            !registry
                .is_subscribed(connection_id, ChannelKey::Room(RoomId::new()))
                .await
        );
    }

    #[tokio::test]
    async fn subscribe_adds_room_to_live_connection_only() {
        let registry = registry();
        let user_id = UserId::new();
        let room_id = RoomId::new();
        let (connection_id, _rx, _control) = connect(&registry, user_id, &[]).await;

        assert!(registry.subscribe(connection_id, ChannelKey::Room(room_id)).await);
        assert!(registry.is_subscribed(connection_id, ChannelKey::Room(room_id)).await);
        assert!(
            !registry
                .subscribe(Uuid::new_v4(), ChannelKey::Room(room_id))
                .await
        );
    }

    #[tokio::test]
    async fn unsubscribe_user_detaches_all_of_their_connections() {
        let registry = registry();
        let user_id = UserId::new();
        let other = UserId::new();
        let room_id = RoomId::new();
        let (first, _rx1, _c1) = connect(&registry, user_id, &[room_id]).await;
        let (second, _rx2, _c2) = connect(&registry, user_id, &[room_id]).await;
        let (bystander, _rx3, _c3) = connect(&registry, other, &[room_id]).await;

        let removed = registry
            .unsubscribe_user(user_id, ChannelKey::Room(room_id))
            .await;
        assert_eq!(removed, 2);
        assert!(!registry.is_subscribed(first, ChannelKey::Room(room_id)).await);
        assert!(!registry.is_subscribed(second, ChannelKey::Room(room_id)).await);
        assert!(registry.is_subscribed(bystander, ChannelKey::Room(room_id)).await);
    }

    #[tokio::test]
    async fn remove_clears_every_subscription() {
        let registry = registry();
        let user_id = UserId::new();
        let room_id = RoomId::new();
        let (connection_id, _rx, _control) = connect(&registry, user_id, &[room_id]).await;

        assert_eq!(registry.remove(connection_id).await, Some(user_id));
        assert_eq!(registry.remove(connection_id).await, None);
        assert_eq!(registry.connection_count().await, 0);
        assert!(!registry.is_subscribed(connection_id, ChannelKey::Everyone).await);
    }

    #[tokio::test]
    async fn signal_close_reaches_only_named_connections() {
        let registry = registry();
        let (first, _rx1, first_control) = connect(&registry, UserId::new(), &[]).await;
        let (_second, _rx2, second_control) = connect(&registry, UserId::new(), &[]).await;

        registry.signal_close(vec![first, Uuid::new_v4()]).await;

        assert_eq!(*first_control.borrow(), ConnectionControl::Close);
        assert_eq!(*second_control.borrow(), ConnectionControl::Open);
    }
}
