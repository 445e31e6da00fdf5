use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, Weak},
    time::{Duration, Instant},
};

use parley_core::{ChatScope, UserId};

use super::registry::{ChannelKey, RealtimeRegistry};
use crate::server::{core::TYPING_SWEEP_INTERVAL_MILLIS, gateway_events};

struct TypingEntry {
    username: String,
    expires_at: Instant,
}

/// Who is typing where. Entries expire `ttl` after their last start signal.
pub(crate) struct TypingRegistry {
    ttl: Duration,
    entries: HashMap<(ChatScope, UserId), TypingEntry>,
}

impl TypingRegistry {
    pub(crate) fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Replaces any existing entry for `user_id` in `scope` with a fresh one.
    pub(crate) fn start(&mut self, scope: ChatScope, user_id: UserId, username: &str, now: Instant) {
        self.entries.insert(
            (scope, user_id),
            TypingEntry {
                username: username.to_owned(),
                expires_at: now + self.ttl,
            },
        );
    }

    pub(crate) fn stop(&mut self, scope: ChatScope, user_id: UserId) -> bool {
        self.entries.remove(&(scope, user_id)).is_some()
    }

    pub(crate) fn expire(&mut self, now: Instant) -> Vec<(ChatScope, UserId)> {
        let mut expired = Vec::new();
        self.entries.retain(|key, entry| {
            if entry.expires_at <= now {
                expired.push(*key);
                false
            } else {
                true
            }
        });
        expired
    }

    pub(crate) fn clear_user(&mut self, user_id: UserId) -> Vec<ChatScope> {
        let mut cleared = Vec::new();
        self.entries.retain(|(scope, typist), _| {
            if *typist == user_id {
                cleared.push(*scope);
                false
            } else {
                true
            }
        });
        cleared
    }

    pub(crate) fn typists(&self, scope: ChatScope) -> Vec<(UserId, String)> {
        let mut typists: Vec<_> = self
            .entries
            .iter()
            .filter(|((entry_scope, _), _)| *entry_scope == scope)
            .map(|((_, user_id), entry)| (*user_id, entry.username.clone()))
            .collect();
        typists.sort_by(|left, right| left.1.cmp(&right.1));
        typists
    }
}

/// Room typing goes to the room channel; direct typing goes to the partner's
/// private channel.
fn typing_target(scope: ChatScope, user_id: UserId) -> Option<ChannelKey> {
    match scope {
        ChatScope::Room(room_id) => Some(ChannelKey::Room(room_id)),
        ChatScope::Direct(pair) => pair.partner_of(user_id).map(ChannelKey::User),
    }
}

impl RealtimeRegistry {
    pub(crate) async fn typing_started(&self, scope: ChatScope, user_id: UserId, username: &str) {
        let Some(key) = typing_target(scope, user_id) else {
            return;
        };
        self.typing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .start(scope, user_id, username, Instant::now());

        let event = match scope {
            ChatScope::Room(room_id) => gateway_events::typing_started(room_id, user_id, username),
            ChatScope::Direct(_) => gateway_events::direct_typing_started(user_id, username),
        };
        if let Some(event) = event {
            self.broadcast(key, &event, Some(user_id)).await;
        }
    }

    /// Emits a stop only when an entry was actually removed, so an expired
    /// indicator is never stopped twice.
    pub(crate) async fn typing_stopped(&self, scope: ChatScope, user_id: UserId) -> bool {
        let removed = self
            .typing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stop(scope, user_id);
        if removed {
            self.emit_typing_stop(scope, user_id).await;
        }
        removed
    }

    pub(crate) fn typists(&self, scope: ChatScope) -> Vec<(UserId, String)> {
        self.typing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .typists(scope)
    }

    pub(crate) async fn sweep_typing(&self, now: Instant) -> usize {
        let expired = self
            .typing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .expire(now);
        for (scope, user_id) in &expired {
            self.emit_typing_stop(*scope, *user_id).await;
        }
        expired.len()
    }

    pub(super) async fn clear_typing(&self, user_id: UserId) {
        let cleared = self
            .typing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear_user(user_id);
        for scope in cleared {
            self.emit_typing_stop(scope, user_id).await;
        }
    }

    async fn emit_typing_stop(&self, scope: ChatScope, user_id: UserId) {
        let Some(key) = typing_target(scope, user_id) else {
            return;
        };
        let event = match scope {
            ChatScope::Room(room_id) => gateway_events::typing_stopped(room_id, user_id),
            ChatScope::Direct(_) => gateway_events::direct_typing_stopped(user_id),
        };
        if let Some(event) = event {
            self.broadcast(key, &event, Some(user_id)).await;
        }
    }
}

/// Periodically expires stale typing entries. The task ends once the
/// registry has been dropped.
pub(crate) fn spawn_typing_sweeper(registry: &Arc<RealtimeRegistry>) {
    let registry: Weak<RealtimeRegistry> = Arc::downgrade(registry);
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_millis(TYPING_SWEEP_INTERVAL_MILLIS));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let Some(registry) = registry.upgrade() else {
                break;
            };
            let expired = registry.sweep_typing(Instant::now()).await;
            if expired > 0 {
                tracing::debug!(event = "gateway.typing.expired", count = expired);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use parley_core::{ChatScope, RoomId, UserId, UserPair};
    use parley_protocol::{decode_server_event, ServerEvent};
    use tokio::sync::{mpsc, watch};
    use uuid::Uuid;

    use super::TypingRegistry;
    use crate::server::{core::ConnectionControl, realtime::registry::RealtimeRegistry};

    #[test]
    fn start_replaces_existing_entry() {
        let mut typing = TypingRegistry::new(Duration::from_secs(6));
        let scope = ChatScope::Room(RoomId::new());
        let user_id = UserId::new();
        let now = Instant::now();

        typing.start(scope, user_id, "alice", now);
        typing.start(scope, user_id, "alice", now + Duration::from_secs(5));

        assert_eq!(typing.typists(scope).len(), 1);
        assert!(typing.expire(now + Duration::from_secs(7)).is_empty());
        assert_eq!(typing.expire(now + Duration::from_secs(12)).len(), 1);
    }

    #[test]
    fn stop_reports_whether_entry_existed() {
        let mut typing = TypingRegistry::new(Duration::from_secs(6));
        let scope = ChatScope::Room(RoomId::new());
        let user_id = UserId::new();

        assert!(!typing.stop(scope, user_id));
        typing.start(scope, user_id, "alice", Instant::now());
        assert!(typing.stop(scope, user_id));
        assert!(typing.typists(scope).is_empty());
    }

    #[test]
    fn clear_user_removes_every_scope_for_that_user_only() {
        let mut typing = TypingRegistry::new(Duration::from_secs(6));
        let alice = UserId::new();
        let bob = UserId::new();
        let room = ChatScope::Room(RoomId::new());
        let direct = ChatScope::Direct(UserPair::new(alice, bob).unwrap());
        let now = Instant::now();

        typing.start(room, alice, "alice", now);
        typing.start(direct, alice, "alice", now);
        typing.start(room, bob, "bob", now);

        let mut cleared = typing.clear_user(alice);
        cleared.sort_by_key(|scope| matches!(scope, ChatScope::Direct(_)));
        assert_eq!(cleared, vec![room, direct]);
        assert_eq!(typing.typists(room), vec![(bob, String::from("bob"))]);
    }

    #[tokio::test]
    async fn expired_direct_typing_emits_stop_to_partner() {
        let registry = RealtimeRegistry::new(Duration::from_millis(10), 4096);
        let alice = UserId::new();
        let bob = UserId::new();
        let (tx, mut rx) = mpsc::channel(8);
        let (control, _) = watch::channel(ConnectionControl::Open);
        registry.register(Uuid::new_v4(), bob, tx, control, &[]).await;

        let scope = ChatScope::Direct(UserPair::new(alice, bob).unwrap());
        registry.typing_started(scope, alice, "alice").await;
        let started = rx.recv().await.unwrap();
        assert!(matches!(
            decode_server_event(&started).unwrap(),
            ServerEvent::DirectTypingStarted(payload) if payload.user_id == alice.to_string()
        ));

        let expired = registry
            .sweep_typing(Instant::now() + Duration::from_secs(1))
            .await;
        assert_eq!(expired, 1);
        let stopped = rx.recv().await.unwrap();
        assert!(matches!(
            decode_server_event(&stopped).unwrap(),
            ServerEvent::DirectTypingStopped(payload) if payload.user_id == alice.to_string()
        ));

        assert!(!registry.typing_stopped(scope, alice).await);
        assert!(rx.try_recv().is_err());
    }
}
