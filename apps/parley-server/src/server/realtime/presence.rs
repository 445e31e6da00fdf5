use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use parley_core::UserId;
use tokio::sync::Mutex as AsyncMutex;

use super::registry::ChannelKey;
use crate::server::{
    core::AppState,
    gateway_events,
    storage::{repository, ChatPersistence},
};

type PresenceSlot = Arc<AsyncMutex<usize>>;

/// Live connection counts per user. Each user has its own async lock so
/// count transitions and the persisted online flag change in arrival order
/// for that user while other users proceed in parallel.
#[derive(Default)]
pub(crate) struct PresenceTracker {
    slots: Mutex<HashMap<UserId, PresenceSlot>>,
}

impl PresenceTracker {
    fn slot(&self, user_id: UserId) -> PresenceSlot {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(user_id)
            .or_default()
            .clone()
    }

    /// Drops the slot once nobody is connected and nobody else holds it.
    fn release(&self, user_id: UserId, slot: PresenceSlot) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(current) = slots.get(&user_id) else {
            return;
        };
        if !Arc::ptr_eq(current, &slot) || Arc::strong_count(&slot) != 2 {
            return;
        }
        if slot.try_lock().is_ok_and(|live| *live == 0) {
            slots.remove(&user_id);
        }
    }

    pub(crate) async fn live_connections(&self, user_id: UserId) -> usize {
        let slot = {
            let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            match slots.get(&user_id) {
                Some(slot) => slot.clone(),
                None => return 0,
            }
        };
        let live = *slot.lock().await;
        live
    }
}

async fn persist_online(state: &AppState, user_id: UserId, online: bool) {
    let result = match repository(state).await {
        Ok(repo) => repo.set_online(user_id, online).await,
        Err(error) => Err(error),
    };
    if let Err(error) = result {
        tracing::warn!(
            event = "gateway.presence.persist",
            user_id = %user_id,
            online,
            error = %error
        );
    }
}

/// Counts a newly admitted connection. The first live connection marks the
/// user online and tells every other connection.
pub(crate) async fn connection_opened(state: &AppState, user_id: UserId) {
    let registry = &state.realtime;
    let slot = registry.presence.slot(user_id);
    {
        let mut live = slot.lock().await;
        *live += 1;
        if *live == 1 {
            persist_online(state, user_id, true).await;
            if let Some(event) = gateway_events::presence_online(user_id) {
                registry
                    .broadcast(ChannelKey::Everyone, &event, Some(user_id))
                    .await;
            }
            tracing::info!(event = "gateway.presence", outcome = "online", user_id = %user_id);
        }
    }
    registry.presence.release(user_id, slot);
}

/// Counts a closed connection. The last one marks the user offline, clears
/// their typing indicators and tells every other connection.
pub(crate) async fn connection_closed(state: &AppState, user_id: UserId) {
    let registry = &state.realtime;
    let slot = registry.presence.slot(user_id);
    {
        let mut live = slot.lock().await;
        if *live == 0 {
            tracing::debug!(event = "gateway.presence", outcome = "unbalanced_close", user_id = %user_id);
        } else {
            *live -= 1;
            if *live == 0 {
                persist_online(state, user_id, false).await;
                registry.clear_typing(user_id).await;
                if let Some(event) = gateway_events::presence_offline(user_id) {
                    registry
                        .broadcast(ChannelKey::Everyone, &event, Some(user_id))
                        .await;
                }
                tracing::info!(event = "gateway.presence", outcome = "offline", user_id = %user_id);
            }
        }
    }
    registry.presence.release(user_id, slot);
}
