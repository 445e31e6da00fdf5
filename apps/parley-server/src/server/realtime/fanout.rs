use parley_core::UserId;

use super::{
    fanout_dispatch::dispatch_gateway_payload,
    registry::{ChannelKey, RealtimeRegistry},
};
use crate::server::{gateway_events::GatewayEvent, metrics::record_gateway_event_emitted};

impl RealtimeRegistry {
    /// Delivers `event` to every connection subscribed to `key`, except those
    /// owned by `skip_user`. Connections that cannot keep up are closed.
    pub(crate) async fn broadcast(
        &self,
        key: ChannelKey,
        event: &GatewayEvent,
        skip_user: Option<UserId>,
    ) -> usize {
        let scope = key.scope_label();
        let mut slow_connections = Vec::new();
        let delivered = {
            let mut channels = self.channels.write().await;
            let Some(listeners) = channels.get_mut(&key) else {
                return 0;
            };
            let delivered = dispatch_gateway_payload(
                listeners,
                &event.payload,
                self.max_event_bytes,
                skip_user,
                event.event_type,
                scope,
                &mut slow_connections,
            );
            if listeners.is_empty() {
                channels.remove(&key);
            }
            delivered
        };

        if delivered > 0 {
            record_gateway_event_emitted(scope, event.event_type);
        }
        if !slow_connections.is_empty() {
            tracing::warn!(
                event = "gateway.fanout.slow_consumer",
                scope,
                event_type = event.event_type,
                count = slow_connections.len()
            );
            self.signal_close(slow_connections).await;
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parley_core::{RoomId, UserId};
    use tokio::sync::{mpsc, watch};
    use uuid::Uuid;

    use crate::server::{
        core::ConnectionControl,
        gateway_events::{presence_online, GatewayEvent},
        realtime::registry::{ChannelKey, RealtimeRegistry},
    };

    #[tokio::test]
    async fn broadcast_reaches_room_listeners_only() {
        let registry = RealtimeRegistry::new(Duration::from_secs(6), 4096);
        let room_id = RoomId::new();
        let (member_tx, mut member_rx) = mpsc::channel(4);
        let (outsider_tx, mut outsider_rx) = mpsc::channel(4);
        let (member_control, _) = watch::channel(ConnectionControl::Open);
        let (outsider_control, _) = watch::channel(ConnectionControl::Open);
        registry
            .register(Uuid::new_v4(), UserId::new(), member_tx, member_control, &[room_id])
            .await;
        registry
            .register(Uuid::new_v4(), UserId::new(), outsider_tx, outsider_control, &[])
            .await;

        let event = GatewayEvent {
            event_type: "room_message",
            payload: String::from("{}"),
        };
        let delivered = registry
            .broadcast(ChannelKey::Room(room_id), &event, None)
            .await;

        assert_eq!(delivered, 1);
        assert_eq!(member_rx.recv().await.as_deref(), Some("{}"));
        assert!(outsider_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_queue_closes_the_connection() {
        let registry = RealtimeRegistry::new(Duration::from_secs(6), 4096);
        let connection_id = Uuid::new_v4();
        let (tx, _rx) = mpsc::channel(1);
        tx.try_send(String::from("occupied")).unwrap();
        let (control_tx, control_rx) = watch::channel(ConnectionControl::Open);
        registry
            .register(connection_id, UserId::new(), tx, control_tx, &[])
            .await;

        let event = presence_online(UserId::new()).unwrap();
        let delivered = registry.broadcast(ChannelKey::Everyone, &event, None).await;

        assert_eq!(delivered, 0);
        assert_eq!(*control_rx.borrow(), ConnectionControl::Close);
        assert!(
            !registry
                .is_subscribed(connection_id, ChannelKey::Everyone)
                .await
        );
    }
}
