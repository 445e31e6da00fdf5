use serde::{Deserialize, Serialize};

pub const READY_EVENT: &str = "ready";
pub const ROOM_MESSAGE_SEND_EVENT: &str = "room_message_send";
pub const ROOM_MESSAGE_EVENT: &str = "room_message";
pub const DIRECT_MESSAGE_SEND_EVENT: &str = "direct_message_send";
pub const DIRECT_MESSAGE_EVENT: &str = "direct_message";
pub const TYPING_START_EVENT: &str = "typing_start";
pub const TYPING_STOP_EVENT: &str = "typing_stop";
pub const DIRECT_TYPING_START_EVENT: &str = "direct_typing_start";
pub const DIRECT_TYPING_STOP_EVENT: &str = "direct_typing_stop";
pub const PRESENCE_ONLINE_EVENT: &str = "presence_online";
pub const PRESENCE_OFFLINE_EVENT: &str = "presence_offline";
pub const ROOM_SUBSCRIBE_EVENT: &str = "room_subscribe";
pub const ROOM_SUBSCRIBED_EVENT: &str = "room_subscribed";
pub const ROOM_CREATED_EVENT: &str = "room_created";

/// Where a server-emitted event is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayEventScope {
    /// Only the connection that caused it.
    Connection,
    /// Every connection subscribed to a room channel.
    Room,
    /// Private per-user channels.
    User,
    /// Every live connection, optionally excluding the originating user.
    Broadcast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventDirection {
    ClientToServer,
    ServerToClient,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventDescriptor {
    pub event_type: &'static str,
    pub direction: EventDirection,
    /// Delivery scope for the server-emitted form, if any.
    pub scope: Option<GatewayEventScope>,
}

pub const EVENT_CATALOG: &[EventDescriptor] = &[
    EventDescriptor {
        event_type: READY_EVENT,
        direction: EventDirection::ServerToClient,
        scope: Some(GatewayEventScope::Connection),
    },
    EventDescriptor {
        event_type: ROOM_MESSAGE_SEND_EVENT,
        direction: EventDirection::ClientToServer,
        scope: None,
    },
    EventDescriptor {
        event_type: ROOM_MESSAGE_EVENT,
        direction: EventDirection::ServerToClient,
        scope: Some(GatewayEventScope::Room),
    },
    EventDescriptor {
        event_type: DIRECT_MESSAGE_SEND_EVENT,
        direction: EventDirection::ClientToServer,
        scope: None,
    },
    EventDescriptor {
        event_type: DIRECT_MESSAGE_EVENT,
        direction: EventDirection::ServerToClient,
        scope: Some(GatewayEventScope::User),
    },
    EventDescriptor {
        event_type: TYPING_START_EVENT,
        direction: EventDirection::Both,
        scope: Some(GatewayEventScope::Room),
    },
    EventDescriptor {
        event_type: TYPING_STOP_EVENT,
        direction: EventDirection::Both,
        scope: Some(GatewayEventScope::Room),
    },
    EventDescriptor {
        event_type: DIRECT_TYPING_START_EVENT,
        direction: EventDirection::Both,
        scope: Some(GatewayEventScope::User),
    },
    EventDescriptor {
        event_type: DIRECT_TYPING_STOP_EVENT,
        direction: EventDirection::Both,
        scope: Some(GatewayEventScope::User),
    },
    EventDescriptor {
        event_type: PRESENCE_ONLINE_EVENT,
        direction: EventDirection::ServerToClient,
        scope: Some(GatewayEventScope::Broadcast),
    },
    EventDescriptor {
        event_type: PRESENCE_OFFLINE_EVENT,
        direction: EventDirection::ServerToClient,
        scope: Some(GatewayEventScope::Broadcast),
    },
    EventDescriptor {
        event_type: ROOM_SUBSCRIBE_EVENT,
        direction: EventDirection::ClientToServer,
        scope: None,
    },
    EventDescriptor {
        event_type: ROOM_SUBSCRIBED_EVENT,
        direction: EventDirection::ServerToClient,
        scope: Some(GatewayEventScope::Connection),
    },
    EventDescriptor {
        event_type: ROOM_CREATED_EVENT,
        direction: EventDirection::ServerToClient,
        scope: Some(GatewayEventScope::Broadcast),
    },
];

#[must_use]
pub fn event_descriptor(event_type: &str) -> Option<&'static EventDescriptor> {
    EVENT_CATALOG
        .iter()
        .find(|descriptor| descriptor.event_type == event_type)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::{event_descriptor, EventDirection, EVENT_CATALOG, ROOM_MESSAGE_SEND_EVENT};
    use crate::validate_event_type;

    #[test]
    fn catalog_identifiers_pass_validation() {
        for descriptor in EVENT_CATALOG {
            assert!(
                validate_event_type(descriptor.event_type).is_ok(),
                "{} should be a valid event type",
                descriptor.event_type
            );
        }
    }

    #[test]
    fn catalog_has_no_duplicates() {
        let unique: BTreeSet<_> = EVENT_CATALOG.iter().map(|d| d.event_type).collect();
        assert_eq!(unique.len(), EVENT_CATALOG.len());
    }

    #[test]
    fn server_emitted_events_declare_a_scope() {
        for descriptor in EVENT_CATALOG {
            let emitted_by_server = descriptor.direction != EventDirection::ClientToServer;
            assert_eq!(emitted_by_server, descriptor.scope.is_some());
        }
    }

    #[test]
    fn lookup_finds_ingress_events() {
        let descriptor = event_descriptor(ROOM_MESSAGE_SEND_EVENT).unwrap();
        assert_eq!(descriptor.direction, EventDirection::ClientToServer);
        assert!(event_descriptor("subscribe").is_none());
    }
}
