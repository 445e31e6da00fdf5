use parley_core::{RoomId, UserId};
use parley_protocol::{
    encode_event, DirectMessage, DirectTypingStarted, DirectTypingStopped, PresencePayload,
    ReadyPayload, RoomCreatedPayload, RoomMessage, RoomSubscribedPayload, TypingStarted,
    TypingStopped, DIRECT_MESSAGE_EVENT, DIRECT_TYPING_START_EVENT, DIRECT_TYPING_STOP_EVENT,
    PRESENCE_OFFLINE_EVENT, PRESENCE_ONLINE_EVENT, READY_EVENT, ROOM_CREATED_EVENT,
    ROOM_MESSAGE_EVENT, ROOM_SUBSCRIBED_EVENT, TYPING_START_EVENT, TYPING_STOP_EVENT,
};
use serde::Serialize;

use super::{
    metrics::{record_gateway_event_dropped, GATEWAY_DROP_REASON_SERIALIZE_ERROR},
    storage::RoomRecord,
};

/// A server event already encoded into its wire envelope.
#[derive(Debug, Clone)]
pub(crate) struct GatewayEvent {
    pub(crate) event_type: &'static str,
    pub(crate) payload: String,
}

fn build_event<T: Serialize>(event_type: &'static str, data: &T) -> Option<GatewayEvent> {
    match encode_event(event_type, data) {
        Ok(payload) => Some(GatewayEvent {
            event_type,
            payload,
        }),
        Err(error) => {
            tracing::error!(event = "gateway.encode", event_type, error = %error);
            record_gateway_event_dropped("encode", event_type, GATEWAY_DROP_REASON_SERIALIZE_ERROR);
            None
        }
    }
}

pub(crate) fn ready(user_id: UserId, room_ids: &[RoomId]) -> Option<GatewayEvent> {
    build_event(
        READY_EVENT,
        &ReadyPayload {
            user_id: user_id.to_string(),
            room_ids: room_ids.iter().map(ToString::to_string).collect(),
        },
    )
}

pub(crate) fn room_message(message: &RoomMessage) -> Option<GatewayEvent> {
    build_event(ROOM_MESSAGE_EVENT, message)
}

pub(crate) fn direct_message(message: &DirectMessage) -> Option<GatewayEvent> {
    build_event(DIRECT_MESSAGE_EVENT, message)
}

pub(crate) fn typing_started(room_id: RoomId, user_id: UserId, username: &str) -> Option<GatewayEvent> {
    build_event(
        TYPING_START_EVENT,
        &TypingStarted {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            username: username.to_owned(),
        },
    )
}

pub(crate) fn typing_stopped(room_id: RoomId, user_id: UserId) -> Option<GatewayEvent> {
    build_event(
        TYPING_STOP_EVENT,
        &TypingStopped {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
        },
    )
}

pub(crate) fn direct_typing_started(user_id: UserId, username: &str) -> Option<GatewayEvent> {
    build_event(
        DIRECT_TYPING_START_EVENT,
        &DirectTypingStarted {
            user_id: user_id.to_string(),
            username: username.to_owned(),
        },
    )
}

pub(crate) fn direct_typing_stopped(user_id: UserId) -> Option<GatewayEvent> {
    build_event(
        DIRECT_TYPING_STOP_EVENT,
        &DirectTypingStopped {
            user_id: user_id.to_string(),
        },
    )
}

pub(crate) fn presence_online(user_id: UserId) -> Option<GatewayEvent> {
    build_event(
        PRESENCE_ONLINE_EVENT,
        &PresencePayload {
            user_id: user_id.to_string(),
        },
    )
}

pub(crate) fn presence_offline(user_id: UserId) -> Option<GatewayEvent> {
    build_event(
        PRESENCE_OFFLINE_EVENT,
        &PresencePayload {
            user_id: user_id.to_string(),
        },
    )
}

pub(crate) fn room_subscribed(room_id: RoomId) -> Option<GatewayEvent> {
    build_event(
        ROOM_SUBSCRIBED_EVENT,
        &RoomSubscribedPayload {
            room_id: room_id.to_string(),
        },
    )
}

pub(crate) fn room_created(room: &RoomRecord) -> Option<GatewayEvent> {
    build_event(
        ROOM_CREATED_EVENT,
        &RoomCreatedPayload {
            room_id: room.room_id.to_string(),
            name: room.name.clone(),
            description: room.description.clone(),
            created_by: room.created_by.map(|user_id| user_id.to_string()),
            created_at_unix: room.created_at_unix,
        },
    )
}

#[cfg(test)]
mod tests {
    use parley_core::{RoomId, UserId};
    use parley_protocol::{decode_server_event, ServerEvent};
    use serde_json::Value;

    use super::{presence_online, ready, typing_started};

    #[test]
    fn ready_lists_room_ids_in_envelope() {
        let user_id = UserId::new();
        let rooms = [RoomId::new(), RoomId::new()];
        let event = ready(user_id, &rooms).unwrap();
        let envelope: Value = serde_json::from_str(&event.payload).unwrap();
        assert_eq!(envelope["v"], Value::from(1));
        assert_eq!(envelope["t"], Value::from("ready"));
        assert_eq!(envelope["d"]["room_ids"].as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn built_events_decode_as_server_events() {
        let user_id = UserId::new();
        let event = presence_online(user_id).unwrap();
        match decode_server_event(&event.payload).unwrap() {
            ServerEvent::PresenceOnline(payload) => {
                assert_eq!(payload.user_id, user_id.to_string());
            }
            other => panic!("unexpected {other:?}"),
        }

        let room_id = RoomId::new();
        let typing = typing_started(room_id, user_id, "alice").unwrap();
        assert!(matches!(
            decode_server_event(&typing.payload).unwrap(),
            ServerEvent::TypingStarted(payload) if payload.username == "alice"
        ));
    }
}
