use parley_core::{ChatScope, RoomId, UserId, UserPair};
use parley_protocol::{
    DirectMessageSend, DirectTypingCommand, Envelope, RoomMessageSend, RoomSubscribeCommand,
    RoomTypingCommand, DIRECT_MESSAGE_SEND_EVENT, DIRECT_TYPING_START_EVENT,
    DIRECT_TYPING_STOP_EVENT, ROOM_MESSAGE_SEND_EVENT, ROOM_SUBSCRIBE_EVENT, TYPING_START_EVENT,
    TYPING_STOP_EVENT,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::registry::ChannelKey;
use crate::server::{
    core::{AppState, AuthContext},
    gateway_events,
    messaging::{send_direct_message, send_room_message},
    metrics::{
        record_gateway_event_dropped, record_gateway_event_emitted, GATEWAY_DROP_REASON_FULL_QUEUE,
    },
    storage::{repository, ChatPersistence},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum GatewayIngressCommand {
    RoomMessageSend(RoomMessageSend),
    DirectMessageSend(DirectMessageSend),
    RoomTyping {
        command: RoomTypingCommand,
        started: bool,
    },
    DirectTyping {
        command: DirectTypingCommand,
        started: bool,
    },
    RoomSubscribe(RoomSubscribeCommand),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum IngressParseError {
    InvalidPayload(&'static str),
    UnknownEventType(String),
}

fn payload<T: DeserializeOwned>(data: Value, reason: &'static str) -> Result<T, IngressParseError> {
    serde_json::from_value(data).map_err(|_| IngressParseError::InvalidPayload(reason))
}

pub(crate) fn parse_ingress_command(
    envelope: Envelope<Value>,
) -> Result<GatewayIngressCommand, IngressParseError> {
    match envelope.t.as_str() {
        ROOM_MESSAGE_SEND_EVENT => Ok(GatewayIngressCommand::RoomMessageSend(payload(
            envelope.d,
            "invalid_room_message_payload",
        )?)),
        DIRECT_MESSAGE_SEND_EVENT => Ok(GatewayIngressCommand::DirectMessageSend(payload(
            envelope.d,
            "invalid_direct_message_payload",
        )?)),
        TYPING_START_EVENT | TYPING_STOP_EVENT => Ok(GatewayIngressCommand::RoomTyping {
            started: envelope.t.as_str() == TYPING_START_EVENT,
            command: payload(envelope.d, "invalid_typing_payload")?,
        }),
        DIRECT_TYPING_START_EVENT | DIRECT_TYPING_STOP_EVENT => {
            Ok(GatewayIngressCommand::DirectTyping {
                started: envelope.t.as_str() == DIRECT_TYPING_START_EVENT,
                command: payload(envelope.d, "invalid_direct_typing_payload")?,
            })
        }
        ROOM_SUBSCRIBE_EVENT => Ok(GatewayIngressCommand::RoomSubscribe(payload(
            envelope.d,
            "invalid_room_subscribe_payload",
        )?)),
        other => Err(IngressParseError::UnknownEventType(other.to_owned())),
    }
}

/// What the connection loop should do after one client event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IngressOutcome {
    Handled,
    Dropped(&'static str),
    Close(&'static str),
}

pub(crate) struct GatewaySession {
    pub(crate) connection_id: Uuid,
    pub(crate) auth: AuthContext,
    pub(crate) outbound_tx: mpsc::Sender<String>,
}

async fn room_member(state: &AppState, user_id: UserId, room_id: RoomId) -> bool {
    match repository(state).await {
        Ok(repo) => repo.is_member(user_id, room_id).await.unwrap_or(false),
        Err(_) => false,
    }
}

async fn user_exists(state: &AppState, user_id: UserId) -> bool {
    match repository(state).await {
        Ok(repo) => matches!(repo.find_user(user_id).await, Ok(Some(_))),
        Err(_) => false,
    }
}

pub(crate) async fn handle_ingress_command(
    state: &AppState,
    session: &GatewaySession,
    command: GatewayIngressCommand,
) -> IngressOutcome {
    let auth = &session.auth;
    match command {
        GatewayIngressCommand::RoomMessageSend(command) => {
            match send_room_message(state, auth, command).await {
                Ok(message) => {
                    if let Ok(room_id) = RoomId::try_from(message.room_id.as_str()) {
                        state
                            .realtime
                            .typing_stopped(ChatScope::Room(room_id), auth.user_id)
                            .await;
                    }
                    IngressOutcome::Handled
                }
                Err(rejection) => IngressOutcome::Dropped(rejection.reason()),
            }
        }
        GatewayIngressCommand::DirectMessageSend(command) => {
            match send_direct_message(state, auth, command).await {
                Ok(message) => {
                    if let Some(scope) = UserId::try_from(message.receiver_id.as_str())
                        .ok()
                        .and_then(|receiver_id| UserPair::new(auth.user_id, receiver_id).ok())
                        .map(ChatScope::Direct)
                    {
                        state.realtime.typing_stopped(scope, auth.user_id).await;
                    }
                    IngressOutcome::Handled
                }
                Err(rejection) => IngressOutcome::Dropped(rejection.reason()),
            }
        }
        GatewayIngressCommand::RoomTyping { command, started } => {
            let Ok(room_id) = RoomId::try_from(command.room_id.as_str()) else {
                return IngressOutcome::Dropped("invalid_room_id");
            };
            if !room_member(state, auth.user_id, room_id).await {
                return IngressOutcome::Dropped("not_member");
            }
            let scope = ChatScope::Room(room_id);
            if started {
                state
                    .realtime
                    .typing_started(scope, auth.user_id, &auth.username)
                    .await;
            } else {
                state.realtime.typing_stopped(scope, auth.user_id).await;
            }
            IngressOutcome::Handled
        }
        GatewayIngressCommand::DirectTyping { command, started } => {
            let Ok(receiver_id) = UserId::try_from(command.receiver_id.as_str()) else {
                return IngressOutcome::Dropped("invalid_receiver_id");
            };
            let Ok(pair) = UserPair::new(auth.user_id, receiver_id) else {
                return IngressOutcome::Dropped("self_direct_typing");
            };
            let scope = ChatScope::Direct(pair);
            if started {
                if !user_exists(state, receiver_id).await {
                    return IngressOutcome::Dropped("unknown_receiver");
                }
                state
                    .realtime
                    .typing_started(scope, auth.user_id, &auth.username)
                    .await;
            } else {
                state.realtime.typing_stopped(scope, auth.user_id).await;
            }
            IngressOutcome::Handled
        }
        GatewayIngressCommand::RoomSubscribe(command) => {
            let Ok(room_id) = RoomId::try_from(command.room_id.as_str()) else {
                return IngressOutcome::Dropped("invalid_room_id");
            };
            if !room_member(state, auth.user_id, room_id).await {
                return IngressOutcome::Dropped("not_member");
            }
            if !state
                .realtime
                .subscribe(session.connection_id, ChannelKey::Room(room_id))
                .await
            {
                return IngressOutcome::Close("connection_gone");
            }
            let Some(ack) = gateway_events::room_subscribed(room_id) else {
                return IngressOutcome::Handled;
            };
            if session.outbound_tx.try_send(ack.payload).is_err() {
                record_gateway_event_dropped(
                    "connection",
                    ack.event_type,
                    GATEWAY_DROP_REASON_FULL_QUEUE,
                );
                return IngressOutcome::Close("outbound_queue_full");
            }
            record_gateway_event_emitted("connection", ack.event_type);
            IngressOutcome::Handled
        }
    }
}
