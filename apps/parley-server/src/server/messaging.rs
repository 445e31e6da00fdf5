use parley_core::{
    AttachmentRef, DomainError, MessageContent, ResourceUrl, RoomId, UserId, UserPair,
};
use parley_protocol::{AttachmentPayload, DirectMessage, DirectMessageSend, RoomMessage, RoomMessageSend};

use super::{
    auth::now_unix,
    core::{AppState, AuthContext},
    errors::ApiFailure,
    gateway_events,
    realtime::ChannelKey,
    storage::{repository, ChatPersistence},
};

/// Why a send was refused. None of these reach other participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendRejection {
    Invalid(&'static str),
    NotMember,
    UnknownReceiver,
    Storage,
}

impl SendRejection {
    pub(crate) fn reason(self) -> &'static str {
        match self {
            Self::Invalid(reason) => reason,
            Self::NotMember => "not_member",
            Self::UnknownReceiver => "unknown_receiver",
            Self::Storage => "storage_error",
        }
    }
}

impl From<ApiFailure> for SendRejection {
    fn from(value: ApiFailure) -> Self {
        match value {
            ApiFailure::NotFound => Self::UnknownReceiver,
            _ => Self::Storage,
        }
    }
}

fn content_from_wire(
    body: Option<String>,
    attachment: Option<AttachmentPayload>,
) -> Result<MessageContent, SendRejection> {
    let attachment = attachment
        .map(|payload| {
            ResourceUrl::try_from(payload.url).map(|url| AttachmentRef {
                url,
                kind: payload.kind,
            })
        })
        .transpose()
        .map_err(|_| SendRejection::Invalid("invalid_attachment"))?;
    MessageContent::new(body, attachment).map_err(|error| match error {
        DomainError::MessageTooLong => SendRejection::Invalid("body_too_long"),
        _ => SendRejection::Invalid("empty_message"),
    })
}

/// Persists a room message from a current member, then delivers it to every
/// connection on the room channel, the sender's own included.
pub(crate) async fn send_room_message(
    state: &AppState,
    auth: &AuthContext,
    command: RoomMessageSend,
) -> Result<RoomMessage, SendRejection> {
    let room_id = RoomId::try_from(command.room_id.as_str())
        .map_err(|_| SendRejection::Invalid("invalid_room_id"))?;
    let content = content_from_wire(command.body, command.attachment)?;

    let repo = repository(state).await?;
    if !repo.is_member(auth.user_id, room_id).await? {
        return Err(SendRejection::NotMember);
    }
    let message = repo
        .insert_room_message(room_id, auth.user_id, &content, now_unix())
        .await?;

    if let Some(event) = gateway_events::room_message(&message) {
        let delivered = state
            .realtime
            .broadcast(ChannelKey::Room(room_id), &event, None)
            .await;
        tracing::debug!(
            event = "gateway.room_message",
            room_id = %room_id,
            message_id = %message.message_id,
            delivered
        );
    }
    Ok(message)
}

/// Persists a direct message and delivers it to the receiver's and the
/// sender's private channels. A user with several connections gets one copy
/// on each of them.
pub(crate) async fn send_direct_message(
    state: &AppState,
    auth: &AuthContext,
    command: DirectMessageSend,
) -> Result<DirectMessage, SendRejection> {
    let receiver_id = UserId::try_from(command.receiver_id.as_str())
        .map_err(|_| SendRejection::Invalid("invalid_receiver_id"))?;
    UserPair::new(auth.user_id, receiver_id)
        .map_err(|_| SendRejection::Invalid("self_direct_message"))?;
    let content = content_from_wire(command.body, command.attachment)?;

    let repo = repository(state).await?;
    if repo.find_user(receiver_id).await?.is_none() {
        return Err(SendRejection::UnknownReceiver);
    }
    let message = repo
        .insert_direct_message(auth.user_id, receiver_id, &content, now_unix())
        .await?;

    if let Some(event) = gateway_events::direct_message(&message) {
        for key in [ChannelKey::User(receiver_id), ChannelKey::User(auth.user_id)] {
            state.realtime.broadcast(key, &event, None).await;
        }
    }
    Ok(message)
}

#[cfg(test)]
mod tests {
    use parley_core::{AttachmentKind, UserId};
    use parley_protocol::{
        decode_server_event, AttachmentPayload, DirectMessageSend, RoomMessageSend, ServerEvent,
    };
    use tokio::sync::{mpsc, watch};
    use uuid::Uuid;

    use super::{send_direct_message, send_room_message, SendRejection};
    use crate::server::{
        core::{AppConfig, AppState, AuthContext, ConnectionControl},
        storage::{repository, seed_user, ChatPersistence},
    };

    fn state() -> AppState {
        let config = AppConfig {
            upload_root: std::env::temp_dir().join("parley-messaging-tests"),
            ..AppConfig::default()
        };
        AppState::new(&config).unwrap()
    }

    async fn user(state: &AppState, name: &str) -> AuthContext {
        let record = seed_user(state, name).await;
        AuthContext {
            user_id: record.user_id,
            username: record.username,
        }
    }

    async fn connect(state: &AppState, auth: &AuthContext) -> mpsc::Receiver<String> {
        let rooms = repository(state)
            .await
            .unwrap()
            .member_room_ids(auth.user_id)
            .await
            .unwrap();
        let (tx, rx) = mpsc::channel(16);
        let (control, _) = watch::channel(ConnectionControl::Open);
        state
            .realtime
            .register(Uuid::new_v4(), auth.user_id, tx, control, &rooms)
            .await;
        rx
    }

    fn room_send(room_id: String, body: Option<&str>) -> RoomMessageSend {
        RoomMessageSend {
            room_id,
            body: body.map(str::to_owned),
            attachment: None,
        }
    }

    #[tokio::test]
    async fn room_message_reaches_members_including_sender() {
        let state = state();
        let alice = user(&state, "alice").await;
        let bob = user(&state, "bob").await;
        let carol = user(&state, "carol").await;
        let repo = repository(&state).await.unwrap();
        let general = repo.find_room_by_name("general").await.unwrap().unwrap();
        repo.add_membership(alice.user_id, general.room_id).await.unwrap();
        repo.add_membership(bob.user_id, general.room_id).await.unwrap();

        let mut alice_rx = connect(&state, &alice).await;
        let mut bob_rx = connect(&state, &bob).await;
        let mut carol_rx = connect(&state, &carol).await;

        let message = send_room_message(
            &state,
            &alice,
            room_send(general.room_id.to_string(), Some("  hello  ")),
        )
        .await
        .unwrap();
        assert_eq!(message.body.as_deref(), Some("hello"));

        for rx in [&mut alice_rx, &mut bob_rx] {
            let frame = rx.recv().await.unwrap();
            assert!(matches!(
                decode_server_event(&frame).unwrap(),
                ServerEvent::RoomMessage(delivered) if delivered.message_id == message.message_id
            ));
            assert!(rx.try_recv().is_err());
        }
        assert!(carol_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn empty_or_non_member_sends_are_rejected_without_fanout() {
        let state = state();
        let alice = user(&state, "alice").await;
        let bob = user(&state, "bob").await;
        let repo = repository(&state).await.unwrap();
        let general = repo.find_room_by_name("general").await.unwrap().unwrap();
        repo.add_membership(bob.user_id, general.room_id).await.unwrap();
        let mut bob_rx = connect(&state, &bob).await;

        assert_eq!(
            send_room_message(&state, &bob, room_send(general.room_id.to_string(), Some("   ")))
                .await
                .unwrap_err(),
            SendRejection::Invalid("empty_message")
        );
        assert_eq!(
            send_room_message(&state, &alice, room_send(general.room_id.to_string(), Some("hi")))
                .await
                .unwrap_err(),
            SendRejection::NotMember
        );
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn attachment_only_message_is_accepted() {
        let state = state();
        let alice = user(&state, "alice").await;
        let repo = repository(&state).await.unwrap();
        let general = repo.find_room_by_name("general").await.unwrap().unwrap();
        repo.add_membership(alice.user_id, general.room_id).await.unwrap();

        let message = send_room_message(
            &state,
            &alice,
            RoomMessageSend {
                room_id: general.room_id.to_string(),
                body: None,
                attachment: Some(AttachmentPayload {
                    url: String::from("/uploads/01J00000000000000000000000"),
                    kind: AttachmentKind::Image,
                }),
            },
        )
        .await
        .unwrap();
        assert_eq!(message.body, None);
        assert_eq!(
            message.attachment.map(|attachment| attachment.kind),
            Some(AttachmentKind::Image)
        );
    }

    #[tokio::test]
    async fn direct_message_reaches_every_connection_of_both_parties() {
        let state = state();
        let alice = user(&state, "alice").await;
        let bob = user(&state, "bob").await;
        let carol = user(&state, "carol").await;
        let mut alice_rx = connect(&state, &alice).await;
        let mut bob_first = connect(&state, &bob).await;
        let mut bob_second = connect(&state, &bob).await;
        let mut carol_rx = connect(&state, &carol).await;

        let message = send_direct_message(
            &state,
            &alice,
            DirectMessageSend {
                receiver_id: bob.user_id.to_string(),
                body: Some(String::from("psst")),
                attachment: None,
            },
        )
        .await
        .unwrap();
        assert!(!message.read);

        for rx in [&mut alice_rx, &mut bob_first, &mut bob_second] {
            let frame = rx.recv().await.unwrap();
            assert!(matches!(
                decode_server_event(&frame).unwrap(),
                ServerEvent::DirectMessage(delivered) if delivered.message_id == message.message_id
            ));
            assert!(rx.try_recv().is_err());
        }
        assert!(carol_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn direct_message_rejects_self_and_unknown_receiver() {
        let state = state();
        let alice = user(&state, "alice").await;
        let send = |receiver_id: String| DirectMessageSend {
            receiver_id,
            body: Some(String::from("hi")),
            attachment: None,
        };

        assert_eq!(
            send_direct_message(&state, &alice, send(alice.user_id.to_string()))
                .await
                .unwrap_err(),
            SendRejection::Invalid("self_direct_message")
        );
        assert_eq!(
            send_direct_message(&state, &alice, send(UserId::new().to_string()))
                .await
                .unwrap_err(),
            SendRejection::UnknownReceiver
        );
    }
}
