use parley_core::AttachmentKind;
use serde::{Deserialize, Serialize};

use crate::{
    events::{
        DIRECT_MESSAGE_EVENT, DIRECT_TYPING_START_EVENT, DIRECT_TYPING_STOP_EVENT,
        PRESENCE_OFFLINE_EVENT, PRESENCE_ONLINE_EVENT, READY_EVENT, ROOM_CREATED_EVENT,
        ROOM_MESSAGE_EVENT, ROOM_SUBSCRIBED_EVENT, TYPING_START_EVENT, TYPING_STOP_EVENT,
    },
    parse_envelope, ProtocolError,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub user_id: String,
    pub username: String,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttachmentPayload {
    pub url: String,
    pub kind: AttachmentKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMessage {
    pub message_id: String,
    pub room_id: String,
    pub sender: UserSummary,
    pub body: Option<String>,
    pub attachment: Option<AttachmentPayload>,
    pub created_at_unix: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectMessage {
    pub message_id: String,
    pub sender: UserSummary,
    pub receiver_id: String,
    pub body: Option<String>,
    pub attachment: Option<AttachmentPayload>,
    pub read: bool,
    pub created_at_unix: i64,
}

/// A message as a client renders it, tagged by where it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "origin", rename_all = "snake_case")]
pub enum ChatMessage {
    Room(RoomMessage),
    Direct(DirectMessage),
}

impl ChatMessage {
    #[must_use]
    pub fn message_id(&self) -> &str {
        match self {
            Self::Room(message) => &message.message_id,
            Self::Direct(message) => &message.message_id,
        }
    }

    #[must_use]
    pub fn sender(&self) -> &UserSummary {
        match self {
            Self::Room(message) => &message.sender,
            Self::Direct(message) => &message.sender,
        }
    }

    #[must_use]
    pub fn body(&self) -> Option<&str> {
        match self {
            Self::Room(message) => message.body.as_deref(),
            Self::Direct(message) => message.body.as_deref(),
        }
    }

    #[must_use]
    pub fn created_at_unix(&self) -> i64 {
        match self {
            Self::Room(message) => message.created_at_unix,
            Self::Direct(message) => message.created_at_unix,
        }
    }

    /// The conversation this message belongs to from `viewer_id`'s side:
    /// the room id, or the other participant of a direct exchange.
    #[must_use]
    pub fn conversation_for<'a>(&'a self, viewer_id: &str) -> &'a str {
        match self {
            Self::Room(message) => &message.room_id,
            Self::Direct(message) if message.sender.user_id == viewer_id => &message.receiver_id,
            Self::Direct(message) => &message.sender.user_id,
        }
    }
}

impl From<RoomMessage> for ChatMessage {
    fn from(value: RoomMessage) -> Self {
        Self::Room(value)
    }
}

impl From<DirectMessage> for ChatMessage {
    fn from(value: DirectMessage) -> Self {
        Self::Direct(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoomMessageSend {
    pub room_id: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub attachment: Option<AttachmentPayload>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DirectMessageSend {
    pub receiver_id: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub attachment: Option<AttachmentPayload>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoomTypingCommand {
    pub room_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DirectTypingCommand {
    pub receiver_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoomSubscribeCommand {
    pub room_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyPayload {
    pub user_id: String,
    pub room_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingStarted {
    pub room_id: String,
    pub user_id: String,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingStopped {
    pub room_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectTypingStarted {
    pub user_id: String,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectTypingStopped {
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresencePayload {
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSubscribedPayload {
    pub room_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomCreatedPayload {
    pub room_id: String,
    pub name: String,
    pub description: Option<String>,
    pub created_by: Option<String>,
    pub created_at_unix: i64,
}

/// Every event a client can receive, decoded from its envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Ready(ReadyPayload),
    RoomMessage(RoomMessage),
    DirectMessage(DirectMessage),
    TypingStarted(TypingStarted),
    TypingStopped(TypingStopped),
    DirectTypingStarted(DirectTypingStarted),
    DirectTypingStopped(DirectTypingStopped),
    PresenceOnline(PresencePayload),
    PresenceOffline(PresencePayload),
    RoomSubscribed(RoomSubscribedPayload),
    RoomCreated(RoomCreatedPayload),
}

impl ServerEvent {
    #[must_use]
    pub fn into_chat_message(self) -> Option<ChatMessage> {
        match self {
            Self::RoomMessage(message) => Some(ChatMessage::Room(message)),
            Self::DirectMessage(message) => Some(ChatMessage::Direct(message)),
            _ => None,
        }
    }
}

/// Decode a server-to-client frame.
///
/// # Errors
/// Returns [`ProtocolError`] for malformed envelopes, payloads that do not
/// match their event type, or event types clients never receive.
pub fn decode_server_event(input: &str) -> Result<ServerEvent, ProtocolError> {
    let envelope = parse_envelope(input.as_bytes())?;
    let data = envelope.d;
    let event = match envelope.t.as_str() {
        READY_EVENT => ServerEvent::Ready(serde_json::from_value(data)?),
        ROOM_MESSAGE_EVENT => ServerEvent::RoomMessage(serde_json::from_value(data)?),
        DIRECT_MESSAGE_EVENT => ServerEvent::DirectMessage(serde_json::from_value(data)?),
        TYPING_START_EVENT => ServerEvent::TypingStarted(serde_json::from_value(data)?),
        TYPING_STOP_EVENT => ServerEvent::TypingStopped(serde_json::from_value(data)?),
        DIRECT_TYPING_START_EVENT => {
            ServerEvent::DirectTypingStarted(serde_json::from_value(data)?)
        }
        DIRECT_TYPING_STOP_EVENT => {
            ServerEvent::DirectTypingStopped(serde_json::from_value(data)?)
        }
        PRESENCE_ONLINE_EVENT => ServerEvent::PresenceOnline(serde_json::from_value(data)?),
        PRESENCE_OFFLINE_EVENT => ServerEvent::PresenceOffline(serde_json::from_value(data)?),
        ROOM_SUBSCRIBED_EVENT => ServerEvent::RoomSubscribed(serde_json::from_value(data)?),
        ROOM_CREATED_EVENT => ServerEvent::RoomCreated(serde_json::from_value(data)?),
        other => return Err(ProtocolError::UnknownEvent(other.to_owned())),
    };
    Ok(event)
}

#[cfg(test)]
mod tests {
    use parley_core::AttachmentKind;
    use serde_json::{json, Value};

    use super::{
        decode_server_event, ChatMessage, DirectMessage, RoomMessage, RoomMessageSend,
        ServerEvent, UserSummary,
    };
    use crate::{encode_event, ProtocolError, DIRECT_MESSAGE_EVENT};

    fn alice() -> UserSummary {
        UserSummary {
            user_id: String::from("u-alice"),
            username: String::from("alice"),
            avatar_url: None,
        }
    }

    fn direct_to_bob() -> DirectMessage {
        DirectMessage {
            message_id: String::from("m1"),
            sender: alice(),
            receiver_id: String::from("u-bob"),
            body: Some(String::from("hi bob")),
            attachment: None,
            read: false,
            created_at_unix: 10,
        }
    }

    #[test]
    fn chat_message_serializes_with_origin_tag() {
        let message = ChatMessage::Direct(direct_to_bob());
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["origin"], Value::from("direct"));
        assert_eq!(value["receiver_id"], Value::from("u-bob"));

        let back: ChatMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn conversation_key_depends_on_viewer_for_direct_messages() {
        let message = ChatMessage::Direct(direct_to_bob());
        assert_eq!(message.conversation_for("u-alice"), "u-bob");
        assert_eq!(message.conversation_for("u-bob"), "u-alice");

        let room = ChatMessage::Room(RoomMessage {
            message_id: String::from("m2"),
            room_id: String::from("r1"),
            sender: alice(),
            body: None,
            attachment: None,
            created_at_unix: 11,
        });
        assert_eq!(room.conversation_for("u-bob"), "r1");
    }

    #[test]
    fn decodes_direct_message_frames_into_tagged_variant() {
        let frame = encode_event(DIRECT_MESSAGE_EVENT, &direct_to_bob()).unwrap();
        let event = decode_server_event(&frame).unwrap();
        let message = event.into_chat_message().unwrap();
        assert!(matches!(message, ChatMessage::Direct(_)));
        assert_eq!(message.body(), Some("hi bob"));
    }

    #[test]
    fn decode_rejects_client_only_events() {
        let frame = json!({"v":1,"t":"room_message_send","d":{"room_id":"r1"}}).to_string();
        assert_eq!(
            decode_server_event(&frame).unwrap_err(),
            ProtocolError::UnknownEvent(String::from("room_message_send"))
        );
    }

    #[test]
    fn decode_presence_online() {
        let frame = json!({"v":1,"t":"presence_online","d":{"user_id":"u1"}}).to_string();
        match decode_server_event(&frame).unwrap() {
            ServerEvent::PresenceOnline(payload) => assert_eq!(payload.user_id, "u1"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn room_send_command_rejects_unknown_fields() {
        let valid: RoomMessageSend = serde_json::from_value(json!({
            "room_id": "r1",
            "attachment": {"url": "/uploads/a", "kind": "image"}
        }))
        .unwrap();
        assert_eq!(valid.body, None);
        assert_eq!(
            valid.attachment.map(|attachment| attachment.kind),
            Some(AttachmentKind::Image)
        );

        assert!(serde_json::from_value::<RoomMessageSend>(json!({
            "room_id": "r1",
            "body": "x",
            "file_url": "/uploads/a"
        }))
        .is_err());
    }
}
