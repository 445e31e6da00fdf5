#![forbid(unsafe_code)]

mod events;
mod payloads;

use serde::{Deserialize, Serialize};

pub use events::{
    event_descriptor, EventDescriptor, EventDirection, GatewayEventScope, DIRECT_MESSAGE_EVENT,
    DIRECT_MESSAGE_SEND_EVENT, DIRECT_TYPING_START_EVENT, DIRECT_TYPING_STOP_EVENT,
    EVENT_CATALOG, PRESENCE_OFFLINE_EVENT, PRESENCE_ONLINE_EVENT, READY_EVENT,
    ROOM_CREATED_EVENT, ROOM_MESSAGE_EVENT, ROOM_MESSAGE_SEND_EVENT, ROOM_SUBSCRIBED_EVENT,
    ROOM_SUBSCRIBE_EVENT, TYPING_START_EVENT, TYPING_STOP_EVENT,
};
pub use payloads::{
    decode_server_event, AttachmentPayload, ChatMessage, DirectMessage, DirectMessageSend,
    DirectTypingCommand, DirectTypingStarted, DirectTypingStopped, PresencePayload,
    ReadyPayload, RoomCreatedPayload, RoomMessage, RoomMessageSend, RoomSubscribeCommand,
    RoomSubscribedPayload, RoomTypingCommand, ServerEvent, TypingStarted, TypingStopped,
    UserSummary,
};

/// Current gateway envelope version.
pub const PROTOCOL_VERSION: u16 = 1;
/// Maximum allowed gateway payload bytes.
pub const MAX_EVENT_BYTES: usize = 64 * 1024;

/// Versioned gateway envelope. All events use `{ v, t, d }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Envelope<T> {
    pub v: u16,
    pub t: EventType,
    pub d: T,
}

/// Event type identifier with a strict character allowlist.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventType(String);

impl EventType {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for EventType {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_event_type(&value)?;
        Ok(Self(value))
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        value.0
    }
}

/// Parse and validate an incoming envelope at the network boundary.
///
/// # Errors
/// Returns [`ProtocolError`] if the payload exceeds limits, is malformed JSON,
/// contains an unsupported version, or has an invalid event type.
pub fn parse_envelope(input: &[u8]) -> Result<Envelope<serde_json::Value>, ProtocolError> {
    if input.len() > MAX_EVENT_BYTES {
        return Err(ProtocolError::OversizedPayload {
            max: MAX_EVENT_BYTES,
            actual: input.len(),
        });
    }

    let envelope: Envelope<serde_json::Value> = serde_json::from_slice(input)?;
    if envelope.v != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion {
            expected: PROTOCOL_VERSION,
            actual: envelope.v,
        });
    }

    Ok(envelope)
}

/// Serialize `data` into a versioned envelope string.
///
/// # Errors
/// Returns [`ProtocolError::InvalidEventType`] for an identifier outside the
/// allowlist and [`ProtocolError::InvalidJson`] if `data` cannot be encoded.
pub fn encode_event<T: Serialize>(event_type: &str, data: &T) -> Result<String, ProtocolError> {
    let envelope = Envelope {
        v: PROTOCOL_VERSION,
        t: EventType::try_from(event_type.to_owned())?,
        d: data,
    };
    Ok(serde_json::to_string(&envelope)?)
}

pub(crate) fn validate_event_type(value: &str) -> Result<(), ProtocolError> {
    const MAX_LEN: usize = 64;

    if value.is_empty() || value.len() > MAX_LEN {
        return Err(ProtocolError::InvalidEventType);
    }

    if value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '.')
    {
        return Ok(());
    }

    Err(ProtocolError::InvalidEventType)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("payload exceeds max size: max={max} bytes actual={actual} bytes")]
    OversizedPayload { max: usize, actual: usize },
    #[error("unsupported envelope version: expected={expected} actual={actual}")]
    UnsupportedVersion { expected: u16, actual: u16 },
    #[error("invalid event type")]
    InvalidEventType,
    #[error("invalid json payload")]
    InvalidJson,
    #[error("event `{0}` is not a server event")]
    UnknownEvent(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(_: serde_json::Error) -> Self {
        Self::InvalidJson
    }
}
