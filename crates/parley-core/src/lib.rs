#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Returns the project code name.
#[must_use]
pub const fn project_name() -> &'static str {
    "parley"
}

/// Maximum characters accepted in a message body after trimming.
pub const MAX_MESSAGE_BODY_CHARS: usize = 4_000;
/// Maximum length of an attachment or avatar reference.
pub const MAX_RESOURCE_URL_CHARS: usize = 2_048;
/// Path prefix under which the upload store serves blobs.
pub const UPLOAD_URL_PREFIX: &str = "/uploads/";
/// Maximum length of a sign-in email address.
pub const MAX_EMAIL_CHARS: usize = 254;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("username is invalid")]
    InvalidUsername,
    #[error("email is invalid")]
    InvalidEmail,
    #[error("room name is invalid")]
    InvalidRoomName,
    #[error("room description is invalid")]
    InvalidRoomDescription,
    #[error("user id is invalid")]
    InvalidUserId,
    #[error("room id is invalid")]
    InvalidRoomId,
    #[error("message id is invalid")]
    InvalidMessageId,
    #[error("message has neither body nor attachment")]
    EmptyMessage,
    #[error("message body is too long")]
    MessageTooLong,
    #[error("attachment reference is invalid")]
    InvalidAttachment,
    #[error("resource url is invalid")]
    InvalidResourceUrl,
    #[error("a direct message scope needs two distinct users")]
    SelfDirectMessage,
}

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident, $error:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Ulid> for $name {
            fn from(value: Ulid) -> Self {
                Self(value)
            }
        }

        impl TryFrom<String> for $name {
            type Error = DomainError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::try_from(value.as_str())
            }
        }

        impl TryFrom<&str> for $name {
            type Error = DomainError;

            fn try_from(value: &str) -> Result<Self, Self::Error> {
                let parsed = Ulid::from_string(value).map_err(|_| $error)?;
                Ok(Self(parsed))
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

ulid_id!(UserId, DomainError::InvalidUserId);
ulid_id!(RoomId, DomainError::InvalidRoomId);
ulid_id!(
    /// Identifier shared by room and direct messages. Ids sort in creation
    /// order, which is what history cursors rely on.
    MessageId,
    DomainError::InvalidMessageId
);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Username(String);

impl Username {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Username {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_username(&value)?;
        Ok(Self(value))
    }
}

/// Sign-in identity, kept apart from the display [`Username`]. Stored
/// trimmed and lowercased so uniqueness ignores case.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Email(String);

impl Email {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Email {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let normalized = value.trim().to_ascii_lowercase();
        validate_email(&normalized)?;
        Ok(Self(normalized))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomName(String);

impl RoomName {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RoomName {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_room_name(&value)?;
        Ok(Self(value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomDescription(String);

impl RoomDescription {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RoomDescription {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.chars().count() > 200 || value.contains('\0') {
            return Err(DomainError::InvalidRoomDescription);
        }
        Ok(Self(value))
    }
}

/// Link to a stored blob: either a path served by the upload store or an
/// absolute http(s) URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceUrl(String);

impl ResourceUrl {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ResourceUrl {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_resource_url(&value)?;
        Ok(Self(value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Image,
    File,
}

impl AttachmentKind {
    #[must_use]
    pub fn from_mime(mime: &str) -> Self {
        if mime.starts_with("image/") {
            Self::Image
        } else {
            Self::File
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::File => "file",
        }
    }
}

impl TryFrom<String> for AttachmentKind {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "image" => Ok(Self::Image),
            "file" => Ok(Self::File),
            _ => Err(DomainError::InvalidAttachment),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentRef {
    pub url: ResourceUrl,
    pub kind: AttachmentKind,
}

/// Validated message payload. A message carries a non-blank body, an
/// attachment, or both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageContent {
    body: Option<String>,
    attachment: Option<AttachmentRef>,
}

impl MessageContent {
    /// Trims the body and checks that something remains to deliver.
    ///
    /// # Errors
    /// Returns [`DomainError::EmptyMessage`] when the trimmed body is empty and
    /// no attachment is present, or [`DomainError::MessageTooLong`] when the
    /// body exceeds [`MAX_MESSAGE_BODY_CHARS`].
    pub fn new(
        body: Option<String>,
        attachment: Option<AttachmentRef>,
    ) -> Result<Self, DomainError> {
        let body = body
            .map(|raw| raw.trim().to_owned())
            .filter(|trimmed| !trimmed.is_empty());
        if body.is_none() && attachment.is_none() {
            return Err(DomainError::EmptyMessage);
        }
        if body
            .as_ref()
            .is_some_and(|text| text.chars().count() > MAX_MESSAGE_BODY_CHARS)
        {
            return Err(DomainError::MessageTooLong);
        }
        Ok(Self { body, attachment })
    }

    #[must_use]
    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    #[must_use]
    pub fn attachment(&self) -> Option<&AttachmentRef> {
        self.attachment.as_ref()
    }
}

/// Unordered pair of distinct users addressing a direct conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UserPair {
    low: UserId,
    high: UserId,
}

impl UserPair {
    /// # Errors
    /// Returns [`DomainError::SelfDirectMessage`] when both ids are equal.
    pub fn new(a: UserId, b: UserId) -> Result<Self, DomainError> {
        match a.cmp(&b) {
            core::cmp::Ordering::Less => Ok(Self { low: a, high: b }),
            core::cmp::Ordering::Greater => Ok(Self { low: b, high: a }),
            core::cmp::Ordering::Equal => Err(DomainError::SelfDirectMessage),
        }
    }

    #[must_use]
    pub fn members(self) -> (UserId, UserId) {
        (self.low, self.high)
    }

    #[must_use]
    pub fn contains(self, user_id: UserId) -> bool {
        self.low == user_id || self.high == user_id
    }

    #[must_use]
    pub fn partner_of(self, user_id: UserId) -> Option<UserId> {
        if self.low == user_id {
            Some(self.high)
        } else if self.high == user_id {
            Some(self.low)
        } else {
            None
        }
    }
}

/// Addressing unit for history reads and typing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChatScope {
    Room(RoomId),
    Direct(UserPair),
}

fn validate_username(value: &str) -> Result<(), DomainError> {
    if !(3..=20).contains(&value.len()) {
        return Err(DomainError::InvalidUsername);
    }

    if value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Ok(());
    }

    Err(DomainError::InvalidUsername)
}

fn validate_email(value: &str) -> Result<(), DomainError> {
    if value.is_empty() || value.len() > MAX_EMAIL_CHARS {
        return Err(DomainError::InvalidEmail);
    }
    if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(DomainError::InvalidEmail);
    }
    let Some((local, domain)) = value.split_once('@') else {
        return Err(DomainError::InvalidEmail);
    };
    if local.is_empty() || local.len() > 64 || domain.contains('@') {
        return Err(DomainError::InvalidEmail);
    }
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 || labels.iter().any(|label| label.is_empty()) {
        return Err(DomainError::InvalidEmail);
    }

    Ok(())
}

fn validate_room_name(value: &str) -> Result<(), DomainError> {
    if !(2..=50).contains(&value.len()) {
        return Err(DomainError::InvalidRoomName);
    }

    if value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
    {
        return Ok(());
    }

    Err(DomainError::InvalidRoomName)
}

fn validate_resource_url(value: &str) -> Result<(), DomainError> {
    if value.is_empty() || value.len() > MAX_RESOURCE_URL_CHARS {
        return Err(DomainError::InvalidResourceUrl);
    }
    if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(DomainError::InvalidResourceUrl);
    }
    if let Some(rest) = value.strip_prefix(UPLOAD_URL_PREFIX) {
        if !rest.is_empty() && !rest.contains("..") {
            return Ok(());
        }
        return Err(DomainError::InvalidResourceUrl);
    }

    let Some((scheme, rest)) = value.split_once("://") else {
        return Err(DomainError::InvalidResourceUrl);
    };
    if matches!(scheme.to_ascii_lowercase().as_str(), "http" | "https") && !rest.is_empty() {
        Ok(())
    } else {
        Err(DomainError::InvalidResourceUrl)
    }
}
