mod in_memory;
mod postgres;

use parley_core::{
    AttachmentKind, AttachmentRef, ChatScope, Email, MessageContent, MessageId, ResourceUrl,
    RoomDescription, RoomId, RoomName, UserId, Username,
};
use parley_protocol::{AttachmentPayload, ChatMessage, DirectMessage, RoomMessage, UserSummary};

pub(crate) use in_memory::{InMemoryChatRepository, MemoryStore};
pub(crate) use postgres::PostgresChatRepository;

use super::{core::AppState, db::ensure_db_schema, errors::ApiFailure};

#[derive(Debug, Clone)]
pub(crate) struct UserRecord {
    pub(crate) user_id: UserId,
    pub(crate) email: String,
    pub(crate) username: String,
    pub(crate) password_hash: String,
    pub(crate) avatar_url: Option<String>,
    pub(crate) is_online: bool,
    pub(crate) created_at_unix: i64,
}

impl UserRecord {
    pub(crate) fn summary(&self) -> UserSummary {
        UserSummary {
            user_id: self.user_id.to_string(),
            username: self.username.clone(),
            avatar_url: self.avatar_url.clone(),
        }
    }
}

/// Everything written when an account is registered.
#[derive(Debug, Clone, Copy)]
pub(crate) struct NewAccount<'a> {
    pub(crate) email: &'a Email,
    pub(crate) username: &'a Username,
    pub(crate) password_hash: &'a str,
    /// Joined in the same write as the user row.
    pub(crate) initial_room: Option<RoomId>,
}

#[derive(Debug, Clone)]
pub(crate) struct RoomRecord {
    pub(crate) room_id: RoomId,
    pub(crate) name: String,
    pub(crate) description: Option<String>,
    pub(crate) avatar_url: Option<String>,
    pub(crate) created_by: Option<UserId>,
    pub(crate) created_at_unix: i64,
}

#[derive(Debug, Clone)]
pub(crate) struct RoomListing {
    pub(crate) room: RoomRecord,
    pub(crate) member_count: u64,
    pub(crate) is_member: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct UploadRecord {
    pub(crate) upload_id: String,
    pub(crate) owner_id: UserId,
    pub(crate) mime_type: String,
    pub(crate) size_bytes: u64,
    pub(crate) sha256_hex: String,
    pub(crate) created_at_unix: i64,
}

/// Profile changes requested by the owner. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub(crate) struct ProfileUpdate {
    pub(crate) username: Option<Username>,
    pub(crate) avatar_url: Option<ResourceUrl>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct UnreadCount {
    pub(crate) sender_id: UserId,
    pub(crate) count: u64,
}

pub(crate) trait ChatPersistence {
    /// Creates the user and its initial membership atomically. Fails with
    /// `email_taken` or `username_taken` and writes nothing on a clash.
    async fn create_user(
        &self,
        account: &NewAccount<'_>,
        now_unix: i64,
    ) -> Result<UserRecord, ApiFailure>;

    async fn find_user(&self, user_id: UserId) -> Result<Option<UserRecord>, ApiFailure>;

    async fn find_user_by_email(&self, email: &Email) -> Result<Option<UserRecord>, ApiFailure>;

    /// Every user but `viewer`, online users first, then by username.
    async fn list_users_except(&self, viewer: UserId) -> Result<Vec<UserRecord>, ApiFailure>;

    async fn update_profile(
        &self,
        user_id: UserId,
        update: &ProfileUpdate,
    ) -> Result<UserRecord, ApiFailure>;

    async fn set_online(&self, user_id: UserId, online: bool) -> Result<(), ApiFailure>;

    async fn insert_session(
        &self,
        token_hash: [u8; 32],
        user_id: UserId,
        expires_at_unix: i64,
    ) -> Result<(), ApiFailure>;

    /// Deletes the session row and returns its owner if it was still valid.
    /// A second call with the same hash always yields `None`.
    async fn take_session(
        &self,
        token_hash: [u8; 32],
        now_unix: i64,
    ) -> Result<Option<UserId>, ApiFailure>;

    async fn create_room(
        &self,
        name: &RoomName,
        description: Option<&RoomDescription>,
        created_by: UserId,
        now_unix: i64,
    ) -> Result<RoomRecord, ApiFailure>;

    async fn find_room(&self, room_id: RoomId) -> Result<Option<RoomRecord>, ApiFailure>;

    async fn find_room_by_name(&self, name: &str) -> Result<Option<RoomRecord>, ApiFailure>;

    async fn list_rooms(&self, viewer: UserId) -> Result<Vec<RoomListing>, ApiFailure>;

    async fn room_members(&self, room_id: RoomId) -> Result<Vec<UserRecord>, ApiFailure>;

    /// Returns `false` when the membership already existed.
    async fn add_membership(&self, user_id: UserId, room_id: RoomId) -> Result<bool, ApiFailure>;

    /// Returns `false` when there was no membership to remove.
    async fn remove_membership(
        &self,
        user_id: UserId,
        room_id: RoomId,
    ) -> Result<bool, ApiFailure>;

    async fn is_member(&self, user_id: UserId, room_id: RoomId) -> Result<bool, ApiFailure>;

    async fn member_room_ids(&self, user_id: UserId) -> Result<Vec<RoomId>, ApiFailure>;

    async fn insert_room_message(
        &self,
        room_id: RoomId,
        sender_id: UserId,
        content: &MessageContent,
        now_unix: i64,
    ) -> Result<RoomMessage, ApiFailure>;

    async fn insert_direct_message(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        content: &MessageContent,
        now_unix: i64,
    ) -> Result<DirectMessage, ApiFailure>;

    /// Up to `limit` messages in `scope` strictly older than `before`,
    /// newest first.
    async fn messages_before(
        &self,
        scope: ChatScope,
        before: Option<MessageId>,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, ApiFailure>;

    /// Flips every unread message from `sender_id` to `reader_id` to read.
    async fn mark_direct_read(
        &self,
        reader_id: UserId,
        sender_id: UserId,
    ) -> Result<u64, ApiFailure>;

    async fn unread_counts(&self, receiver_id: UserId) -> Result<Vec<UnreadCount>, ApiFailure>;

    async fn insert_upload(&self, record: &UploadRecord) -> Result<(), ApiFailure>;

    async fn find_upload(&self, upload_id: &str) -> Result<Option<UploadRecord>, ApiFailure>;
}

pub(crate) enum ChatRepository<'a> {
    Postgres(PostgresChatRepository<'a>),
    InMemory(InMemoryChatRepository<'a>),
}

impl ChatRepository<'_> {
    pub(crate) fn from_state(state: &AppState) -> ChatRepository<'_> {
        if let Some(pool) = &state.db_pool {
            ChatRepository::Postgres(PostgresChatRepository::new(state, pool))
        } else {
            ChatRepository::InMemory(InMemoryChatRepository::new(state))
        }
    }
}

/// Storage handle for request and gateway handlers. The Postgres schema is
/// created on first use.
pub(crate) async fn repository(state: &AppState) -> Result<ChatRepository<'_>, ApiFailure> {
    ensure_db_schema(state).await?;
    Ok(ChatRepository::from_state(state))
}

/// Registers `name` with a derived email and no initial room.
#[cfg(test)]
pub(crate) async fn seed_user(state: &AppState, name: &str) -> UserRecord {
    let email = Email::try_from(format!("{name}@example.test")).unwrap();
    let username = Username::try_from(name.to_owned()).unwrap();
    repository(state)
        .await
        .unwrap()
        .create_user(
            &NewAccount {
                email: &email,
                username: &username,
                password_hash: "hash",
                initial_room: None,
            },
            super::auth::now_unix(),
        )
        .await
        .unwrap()
}

pub(crate) fn attachment_payload(attachment: &AttachmentRef) -> AttachmentPayload {
    AttachmentPayload {
        url: attachment.url.as_str().to_owned(),
        kind: attachment.kind,
    }
}

/// Rebuilds an attachment read back from storage. Rows that no longer pass
/// validation are surfaced without the attachment rather than failing the page.
pub(crate) fn stored_attachment(
    url: Option<String>,
    kind: Option<String>,
) -> Option<AttachmentPayload> {
    let url = ResourceUrl::try_from(url?).ok()?;
    let kind = AttachmentKind::try_from(kind?).ok()?;
    Some(attachment_payload(&AttachmentRef { url, kind }))
}

impl ChatPersistence for ChatRepository<'_> {
    async fn create_user(
        &self,
        account: &NewAccount<'_>,
        now_unix: i64,
    ) -> Result<UserRecord, ApiFailure> {
        match self {
            Self::Postgres(repo) => repo.create_user(account, now_unix).await,
            Self::InMemory(repo) => repo.create_user(account, now_unix).await,
        }
    }

    async fn find_user(&self, user_id: UserId) -> Result<Option<UserRecord>, ApiFailure> {
        match self {
            Self::Postgres(repo) => repo.find_user(user_id).await,
            Self::InMemory(repo) => repo.find_user(user_id).await,
        }
    }

    async fn find_user_by_email(&self, email: &Email) -> Result<Option<UserRecord>, ApiFailure> {
        match self {
            Self::Postgres(repo) => repo.find_user_by_email(email).await,
            Self::InMemory(repo) => repo.find_user_by_email(email).await,
        }
    }

    async fn list_users_except(&self, viewer: UserId) -> Result<Vec<UserRecord>, ApiFailure> {
        match self {
            Self::Postgres(repo) => repo.list_users_except(viewer).await,
            Self::InMemory(repo) => repo.list_users_except(viewer).await,
        }
    }

    async fn update_profile(
        &self,
        user_id: UserId,
        update: &ProfileUpdate,
    ) -> Result<UserRecord, ApiFailure> {
        match self {
            Self::Postgres(repo) => repo.update_profile(user_id, update).await,
            Self::InMemory(repo) => repo.update_profile(user_id, update).await,
        }
    }

    async fn set_online(&self, user_id: UserId, online: bool) -> Result<(), ApiFailure> {
        match self {
            Self::Postgres(repo) => repo.set_online(user_id, online).await,
            Self::InMemory(repo) => repo.set_online(user_id, online).await,
        }
    }

    async fn insert_session(
        &self,
        token_hash: [u8; 32],
        user_id: UserId,
        expires_at_unix: i64,
    ) -> Result<(), ApiFailure> {
        match self {
            Self::Postgres(repo) => {
                repo.insert_session(token_hash, user_id, expires_at_unix)
                    .await
            }
            Self::InMemory(repo) => {
                repo.insert_session(token_hash, user_id, expires_at_unix)
                    .await
            }
        }
    }

    async fn take_session(
        &self,
        token_hash: [u8; 32],
        now_unix: i64,
    ) -> Result<Option<UserId>, ApiFailure> {
        match self {
            Self::Postgres(repo) => repo.take_session(token_hash, now_unix).await,
            Self::InMemory(repo) => repo.take_session(token_hash, now_unix).await,
        }
    }

    async fn create_room(
        &self,
        name: &RoomName,
        description: Option<&RoomDescription>,
        created_by: UserId,
        now_unix: i64,
    ) -> Result<RoomRecord, ApiFailure> {
        match self {
            Self::Postgres(repo) => {
                repo.create_room(name, description, created_by, now_unix)
                    .await
            }
            Self::InMemory(repo) => {
                repo.create_room(name, description, created_by, now_unix)
                    .await
            }
        }
    }

    async fn find_room(&self, room_id: RoomId) -> Result<Option<RoomRecord>, ApiFailure> {
        match self {
            Self::Postgres(repo) => repo.find_room(room_id).await,
            Self::InMemory(repo) => repo.find_room(room_id).await,
        }
    }

    async fn find_room_by_name(&self, name: &str) -> Result<Option<RoomRecord>, ApiFailure> {
        match self {
            Self::Postgres(repo) => repo.find_room_by_name(name).await,
            Self::InMemory(repo) => repo.find_room_by_name(name).await,
        }
    }

    async fn list_rooms(&self, viewer: UserId) -> Result<Vec<RoomListing>, ApiFailure> {
        match self {
            Self::Postgres(repo) => repo.list_rooms(viewer).await,
            Self::InMemory(repo) => repo.list_rooms(viewer).await,
        }
    }

    async fn room_members(&self, room_id: RoomId) -> Result<Vec<UserRecord>, ApiFailure> {
        match self {
            Self::Postgres(repo) => repo.room_members(room_id).await,
            Self::InMemory(repo) => repo.room_members(room_id).await,
        }
    }

    async fn add_membership(&self, user_id: UserId, room_id: RoomId) -> Result<bool, ApiFailure> {
        match self {
            Self::Postgres(repo) => repo.add_membership(user_id, room_id).await,
            Self::InMemory(repo) => repo.add_membership(user_id, room_id).await,
        }
    }

    async fn remove_membership(
        &self,
        user_id: UserId,
        room_id: RoomId,
    ) -> Result<bool, ApiFailure> {
        match self {
            Self::Postgres(repo) => repo.remove_membership(user_id, room_id).await,
            Self::InMemory(repo) => repo.remove_membership(user_id, room_id).await,
        }
    }

    async fn is_member(&self, user_id: UserId, room_id: RoomId) -> Result<bool, ApiFailure> {
        match self {
            Self::Postgres(repo) => repo.is_member(user_id, room_id).await,
            Self::InMemory(repo) => repo.is_member(user_id, room_id).await,
        }
    }

    async fn member_room_ids(&self, user_id: UserId) -> Result<Vec<RoomId>, ApiFailure> {
        match self {
            Self::Postgres(repo) => repo.member_room_ids(user_id).await,
            Self::InMemory(repo) => repo.member_room_ids(user_id).await,
        }
    }

    async fn insert_room_message(
        &self,
        room_id: RoomId,
        sender_id: UserId,
        content: &MessageContent,
        now_unix: i64,
    ) -> Result<RoomMessage, ApiFailure> {
        match self {
            Self::Postgres(repo) => {
                repo.insert_room_message(room_id, sender_id, content, now_unix)
                    .await
            }
            Self::InMemory(repo) => {
                repo.insert_room_message(room_id, sender_id, content, now_unix)
                    .await
            }
        }
    }

    async fn insert_direct_message(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        content: &MessageContent,
        now_unix: i64,
    ) -> Result<DirectMessage, ApiFailure> {
        match self {
            Self::Postgres(repo) => {
                repo.insert_direct_message(sender_id, receiver_id, content, now_unix)
                    .await
            }
            Self::InMemory(repo) => {
                repo.insert_direct_message(sender_id, receiver_id, content, now_unix)
                    .await
            }
        }
    }

    async fn messages_before(
        &self,
        scope: ChatScope,
        before: Option<MessageId>,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, ApiFailure> {
        match self {
            Self::Postgres(repo) => repo.messages_before(scope, before, limit).await,
            Self::InMemory(repo) => repo.messages_before(scope, before, limit).await,
        }
    }

    async fn mark_direct_read(
        &self,
        reader_id: UserId,
        sender_id: UserId,
    ) -> Result<u64, ApiFailure> {
        match self {
            Self::Postgres(repo) => repo.mark_direct_read(reader_id, sender_id).await,
            Self::InMemory(repo) => repo.mark_direct_read(reader_id, sender_id).await,
        }
    }

    async fn unread_counts(&self, receiver_id: UserId) -> Result<Vec<UnreadCount>, ApiFailure> {
        match self {
            Self::Postgres(repo) => repo.unread_counts(receiver_id).await,
            Self::InMemory(repo) => repo.unread_counts(receiver_id).await,
        }
    }

    async fn insert_upload(&self, record: &UploadRecord) -> Result<(), ApiFailure> {
        match self {
            Self::Postgres(repo) => repo.insert_upload(record).await,
            Self::InMemory(repo) => repo.insert_upload(record).await,
        }
    }

    async fn find_upload(&self, upload_id: &str) -> Result<Option<UploadRecord>, ApiFailure> {
        match self {
            Self::Postgres(repo) => repo.find_upload(upload_id).await,
            Self::InMemory(repo) => repo.find_upload(upload_id).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use parley_core::{Email, RoomId, Username};

    use super::{repository, ChatPersistence, NewAccount};
    use crate::server::{
        auth::now_unix,
        core::{AppConfig, AppState},
        errors::ApiFailure,
    };

    fn state() -> AppState {
        let config = AppConfig {
            upload_root: std::env::temp_dir().join("parley-storage-tests"),
            ..AppConfig::default()
        };
        AppState::new(&config).unwrap()
    }

    fn account<'a>(
        email: &'a Email,
        username: &'a Username,
        initial_room: Option<RoomId>,
    ) -> NewAccount<'a> {
        NewAccount {
            email,
            username,
            password_hash: "hash",
            initial_room,
        }
    }

    #[tokio::test]
    async fn failed_initial_join_leaves_no_account_behind() {
        let state = state();
        let repo = repository(&state).await.unwrap();
        let email = Email::try_from(String::from("gina@example.test")).unwrap();
        let username = Username::try_from(String::from("gina")).unwrap();

        let missing_room = repo
            .create_user(&account(&email, &username, Some(RoomId::new())), now_unix())
            .await;
        assert!(matches!(missing_room, Err(ApiFailure::NotFound)));
        assert!(repo.find_user_by_email(&email).await.unwrap().is_none());

        let general = repo.find_room_by_name("general").await.unwrap().unwrap();
        let user = repo
            .create_user(&account(&email, &username, Some(general.room_id)), now_unix())
            .await
            .unwrap();
        assert!(repo.is_member(user.user_id, general.room_id).await.unwrap());
        assert_eq!(
            repo.find_user_by_email(&email).await.unwrap().unwrap().user_id,
            user.user_id
        );
    }

    #[tokio::test]
    async fn conflicts_name_the_clashing_identity() {
        let state = state();
        let repo = repository(&state).await.unwrap();
        let email = Email::try_from(String::from("hank@example.test")).unwrap();
        let username = Username::try_from(String::from("hank")).unwrap();
        repo.create_user(&account(&email, &username, None), now_unix())
            .await
            .unwrap();

        let other_email = Email::try_from(String::from("other@example.test")).unwrap();
        let other_name = Username::try_from(String::from("other")).unwrap();
        assert!(matches!(
            repo.create_user(&account(&email, &other_name, None), now_unix()).await,
            Err(ApiFailure::Conflict("email_taken"))
        ));
        assert!(matches!(
            repo.create_user(&account(&other_email, &username, None), now_unix()).await,
            Err(ApiFailure::Conflict("username_taken"))
        ));
    }
}
