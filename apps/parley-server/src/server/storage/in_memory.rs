use std::collections::{HashMap, HashSet};

use parley_core::{
    AttachmentRef, ChatScope, Email, MessageContent, MessageId, RoomDescription, RoomId, RoomName,
    UserId,
};
use parley_protocol::{ChatMessage, DirectMessage, RoomMessage, UserSummary};
use tokio::sync::RwLock;

use super::{
    attachment_payload, ChatPersistence, NewAccount, ProfileUpdate, RoomListing, RoomRecord, UnreadCount,
    UploadRecord, UserRecord,
};
use crate::server::{auth::now_unix, core::AppState, errors::ApiFailure};

struct RoomMessageRow {
    message_id: MessageId,
    room_id: RoomId,
    sender_id: UserId,
    body: Option<String>,
    attachment: Option<AttachmentRef>,
    created_at_unix: i64,
}

struct DirectMessageRow {
    message_id: MessageId,
    sender_id: UserId,
    receiver_id: UserId,
    body: Option<String>,
    attachment: Option<AttachmentRef>,
    read: bool,
    created_at_unix: i64,
}

struct SessionRow {
    user_id: UserId,
    expires_at_unix: i64,
}

#[derive(Default)]
struct MemoryTables {
    users: HashMap<UserId, UserRecord>,
    usernames: HashMap<String, UserId>,
    emails: HashMap<String, UserId>,
    sessions: HashMap<[u8; 32], SessionRow>,
    rooms: HashMap<RoomId, RoomRecord>,
    room_names: HashMap<String, RoomId>,
    memberships: HashSet<(UserId, RoomId)>,
    room_messages: HashMap<RoomId, Vec<RoomMessageRow>>,
    direct_messages: Vec<DirectMessageRow>,
    uploads: HashMap<String, UploadRecord>,
}

impl MemoryTables {
    fn summary(&self, user_id: UserId) -> Result<UserSummary, ApiFailure> {
        self.users
            .get(&user_id)
            .map(UserRecord::summary)
            .ok_or(ApiFailure::Internal)
    }

    fn room_wire(&self, row: &RoomMessageRow) -> Result<RoomMessage, ApiFailure> {
        Ok(RoomMessage {
            message_id: row.message_id.to_string(),
            room_id: row.room_id.to_string(),
            sender: self.summary(row.sender_id)?,
            body: row.body.clone(),
            attachment: row.attachment.as_ref().map(attachment_payload),
            created_at_unix: row.created_at_unix,
        })
    }

    fn direct_wire(&self, row: &DirectMessageRow) -> Result<DirectMessage, ApiFailure> {
        Ok(DirectMessage {
            message_id: row.message_id.to_string(),
            sender: self.summary(row.sender_id)?,
            receiver_id: row.receiver_id.to_string(),
            body: row.body.clone(),
            attachment: row.attachment.as_ref().map(attachment_payload),
            read: row.read,
            created_at_unix: row.created_at_unix,
        })
    }

    fn insert_room(&mut self, record: RoomRecord) {
        self.room_names.insert(record.name.clone(), record.room_id);
        self.rooms.insert(record.room_id, record);
    }
}

/// Process-local tables used when no database is configured. One lock
/// guards every table so multi-table writes stay consistent.
pub(crate) struct MemoryStore {
    tables: RwLock<MemoryTables>,
}

impl MemoryStore {
    /// Builds the store with the given rooms already present, in order.
    pub(crate) fn seeded(room_names: &[String]) -> anyhow::Result<Self> {
        let mut tables = MemoryTables::default();
        let created_at_unix = now_unix();
        for name in room_names {
            let name = RoomName::try_from(name.clone())
                .map_err(|e| anyhow::anyhow!("invalid seed room {name:?}: {e}"))?;
            tables.insert_room(RoomRecord {
                room_id: RoomId::new(),
                name: name.as_str().to_owned(),
                description: None,
                avatar_url: None,
                created_by: None,
                created_at_unix,
            });
        }
        Ok(Self {
            tables: RwLock::new(tables),
        })
    }
}

pub(crate) struct InMemoryChatRepository<'a> {
    state: &'a AppState,
}

impl<'a> InMemoryChatRepository<'a> {
    pub(crate) fn new(state: &'a AppState) -> Self {
        Self { state }
    }
}

fn direct_pair_matches(row: &DirectMessageRow, a: UserId, b: UserId) -> bool {
    (row.sender_id == a && row.receiver_id == b) || (row.sender_id == b && row.receiver_id == a)
}

impl ChatPersistence for InMemoryChatRepository<'_> {
    async fn create_user(
        &self,
        account: &NewAccount<'_>,
        now_unix: i64,
    ) -> Result<UserRecord, ApiFailure> {
        let mut tables = self.state.memory.tables.write().await;
        if tables.emails.contains_key(account.email.as_str()) {
            return Err(ApiFailure::Conflict("email_taken"));
        }
        if tables.usernames.contains_key(account.username.as_str()) {
            return Err(ApiFailure::Conflict("username_taken"));
        }
        if let Some(room_id) = account.initial_room {
            if !tables.rooms.contains_key(&room_id) {
                return Err(ApiFailure::NotFound);
            }
        }
        let record = UserRecord {
            user_id: UserId::new(),
            email: account.email.as_str().to_owned(),
            username: account.username.as_str().to_owned(),
            password_hash: account.password_hash.to_owned(),
            avatar_url: None,
            is_online: false,
            created_at_unix: now_unix,
        };
        tables
            .usernames
            .insert(record.username.clone(), record.user_id);
        tables.emails.insert(record.email.clone(), record.user_id);
        if let Some(room_id) = account.initial_room {
            tables.memberships.insert((record.user_id, room_id));
        }
        tables.users.insert(record.user_id, record.clone());
        Ok(record)
    }

    async fn find_user(&self, user_id: UserId) -> Result<Option<UserRecord>, ApiFailure> {
        let tables = self.state.memory.tables.read().await;
        Ok(tables.users.get(&user_id).cloned())
    }

    async fn find_user_by_email(&self, email: &Email) -> Result<Option<UserRecord>, ApiFailure> {
        let tables = self.state.memory.tables.read().await;
        Ok(tables
            .emails
            .get(email.as_str())
            .and_then(|user_id| tables.users.get(user_id))
            .cloned())
    }

    async fn list_users_except(&self, viewer: UserId) -> Result<Vec<UserRecord>, ApiFailure> {
        let tables = self.state.memory.tables.read().await;
        let mut users: Vec<UserRecord> = tables
            .users
            .values()
            .filter(|user| user.user_id != viewer)
            .cloned()
            .collect();
        users.sort_by(|a, b| {
            b.is_online
                .cmp(&a.is_online)
                .then_with(|| a.username.cmp(&b.username))
        });
        Ok(users)
    }

    async fn update_profile(
        &self,
        user_id: UserId,
        update: &ProfileUpdate,
    ) -> Result<UserRecord, ApiFailure> {
        let mut tables = self.state.memory.tables.write().await;
        let current = tables
            .users
            .get(&user_id)
            .map(|user| user.username.clone())
            .ok_or(ApiFailure::NotFound)?;

        if let Some(username) = &update.username {
            if username.as_str() != current {
                if tables.usernames.contains_key(username.as_str()) {
                    return Err(ApiFailure::Conflict("username_taken"));
                }
                tables.usernames.remove(&current);
                tables
                    .usernames
                    .insert(username.as_str().to_owned(), user_id);
            }
        }

        let user = tables.users.get_mut(&user_id).ok_or(ApiFailure::NotFound)?;
        if let Some(username) = &update.username {
            username.as_str().clone_into(&mut user.username);
        }
        if let Some(avatar_url) = &update.avatar_url {
            user.avatar_url = Some(avatar_url.as_str().to_owned());
        }
        Ok(user.clone())
    }

    async fn set_online(&self, user_id: UserId, online: bool) -> Result<(), ApiFailure> {
        let mut tables = self.state.memory.tables.write().await;
        if let Some(user) = tables.users.get_mut(&user_id) {
            user.is_online = online;
        }
        Ok(())
    }

    async fn insert_session(
        &self,
        token_hash: [u8; 32],
        user_id: UserId,
        expires_at_unix: i64,
    ) -> Result<(), ApiFailure> {
        let mut tables = self.state.memory.tables.write().await;
        let now = now_unix();
        tables
            .sessions
            .retain(|_, session| session.expires_at_unix >= now);
        tables.sessions.insert(
            token_hash,
            SessionRow {
                user_id,
                expires_at_unix,
            },
        );
        Ok(())
    }

    async fn take_session(
        &self,
        token_hash: [u8; 32],
        now_unix: i64,
    ) -> Result<Option<UserId>, ApiFailure> {
        let mut tables = self.state.memory.tables.write().await;
        Ok(tables
            .sessions
            .remove(&token_hash)
            .filter(|session| session.expires_at_unix >= now_unix)
            .map(|session| session.user_id))
    }

    async fn create_room(
        &self,
        name: &RoomName,
        description: Option<&RoomDescription>,
        created_by: UserId,
        now_unix: i64,
    ) -> Result<RoomRecord, ApiFailure> {
        let mut tables = self.state.memory.tables.write().await;
        if tables.room_names.contains_key(name.as_str()) {
            return Err(ApiFailure::Conflict("room_name_taken"));
        }
        let record = RoomRecord {
            room_id: RoomId::new(),
            name: name.as_str().to_owned(),
            description: description.map(|value| value.as_str().to_owned()),
            avatar_url: None,
            created_by: Some(created_by),
            created_at_unix: now_unix,
        };
        tables.insert_room(record.clone());
        tables.memberships.insert((created_by, record.room_id));
        Ok(record)
    }

    async fn find_room(&self, room_id: RoomId) -> Result<Option<RoomRecord>, ApiFailure> {
        let tables = self.state.memory.tables.read().await;
        Ok(tables.rooms.get(&room_id).cloned())
    }

    async fn find_room_by_name(&self, name: &str) -> Result<Option<RoomRecord>, ApiFailure> {
        let tables = self.state.memory.tables.read().await;
        Ok(tables
            .room_names
            .get(name)
            .and_then(|room_id| tables.rooms.get(room_id))
            .cloned())
    }

    async fn list_rooms(&self, viewer: UserId) -> Result<Vec<RoomListing>, ApiFailure> {
        let tables = self.state.memory.tables.read().await;
        let mut member_counts: HashMap<RoomId, u64> = HashMap::new();
        for (_, room_id) in &tables.memberships {
            *member_counts.entry(*room_id).or_insert(0) += 1;
        }
        let mut rooms: Vec<RoomListing> = tables
            .rooms
            .values()
            .map(|room| RoomListing {
                room: room.clone(),
                member_count: member_counts.get(&room.room_id).copied().unwrap_or(0),
                is_member: tables.memberships.contains(&(viewer, room.room_id)),
            })
            .collect();
        rooms.sort_by(|a, b| {
            a.room
                .created_at_unix
                .cmp(&b.room.created_at_unix)
                .then_with(|| a.room.room_id.cmp(&b.room.room_id))
        });
        Ok(rooms)
    }

    async fn room_members(&self, room_id: RoomId) -> Result<Vec<UserRecord>, ApiFailure> {
        let tables = self.state.memory.tables.read().await;
        let mut members: Vec<UserRecord> = tables
            .memberships
            .iter()
            .filter(|(_, member_room)| *member_room == room_id)
            .filter_map(|(user_id, _)| tables.users.get(user_id).cloned())
            .collect();
        members.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(members)
    }

    async fn add_membership(&self, user_id: UserId, room_id: RoomId) -> Result<bool, ApiFailure> {
        let mut tables = self.state.memory.tables.write().await;
        if !tables.rooms.contains_key(&room_id) {
            return Err(ApiFailure::NotFound);
        }
        Ok(tables.memberships.insert((user_id, room_id)))
    }

    async fn remove_membership(
        &self,
        user_id: UserId,
        room_id: RoomId,
    ) -> Result<bool, ApiFailure> {
        let mut tables = self.state.memory.tables.write().await;
        Ok(tables.memberships.remove(&(user_id, room_id)))
    }

    async fn is_member(&self, user_id: UserId, room_id: RoomId) -> Result<bool, ApiFailure> {
        let tables = self.state.memory.tables.read().await;
        Ok(tables.memberships.contains(&(user_id, room_id)))
    }

    async fn member_room_ids(&self, user_id: UserId) -> Result<Vec<RoomId>, ApiFailure> {
        let tables = self.state.memory.tables.read().await;
        let mut room_ids: Vec<RoomId> = tables
            .memberships
            .iter()
            .filter(|(member, _)| *member == user_id)
            .map(|(_, room_id)| *room_id)
            .collect();
        room_ids.sort_unstable();
        Ok(room_ids)
    }

    async fn insert_room_message(
        &self,
        room_id: RoomId,
        sender_id: UserId,
        content: &MessageContent,
        now_unix: i64,
    ) -> Result<RoomMessage, ApiFailure> {
        let mut tables = self.state.memory.tables.write().await;
        if !tables.rooms.contains_key(&room_id) {
            return Err(ApiFailure::NotFound);
        }
        let row = RoomMessageRow {
            message_id: self.state.message_ids.next_id(),
            room_id,
            sender_id,
            body: content.body().map(str::to_owned),
            attachment: content.attachment().cloned(),
            created_at_unix: now_unix,
        };
        let message = tables.room_wire(&row)?;
        tables.room_messages.entry(room_id).or_default().push(row);
        Ok(message)
    }

    async fn insert_direct_message(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        content: &MessageContent,
        now_unix: i64,
    ) -> Result<DirectMessage, ApiFailure> {
        let mut tables = self.state.memory.tables.write().await;
        if !tables.users.contains_key(&receiver_id) {
            return Err(ApiFailure::NotFound);
        }
        let row = DirectMessageRow {
            message_id: self.state.message_ids.next_id(),
            sender_id,
            receiver_id,
            body: content.body().map(str::to_owned),
            attachment: content.attachment().cloned(),
            read: false,
            created_at_unix: now_unix,
        };
        let message = tables.direct_wire(&row)?;
        tables.direct_messages.push(row);
        Ok(message)
    }

    async fn messages_before(
        &self,
        scope: ChatScope,
        before: Option<MessageId>,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, ApiFailure> {
        let tables = self.state.memory.tables.read().await;
        let older = |message_id: MessageId| before.is_none_or(|cursor| message_id < cursor);
        match scope {
            ChatScope::Room(room_id) => tables
                .room_messages
                .get(&room_id)
                .into_iter()
                .flatten()
                .rev()
                .filter(|row| older(row.message_id))
                .take(limit)
                .map(|row| tables.room_wire(row).map(ChatMessage::Room))
                .collect(),
            ChatScope::Direct(pair) => {
                let (a, b) = pair.members();
                tables
                    .direct_messages
                    .iter()
                    .rev()
                    .filter(|row| direct_pair_matches(row, a, b) && older(row.message_id))
                    .take(limit)
                    .map(|row| tables.direct_wire(row).map(ChatMessage::Direct))
                    .collect()
            }
        }
    }

    async fn mark_direct_read(
        &self,
        reader_id: UserId,
        sender_id: UserId,
    ) -> Result<u64, ApiFailure> {
        let mut tables = self.state.memory.tables.write().await;
        let mut flipped = 0;
        for row in &mut tables.direct_messages {
            if row.receiver_id == reader_id && row.sender_id == sender_id && !row.read {
                row.read = true;
                flipped += 1;
            }
        }
        Ok(flipped)
    }

    async fn unread_counts(&self, receiver_id: UserId) -> Result<Vec<UnreadCount>, ApiFailure> {
        let tables = self.state.memory.tables.read().await;
        let mut counts: HashMap<UserId, u64> = HashMap::new();
        for row in &tables.direct_messages {
            if row.receiver_id == receiver_id && !row.read {
                *counts.entry(row.sender_id).or_insert(0) += 1;
            }
        }
        let mut counts: Vec<UnreadCount> = counts
            .into_iter()
            .map(|(sender_id, count)| UnreadCount { sender_id, count })
            .collect();
        counts.sort_by_key(|entry| entry.sender_id);
        Ok(counts)
    }

    async fn insert_upload(&self, record: &UploadRecord) -> Result<(), ApiFailure> {
        let mut tables = self.state.memory.tables.write().await;
        tables
            .uploads
            .insert(record.upload_id.clone(), record.clone());
        Ok(())
    }

    async fn find_upload(&self, upload_id: &str) -> Result<Option<UploadRecord>, ApiFailure> {
        let tables = self.state.memory.tables.read().await;
        Ok(tables.uploads.get(upload_id).cloned())
    }
}
