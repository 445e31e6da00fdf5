use parley_core::{
    ChatScope, Email, MessageContent, MessageId, RoomDescription, RoomId, RoomName, UserId,
    Username,
};
use parley_protocol::{ChatMessage, DirectMessage, RoomMessage, UserSummary};
use sqlx::{postgres::PgRow, PgPool, Row};

use super::{
    attachment_payload, stored_attachment, ChatPersistence, NewAccount, ProfileUpdate, RoomListing,
    RoomRecord, UnreadCount, UploadRecord, UserRecord,
};
use crate::server::{core::AppState, errors::ApiFailure};

const USER_COLUMNS: &str =
    "user_id, email, username, password_hash, avatar_url, is_online, created_at_unix";
const ROOM_COLUMNS: &str = "room_id, name, description, avatar_url, created_by, created_at_unix";

pub(crate) struct PostgresChatRepository<'a> {
    state: &'a AppState,
    pool: &'a PgPool,
}

impl<'a> PostgresChatRepository<'a> {
    pub(crate) fn new(state: &'a AppState, pool: &'a PgPool) -> Self {
        Self { state, pool }
    }

    async fn sender_summary(&self, user_id: UserId) -> Result<UserSummary, ApiFailure> {
        self.find_user(user_id)
            .await?
            .map(|user| user.summary())
            .ok_or(ApiFailure::Internal)
    }
}

fn internal(error: &sqlx::Error) -> ApiFailure {
    tracing::error!(event = "db.query", error = %error);
    ApiFailure::Internal
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db_error) if db_error.is_unique_violation())
}

fn user_from_row(row: &PgRow) -> Result<UserRecord, ApiFailure> {
    let user_id: String = row.try_get("user_id").map_err(|_| ApiFailure::Internal)?;
    Ok(UserRecord {
        user_id: UserId::try_from(user_id).map_err(|_| ApiFailure::Internal)?,
        email: row.try_get("email").map_err(|_| ApiFailure::Internal)?,
        username: row.try_get("username").map_err(|_| ApiFailure::Internal)?,
        password_hash: row
            .try_get("password_hash")
            .map_err(|_| ApiFailure::Internal)?,
        avatar_url: row.try_get("avatar_url").map_err(|_| ApiFailure::Internal)?,
        is_online: row.try_get("is_online").map_err(|_| ApiFailure::Internal)?,
        created_at_unix: row
            .try_get("created_at_unix")
            .map_err(|_| ApiFailure::Internal)?,
    })
}

fn room_from_row(row: &PgRow) -> Result<RoomRecord, ApiFailure> {
    let room_id: String = row.try_get("room_id").map_err(|_| ApiFailure::Internal)?;
    let created_by: Option<String> = row.try_get("created_by").map_err(|_| ApiFailure::Internal)?;
    Ok(RoomRecord {
        room_id: RoomId::try_from(room_id).map_err(|_| ApiFailure::Internal)?,
        name: row.try_get("name").map_err(|_| ApiFailure::Internal)?,
        description: row
            .try_get("description")
            .map_err(|_| ApiFailure::Internal)?,
        avatar_url: row.try_get("avatar_url").map_err(|_| ApiFailure::Internal)?,
        created_by: created_by
            .map(UserId::try_from)
            .transpose()
            .map_err(|_| ApiFailure::Internal)?,
        created_at_unix: row
            .try_get("created_at_unix")
            .map_err(|_| ApiFailure::Internal)?,
    })
}

fn sender_from_row(row: &PgRow) -> Result<UserSummary, ApiFailure> {
    Ok(UserSummary {
        user_id: row.try_get("sender_id").map_err(|_| ApiFailure::Internal)?,
        username: row
            .try_get("sender_username")
            .map_err(|_| ApiFailure::Internal)?,
        avatar_url: row
            .try_get("sender_avatar_url")
            .map_err(|_| ApiFailure::Internal)?,
    })
}

fn room_message_from_row(row: &PgRow) -> Result<RoomMessage, ApiFailure> {
    Ok(RoomMessage {
        message_id: row.try_get("message_id").map_err(|_| ApiFailure::Internal)?,
        room_id: row.try_get("room_id").map_err(|_| ApiFailure::Internal)?,
        sender: sender_from_row(row)?,
        body: row.try_get("body").map_err(|_| ApiFailure::Internal)?,
        attachment: stored_attachment(
            row.try_get("attachment_url")
                .map_err(|_| ApiFailure::Internal)?,
            row.try_get("attachment_kind")
                .map_err(|_| ApiFailure::Internal)?,
        ),
        created_at_unix: row
            .try_get("created_at_unix")
            .map_err(|_| ApiFailure::Internal)?,
    })
}

fn direct_message_from_row(row: &PgRow) -> Result<DirectMessage, ApiFailure> {
    Ok(DirectMessage {
        message_id: row.try_get("message_id").map_err(|_| ApiFailure::Internal)?,
        sender: sender_from_row(row)?,
        receiver_id: row.try_get("receiver_id").map_err(|_| ApiFailure::Internal)?,
        body: row.try_get("body").map_err(|_| ApiFailure::Internal)?,
        attachment: stored_attachment(
            row.try_get("attachment_url")
                .map_err(|_| ApiFailure::Internal)?,
            row.try_get("attachment_kind")
                .map_err(|_| ApiFailure::Internal)?,
        ),
        read: row.try_get("is_read").map_err(|_| ApiFailure::Internal)?,
        created_at_unix: row
            .try_get("created_at_unix")
            .map_err(|_| ApiFailure::Internal)?,
    })
}

fn upload_from_row(row: &PgRow) -> Result<UploadRecord, ApiFailure> {
    let owner_id: String = row.try_get("owner_id").map_err(|_| ApiFailure::Internal)?;
    let size_bytes: i64 = row.try_get("size_bytes").map_err(|_| ApiFailure::Internal)?;
    Ok(UploadRecord {
        upload_id: row.try_get("upload_id").map_err(|_| ApiFailure::Internal)?,
        owner_id: UserId::try_from(owner_id).map_err(|_| ApiFailure::Internal)?,
        mime_type: row.try_get("mime_type").map_err(|_| ApiFailure::Internal)?,
        size_bytes: u64::try_from(size_bytes).map_err(|_| ApiFailure::Internal)?,
        sha256_hex: row.try_get("sha256_hex").map_err(|_| ApiFailure::Internal)?,
        created_at_unix: row
            .try_get("created_at_unix")
            .map_err(|_| ApiFailure::Internal)?,
    })
}

impl ChatPersistence for PostgresChatRepository<'_> {
    async fn create_user(
        &self,
        account: &NewAccount<'_>,
        now_unix: i64,
    ) -> Result<UserRecord, ApiFailure> {
        let user_id = UserId::new();
        let mut tx = self.pool.begin().await.map_err(|e| internal(&e))?;
        let insert_result = sqlx::query(
            "INSERT INTO users (user_id, email, username, password_hash, avatar_url, is_online, created_at_unix)
             VALUES ($1, $2, $3, $4, NULL, FALSE, $5)
             ON CONFLICT DO NOTHING",
        )
        .bind(user_id.to_string())
        .bind(account.email.as_str())
        .bind(account.username.as_str())
        .bind(account.password_hash)
        .bind(now_unix)
        .execute(&mut *tx)
        .await
        .map_err(|e| internal(&e))?;
        if insert_result.rows_affected() == 0 {
            let email_taken = sqlx::query_scalar::<_, bool>(
                "SELECT EXISTS (SELECT 1 FROM users WHERE email = $1)",
            )
            .bind(account.email.as_str())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| internal(&e))?;
            return Err(ApiFailure::Conflict(if email_taken {
                "email_taken"
            } else {
                "username_taken"
            }));
        }
        if let Some(room_id) = account.initial_room {
            let joined = sqlx::query(
                "INSERT INTO room_members (user_id, room_id)
                 SELECT $1, room_id FROM rooms WHERE room_id = $2",
            )
            .bind(user_id.to_string())
            .bind(room_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| internal(&e))?;
            if joined.rows_affected() == 0 {
                return Err(ApiFailure::NotFound);
            }
        }
        tx.commit().await.map_err(|e| internal(&e))?;

        Ok(UserRecord {
            user_id,
            email: account.email.as_str().to_owned(),
            username: account.username.as_str().to_owned(),
            password_hash: account.password_hash.to_owned(),
            avatar_url: None,
            is_online: false,
            created_at_unix: now_unix,
        })
    }

    async fn find_user(&self, user_id: UserId) -> Result<Option<UserRecord>, ApiFailure> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE user_id = $1"))
            .bind(user_id.to_string())
            .fetch_optional(self.pool)
            .await
            .map_err(|e| internal(&e))?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn find_user_by_email(&self, email: &Email) -> Result<Option<UserRecord>, ApiFailure> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1"))
            .bind(email.as_str())
            .fetch_optional(self.pool)
            .await
            .map_err(|e| internal(&e))?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn list_users_except(&self, viewer: UserId) -> Result<Vec<UserRecord>, ApiFailure> {
        let rows = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE user_id <> $1
             ORDER BY is_online DESC, username ASC"
        ))
        .bind(viewer.to_string())
        .fetch_all(self.pool)
        .await
        .map_err(|e| internal(&e))?;
        rows.iter().map(user_from_row).collect()
    }

    async fn update_profile(
        &self,
        user_id: UserId,
        update: &ProfileUpdate,
    ) -> Result<UserRecord, ApiFailure> {
        let result = sqlx::query(&format!(
            "UPDATE users
             SET username = COALESCE($2, username), avatar_url = COALESCE($3, avatar_url)
             WHERE user_id = $1
             RETURNING {USER_COLUMNS}"
        ))
        .bind(user_id.to_string())
        .bind(update.username.as_ref().map(Username::as_str))
        .bind(update.avatar_url.as_ref().map(|url| url.as_str()))
        .fetch_optional(self.pool)
        .await;
        match result {
            Ok(Some(row)) => user_from_row(&row),
            Ok(None) => Err(ApiFailure::NotFound),
            Err(error) if is_unique_violation(&error) => Err(ApiFailure::Conflict("username_taken")),
            Err(error) => Err(internal(&error)),
        }
    }

    async fn set_online(&self, user_id: UserId, online: bool) -> Result<(), ApiFailure> {
        sqlx::query("UPDATE users SET is_online = $2 WHERE user_id = $1")
            .bind(user_id.to_string())
            .bind(online)
            .execute(self.pool)
            .await
            .map_err(|e| internal(&e))?;
        Ok(())
    }

    async fn insert_session(
        &self,
        token_hash: [u8; 32],
        user_id: UserId,
        expires_at_unix: i64,
    ) -> Result<(), ApiFailure> {
        sqlx::query(
            "INSERT INTO sessions (token_hash, user_id, expires_at_unix) VALUES ($1, $2, $3)",
        )
        .bind(token_hash.as_slice())
        .bind(user_id.to_string())
        .bind(expires_at_unix)
        .execute(self.pool)
        .await
        .map_err(|e| internal(&e))?;
        Ok(())
    }

    async fn take_session(
        &self,
        token_hash: [u8; 32],
        now_unix: i64,
    ) -> Result<Option<UserId>, ApiFailure> {
        sqlx::query("DELETE FROM sessions WHERE expires_at_unix < $1")
            .bind(now_unix)
            .execute(self.pool)
            .await
            .map_err(|e| internal(&e))?;

        let row = sqlx::query(
            "DELETE FROM sessions WHERE token_hash = $1 RETURNING user_id, expires_at_unix",
        )
        .bind(token_hash.as_slice())
        .fetch_optional(self.pool)
        .await
        .map_err(|e| internal(&e))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let expires_at_unix: i64 = row
            .try_get("expires_at_unix")
            .map_err(|_| ApiFailure::Internal)?;
        if expires_at_unix < now_unix {
            return Ok(None);
        }
        let user_id: String = row.try_get("user_id").map_err(|_| ApiFailure::Internal)?;
        UserId::try_from(user_id)
            .map(Some)
            .map_err(|_| ApiFailure::Internal)
    }

    async fn create_room(
        &self,
        name: &RoomName,
        description: Option<&RoomDescription>,
        created_by: UserId,
        now_unix: i64,
    ) -> Result<RoomRecord, ApiFailure> {
        let room_id = RoomId::new();
        let mut tx = self.pool.begin().await.map_err(|e| internal(&e))?;
        let insert_result = sqlx::query(
            "INSERT INTO rooms (room_id, name, description, avatar_url, created_by, created_at_unix)
             VALUES ($1, $2, $3, NULL, $4, $5)
             ON CONFLICT (name) DO NOTHING",
        )
        .bind(room_id.to_string())
        .bind(name.as_str())
        .bind(description.map(RoomDescription::as_str))
        .bind(created_by.to_string())
        .bind(now_unix)
        .execute(&mut *tx)
        .await
        .map_err(|e| internal(&e))?;
        if insert_result.rows_affected() == 0 {
            return Err(ApiFailure::Conflict("room_name_taken"));
        }
        sqlx::query("INSERT INTO room_members (user_id, room_id) VALUES ($1, $2)")
            .bind(created_by.to_string())
            .bind(room_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| internal(&e))?;
        tx.commit().await.map_err(|e| internal(&e))?;

        Ok(RoomRecord {
            room_id,
            name: name.as_str().to_owned(),
            description: description.map(|value| value.as_str().to_owned()),
            avatar_url: None,
            created_by: Some(created_by),
            created_at_unix: now_unix,
        })
    }

    async fn find_room(&self, room_id: RoomId) -> Result<Option<RoomRecord>, ApiFailure> {
        let row = sqlx::query(&format!("SELECT {ROOM_COLUMNS} FROM rooms WHERE room_id = $1"))
            .bind(room_id.to_string())
            .fetch_optional(self.pool)
            .await
            .map_err(|e| internal(&e))?;
        row.as_ref().map(room_from_row).transpose()
    }

    async fn find_room_by_name(&self, name: &str) -> Result<Option<RoomRecord>, ApiFailure> {
        let row = sqlx::query(&format!("SELECT {ROOM_COLUMNS} FROM rooms WHERE name = $1"))
            .bind(name)
            .fetch_optional(self.pool)
            .await
            .map_err(|e| internal(&e))?;
        row.as_ref().map(room_from_row).transpose()
    }

    async fn list_rooms(&self, viewer: UserId) -> Result<Vec<RoomListing>, ApiFailure> {
        let rows = sqlx::query(
            "SELECT r.room_id, r.name, r.description, r.avatar_url, r.created_by, r.created_at_unix,
                    COUNT(m.user_id) AS member_count,
                    COALESCE(BOOL_OR(m.user_id = $1), FALSE) AS is_member
             FROM rooms r
             LEFT JOIN room_members m ON m.room_id = r.room_id
             GROUP BY r.room_id
             ORDER BY r.created_at_unix ASC, r.room_id ASC",
        )
        .bind(viewer.to_string())
        .fetch_all(self.pool)
        .await
        .map_err(|e| internal(&e))?;

        rows.iter()
            .map(|row| {
                let member_count: i64 = row
                    .try_get("member_count")
                    .map_err(|_| ApiFailure::Internal)?;
                Ok(RoomListing {
                    room: room_from_row(row)?,
                    member_count: u64::try_from(member_count).unwrap_or(0),
                    is_member: row.try_get("is_member").map_err(|_| ApiFailure::Internal)?,
                })
            })
            .collect()
    }

    async fn room_members(&self, room_id: RoomId) -> Result<Vec<UserRecord>, ApiFailure> {
        let rows = sqlx::query(
            "SELECT u.user_id, u.email, u.username, u.password_hash, u.avatar_url, u.is_online,
                    u.created_at_unix
             FROM room_members m
             JOIN users u ON u.user_id = m.user_id
             WHERE m.room_id = $1
             ORDER BY u.username ASC",
        )
        .bind(room_id.to_string())
        .fetch_all(self.pool)
        .await
        .map_err(|e| internal(&e))?;
        rows.iter().map(user_from_row).collect()
    }

    async fn add_membership(&self, user_id: UserId, room_id: RoomId) -> Result<bool, ApiFailure> {
        let result = sqlx::query(
            "INSERT INTO room_members (user_id, room_id)
             SELECT $1, room_id FROM rooms WHERE room_id = $2
             ON CONFLICT (user_id, room_id) DO NOTHING",
        )
        .bind(user_id.to_string())
        .bind(room_id.to_string())
        .execute(self.pool)
        .await
        .map_err(|e| internal(&e))?;
        if result.rows_affected() > 0 {
            return Ok(true);
        }
        if self.find_room(room_id).await?.is_none() {
            return Err(ApiFailure::NotFound);
        }
        Ok(false)
    }

    async fn remove_membership(
        &self,
        user_id: UserId,
        room_id: RoomId,
    ) -> Result<bool, ApiFailure> {
        let result = sqlx::query("DELETE FROM room_members WHERE user_id = $1 AND room_id = $2")
            .bind(user_id.to_string())
            .bind(room_id.to_string())
            .execute(self.pool)
            .await
            .map_err(|e| internal(&e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn is_member(&self, user_id: UserId, room_id: RoomId) -> Result<bool, ApiFailure> {
        let row = sqlx::query("SELECT 1 FROM room_members WHERE user_id = $1 AND room_id = $2")
            .bind(user_id.to_string())
            .bind(room_id.to_string())
            .fetch_optional(self.pool)
            .await
            .map_err(|e| internal(&e))?;
        Ok(row.is_some())
    }

    async fn member_room_ids(&self, user_id: UserId) -> Result<Vec<RoomId>, ApiFailure> {
        let rows = sqlx::query(
            "SELECT room_id FROM room_members WHERE user_id = $1 ORDER BY room_id ASC",
        )
        .bind(user_id.to_string())
        .fetch_all(self.pool)
        .await
        .map_err(|e| internal(&e))?;
        rows.iter()
            .map(|row| {
                let room_id: String = row.try_get("room_id").map_err(|_| ApiFailure::Internal)?;
                RoomId::try_from(room_id).map_err(|_| ApiFailure::Internal)
            })
            .collect()
    }

    async fn insert_room_message(
        &self,
        room_id: RoomId,
        sender_id: UserId,
        content: &MessageContent,
        now_unix: i64,
    ) -> Result<RoomMessage, ApiFailure> {
        let message_id = self.state.message_ids.next_id();
        let attachment = content.attachment();
        sqlx::query(
            "INSERT INTO messages
                (message_id, room_id, sender_id, body, attachment_url, attachment_kind, created_at_unix)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(message_id.to_string())
        .bind(room_id.to_string())
        .bind(sender_id.to_string())
        .bind(content.body())
        .bind(attachment.map(|value| value.url.as_str()))
        .bind(attachment.map(|value| value.kind.as_str()))
        .bind(now_unix)
        .execute(self.pool)
        .await
        .map_err(|e| internal(&e))?;

        Ok(RoomMessage {
            message_id: message_id.to_string(),
            room_id: room_id.to_string(),
            sender: self.sender_summary(sender_id).await?,
            body: content.body().map(str::to_owned),
            attachment: attachment.map(attachment_payload),
            created_at_unix: now_unix,
        })
    }

    async fn insert_direct_message(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        content: &MessageContent,
        now_unix: i64,
    ) -> Result<DirectMessage, ApiFailure> {
        let message_id = self.state.message_ids.next_id();
        let attachment = content.attachment();
        sqlx::query(
            "INSERT INTO direct_messages
                (message_id, sender_id, receiver_id, body, attachment_url, attachment_kind, is_read, created_at_unix)
             VALUES ($1, $2, $3, $4, $5, $6, FALSE, $7)",
        )
        .bind(message_id.to_string())
        .bind(sender_id.to_string())
        .bind(receiver_id.to_string())
        .bind(content.body())
        .bind(attachment.map(|value| value.url.as_str()))
        .bind(attachment.map(|value| value.kind.as_str()))
        .bind(now_unix)
        .execute(self.pool)
        .await
        .map_err(|e| internal(&e))?;

        Ok(DirectMessage {
            message_id: message_id.to_string(),
            sender: self.sender_summary(sender_id).await?,
            receiver_id: receiver_id.to_string(),
            body: content.body().map(str::to_owned),
            attachment: attachment.map(attachment_payload),
            read: false,
            created_at_unix: now_unix,
        })
    }

    async fn messages_before(
        &self,
        scope: ChatScope,
        before: Option<MessageId>,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, ApiFailure> {
        let limit = i64::try_from(limit).map_err(|_| ApiFailure::InvalidRequest)?;
        let before = before.map(|cursor| cursor.to_string());
        match scope {
            ChatScope::Room(room_id) => {
                let rows = sqlx::query(
                    "SELECT m.message_id, m.room_id, m.sender_id, u.username AS sender_username,
                            u.avatar_url AS sender_avatar_url, m.body, m.attachment_url,
                            m.attachment_kind, m.created_at_unix
                     FROM messages m
                     JOIN users u ON u.user_id = m.sender_id
                     WHERE m.room_id = $1 AND ($2::TEXT IS NULL OR m.message_id < $2)
                     ORDER BY m.message_id DESC
                     LIMIT $3",
                )
                .bind(room_id.to_string())
                .bind(before)
                .bind(limit)
                .fetch_all(self.pool)
                .await
                .map_err(|e| internal(&e))?;
                rows.iter()
                    .map(|row| room_message_from_row(row).map(ChatMessage::Room))
                    .collect()
            }
            ChatScope::Direct(pair) => {
                let (a, b) = pair.members();
                let rows = sqlx::query(
                    "SELECT d.message_id, d.sender_id, u.username AS sender_username,
                            u.avatar_url AS sender_avatar_url, d.receiver_id, d.body,
                            d.attachment_url, d.attachment_kind, d.is_read, d.created_at_unix
                     FROM direct_messages d
                     JOIN users u ON u.user_id = d.sender_id
                     WHERE ((d.sender_id = $1 AND d.receiver_id = $2)
                         OR (d.sender_id = $2 AND d.receiver_id = $1))
                       AND ($3::TEXT IS NULL OR d.message_id < $3)
                     ORDER BY d.message_id DESC
                     LIMIT $4",
                )
                .bind(a.to_string())
                .bind(b.to_string())
                .bind(before)
                .bind(limit)
                .fetch_all(self.pool)
                .await
                .map_err(|e| internal(&e))?;
                rows.iter()
                    .map(|row| direct_message_from_row(row).map(ChatMessage::Direct))
                    .collect()
            }
        }
    }

    async fn mark_direct_read(
        &self,
        reader_id: UserId,
        sender_id: UserId,
    ) -> Result<u64, ApiFailure> {
        let result = sqlx::query(
            "UPDATE direct_messages SET is_read = TRUE
             WHERE receiver_id = $1 AND sender_id = $2 AND NOT is_read",
        )
        .bind(reader_id.to_string())
        .bind(sender_id.to_string())
        .execute(self.pool)
        .await
        .map_err(|e| internal(&e))?;
        Ok(result.rows_affected())
    }

    async fn unread_counts(&self, receiver_id: UserId) -> Result<Vec<UnreadCount>, ApiFailure> {
        let rows = sqlx::query(
            "SELECT sender_id, COUNT(*) AS unread
             FROM direct_messages
             WHERE receiver_id = $1 AND NOT is_read
             GROUP BY sender_id
             ORDER BY sender_id ASC",
        )
        .bind(receiver_id.to_string())
        .fetch_all(self.pool)
        .await
        .map_err(|e| internal(&e))?;
        rows.iter()
            .map(|row| {
                let sender_id: String = row.try_get("sender_id").map_err(|_| ApiFailure::Internal)?;
                let unread: i64 = row.try_get("unread").map_err(|_| ApiFailure::Internal)?;
                Ok(UnreadCount {
                    sender_id: UserId::try_from(sender_id).map_err(|_| ApiFailure::Internal)?,
                    count: u64::try_from(unread).unwrap_or(0),
                })
            })
            .collect()
    }

    async fn insert_upload(&self, record: &UploadRecord) -> Result<(), ApiFailure> {
        sqlx::query(
            "INSERT INTO uploads (upload_id, owner_id, mime_type, size_bytes, sha256_hex, created_at_unix)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&record.upload_id)
        .bind(record.owner_id.to_string())
        .bind(&record.mime_type)
        .bind(i64::try_from(record.size_bytes).map_err(|_| ApiFailure::PayloadTooLarge)?)
        .bind(&record.sha256_hex)
        .bind(record.created_at_unix)
        .execute(self.pool)
        .await
        .map_err(|e| internal(&e))?;
        Ok(())
    }

    async fn find_upload(&self, upload_id: &str) -> Result<Option<UploadRecord>, ApiFailure> {
        let row = sqlx::query(
            "SELECT upload_id, owner_id, mime_type, size_bytes, sha256_hex, created_at_unix
             FROM uploads WHERE upload_id = $1",
        )
        .bind(upload_id)
        .fetch_optional(self.pool)
        .await
        .map_err(|e| internal(&e))?;
        row.as_ref().map(upload_from_row).transpose()
    }
}
