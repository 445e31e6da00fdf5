use parley_core::{RoomId, RoomName};

use super::{auth::now_unix, core::AppState, errors::ApiFailure};

const CREATE_USERS_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS users (
                    user_id TEXT PRIMARY KEY,
                    email TEXT UNIQUE NOT NULL,
                    username TEXT UNIQUE NOT NULL,
                    password_hash TEXT NOT NULL,
                    avatar_url TEXT NULL,
                    is_online BOOLEAN NOT NULL DEFAULT FALSE,
                    created_at_unix BIGINT NOT NULL
                )";
const CREATE_SESSIONS_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS sessions (
                    token_hash BYTEA PRIMARY KEY,
                    user_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
                    expires_at_unix BIGINT NOT NULL
                )";
const CREATE_ROOMS_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS rooms (
                    room_id TEXT PRIMARY KEY,
                    name TEXT UNIQUE NOT NULL,
                    description TEXT NULL,
                    avatar_url TEXT NULL,
                    created_by TEXT NULL REFERENCES users(user_id) ON DELETE SET NULL,
                    created_at_unix BIGINT NOT NULL
                )";
const CREATE_ROOM_MEMBERS_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS room_members (
                    user_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
                    room_id TEXT NOT NULL REFERENCES rooms(room_id) ON DELETE CASCADE,
                    PRIMARY KEY (user_id, room_id)
                )";
const CREATE_MESSAGES_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS messages (
                    message_id TEXT COLLATE \"C\" PRIMARY KEY,
                    room_id TEXT NOT NULL REFERENCES rooms(room_id) ON DELETE CASCADE,
                    sender_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
                    body TEXT NULL,
                    attachment_url TEXT NULL,
                    attachment_kind TEXT NULL,
                    created_at_unix BIGINT NOT NULL,
                    CHECK (body IS NOT NULL OR attachment_url IS NOT NULL)
                )";
const CREATE_MESSAGES_ROOM_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS idx_messages_room_message
                    ON messages(room_id, message_id DESC)";
const CREATE_DIRECT_MESSAGES_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS direct_messages (
                    message_id TEXT COLLATE \"C\" PRIMARY KEY,
                    sender_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
                    receiver_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
                    body TEXT NULL,
                    attachment_url TEXT NULL,
                    attachment_kind TEXT NULL,
                    is_read BOOLEAN NOT NULL DEFAULT FALSE,
                    created_at_unix BIGINT NOT NULL,
                    CHECK (sender_id <> receiver_id),
                    CHECK (body IS NOT NULL OR attachment_url IS NOT NULL)
                )";
const CREATE_DIRECT_MESSAGES_PAIR_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS idx_direct_messages_pair_message
                    ON direct_messages(sender_id, receiver_id, message_id DESC)";
const CREATE_DIRECT_MESSAGES_UNREAD_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS idx_direct_messages_unread
                    ON direct_messages(receiver_id, sender_id) WHERE NOT is_read";
const CREATE_UPLOADS_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS uploads (
                    upload_id TEXT PRIMARY KEY,
                    owner_id TEXT NOT NULL REFERENCES users(user_id) ON DELETE CASCADE,
                    mime_type TEXT NOT NULL,
                    size_bytes BIGINT NOT NULL,
                    sha256_hex TEXT NOT NULL,
                    created_at_unix BIGINT NOT NULL
                )";

const SCHEMA_STATEMENTS: [&str; 10] = [
    CREATE_USERS_TABLE_SQL,
    CREATE_SESSIONS_TABLE_SQL,
    CREATE_ROOMS_TABLE_SQL,
    CREATE_ROOM_MEMBERS_TABLE_SQL,
    CREATE_MESSAGES_TABLE_SQL,
    CREATE_MESSAGES_ROOM_INDEX_SQL,
    CREATE_DIRECT_MESSAGES_TABLE_SQL,
    CREATE_DIRECT_MESSAGES_PAIR_INDEX_SQL,
    CREATE_DIRECT_MESSAGES_UNREAD_INDEX_SQL,
    CREATE_UPLOADS_TABLE_SQL,
];

/// Creates the schema and the seed rooms once per process. Seed rooms that
/// already exist are left untouched.
pub(crate) async fn ensure_db_schema(state: &AppState) -> Result<(), ApiFailure> {
    const SCHEMA_INIT_LOCK_ID: i64 = 0x5041_524c_4559_0001;
    let Some(pool) = &state.db_pool else {
        return Ok(());
    };

    let mut seed_rooms = Vec::with_capacity(state.runtime.seed_rooms.len());
    for name in &state.runtime.seed_rooms {
        seed_rooms.push(RoomName::try_from(name.clone()).map_err(|_| ApiFailure::Internal)?);
    }

    state
        .db_init
        .get_or_try_init(|| async move {
            let mut tx = pool.begin().await?;
            sqlx::query("SELECT pg_advisory_xact_lock($1)")
                .bind(SCHEMA_INIT_LOCK_ID)
                .execute(&mut *tx)
                .await?;

            for statement in SCHEMA_STATEMENTS {
                sqlx::query(statement).execute(&mut *tx).await?;
            }

            let created_at_unix = now_unix();
            for name in &seed_rooms {
                sqlx::query(
                    "INSERT INTO rooms (room_id, name, description, avatar_url, created_by, created_at_unix)
                     VALUES ($1, $2, NULL, NULL, NULL, $3)
                     ON CONFLICT (name) DO NOTHING",
                )
                .bind(RoomId::new().to_string())
                .bind(name.as_str())
                .bind(created_at_unix)
                .execute(&mut *tx)
                .await?;
            }

            tx.commit().await?;

            Ok::<(), sqlx::Error>(())
        })
        .await
        .map_err(|e| {
            tracing::error!(event = "db.init", error = %e);
            ApiFailure::Internal
        })?;

    Ok(())
}
