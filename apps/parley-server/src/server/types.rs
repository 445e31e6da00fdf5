use axum::{
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Response},
    Json,
};
use parley_core::AttachmentKind;
use serde::{Deserialize, Serialize};

use super::{
    core::METRICS_TEXT_CONTENT_TYPE,
    metrics::render_metrics,
    storage::{RoomListing, RoomRecord, UnreadCount, UserRecord},
};

#[derive(Debug, Serialize)]
pub(crate) struct HealthResponse {
    pub(crate) status: &'static str,
}

pub(crate) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub(crate) async fn metrics() -> Response {
    (
        [(CONTENT_TYPE, METRICS_TEXT_CONTENT_TYPE)],
        render_metrics(),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
pub(crate) struct ApiError {
    pub(crate) error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) field: Option<&'static str>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RegisterRequest {
    pub(crate) email: String,
    pub(crate) username: String,
    pub(crate) password: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct LoginRequest {
    pub(crate) email: String,
    pub(crate) password: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct AuthResponse {
    pub(crate) access_token: String,
    pub(crate) expires_in_secs: i64,
    pub(crate) user: AccountResponse,
}

/// The caller's own profile. Only the owner ever sees the email.
#[derive(Debug, Serialize)]
pub(crate) struct AccountResponse {
    #[serde(flatten)]
    pub(crate) profile: UserProfileResponse,
    pub(crate) email: String,
}

impl From<&UserRecord> for AccountResponse {
    fn from(value: &UserRecord) -> Self {
        Self {
            profile: UserProfileResponse::from(value),
            email: value.email.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct UserProfileResponse {
    pub(crate) user_id: String,
    pub(crate) username: String,
    pub(crate) avatar_url: Option<String>,
    pub(crate) is_online: bool,
    pub(crate) created_at_unix: i64,
}

impl From<&UserRecord> for UserProfileResponse {
    fn from(value: &UserRecord) -> Self {
        Self {
            user_id: value.user_id.to_string(),
            username: value.username.clone(),
            avatar_url: value.avatar_url.clone(),
            is_online: value.is_online,
            created_at_unix: value.created_at_unix,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct UserListResponse {
    pub(crate) users: Vec<UserProfileResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct UpdateProfileRequest {
    pub(crate) username: Option<String>,
    pub(crate) avatar_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct UnreadCountResponse {
    pub(crate) sender_id: String,
    pub(crate) count: u64,
}

#[derive(Debug, Serialize)]
pub(crate) struct UnreadCountsResponse {
    pub(crate) counts: Vec<UnreadCountResponse>,
}

impl From<Vec<UnreadCount>> for UnreadCountsResponse {
    fn from(value: Vec<UnreadCount>) -> Self {
        Self {
            counts: value
                .into_iter()
                .map(|entry| UnreadCountResponse {
                    sender_id: entry.sender_id.to_string(),
                    count: entry.count,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct CreateRoomRequest {
    pub(crate) name: String,
    pub(crate) description: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct RoomResponse {
    pub(crate) room_id: String,
    pub(crate) name: String,
    pub(crate) description: Option<String>,
    pub(crate) avatar_url: Option<String>,
    pub(crate) created_by: Option<String>,
    pub(crate) created_at_unix: i64,
}

impl From<&RoomRecord> for RoomResponse {
    fn from(value: &RoomRecord) -> Self {
        Self {
            room_id: value.room_id.to_string(),
            name: value.name.clone(),
            description: value.description.clone(),
            avatar_url: value.avatar_url.clone(),
            created_by: value.created_by.map(|user_id| user_id.to_string()),
            created_at_unix: value.created_at_unix,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct RoomSummaryResponse {
    #[serde(flatten)]
    pub(crate) room: RoomResponse,
    pub(crate) member_count: u64,
    pub(crate) is_member: bool,
}

impl From<&RoomListing> for RoomSummaryResponse {
    fn from(value: &RoomListing) -> Self {
        Self {
            room: RoomResponse::from(&value.room),
            member_count: value.member_count,
            is_member: value.is_member,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct RoomListResponse {
    pub(crate) rooms: Vec<RoomSummaryResponse>,
}

#[derive(Debug, Serialize)]
pub(crate) struct RoomMemberResponse {
    pub(crate) user_id: String,
    pub(crate) username: String,
    pub(crate) avatar_url: Option<String>,
    pub(crate) is_online: bool,
}

impl From<&UserRecord> for RoomMemberResponse {
    fn from(value: &UserRecord) -> Self {
        Self {
            user_id: value.user_id.to_string(),
            username: value.username.clone(),
            avatar_url: value.avatar_url.clone(),
            is_online: value.is_online,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct RoomDetailResponse {
    #[serde(flatten)]
    pub(crate) room: RoomResponse,
    pub(crate) members: Vec<RoomMemberResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct HistoryQuery {
    pub(crate) cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct UploadQuery {
    pub(crate) filename: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct UploadResponse {
    pub(crate) upload_id: String,
    pub(crate) url: String,
    pub(crate) kind: AttachmentKind,
    pub(crate) mime_type: String,
    pub(crate) size_bytes: u64,
    pub(crate) sha256_hex: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GatewayAuthQuery {
    pub(crate) access_token: Option<String>,
}
