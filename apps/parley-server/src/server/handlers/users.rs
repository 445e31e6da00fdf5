use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use parley_core::{ResourceUrl, UserId, Username};

use crate::server::{
    auth::authenticate,
    core::AppState,
    errors::ApiFailure,
    history::{direct_history, parse_cursor, unread_counts, HistoryPage},
    storage::{repository, ChatPersistence, ProfileUpdate},
    types::{
        HistoryQuery, UnreadCountsResponse, UpdateProfileRequest, UserListResponse,
        UserProfileResponse,
    },
};

fn parse_user_id(raw: &str) -> Result<UserId, ApiFailure> {
    UserId::try_from(raw).map_err(|_| ApiFailure::NotFound)
}

pub(crate) async fn list_users(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<UserListResponse>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let users = repository(&state)
        .await?
        .list_users_except(auth.user_id)
        .await?;
    Ok(Json(UserListResponse {
        users: users.iter().map(UserProfileResponse::from).collect(),
    }))
}

pub(crate) async fn unread(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<UnreadCountsResponse>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let counts = unread_counts(&state, &auth).await?;
    Ok(Json(UnreadCountsResponse::from(counts)))
}

pub(crate) async fn get_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Result<Json<UserProfileResponse>, ApiFailure> {
    authenticate(&state, &headers).await?;
    let user_id = parse_user_id(&user_id)?;
    let user = repository(&state)
        .await?
        .find_user(user_id)
        .await?
        .ok_or(ApiFailure::NotFound)?;
    Ok(Json(UserProfileResponse::from(&user)))
}

pub(crate) async fn update_me(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<UpdateProfileRequest>,
) -> Result<Json<UserProfileResponse>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let update = ProfileUpdate {
        username: payload.username.map(Username::try_from).transpose()?,
        avatar_url: payload.avatar_url.map(ResourceUrl::try_from).transpose()?,
    };
    let user = repository(&state)
        .await?
        .update_profile(auth.user_id, &update)
        .await?;
    tracing::info!(event = "users.update_profile", user_id = %auth.user_id);
    Ok(Json(UserProfileResponse::from(&user)))
}

pub(crate) async fn direct_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(partner_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryPage>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let partner_id = parse_user_id(&partner_id)?;
    let cursor = parse_cursor(query.cursor.as_deref())?;
    direct_history(&state, &auth, partner_id, cursor).await.map(Json)
}
