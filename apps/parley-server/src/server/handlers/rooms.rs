use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use parley_core::{ChatScope, RoomDescription, RoomId, RoomName};

use crate::server::{
    auth::{authenticate, now_unix},
    core::AppState,
    errors::ApiFailure,
    gateway_events,
    history::{parse_cursor, room_history, HistoryPage},
    realtime::ChannelKey,
    storage::{repository, ChatPersistence},
    types::{
        CreateRoomRequest, HistoryQuery, RoomDetailResponse, RoomListResponse,
        RoomMemberResponse, RoomResponse, RoomSummaryResponse,
    },
};

fn parse_room_id(raw: &str) -> Result<RoomId, ApiFailure> {
    RoomId::try_from(raw).map_err(|_| ApiFailure::NotFound)
}

pub(crate) async fn list_rooms(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<RoomListResponse>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let listings = repository(&state).await?.list_rooms(auth.user_id).await?;
    Ok(Json(RoomListResponse {
        rooms: listings.iter().map(RoomSummaryResponse::from).collect(),
    }))
}

pub(crate) async fn create_room(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateRoomRequest>,
) -> Result<(StatusCode, Json<RoomResponse>), ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let name = RoomName::try_from(payload.name)?;
    let description = payload
        .description
        .filter(|text| !text.trim().is_empty())
        .map(RoomDescription::try_from)
        .transpose()?;

    let room = repository(&state)
        .await?
        .create_room(&name, description.as_ref(), auth.user_id, now_unix())
        .await?;
    tracing::info!(event = "rooms.create", room_id = %room.room_id, user_id = %auth.user_id);

    if let Some(event) = gateway_events::room_created(&room) {
        state
            .realtime
            .broadcast(ChannelKey::Everyone, &event, None)
            .await;
    }
    Ok((StatusCode::CREATED, Json(RoomResponse::from(&room))))
}

pub(crate) async fn get_room(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(room_id): Path<String>,
) -> Result<Json<RoomDetailResponse>, ApiFailure> {
    authenticate(&state, &headers).await?;
    let room_id = parse_room_id(&room_id)?;
    let repo = repository(&state).await?;
    let room = repo.find_room(room_id).await?.ok_or(ApiFailure::NotFound)?;
    let members = repo.room_members(room_id).await?;
    Ok(Json(RoomDetailResponse {
        room: RoomResponse::from(&room),
        members: members.iter().map(RoomMemberResponse::from).collect(),
    }))
}

pub(crate) async fn join_room(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(room_id): Path<String>,
) -> Result<StatusCode, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let room_id = parse_room_id(&room_id)?;
    let repo = repository(&state).await?;
    if !repo.add_membership(auth.user_id, room_id).await? {
        return Err(ApiFailure::Conflict("already_member"));
    }
    tracing::info!(event = "rooms.join", room_id = %room_id, user_id = %auth.user_id);
    Ok(StatusCode::NO_CONTENT)
}

/// Leaving drops the membership and detaches the caller's live connections
/// from the room channel. Nobody leaves the default room.
pub(crate) async fn leave_room(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(room_id): Path<String>,
) -> Result<StatusCode, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let room_id = parse_room_id(&room_id)?;
    let repo = repository(&state).await?;
    let room = repo.find_room(room_id).await?.ok_or(ApiFailure::NotFound)?;
    if room.name == state.runtime.default_room {
        return Err(ApiFailure::Forbidden);
    }
    if !repo.remove_membership(auth.user_id, room_id).await? {
        return Err(ApiFailure::NotFound);
    }

    let detached = state
        .realtime
        .unsubscribe_user(auth.user_id, ChannelKey::Room(room_id))
        .await;
    state
        .realtime
        .typing_stopped(ChatScope::Room(room_id), auth.user_id)
        .await;
    tracing::info!(
        event = "rooms.leave",
        room_id = %room_id,
        user_id = %auth.user_id,
        detached
    );
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn room_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(room_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryPage>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let room_id = parse_room_id(&room_id)?;
    let cursor = parse_cursor(query.cursor.as_deref())?;
    room_history(&state, &auth, room_id, cursor).await.map(Json)
}
