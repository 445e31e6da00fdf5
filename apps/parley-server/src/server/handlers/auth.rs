use axum::{
    extract::State,
    http::{header::SET_COOKIE, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use parley_core::{Email, Username};

use crate::server::{
    auth::{
        authenticate, clear_refresh_cookie, hash_password, hash_refresh_token,
        issue_access_token, issue_refresh_token, now_unix, refresh_cookie,
        refresh_token_from_cookies, validate_password, verify_password,
    },
    core::{AppState, ACCESS_TOKEN_TTL_SECS, REFRESH_TOKEN_TTL_SECS},
    errors::ApiFailure,
    storage::{repository, ChatPersistence, ChatRepository, NewAccount, UserRecord},
    types::{AccountResponse, AuthResponse, LoginRequest, RegisterRequest},
};

/// Mints an access token plus a fresh refresh row and sets the cookie.
async fn open_session(
    state: &AppState,
    repo: &ChatRepository<'_>,
    user: &UserRecord,
) -> Result<Response, ApiFailure> {
    let access_token = issue_access_token(state, user.user_id, &user.username)
        .map_err(|_| ApiFailure::Internal)?;
    let (refresh_token, refresh_hash) = issue_refresh_token();
    repo.insert_session(
        refresh_hash,
        user.user_id,
        now_unix().saturating_add(REFRESH_TOKEN_TTL_SECS),
    )
    .await?;

    Ok((
        [(
            SET_COOKIE,
            refresh_cookie(&refresh_token, state.runtime.secure_cookies),
        )],
        Json(AuthResponse {
            access_token,
            expires_in_secs: ACCESS_TOKEN_TTL_SECS,
            user: AccountResponse::from(user),
        }),
    )
        .into_response())
}

pub(crate) async fn register(
    State(state): State<AppState>,
    Json(payload): Json<RegisterRequest>,
) -> Result<Response, ApiFailure> {
    let email = Email::try_from(payload.email)?;
    let username = Username::try_from(payload.username)?;
    validate_password(&payload.password)?;
    let password_hash = hash_password(&payload.password).map_err(|_| ApiFailure::Internal)?;

    let repo = repository(&state).await?;
    let default_room = repo.find_room_by_name(&state.runtime.default_room).await?;
    if default_room.is_none() {
        tracing::warn!(event = "auth.register", outcome = "default_room_missing", room = %state.runtime.default_room);
    }
    let user = repo
        .create_user(
            &NewAccount {
                email: &email,
                username: &username,
                password_hash: &password_hash,
                initial_room: default_room.map(|room| room.room_id),
            },
            now_unix(),
        )
        .await
        .inspect_err(|failure| {
            if let ApiFailure::Conflict(reason) = failure {
                tracing::info!(event = "auth.register", outcome = *reason);
            }
        })?;

    tracing::info!(event = "auth.register", outcome = "created", user_id = %user.user_id);
    open_session(&state, &repo, &user).await
}

pub(crate) async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Response, ApiFailure> {
    let repo = repository(&state).await?;
    let user = match Email::try_from(payload.email) {
        Ok(email) => repo.find_user_by_email(&email).await?,
        Err(_) => None,
    };
    let Some(user) = user else {
        // keep the unknown-user path as slow as a wrong password
        let _ = verify_password(&state.dummy_password_hash, &payload.password);
        tracing::warn!(event = "auth.login", outcome = "invalid_credentials");
        return Err(ApiFailure::Unauthorized);
    };
    if !verify_password(&user.password_hash, &payload.password) {
        tracing::warn!(event = "auth.login", outcome = "invalid_credentials", user_id = %user.user_id);
        return Err(ApiFailure::Unauthorized);
    }

    tracing::info!(event = "auth.login", outcome = "success", user_id = %user.user_id);
    open_session(&state, &repo, &user).await
}

async fn rotate_session(state: &AppState, headers: &HeaderMap) -> Result<Response, ApiFailure> {
    let presented = refresh_token_from_cookies(headers).ok_or(ApiFailure::Unauthorized)?;
    let repo = repository(state).await?;
    let user_id = repo
        .take_session(hash_refresh_token(presented), now_unix())
        .await?
        .ok_or(ApiFailure::Unauthorized)?;
    let user = repo
        .find_user(user_id)
        .await?
        .ok_or(ApiFailure::Unauthorized)?;

    tracing::info!(event = "auth.refresh", outcome = "success", user_id = %user_id);
    open_session(state, &repo, &user).await
}

/// Exchanges the refresh cookie for a new token pair. The presented token is
/// consumed either way; a rejected one also clears the cookie.
pub(crate) async fn refresh(State(state): State<AppState>, headers: HeaderMap) -> Response {
    match rotate_session(&state, &headers).await {
        Ok(response) => response,
        Err(ApiFailure::Unauthorized) => {
            tracing::warn!(event = "auth.refresh", outcome = "rejected");
            (
                [(
                    SET_COOKIE,
                    clear_refresh_cookie(state.runtime.secure_cookies),
                )],
                ApiFailure::Unauthorized,
            )
                .into_response()
        }
        Err(other) => other.into_response(),
    }
}

pub(crate) async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiFailure> {
    if let Some(presented) = refresh_token_from_cookies(&headers) {
        let revoked = repository(&state)
            .await?
            .take_session(hash_refresh_token(presented), now_unix())
            .await?;
        tracing::info!(
            event = "auth.logout",
            outcome = if revoked.is_some() { "revoked" } else { "unknown_session" }
        );
    }

    Ok((
        StatusCode::NO_CONTENT,
        [(
            SET_COOKIE,
            clear_refresh_cookie(state.runtime.secure_cookies),
        )],
    )
        .into_response())
}

pub(crate) async fn me(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<AccountResponse>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let user = repository(&state)
        .await?
        .find_user(auth.user_id)
        .await?
        .ok_or(ApiFailure::Unauthorized)?;
    Ok(Json(AccountResponse::from(&user)))
}
