use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::anyhow;
use axum::{
    extract::ConnectInfo,
    extract::DefaultBodyLimit,
    http::{request::Request, HeaderMap, HeaderName, StatusCode},
    routing::{delete, get, patch, post},
    Router,
};
use tower::ServiceBuilder;
use tower_governor::{
    errors::GovernorError, governor::GovernorConfigBuilder, key_extractor::KeyExtractor,
    GovernorLayer,
};
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use super::{
    core::{AppConfig, AppState, MAX_HISTORY_PAGE_LIMIT},
    handlers::{
        create_room, direct_messages, download_file, get_room, get_user, join_room, leave_room,
        list_rooms, list_users, login, logout, me, refresh, register, room_messages, unread,
        update_me, upload_file,
    },
    realtime::{gateway_ws, spawn_typing_sweeper},
    types::{health, metrics},
};

const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Keys the limiter on the first `x-forwarded-for` hop, falling back to the
/// socket peer address.
#[derive(Clone, Copy)]
struct ClientIpKeyExtractor;

fn forwarded_client_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get(FORWARDED_FOR_HEADER)?
        .to_str()
        .ok()?
        .split(',')
        .next()?
        .trim()
        .parse()
        .ok()
}

impl KeyExtractor for ClientIpKeyExtractor {
    type Key = IpAddr;

    fn extract<T>(&self, req: &Request<T>) -> Result<Self::Key, GovernorError> {
        let peer_ip = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|value| value.0.ip())
            .or_else(|| req.extensions().get::<SocketAddr>().map(SocketAddr::ip));
        Ok(forwarded_client_ip(req.headers())
            .or(peer_ip)
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)))
    }
}

fn validate_config(config: &AppConfig) -> anyhow::Result<()> {
    if config.max_gateway_event_bytes == 0
        || config.max_gateway_event_bytes > parley_protocol::MAX_EVENT_BYTES
    {
        return Err(anyhow!(
            "gateway event limit must be between 1 and the protocol max of {} bytes",
            parley_protocol::MAX_EVENT_BYTES
        ));
    }
    if config.history_page_limit == 0 || config.history_page_limit > MAX_HISTORY_PAGE_LIMIT {
        return Err(anyhow!(
            "history page limit must be between 1 and {MAX_HISTORY_PAGE_LIMIT} messages"
        ));
    }
    if config.rate_limit_requests_per_minute == 0 {
        return Err(anyhow!(
            "rate limit must be at least 1 request per minute"
        ));
    }
    if config.gateway_ingress_events_per_window == 0 || config.gateway_ingress_window.is_zero() {
        return Err(anyhow!(
            "gateway ingress limit must allow at least 1 event per non-empty window"
        ));
    }
    if config.gateway_outbound_queue == 0 {
        return Err(anyhow!("gateway outbound queue must hold at least 1 event"));
    }
    if config.max_upload_bytes == 0 {
        return Err(anyhow!("max upload bytes must be at least 1 byte"));
    }
    if config.typing_ttl.is_zero() {
        return Err(anyhow!("typing ttl must be non-zero"));
    }
    if config.default_room.trim().is_empty() {
        return Err(anyhow!("default room name must not be empty"));
    }
    Ok(())
}

/// Build the axum router with global security middleware.
///
/// # Errors
/// Returns an error if configured limits are invalid or state init fails.
pub fn build_router(config: &AppConfig) -> anyhow::Result<Router> {
    validate_config(config)?;

    let governor_config = Arc::new(
        GovernorConfigBuilder::default()
            .period(Duration::from_secs(60))
            .burst_size(config.rate_limit_requests_per_minute)
            .key_extractor(ClientIpKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow!("invalid governor configuration"))?,
    );
    let app_state = AppState::new(config)?;
    if tokio::runtime::Handle::try_current().is_ok() {
        spawn_typing_sweeper(&app_state.realtime);
    }
    let request_id_header = HeaderName::from_static("x-request-id");
    let governor_layer = GovernorLayer::new(governor_config);

    let routes = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
        .route("/auth/logout", post(logout))
        .route("/auth/me", get(me))
        .route("/users", get(list_users))
        .route("/users/unread", get(unread))
        .route("/users/me", patch(update_me))
        .route("/users/{user_id}", get(get_user))
        .route("/users/{user_id}/messages", get(direct_messages))
        .route("/rooms", get(list_rooms).post(create_room))
        .route("/rooms/{room_id}", get(get_room))
        .route("/rooms/{room_id}/join", post(join_room))
        .route("/rooms/{room_id}/leave", delete(leave_room))
        .route("/rooms/{room_id}/messages", get(room_messages))
        .route("/uploads/{upload_id}", get(download_file))
        .route("/gateway/ws", get(gateway_ws));

    let upload_route = Router::new()
        .route("/uploads", post(upload_file))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes));

    Ok(routes
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .merge(upload_route)
        .with_state(app_state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
                .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
                .layer(TimeoutLayer::with_status_code(
                    StatusCode::REQUEST_TIMEOUT,
                    config.request_timeout,
                ))
                .layer(governor_layer),
        ))
}
