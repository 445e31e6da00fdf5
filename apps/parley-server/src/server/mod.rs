pub(crate) mod auth;
pub(crate) mod core;
pub(crate) mod db;
pub(crate) mod errors;
pub(crate) mod gateway_events;
pub(crate) mod handlers;
pub(crate) mod history;
pub(crate) mod messaging;
pub(crate) mod metrics;
pub(crate) mod realtime;
pub(crate) mod router;
pub(crate) mod storage;
pub(crate) mod types;

pub use self::core::{
    AppConfig, ACCESS_TOKEN_TTL_SECS, DEFAULT_HISTORY_PAGE_LIMIT, DEFAULT_ROOM_NAME,
    DEFAULT_TYPING_TTL_MILLIS, MAX_HISTORY_PAGE_LIMIT, REFRESH_TOKEN_TTL_SECS,
};
pub use errors::init_tracing;
pub use router::build_router;
