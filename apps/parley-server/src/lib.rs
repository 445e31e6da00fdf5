#![forbid(unsafe_code)]

mod server;

pub use server::{
    build_router, init_tracing, AppConfig, ACCESS_TOKEN_TTL_SECS, DEFAULT_HISTORY_PAGE_LIMIT,
    DEFAULT_ROOM_NAME, DEFAULT_TYPING_TTL_MILLIS, MAX_HISTORY_PAGE_LIMIT, REFRESH_TOKEN_TTL_SECS,
};
