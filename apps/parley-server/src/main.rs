#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;

use parley_server::{build_router, init_tracing, AppConfig};
use tokio::net::TcpListener;

fn parse_env<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    std::env::var(name).map_or_else(
        |_| Ok(default),
        |value| {
            value
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("invalid {name} value {value:?}: {e}"))
        },
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let defaults = AppConfig::default();
    let database_url = std::env::var("PARLEY_DATABASE_URL").ok();
    if database_url.is_none() {
        tracing::warn!("PARLEY_DATABASE_URL unset, using in-memory storage");
    }
    let app_config = AppConfig {
        upload_root: std::env::var("PARLEY_UPLOAD_ROOT")
            .map_or_else(|_| PathBuf::from("./data/uploads"), PathBuf::from),
        secure_cookies: parse_env("PARLEY_SECURE_COOKIES", defaults.secure_cookies)?,
        history_page_limit: parse_env("PARLEY_HISTORY_PAGE_LIMIT", defaults.history_page_limit)?,
        rate_limit_requests_per_minute: parse_env(
            "PARLEY_RATE_LIMIT_REQUESTS_PER_MINUTE",
            defaults.rate_limit_requests_per_minute,
        )?,
        database_url,
        ..defaults
    };
    let app = build_router(&app_config)?;
    let addr = std::env::var("PARLEY_BIND_ADDR")
        .unwrap_or_else(|_| String::from("0.0.0.0:3000"))
        .parse::<SocketAddr>()
        .map_err(|e| anyhow::anyhow!("invalid PARLEY_BIND_ADDR: {e}"))?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "parley-server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
