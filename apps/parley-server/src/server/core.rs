use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex, OnceLock, PoisonError},
    time::Duration,
};

use anyhow::anyhow;
use argon2::password_hash::rand_core::{OsRng, RngCore};
use object_store::local::LocalFileSystem;
use parley_core::{MessageId, UserId};
use pasetors::{keys::SymmetricKey, version4::V4};
use sqlx::{postgres::PgPoolOptions, PgPool};
use tokio::sync::OnceCell;
use ulid::{Generator, Ulid};

use super::{auth::hash_password, realtime::RealtimeRegistry, storage::MemoryStore};

pub const DEFAULT_JSON_BODY_LIMIT_BYTES: usize = 1_048_576;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_RATE_LIMIT_REQUESTS_PER_MINUTE: u32 = 60;
pub const ACCESS_TOKEN_TTL_SECS: i64 = 15 * 60;
pub const REFRESH_TOKEN_TTL_SECS: i64 = 7 * 24 * 60 * 60;
pub const DEFAULT_GATEWAY_INGRESS_EVENTS_PER_WINDOW: u32 = 20;
pub const DEFAULT_GATEWAY_INGRESS_WINDOW_SECS: u64 = 10;
pub const DEFAULT_GATEWAY_OUTBOUND_QUEUE: usize = 256;
pub const DEFAULT_MAX_GATEWAY_EVENT_BYTES: usize = parley_protocol::MAX_EVENT_BYTES;
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_HISTORY_PAGE_LIMIT: usize = 50;
pub const MAX_HISTORY_PAGE_LIMIT: usize = 100;
pub const DEFAULT_TYPING_TTL_MILLIS: u64 = 6_000;
pub const DEFAULT_ROOM_NAME: &str = "general";
pub(crate) const GATEWAY_PING_INTERVAL_SECS: u64 = 30;
pub(crate) const TYPING_SWEEP_INTERVAL_MILLIS: u64 = 1_000;
pub(crate) const MAX_MIME_SNIFF_BYTES: usize = 8192;
pub(crate) const MAX_REFRESH_TOKEN_CHARS: usize = 256;
pub(crate) const REFRESH_COOKIE_NAME: &str = "refresh_token";
pub(crate) const REFRESH_COOKIE_PATH: &str = "/auth";
pub(crate) const METRICS_TEXT_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

pub(crate) static METRICS_STATE: OnceLock<MetricsState> = OnceLock::new();

type LabelCounters<K> = Mutex<HashMap<K, u64>>;

#[derive(Default)]
pub(crate) struct MetricsState {
    pub(crate) auth_failures: LabelCounters<&'static str>,
    pub(crate) rate_limit_hits: LabelCounters<(&'static str, &'static str)>,
    pub(crate) ws_disconnects: LabelCounters<&'static str>,
    pub(crate) gateway_events_emitted: LabelCounters<(String, String)>,
    pub(crate) gateway_events_dropped: LabelCounters<(String, String, String)>,
    pub(crate) gateway_ingress_rejected: LabelCounters<(String, String)>,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub max_body_bytes: usize,
    pub request_timeout: Duration,
    pub rate_limit_requests_per_minute: u32,
    pub gateway_ingress_events_per_window: u32,
    pub gateway_ingress_window: Duration,
    pub gateway_outbound_queue: usize,
    pub max_gateway_event_bytes: usize,
    pub max_upload_bytes: usize,
    pub history_page_limit: usize,
    pub typing_ttl: Duration,
    pub default_room: String,
    pub seed_rooms: Vec<String>,
    pub secure_cookies: bool,
    pub upload_root: PathBuf,
    pub database_url: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: DEFAULT_JSON_BODY_LIMIT_BYTES,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            rate_limit_requests_per_minute: DEFAULT_RATE_LIMIT_REQUESTS_PER_MINUTE,
            gateway_ingress_events_per_window: DEFAULT_GATEWAY_INGRESS_EVENTS_PER_WINDOW,
            gateway_ingress_window: Duration::from_secs(DEFAULT_GATEWAY_INGRESS_WINDOW_SECS),
            gateway_outbound_queue: DEFAULT_GATEWAY_OUTBOUND_QUEUE,
            max_gateway_event_bytes: DEFAULT_MAX_GATEWAY_EVENT_BYTES,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            history_page_limit: DEFAULT_HISTORY_PAGE_LIMIT,
            typing_ttl: Duration::from_millis(DEFAULT_TYPING_TTL_MILLIS),
            default_room: String::from(DEFAULT_ROOM_NAME),
            seed_rooms: vec![
                String::from(DEFAULT_ROOM_NAME),
                String::from("random"),
                String::from("tech"),
            ],
            secure_cookies: true,
            upload_root: PathBuf::from("./data/uploads"),
            database_url: None,
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct RuntimeConfig {
    pub(crate) gateway_ingress_events_per_window: u32,
    pub(crate) gateway_ingress_window: Duration,
    pub(crate) gateway_outbound_queue: usize,
    pub(crate) max_gateway_event_bytes: usize,
    pub(crate) max_upload_bytes: usize,
    pub(crate) history_page_limit: usize,
    pub(crate) default_room: String,
    pub(crate) seed_rooms: Vec<String>,
    pub(crate) secure_cookies: bool,
}

/// Hands out message ids that sort in creation order within this process,
/// even when several are minted in the same millisecond.
pub(crate) struct MessageIdSource(Mutex<Generator>);

impl MessageIdSource {
    fn new() -> Self {
        Self(Mutex::new(Generator::new()))
    }

    pub(crate) fn next_id(&self) -> MessageId {
        let mut generator = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        generator
            .generate()
            .map_or_else(|_| MessageId::from(Ulid::new()), MessageId::from)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub(crate) db_pool: Option<PgPool>,
    pub(crate) db_init: Arc<OnceCell<()>>,
    pub(crate) memory: Arc<MemoryStore>,
    pub(crate) message_ids: Arc<MessageIdSource>,
    pub(crate) token_key: Arc<SymmetricKey<V4>>,
    pub(crate) dummy_password_hash: Arc<String>,
    pub(crate) upload_store: Arc<LocalFileSystem>,
    pub(crate) realtime: Arc<RealtimeRegistry>,
    pub(crate) runtime: Arc<RuntimeConfig>,
}

impl AppState {
    pub(crate) fn new(config: &AppConfig) -> anyhow::Result<Self> {
        let mut key_bytes = [0_u8; 32];
        OsRng.fill_bytes(&mut key_bytes);
        let token_key = SymmetricKey::<V4>::from(&key_bytes)
            .map_err(|e| anyhow!("token key init failed: {e}"))?;
        let dummy_password_hash = hash_password("parley-dummy-password")?;
        let db_pool = if let Some(database_url) = &config.database_url {
            Some(
                PgPoolOptions::new()
                    .max_connections(10)
                    .connect_lazy(database_url)
                    .map_err(|e| anyhow!("postgres pool init failed: {e}"))?,
            )
        } else {
            None
        };

        std::fs::create_dir_all(&config.upload_root)
            .map_err(|e| anyhow!("upload root init failed: {e}"))?;
        let upload_store = LocalFileSystem::new_with_prefix(&config.upload_root)
            .map_err(|e| anyhow!("upload store init failed: {e}"))?;

        let mut seed_rooms = vec![config.default_room.clone()];
        for name in &config.seed_rooms {
            if !seed_rooms.contains(name) {
                seed_rooms.push(name.clone());
            }
        }
        let memory = MemoryStore::seeded(&seed_rooms)?;

        Ok(Self {
            db_pool,
            db_init: Arc::new(OnceCell::new()),
            memory: Arc::new(memory),
            message_ids: Arc::new(MessageIdSource::new()),
            token_key: Arc::new(token_key),
            dummy_password_hash: Arc::new(dummy_password_hash),
            upload_store: Arc::new(upload_store),
            realtime: Arc::new(RealtimeRegistry::new(
                config.typing_ttl,
                config.max_gateway_event_bytes,
            )),
            runtime: Arc::new(RuntimeConfig {
                gateway_ingress_events_per_window: config.gateway_ingress_events_per_window,
                gateway_ingress_window: config.gateway_ingress_window,
                gateway_outbound_queue: config.gateway_outbound_queue,
                max_gateway_event_bytes: config.max_gateway_event_bytes,
                max_upload_bytes: config.max_upload_bytes,
                history_page_limit: config.history_page_limit,
                default_room: config.default_room.clone(),
                seed_rooms,
                secure_cookies: config.secure_cookies,
            }),
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct AuthContext {
    pub(crate) user_id: UserId,
    pub(crate) username: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionControl {
    Open,
    Close,
}

#[cfg(test)]
mod tests {
    use super::MessageIdSource;

    #[test]
    fn message_ids_are_strictly_increasing() {
        let source = MessageIdSource::new();
        let mut previous = source.next_id();
        for _ in 0..1_000 {
            let next = source.next_id();
            assert!(next > previous);
            previous = next;
        }
    }
}
