//! Configuration
//!
//! Handles loading configuration from environment variables and config files,
//! and owns the shared application state handed to every request.

use axum::extract::FromRef;
use axum_extra::extract::cookie::Key;
use serde::Deserialize;
use std::sync::Arc;

use crate::error::{AppError, AppResult};
use crate::index::Index;
use crate::ingest::Ingestor;
use crate::rbac::{InMemoryPolicy, PolicyEngine};
use crate::read::ReadAggregator;
use crate::services::{
    Cache, HttpIdentityResolver, IdentityResolver, KeyStore, KnotClient, OAuthService,
    ServiceAuthMinter, SessionLimits, SessionService, SessionStore,
};
use crate::write::WriteCoordinator;

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub cookie: CookieConfig,
    pub redis: RedisConfig,
    pub database: DatabaseConfig,
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub remotes: RemoteConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Base URL for this server (used in OAuth metadata)
    pub base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CookieConfig {
    /// Secret the signed session cookie is keyed from. Rotating it
    /// invalidates every cookie but no server-side session.
    pub secret: String,
    #[serde(default = "default_cookie_name")]
    pub name: String,
    /// Set the Secure attribute. Disable only for local development.
    #[serde(default = "default_true")]
    pub secure: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    /// Client ID: the public URL of the client metadata document
    pub client_id: String,
    /// Redirect URI for the OAuth callback
    pub redirect_uri: String,
    /// Path to the ES256 private key (PEM format)
    pub private_key_path: Option<String>,
    /// ES256 private key as base64-encoded PEM (alternative to file path)
    pub private_key_base64: Option<String>,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    #[serde(default = "default_plc_directory")]
    pub plc_directory: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// A session dies after this much inactivity.
    #[serde(default = "default_inactivity_secs")]
    pub inactivity_secs: u64,
    /// A session dies this long after creation no matter what.
    #[serde(default = "default_absolute_secs")]
    pub absolute_secs: u64,
    /// Pending authorization requests are discarded after this.
    #[serde(default = "default_auth_request_secs")]
    pub auth_request_secs: u64,
    /// Access tokens are refreshed when they are this close to expiry.
    #[serde(default = "default_refresh_window_secs")]
    pub refresh_window_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inactivity_secs: default_inactivity_secs(),
            absolute_secs: default_absolute_secs(),
            auth_request_secs: default_auth_request_secs(),
            refresh_window_secs: default_refresh_window_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    /// Ceiling for primary knot/spindle calls in a request path.
    #[serde(default = "default_primary_timeout_secs")]
    pub primary_timeout_secs: u64,
    /// Ceiling for secondary (enrichment) knot/spindle calls.
    #[serde(default = "default_secondary_timeout_secs")]
    pub secondary_timeout_secs: u64,
    /// Ceiling for PDS calls.
    #[serde(default = "default_pds_timeout_secs")]
    pub pds_timeout_secs: u64,
    /// Allow http/ws and private hosts. Local development only.
    #[serde(default)]
    pub allow_insecure: bool,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            primary_timeout_secs: default_primary_timeout_secs(),
            secondary_timeout_secs: default_secondary_timeout_secs(),
            pds_timeout_secs: default_pds_timeout_secs(),
            allow_insecure: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Bounded retries before an event is dead-lettered.
    #[serde(default = "default_max_event_attempts")]
    pub max_event_attempts: u32,
    /// Stop the source instead of advancing past a dead-lettered event.
    #[serde(default)]
    pub halt_on_dead_letter: bool,
    #[serde(default = "default_backoff_min_ms")]
    pub backoff_min_ms: u64,
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
    /// WebSocket keepalive interval; the read deadline is a small multiple.
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_event_attempts: default_max_event_attempts(),
            halt_on_dead_letter: false,
            backoff_min_ms: default_backoff_min_ms(),
            backoff_max_secs: default_backoff_max_secs(),
            keepalive_secs: default_keepalive_secs(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_cookie_name() -> String {
    "appview-session".to_string()
}

fn default_true() -> bool {
    true
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_database_url() -> String {
    "sqlite://appview.db?mode=rwc".to_string()
}

fn default_scopes() -> Vec<String> {
    vec!["atproto".to_string(), "transition:generic".to_string()]
}

fn default_plc_directory() -> String {
    "https://plc.directory".to_string()
}

fn default_inactivity_secs() -> u64 {
    86400 * 14
}

fn default_absolute_secs() -> u64 {
    86400 * 60
}

fn default_auth_request_secs() -> u64 {
    600
}

fn default_refresh_window_secs() -> u64 {
    300
}

fn default_primary_timeout_secs() -> u64 {
    30
}

fn default_secondary_timeout_secs() -> u64 {
    5
}

fn default_pds_timeout_secs() -> u64 {
    30
}

fn default_max_event_attempts() -> u32 {
    3
}

fn default_backoff_min_ms() -> u64 {
    500
}

fn default_backoff_max_secs() -> u64 {
    30
}

fn default_keepalive_secs() -> u64 {
    30
}

impl AppConfig {
    /// Load configuration from environment and config files
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port())?
            .set_default("redis.url", default_redis_url())?
            .set_default("database.url", default_database_url())?
            .set_default("cookie.name", default_cookie_name())?
            .set_default("oauth.scopes", default_scopes())?
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(
                config::Environment::with_prefix("APPVIEW")
                    .separator("__")
                    .with_list_parse_key("APPVIEW__OAUTH__SCOPES")
                    .list_separator(",")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub http: reqwest::Client,
    pub redis: redis::aio::ConnectionManager,
    pub index: Index,
    pub cookie_key: Key,
    pub keys: Arc<KeyStore>,
    pub identity: Arc<dyn IdentityResolver>,
    pub store: Arc<SessionStore>,
    pub oauth: Arc<OAuthService>,
    pub sessions: Arc<SessionService>,
    pub knots: Arc<KnotClient>,
    pub policy: Arc<dyn PolicyEngine>,
    pub writes: Arc<WriteCoordinator>,
    pub reads: Arc<ReadAggregator>,
    pub ingestor: Arc<Ingestor>,
    pub cache: Cache,
}

impl AppState {
    pub async fn new(config: AppConfig) -> AppResult<Self> {
        if config.cookie.secret.len() < 32 {
            return Err(AppError::Config(
                "cookie.secret must be at least 32 bytes".into(),
            ));
        }
        let cookie_key = Key::derive_from(config.cookie.secret.as_bytes());

        let http = reqwest::Client::builder()
            .user_agent(concat!("tangled-appview/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(
                config.remotes.pds_timeout_secs,
            ))
            .build()?;

        let redis_client = redis::Client::open(config.redis.url.as_str())?;
        let redis = redis::aio::ConnectionManager::new(redis_client).await?;

        let index = Index::connect(&config.database.url).await?;

        let keys = Arc::new(KeyStore::from_config(&config.oauth)?);
        let identity: Arc<dyn IdentityResolver> = Arc::new(HttpIdentityResolver::new(
            http.clone(),
            config.oauth.plc_directory.clone(),
        ));

        let limits = SessionLimits {
            inactivity: chrono::Duration::seconds(config.sessions.inactivity_secs as i64),
            absolute: chrono::Duration::seconds(config.sessions.absolute_secs as i64),
            auth_request_secs: config.sessions.auth_request_secs,
        };
        let store = Arc::new(SessionStore::new(redis.clone(), limits));

        let oauth = Arc::new(OAuthService::new(
            http.clone(),
            keys.clone(),
            identity.clone(),
            store.clone(),
            config.oauth.client_id.clone(),
            config.oauth.redirect_uri.clone(),
            config.oauth.scopes.clone(),
            config.remotes.allow_insecure,
        ));

        let sessions = Arc::new(SessionService::new(
            store.clone(),
            oauth.clone(),
            http.clone(),
            chrono::Duration::seconds(config.sessions.refresh_window_secs as i64),
        ));

        let knots = Arc::new(KnotClient::new(
            std::time::Duration::from_secs(config.remotes.primary_timeout_secs),
            std::time::Duration::from_secs(config.remotes.secondary_timeout_secs),
            config.remotes.allow_insecure,
        )?);

        let policy: Arc<dyn PolicyEngine> = Arc::new(InMemoryPolicy::new());
        let cache = Cache::new(redis.clone());

        let minter = ServiceAuthMinter::default();
        let writes = Arc::new(WriteCoordinator::new(
            index.clone(),
            knots.clone(),
            policy.clone(),
            minter,
            identity.clone(),
            config.remotes.allow_insecure,
        ));
        let reads = Arc::new(ReadAggregator::new(
            index.clone(),
            knots.clone(),
            identity.clone(),
            cache.clone(),
        ));
        let ingestor = Arc::new(Ingestor::new(
            index.clone(),
            config.ingest.clone(),
            config.remotes.allow_insecure,
        ));

        Ok(Self {
            config: Arc::new(config),
            http,
            redis,
            index,
            cookie_key,
            keys,
            identity,
            store,
            oauth,
            sessions,
            knots,
            policy,
            writes,
            reads,
            ingestor,
            cache,
        })
    }
}

impl FromRef<AppState> for Key {
    fn from_ref(state: &AppState) -> Key {
        state.cookie_key.clone()
    }
}
