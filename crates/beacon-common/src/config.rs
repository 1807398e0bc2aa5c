//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: env vars > .env file > config.toml > defaults

use serde::Deserialize;
use std::time::Duration;

/// Load the configuration for the process: `.env` first (development), then
/// [`load`].
///
/// Should be called once at application startup.
pub fn init() -> Result<AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();
    load()
}

/// Build an [`AppConfig`] from defaults, `config.toml` and `BEACON_*` env vars.
pub fn load() -> Result<AppConfig, config::ConfigError> {
    let cfg = config::Config::builder()
        // Defaults
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 8443)?
        .set_default("server.ws_path", "/one2many")?
        .set_default("media.uri", "ws://localhost:8888/kurento")?
        .set_default("media.request_timeout_secs", 30)?
        .set_default("candidates.max_queued", 128)?
        .set_default("candidates.ttl_secs", 60)?
        .set_default("candidates.sweep_interval_secs", 15)?
        .set_default("session.presenter_policy", "replace")?
        // Optional config file
        .add_source(config::File::with_name("config").required(false))
        // Environment variables (BEACON_SERVER__PORT, BEACON_MEDIA__URI, etc.)
        .add_source(
            config::Environment::with_prefix("BEACON")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let app_config: AppConfig = cfg.try_deserialize()?;
    app_config.validate()?;
    Ok(app_config)
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub media: MediaConfig,
    pub candidates: CandidateConfig,
    pub session: SessionConfig,
}

impl AppConfig {
    /// Reject values that would only fail later, at first use.
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        let uri = url::Url::parse(&self.media.uri).map_err(|e| {
            config::ConfigError::Message(format!("media.uri {:?}: {e}", self.media.uri))
        })?;
        if !matches!(uri.scheme(), "ws" | "wss") {
            return Err(config::ConfigError::Message(format!(
                "media.uri must be a ws:// or wss:// URI, got {:?}",
                self.media.uri
            )));
        }
        if !self.server.ws_path.starts_with('/') {
            return Err(config::ConfigError::Message(format!(
                "server.ws_path must start with '/', got {:?}",
                self.server.ws_path
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Path of the signaling WebSocket route.
    pub ws_path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MediaConfig {
    /// Control URI of the media server (Kurento JSON-RPC endpoint).
    pub uri: String,
    /// Upper bound on a single media server request; `0` waits forever.
    pub request_timeout_secs: u64,
}

impl MediaConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CandidateConfig {
    /// Max candidates buffered per session before the oldest is dropped.
    pub max_queued: usize,
    /// Queued candidates older than this are discarded instead of applied.
    pub ttl_secs: u64,
    /// How often the server sweeps expired candidates out of the queue.
    pub sweep_interval_secs: u64,
}

impl CandidateConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// `None` when sweeping is disabled (`sweep_interval_secs = 0`).
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    pub presenter_policy: PresenterPolicy,
}

/// What happens when a session that is already presenting asks to present again.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PresenterPolicy {
    /// The new registration evicts the old one (viewers are told to stop).
    #[default]
    Replace,
    /// The new registration is refused and the old one keeps running.
    Reject,
}
