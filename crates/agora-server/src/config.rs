//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use agora_shared::constants::{
    APP_NAME, DEFAULT_FLUSH_INTERVAL_MS, DEFAULT_GRACE_PERIOD_MS, DEFAULT_HISTORY_PAGE_SIZE,
    DEFAULT_HTTP_PORT,
};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite file holding the store document.
    /// Env: `DATA_PATH`
    /// Default: `None`, meaning the platform data directory.
    pub data_path: Option<PathBuf>,

    /// Human-readable name for this instance.
    /// Env: `INSTANCE_NAME`
    /// Default: `"Agora"`
    pub instance_name: String,

    /// Delay between a user's last connection dropping and the leave notice.
    /// Env: `GRACE_PERIOD_MS`
    pub grace_period: Duration,

    /// Write-behind coalescing window.
    /// Env: `FLUSH_INTERVAL_MS`
    pub flush_interval: Duration,

    /// Messages in the initial history page and in each history request.
    /// Env: `HISTORY_PAGE_SIZE`
    pub history_page_size: usize,

    /// Admin API bearer token. Required to access /admin/* endpoints.
    /// Env: `ADMIN_TOKEN`
    /// Default: empty (admin API disabled).
    pub admin_token: Option<String>,

    /// Lifetime of issued session tokens.
    /// Env: `SESSION_TTL_SECS`
    /// Default: 7 days.
    pub session_ttl: Duration,

    /// Per-user chat message budget.
    /// Env: `MESSAGES_PER_MINUTE`
    /// Default: `30`
    pub messages_per_minute: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            data_path: None,
            instance_name: APP_NAME.to_string(),
            grace_period: Duration::from_millis(DEFAULT_GRACE_PERIOD_MS),
            flush_interval: Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS),
            history_page_size: DEFAULT_HISTORY_PAGE_SIZE,
            admin_token: None,
            session_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            messages_per_minute: 30,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ServerConfig::from_env`] with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = parse_var(&lookup, "HTTP_ADDR") {
            config.http_addr = addr;
        }

        if let Some(path) = lookup("DATA_PATH").filter(|p| !p.is_empty()) {
            config.data_path = Some(PathBuf::from(path));
        }

        if let Some(name) = lookup("INSTANCE_NAME").filter(|n| !n.is_empty()) {
            config.instance_name = name;
        }

        if let Some(ms) = parse_var::<u64>(&lookup, "GRACE_PERIOD_MS") {
            config.grace_period = Duration::from_millis(ms);
        }

        if let Some(ms) = parse_var::<u64>(&lookup, "FLUSH_INTERVAL_MS") {
            config.flush_interval = Duration::from_millis(ms);
        }

        match parse_var::<usize>(&lookup, "HISTORY_PAGE_SIZE") {
            Some(0) => tracing::warn!("HISTORY_PAGE_SIZE must be positive, using default"),
            Some(n) => config.history_page_size = n,
            None => {}
        }

        if let Some(token) = lookup("ADMIN_TOKEN") {
            if !token.is_empty() {
                config.admin_token = Some(token);
            }
        }

        if let Some(secs) = parse_var::<u64>(&lookup, "SESSION_TTL_SECS") {
            config.session_ttl = Duration::from_secs(secs);
        }

        match parse_var::<u32>(&lookup, "MESSAGES_PER_MINUTE") {
            Some(0) => tracing::warn!("MESSAGES_PER_MINUTE must be positive, using default"),
            Some(n) => config.messages_per_minute = n,
            None => {}
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

/// Parse an optional variable, warning and returning `None` when malformed.
fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid value, using default");
            None
        }
    }
}
