//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `DIALBACK_SECRET`, `DIALBACK_LISTEN`,
//!    `DIALBACK_URL`
//! 2. **Config file**: path via `--config <path>`, or `dialback.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8080"
//!
//! [proxy]
//! secret = "shared-secret"          # required in serve mode
//! placement = "header"              # or "path"
//! header_name = "X-Client-Proxy"
//! path_prefix = ""                  # path placement: "<path_prefix>/<secret>"
//! transport = "h2"                  # or "yamux"; both ends must agree
//! target_scheme = "https"
//! shutdown_timeout_secs = 60
//!
//! # Dial mode only
//! [dial]
//! url = "https://public.example.com/"
//! upstream = "http://127.0.0.1:3000"
//! max_concurrent_requests = 64
//! reconnect_delay_secs = 5
//! reconnect_max_delay_secs = 60
//!
//! [yamux]
//! accept_backlog = 256
//! keepalive_interval_secs = 300
//! connection_write_timeout_secs = 10
//! max_stream_window_size = 262144
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;
use std::time::Duration;

use axum::http::HeaderName;
use serde::Deserialize;

use crate::error::ConfigError;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub dial: DialConfig,
    #[serde(default)]
    pub yamux: YamuxConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Public endpoint listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8080`).
    #[serde(default = "default_listen")]
    pub listen: String,
}

/// Where the handshake discriminator travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Placement {
    /// Secret is the value of `header_name`.
    #[default]
    Header,
    /// Secret is the final path segment: `<path_prefix>/<secret>`.
    /// Leaks the secret into intermediary access logs.
    Path,
}

/// Multiplexing strategy run over the hijacked connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MuxKind {
    /// HTTP/2 with roles swapped: the public endpoint is the h2 client.
    #[default]
    H2,
    /// yamux streams, one HTTP/1.1 exchange per stream.
    Yamux,
}

impl MuxKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::H2 => "h2",
            Self::Yamux => "yamux",
        }
    }
}

/// Tunnel endpoint settings (serve mode).
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Shared secret that identifies a tunnel handshake. Required.
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub placement: Placement,
    /// Header carrying the secret with `Placement::Header` (default `X-Client-Proxy`).
    #[serde(default = "default_header_name")]
    pub header_name: String,
    /// Path prefix for `Placement::Path`, without trailing slash (default empty).
    #[serde(default)]
    pub path_prefix: String,
    #[serde(default)]
    pub transport: MuxKind,
    /// Scheme written into forwarded request URIs (default `https`).
    #[serde(default = "default_target_scheme")]
    pub target_scheme: String,
    /// Upper bound for draining a superseded tunnel (default 60).
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

/// Dialer settings (dial mode).
#[derive(Debug, Clone, Deserialize)]
pub struct DialConfig {
    /// Public endpoint URL, including the handshake path for path placement.
    pub url: Option<String>,
    /// Local HTTP service that answers tunneled requests. When unset, a
    /// built-in greeting handler answers instead.
    pub upstream: Option<String>,
    /// Send the secret in this header instead of the URL path.
    pub header_name: Option<String>,
    /// Secret for header placement. Falls back to `[proxy] secret`.
    pub secret: Option<String>,
    #[serde(default)]
    pub transport: MuxKind,
    /// Concurrency limit for locally handled requests (default 64).
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    /// Seconds between reconnect attempts (default 5).
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// Max seconds between reconnect attempts (default 60).
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_secs: u64,
}

/// yamux session tuning, shared by both ends.
#[derive(Debug, Clone, Deserialize)]
pub struct YamuxConfig {
    #[serde(default = "default_accept_backlog")]
    pub accept_backlog: u32,
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_connection_write_timeout")]
    pub connection_write_timeout_secs: u64,
    #[serde(default = "default_max_stream_window_size")]
    pub max_stream_window_size: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_header_name() -> String {
    "X-Client-Proxy".to_string()
}
fn default_target_scheme() -> String {
    "https".to_string()
}
fn default_shutdown_timeout() -> u64 {
    60
}
fn default_max_concurrent_requests() -> usize {
    64
}
fn default_reconnect_delay() -> u64 {
    5
}
fn default_reconnect_max_delay() -> u64 {
    60
}
fn default_accept_backlog() -> u32 {
    256
}
fn default_keepalive_interval() -> u64 {
    300
}
fn default_connection_write_timeout() -> u64 {
    10
}
fn default_max_stream_window_size() -> u32 {
    256 * 1024
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            placement: Placement::default(),
            header_name: default_header_name(),
            path_prefix: String::new(),
            transport: MuxKind::default(),
            target_scheme: default_target_scheme(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl Default for DialConfig {
    fn default() -> Self {
        Self {
            url: None,
            upstream: None,
            header_name: None,
            secret: None,
            transport: MuxKind::default(),
            max_concurrent_requests: default_max_concurrent_requests(),
            reconnect_delay_secs: default_reconnect_delay(),
            reconnect_max_delay_secs: default_reconnect_max_delay(),
        }
    }
}

impl Default for YamuxConfig {
    fn default() -> Self {
        Self {
            accept_backlog: default_accept_backlog(),
            keepalive_interval_secs: default_keepalive_interval(),
            connection_write_timeout_secs: default_connection_write_timeout(),
            max_stream_window_size: default_max_stream_window_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ProxyConfig {
    /// Config for `secret` with every other field at its default.
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            ..Self::default()
        }
    }

    /// Reject configurations the tunnel endpoint cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.secret.is_empty() {
            return Err(ConfigError::MissingSecret);
        }
        if self.placement == Placement::Header
            && HeaderName::from_bytes(self.header_name.as_bytes()).is_err()
        {
            return Err(ConfigError::InvalidHeaderName(self.header_name.clone()));
        }
        if !matches!(self.target_scheme.as_str(), "http" | "https") {
            return Err(ConfigError::InvalidScheme(self.target_scheme.clone()));
        }
        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// The exact request path that marks a handshake under `Placement::Path`.
    pub fn handshake_path(&self) -> String {
        format!("{}/{}", self.path_prefix.trim_end_matches('/'), self.secret)
    }
}

impl YamuxConfig {
    /// Session config for `tokio_yamux`.
    #[allow(clippy::useless_conversion)]
    pub fn session_config(&self) -> tokio_yamux::Config {
        tokio_yamux::Config {
            accept_backlog: self.accept_backlog.try_into().unwrap_or(256),
            enable_keepalive: true,
            keepalive_interval: Duration::from_secs(self.keepalive_interval_secs),
            connection_write_timeout: Duration::from_secs(self.connection_write_timeout_secs),
            max_stream_window_size: self.max_stream_window_size,
            ..tokio_yamux::Config::default()
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `dialback.toml` in
    /// the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = if let Some(p) = path {
            Self::from_file(p)?
        } else if Path::new("dialback.toml").exists() {
            Self::from_file("dialback.toml")?
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(secret) = std::env::var("DIALBACK_SECRET") {
            config.proxy.secret = secret;
        }
        if let Ok(listen) = std::env::var("DIALBACK_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(url) = std::env::var("DIALBACK_URL") {
            config.dial.url = Some(url);
        }

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(path, &content)
    }

    fn parse(path: &str, content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }
}
