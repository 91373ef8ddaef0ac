//! Error types for configuration, tunnel lifecycle, forwarding and dialing.

use std::time::Duration;

use thiserror::Error;

/// Setup-time configuration failures. Fatal: the proxy layer is never built.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("no secret configured (set [proxy] secret or DIALBACK_SECRET)")]
    MissingSecret,

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("secret cannot be sent as a header value (control characters?)")]
    InvalidSecret,

    #[error("invalid header name {0:?}")]
    InvalidHeaderName(String),

    #[error("invalid target scheme {0:?}")]
    InvalidScheme(String),

    #[error("no dial url configured (set [dial] url or DIALBACK_URL)")]
    MissingDialUrl,

    #[error("invalid upstream {0:?}: must be an http:// URL with a host")]
    InvalidUpstream(String),
}

/// Failures while establishing or tearing down a tunnel session.
#[derive(Error, Debug)]
pub enum TunnelError {
    /// The handshake arrived on a connection that cannot be taken over.
    #[error("tunnel handshake must use HTTP/1.1 with an Upgrade header")]
    ProtocolUnsupported,

    #[error("connection hijack failed: {0}")]
    Hijack(#[source] hyper::Error),

    #[error("failed to initialise multiplexed transport: {0}")]
    TransportInit(String),

    /// Graceful shutdown did not finish in time; the session was force-closed.
    #[error("drain did not complete within {0:?}, transport force-closed")]
    DrainTimeout(Duration),
}

/// Per-request failures on the active tunnel.
#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("tunnel session is closed")]
    SessionClosed,

    #[error("tunnel session is draining")]
    Draining,

    #[error("failed to open tunnel stream: {0}")]
    OpenStream(String),

    #[error("invalid forwarded request: {0}")]
    InvalidRequest(String),

    #[error("upstream request failed: {0}")]
    Upstream(#[from] hyper::Error),
}

/// Dialer-side failures.
#[derive(Error, Debug)]
pub enum DialError {
    #[error("invalid dial url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),

    #[error("TLS handshake failed: {0}")]
    Tls(#[source] std::io::Error),

    #[error("handshake request failed: {0}")]
    Handshake(#[source] hyper::Error),

    #[error("handshake rejected by endpoint: {0}")]
    Rejected(String),

    #[error("tunnel I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("responder failed: {0}")]
    Serve(String),
}
