//! The dialing side: connect out, hand the connection over, answer requests.
//!
//! Phase 1 is an ordinary HTTP/1.1 upgrade request, sent with hyper's client
//! so the endpoint's `101` is parsed like any other response. Phase 2 reuses
//! the same socket with roles swapped: the endpoint opens streams, this side
//! answers them with the supplied [`Router`].
//!
//! There is no retry in here; callers decide whether and when to dial again.

use std::sync::Arc;

use axum::http::header::{CONNECTION, HOST, UPGRADE};
use axum::http::{HeaderName, HeaderValue, Method, Request, StatusCode, Uri};
use axum::Router;
use bytes::Bytes;
use http_body_util::Empty;
use hyper::client::conn::http1 as client_http1;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::acceptor::UPGRADE_PROTOCOL;
use super::mux::{serve_responder, BoxedIo};
use super::replay::ReplayConn;
use crate::config::{MuxKind, YamuxConfig};
use crate::error::{ConfigError, DialError};

/// How to reach and talk to the endpoint.
#[derive(Debug, Clone, Default)]
pub struct DialOptions {
    /// Must match the endpoint's `transport`.
    pub transport: MuxKind,
    /// Discriminator header sent with the handshake, for header placement.
    pub secret_header: Option<(HeaderName, HeaderValue)>,
    pub yamux: YamuxConfig,
}

impl DialOptions {
    pub fn new(transport: MuxKind) -> Self {
        Self {
            transport,
            ..Self::default()
        }
    }

    /// Send `secret` in header `name` with the handshake.
    pub fn with_secret_header(mut self, name: &str, secret: &str) -> Result<Self, ConfigError> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| ConfigError::InvalidHeaderName(name.to_string()))?;
        let value = HeaderValue::from_str(secret).map_err(|_| ConfigError::InvalidSecret)?;
        self.secret_header = Some((name, value));
        Ok(self)
    }

    pub fn with_yamux(mut self, yamux: YamuxConfig) -> Self {
        self.yamux = yamux;
        self
    }
}

/// Where to dial, split out of the endpoint URL.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DialTarget {
    tls: bool,
    host: String,
    port: u16,
    authority: String,
    request_uri: String,
}

impl DialTarget {
    fn parse(url: &str) -> Result<Self, DialError> {
        let invalid = |reason: &str| DialError::InvalidUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        };
        let uri: Uri = url.parse().map_err(|_| invalid("not a valid URI"))?;
        let tls = match uri.scheme_str() {
            Some("https") => true,
            Some("http") => false,
            _ => return Err(invalid("scheme must be http or https")),
        };
        let authority = uri.authority().ok_or_else(|| invalid("missing host"))?;
        let host = authority
            .host()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port = authority.port_u16().unwrap_or(if tls { 443 } else { 80 });
        let request_uri = uri
            .path_and_query()
            .map_or_else(|| "/".to_string(), |pq| pq.as_str().to_string());
        Ok(Self {
            tls,
            host,
            port,
            authority: authority.as_str().to_string(),
            request_uri,
        })
    }
}

/// Dial `url`, perform the handshake, then serve `handler` over the tunnel.
///
/// Returns when the tunnel closes from either side, or after `cancel` fires
/// and in-flight handlers finished (bounded).
pub async fn dial_and_serve(
    url: &str,
    handler: Router,
    options: &DialOptions,
    cancel: CancellationToken,
) -> Result<(), DialError> {
    let target = DialTarget::parse(url)?;
    let io = tokio::select! {
        biased;
        () = cancel.cancelled() => return Ok(()),
        io = establish(&target, options) => io?,
    };
    info!(
        endpoint = %target.authority,
        transport = options.transport.as_str(),
        "Tunnel established, serving requests"
    );
    serve_responder(options.transport, io, handler, &options.yamux, cancel).await
}

/// Connect and run phase 1. Returns the connection positioned right after
/// the `101` response head.
async fn establish(target: &DialTarget, options: &DialOptions) -> Result<BoxedIo, DialError> {
    let tcp = TcpStream::connect((target.host.as_str(), target.port))
        .await
        .map_err(DialError::Connect)?;
    tcp.set_nodelay(true)?;

    let io: BoxedIo = if target.tls {
        let server_name = ServerName::try_from(target.host.clone()).map_err(|e| {
            DialError::InvalidUrl {
                url: target.authority.clone(),
                reason: e.to_string(),
            }
        })?;
        let stream = tls_connector()?
            .connect(server_name, tcp)
            .await
            .map_err(DialError::Tls)?;
        debug!(host = %target.host, "TLS handshake complete");
        Box::new(stream)
    } else {
        Box::new(tcp)
    };

    handshake(io, target, options).await
}

fn tls_connector() -> Result<TlsConnector, DialError> {
    let roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let mut config =
        ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| DialError::Tls(std::io::Error::other(e)))?
            .with_root_certificates(roots)
            .with_no_client_auth();
    // Hijack only works on an HTTP/1.1 connection.
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(TlsConnector::from(Arc::new(config)))
}

async fn handshake(
    io: BoxedIo,
    target: &DialTarget,
    options: &DialOptions,
) -> Result<BoxedIo, DialError> {
    let mut request = Request::builder()
        .method(Method::GET)
        .uri(target.request_uri.as_str())
        .header(HOST, target.authority.as_str())
        .header(CONNECTION, "upgrade")
        .header(UPGRADE, UPGRADE_PROTOCOL);
    if let Some((name, value)) = &options.secret_header {
        request = request.header(name, value);
    }
    let request = request
        .body(Empty::<Bytes>::new())
        .map_err(|e| DialError::InvalidUrl {
            url: target.request_uri.clone(),
            reason: e.to_string(),
        })?;

    let (mut sender, conn) = client_http1::handshake(TokioIo::new(io))
        .await
        .map_err(DialError::Handshake)?;
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!("handshake connection ended: {e}");
        }
    });

    let mut response = sender
        .send_request(request)
        .await
        .map_err(DialError::Handshake)?;
    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Err(DialError::Rejected(response.status().to_string()));
    }
    let upgraded = hyper::upgrade::on(&mut response)
        .await
        .map_err(DialError::Handshake)?;

    Ok(match upgraded.downcast::<TokioIo<BoxedIo>>() {
        Ok(parts) if parts.read_buf.is_empty() => parts.io.into_inner(),
        Ok(parts) => {
            debug!(
                bytes = parts.read_buf.len(),
                "Replaying bytes read past the handshake response"
            );
            Box::new(ReplayConn::new(parts.io.into_inner(), parts.read_buf))
        }
        Err(upgraded) => Box::new(TokioIo::new(upgraded)),
    })
}
