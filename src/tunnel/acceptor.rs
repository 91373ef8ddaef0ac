//! Turning a handshake request into a published tunnel session.
//!
//! The request handler validates the handshake and answers `101 Switching
//! Protocols`; the connection is only released once that response is out, so
//! everything after the hijack runs on a dedicated session-owner task
//! ([`PendingTunnel::spawn`]). That task is the sole owner of the session's
//! teardown: it lives until the session is superseded or its transport dies,
//! then drains it to Closed.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::header::{CONNECTION, UPGRADE};
use axum::http::uri::Scheme;
use axum::http::{HeaderValue, Request, Response, StatusCode, Version};
use hyper::upgrade::{OnUpgrade, Upgraded};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::{debug, info, info_span, warn, Instrument};

use super::mux::{BoxedIo, Transport};
use super::registry::ActiveTunnel;
use super::replay::ReplayConn;
use super::session::TunnelSession;
use crate::config::{MuxKind, ProxyConfig, YamuxConfig};
use crate::error::TunnelError;
use crate::state::{TunnelEventType, TunnelStats};

/// Token sent in the `Upgrade` header of a tunnel handshake.
pub const UPGRADE_PROTOCOL: &str = "dialback";

/// Accepts tunnel handshakes and owns the resulting sessions.
#[derive(Clone)]
pub struct Acceptor {
    registry: ActiveTunnel,
    stats: Arc<TunnelStats>,
    kind: MuxKind,
    yamux: YamuxConfig,
    scheme: Scheme,
    shutdown_timeout: Duration,
}

impl Acceptor {
    /// `config` must already be validated.
    pub fn new(
        config: &ProxyConfig,
        yamux: YamuxConfig,
        registry: ActiveTunnel,
        stats: Arc<TunnelStats>,
    ) -> Self {
        let scheme = if config.target_scheme == "http" {
            Scheme::HTTP
        } else {
            Scheme::HTTPS
        };
        Self {
            registry,
            stats,
            kind: config.transport,
            yamux,
            scheme,
            shutdown_timeout: config.shutdown_timeout(),
        }
    }

    /// Claim the connection behind a handshake request.
    ///
    /// Fails with [`TunnelError::ProtocolUnsupported`] when the connection
    /// cannot be taken over (HTTP/2, HTTP/1.0, or no `Upgrade` header); the
    /// connection is left untouched in that case.
    pub fn accept<B>(&self, request: &mut Request<B>) -> Result<PendingTunnel, TunnelError> {
        if request.version() != Version::HTTP_11
            || !request.headers().contains_key(UPGRADE)
            || request.extensions().get::<OnUpgrade>().is_none()
        {
            return Err(TunnelError::ProtocolUnsupported);
        }
        Ok(PendingTunnel {
            on_upgrade: hyper::upgrade::on(request),
            acceptor: self.clone(),
        })
    }

    /// Publish `session` and own it until it is Closed.
    ///
    /// Returns once the session has been superseded (or its transport failed)
    /// and drained. A drain that hit the timeout is reported as
    /// [`TunnelError::DrainTimeout`]; the session is Closed regardless.
    pub async fn own(&self, session: Arc<TunnelSession>) -> Result<(), TunnelError> {
        let id = session.id();
        TunnelStats::incr(&self.stats.sessions_accepted);
        let superseded = self.registry.publish(session.clone());
        info!(session = %id, transport = self.kind.as_str(), "Tunnel session active");
        self.stats
            .push_event(TunnelEventType::Published, id.to_string())
            .await;

        tokio::select! {
            biased;
            () = superseded.cancelled() => {
                info!(session = %id, "Tunnel session superseded, draining");
                TunnelStats::incr(&self.stats.supersessions);
                self.stats
                    .push_event(TunnelEventType::Superseded, id.to_string())
                    .await;
            }
            () = session.transport().closed() => {
                warn!(session = %id, "Tunnel connection lost, draining");
                self.registry.evict(id);
                TunnelStats::incr(&self.stats.transport_failures);
                self.stats
                    .push_event(TunnelEventType::TransportFailed, id.to_string())
                    .await;
            }
        }

        let result = session.drain(self.shutdown_timeout).await;
        match &result {
            Ok(()) => {
                info!(session = %id, "Tunnel session closed");
                self.stats
                    .push_event(TunnelEventType::Drained, id.to_string())
                    .await;
            }
            Err(e) => {
                warn!(session = %id, "Tunnel session force-closed: {e}");
                TunnelStats::incr(&self.stats.drain_timeouts);
                self.stats
                    .push_event(TunnelEventType::DrainTimeout, id.to_string())
                    .await;
            }
        }
        result
    }

    /// Build the transport over an already hijacked connection and own the
    /// session it backs. The connection is closed if construction fails.
    pub async fn establish<I: super::mux::Io>(&self, io: I) -> Result<(), TunnelError> {
        let transport = Transport::connect(self.kind, io, &self.yamux).await?;
        let session = Arc::new(TunnelSession::new(transport, self.scheme.clone()));
        self.own(session).await
    }
}

/// A validated handshake whose connection is released once the 101 is sent.
pub struct PendingTunnel {
    on_upgrade: OnUpgrade,
    acceptor: Acceptor,
}

impl PendingTunnel {
    /// Wait for the hijack, then run the session to completion.
    pub async fn run(self) -> Result<(), TunnelError> {
        let upgraded = self.on_upgrade.await.map_err(TunnelError::Hijack)?;
        self.acceptor.establish(hijack(upgraded)).await
    }

    /// Run on a session-owner task; failures are logged, never propagated
    /// to the listener.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        let stats = self.acceptor.stats.clone();
        tokio::spawn(
            async move {
                match self.run().await {
                    Ok(()) | Err(TunnelError::DrainTimeout(_)) => {}
                    Err(e) => {
                        warn!("Tunnel handshake failed: {e}");
                        stats
                            .push_event(TunnelEventType::HandshakeFailed, e.to_string())
                            .await;
                    }
                }
            }
            .instrument(info_span!("tunnel_session")),
        )
    }
}

/// The response that hands the connection over.
pub fn switching_protocols() -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("upgrade"));
    response
        .headers_mut()
        .insert(UPGRADE, HeaderValue::from_static(UPGRADE_PROTOCOL));
    response
}

/// Take the raw socket out of `upgraded` when the host served a plain TCP
/// connection, replaying whatever its parser had already buffered. Other
/// hosts (TLS, protocol sniffing) keep hyper's own wrapper, which replays
/// the same bytes internally.
fn hijack(upgraded: Upgraded) -> BoxedIo {
    match upgraded.downcast::<TokioIo<TcpStream>>() {
        Ok(parts) => {
            let stream = parts.io.into_inner();
            if parts.read_buf.is_empty() {
                Box::new(stream)
            } else {
                debug!(
                    bytes = parts.read_buf.len(),
                    "Replaying bytes buffered before hijack"
                );
                Box::new(ReplayConn::new(stream, parts.read_buf))
            }
        }
        Err(upgraded) => Box::new(TokioIo::new(upgraded)),
    }
}
