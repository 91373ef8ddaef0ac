//! The client-proxy middleware: tunnel handshakes in, forwarded requests out.
//!
//! Install it in front of any axum fallback with
//! `axum::middleware::from_fn_with_state(proxy, client_proxy)`. Per request:
//!
//! 1. Handshake (secret matches): take the connection over and answer 101.
//! 2. Tunnel active: forward over it, 502 JSON when that fails.
//! 3. Otherwise: hand the request to the next handler untouched.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::header::UPGRADE;
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::auth::{fingerprint, Discriminator};
use crate::config::{ProxyConfig, YamuxConfig};
use crate::error::{ConfigError, TunnelError};
use crate::state::TunnelStats;
use crate::tunnel::acceptor::{switching_protocols, Acceptor, UPGRADE_PROTOCOL};
use crate::tunnel::session::{Forwarder, SessionState};
use crate::tunnel::ActiveTunnel;

/// Shared state of the tunnel endpoint. Cheap to clone.
#[derive(Clone)]
pub struct ClientProxy {
    inner: Arc<ProxyInner>,
}

struct ProxyInner {
    discriminator: Discriminator,
    acceptor: Acceptor,
    registry: ActiveTunnel,
    stats: Arc<TunnelStats>,
    config: ProxyConfig,
    fingerprint: String,
}

impl ClientProxy {
    /// Validate `config` and build the endpoint with an empty tunnel slot.
    pub fn new(config: ProxyConfig, yamux: YamuxConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let registry = ActiveTunnel::new();
        let stats = Arc::new(TunnelStats::new());
        let acceptor = Acceptor::new(&config, yamux, registry.clone(), stats.clone());
        Ok(Self {
            inner: Arc::new(ProxyInner {
                discriminator: Discriminator::new(&config),
                acceptor,
                registry,
                stats,
                fingerprint: fingerprint(&config.secret),
                config,
            }),
        })
    }

    pub fn registry(&self) -> &ActiveTunnel {
        &self.inner.registry
    }

    pub fn stats(&self) -> &Arc<TunnelStats> {
        &self.inner.stats
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.inner.config
    }

    /// Log-safe fingerprint of the configured secret.
    pub fn fingerprint(&self) -> &str {
        &self.inner.fingerprint
    }

    /// Empty the slot and wait for the session it held to reach Closed.
    ///
    /// The session's owner task runs the actual drain; this only waits for it,
    /// bounded by the shutdown timeout plus a second of slack.
    pub async fn shutdown(&self) {
        let Some(session) = self.inner.registry.clear() else {
            return;
        };
        info!(session = %session.id(), "Draining active tunnel for shutdown");
        let mut state = session.watch_state();
        let bound = self.inner.config.shutdown_timeout() + Duration::from_secs(1);
        let closed = tokio::time::timeout(bound, state.wait_for(|s| *s == SessionState::Closed));
        if closed.await.is_err() {
            warn!(session = %session.id(), "Tunnel still open after {bound:?}");
        }
    }

    fn handshake(&self, request: &mut Request) -> Response {
        match self.inner.acceptor.accept(request) {
            Ok(pending) => {
                info!(
                    secret = %self.inner.fingerprint,
                    "Tunnel handshake accepted, switching protocols"
                );
                pending.spawn();
                switching_protocols()
            }
            Err(e) => {
                TunnelStats::incr(&self.inner.stats.handshake_rejections);
                warn!(version = ?request.version(), "Tunnel handshake rejected: {e}");
                protocol_unsupported(&e)
            }
        }
    }

    async fn forward(&self, forwarder: Forwarder, request: Request) -> Response {
        let session = forwarder.session_id();
        match forwarder.forward(request).await {
            Ok(response) => {
                TunnelStats::incr(&self.inner.stats.forwarded);
                response
            }
            Err(e) => {
                TunnelStats::incr(&self.inner.stats.forward_errors);
                warn!(session = %session, "Tunnel forward failed: {e}");
                (
                    StatusCode::BAD_GATEWAY,
                    Json(json!({"error": e.to_string(), "code": "TUNNEL_FORWARD_FAILED"})),
                )
                    .into_response()
            }
        }
    }

    /// Counters and recent events for the health route.
    pub async fn status(&self) -> Value {
        let stats = &self.inner.stats;
        let session = self.inner.registry.current_session();
        let now = std::time::Instant::now();
        let recent_events: Vec<Value> = stats
            .recent_events(10)
            .await
            .iter()
            .map(|e| {
                json!({
                    "ago_secs": now.duration_since(e.timestamp).as_secs(),
                    "event": e.event_type.as_str(),
                    "detail": e.detail,
                })
            })
            .collect();

        json!({
            "active": session.as_ref().map(|s| json!({
                "id": s.id().to_string(),
                "state": s.state().as_str(),
                "inflight": s.transport().inflight(),
            })),
            "transport": self.inner.config.transport.as_str(),
            "secret_fingerprint": self.inner.fingerprint,
            "sessions_accepted": stats.sessions_accepted.load(Ordering::Relaxed),
            "supersessions": stats.supersessions.load(Ordering::Relaxed),
            "transport_failures": stats.transport_failures.load(Ordering::Relaxed),
            "drain_timeouts": stats.drain_timeouts.load(Ordering::Relaxed),
            "handshake_rejections": stats.handshake_rejections.load(Ordering::Relaxed),
            "forwarded": stats.forwarded.load(Ordering::Relaxed),
            "forward_errors": stats.forward_errors.load(Ordering::Relaxed),
            "fallback": stats.fallback.load(Ordering::Relaxed),
            "recent_events": recent_events,
        })
    }
}

fn protocol_unsupported(e: &TunnelError) -> Response {
    let mut response = (
        StatusCode::UPGRADE_REQUIRED,
        Json(json!({"error": e.to_string(), "code": "TUNNEL_PROTOCOL_UNSUPPORTED"})),
    )
        .into_response();
    response
        .headers_mut()
        .insert(UPGRADE, HeaderValue::from_static(UPGRADE_PROTOCOL));
    response
}

/// Middleware entry point.
pub async fn client_proxy(
    State(proxy): State<ClientProxy>,
    mut request: Request,
    next: Next,
) -> Response {
    if proxy.inner.discriminator.matches(&request) {
        return proxy.handshake(&mut request);
    }
    // One snapshot per request; a handover mid-request does not affect it.
    match proxy.inner.registry.current() {
        Some(forwarder) => proxy.forward(forwarder, request).await,
        None => {
            TunnelStats::incr(&proxy.inner.stats.fallback);
            next.run(request).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MuxKind;
    use crate::tunnel::{Transport, TunnelSession};
    use axum::body::Body;
    use axum::http::uri::Scheme;
    use axum::http::Request;
    use axum::routing::get;
    use axum::Router;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn app(proxy: ClientProxy) -> Router {
        Router::new()
            .route("/ping", get(|| async { "fallback pong" }))
            .layer(axum::middleware::from_fn_with_state(proxy, client_proxy))
    }

    #[test]
    fn empty_secret_never_builds() {
        let result = ClientProxy::new(ProxyConfig::default(), YamuxConfig::default());
        assert!(matches!(result, Err(ConfigError::MissingSecret)));
    }

    #[tokio::test]
    async fn no_tunnel_passes_through_to_fallback() {
        let proxy = ClientProxy::new(ProxyConfig::with_secret("s1"), YamuxConfig::default())
            .unwrap();
        let response = app(proxy.clone())
            .oneshot(Request::builder().uri("/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"fallback pong");
        assert_eq!(proxy.stats().fallback.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn wrong_secret_is_ordinary_traffic() {
        let proxy = ClientProxy::new(ProxyConfig::with_secret("s1"), YamuxConfig::default())
            .unwrap();
        let response = app(proxy)
            .oneshot(
                Request::builder()
                    .uri("/ping")
                    .header("X-Client-Proxy", "s1x")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unhijackable_handshake_gets_426() {
        let proxy = ClientProxy::new(ProxyConfig::with_secret("s1"), YamuxConfig::default())
            .unwrap();
        // oneshot never attaches an upgrade handle, like an HTTP/2 host would.
        let response = app(proxy.clone())
            .oneshot(
                Request::builder()
                    .uri("/ping")
                    .header("X-Client-Proxy", "s1")
                    .header("upgrade", UPGRADE_PROTOCOL)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UPGRADE_REQUIRED);
        let body: Value =
            serde_json::from_slice(&response.into_body().collect().await.unwrap().to_bytes())
                .unwrap();
        assert_eq!(body["code"], "TUNNEL_PROTOCOL_UNSUPPORTED");
        assert_eq!(proxy.stats().handshake_rejections.load(Ordering::Relaxed), 1);
        assert!(proxy.registry().current().is_none());
    }

    #[tokio::test]
    async fn dead_tunnel_yields_502() {
        let proxy = ClientProxy::new(ProxyConfig::with_secret("s1"), YamuxConfig::default())
            .unwrap();
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let transport = Transport::connect(MuxKind::Yamux, local, &YamuxConfig::default())
            .await
            .unwrap();
        drop(remote);
        tokio::time::timeout(Duration::from_secs(5), transport.closed())
            .await
            .unwrap();
        // No owner task here, so nothing evicts the session.
        let session = Arc::new(TunnelSession::new(transport, Scheme::HTTPS));
        proxy.registry().publish(session);

        let response = app(proxy.clone())
            .oneshot(
                Request::builder()
                    .uri("/ping")
                    .header("host", "public.example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body: Value =
            serde_json::from_slice(&response.into_body().collect().await.unwrap().to_bytes())
                .unwrap();
        assert_eq!(body["code"], "TUNNEL_FORWARD_FAILED");
        assert_eq!(proxy.stats().forward_errors.load(Ordering::Relaxed), 1);
        assert_eq!(proxy.stats().fallback.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn shutdown_without_tunnel_returns_immediately() {
        let proxy = ClientProxy::new(ProxyConfig::with_secret("s1"), YamuxConfig::default())
            .unwrap();
        tokio::time::timeout(Duration::from_millis(100), proxy.shutdown())
            .await
            .unwrap();
        let status = proxy.status().await;
        assert!(status["active"].is_null());
        assert_eq!(status["transport"], "h2");
    }
}
