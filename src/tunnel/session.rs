//! Tunnel sessions and their forwarders.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::request::Parts;
use axum::http::uri::{Authority, PathAndQuery, Scheme};
use axum::http::{Request, Response, StatusCode, Uri, Version};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::mux::Transport;
use crate::config::MuxKind;
use crate::error::{ForwardError, TunnelError};

/// Lifecycle of a [`TunnelSession`]. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Handshaking,
    Active,
    Draining,
    Closed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Handshaking => "handshaking",
            Self::Active => "active",
            Self::Draining => "draining",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One established tunnel: the multiplexed transport plus its lifecycle.
///
/// The session owns the transport; forwarders only hold a weak reference.
pub struct TunnelSession {
    id: Uuid,
    transport: Arc<Transport>,
    target_scheme: Scheme,
    superseded: CancellationToken,
    drain_started: AtomicBool,
    state: watch::Sender<SessionState>,
}

impl TunnelSession {
    /// Wrap a freshly built transport. The session starts out Active.
    pub fn new(transport: Transport, target_scheme: Scheme) -> Self {
        Self {
            id: Uuid::new_v4(),
            transport: Arc::new(transport),
            target_scheme,
            superseded: CancellationToken::new(),
            drain_started: AtomicBool::new(false),
            state: watch::channel(SessionState::Active).0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn forwarder(&self) -> Forwarder {
        Forwarder {
            session_id: self.id,
            transport: Arc::downgrade(&self.transport),
            scheme: self.target_scheme.clone(),
        }
    }

    /// Tell the session it has been replaced. Safe to call any number of times.
    pub fn supersede(&self) {
        self.superseded.cancel();
    }

    pub fn is_superseded(&self) -> bool {
        self.superseded.is_cancelled()
    }

    pub(crate) fn superseded_signal(&self) -> CancellationToken {
        self.superseded.clone()
    }

    /// Drain the session: graceful transport shutdown bounded by `timeout`,
    /// then Closed. Only the first call does any work.
    pub async fn drain(&self, timeout: Duration) -> Result<(), TunnelError> {
        if self.drain_started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.advance(SessionState::Draining);
        let result = self.transport.shutdown(timeout).await;
        self.advance(SessionState::Closed);
        result
    }

    fn advance(&self, next: SessionState) {
        self.state.send_if_modified(|state| {
            if next > *state {
                *state = next;
                true
            } else {
                false
            }
        });
    }
}

impl fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("transport", &self.transport.kind())
            .finish_non_exhaustive()
    }
}

/// HTTP request transport bound to one session's tunnel.
#[derive(Clone, Debug)]
pub struct Forwarder {
    session_id: Uuid,
    transport: Weak<Transport>,
    scheme: Scheme,
}

impl Forwarder {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Rewrite `request` for the tunnel and send it across.
    ///
    /// Over yamux a protocol switch (WebSocket and the like) passes through:
    /// on a `101` the client connection and the tunnel stream are spliced
    /// together, and the splice counts as in flight until either side closes.
    /// h2 streams cannot switch protocols, so there the upgrade is dropped.
    pub async fn forward(
        &self,
        mut request: Request<Body>,
    ) -> Result<Response<Body>, ForwardError> {
        let transport = self.transport.upgrade().ok_or(ForwardError::SessionClosed)?;
        let switch = match transport.kind() {
            MuxKind::Yamux => upgrade_protocol(request.headers()).and_then(|protocol| {
                let client = request.extensions_mut().remove::<OnUpgrade>()?;
                Some((protocol, client))
            }),
            MuxKind::H2 => None,
        };

        let mut request = rewrite_request(request, transport.kind(), &self.scheme)?;
        let Some((protocol, client)) = switch else {
            let mut response = transport.send(request).await?;
            strip_hop_by_hop(response.headers_mut());
            return Ok(response);
        };

        restore_upgrade(request.headers_mut(), protocol);
        let mut response = transport.send(request).await?;
        let accepted = upgrade_protocol(response.headers());
        strip_hop_by_hop(response.headers_mut());
        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            if let Some(protocol) = accepted {
                restore_upgrade(response.headers_mut(), protocol);
            }
            let tunneled = hyper::upgrade::on(&mut response);
            let token = transport.track();
            tokio::spawn(async move {
                let _token = token;
                splice(client, tunneled).await;
            });
        }
        Ok(response)
    }
}

/// Protocol named in `Upgrade`, when `Connection` asks for a switch.
pub fn upgrade_protocol(headers: &HeaderMap) -> Option<HeaderValue> {
    let requested = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    if requested {
        headers.get(header::UPGRADE).cloned()
    } else {
        None
    }
}

/// Put a protocol switch back after [`strip_hop_by_hop`].
pub fn restore_upgrade(headers: &mut HeaderMap, protocol: HeaderValue) {
    headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
    headers.insert(header::UPGRADE, protocol);
}

/// Copy bytes both ways between two upgraded connections until one closes.
pub async fn splice(client: OnUpgrade, upstream: OnUpgrade) {
    let (client, upstream) = match tokio::try_join!(client, upstream) {
        Ok(pair) => pair,
        Err(e) => {
            debug!("protocol switch failed: {e}");
            return;
        }
    };
    let mut client = TokioIo::new(client);
    let mut upstream = TokioIo::new(upstream);
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((sent, received)) => debug!(sent, received, "Upgraded connection closed"),
        Err(e) => debug!("Upgraded connection ended: {e}"),
    }
}

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Append the client address to `X-Forwarded-For` and record the public host
/// and scheme, unless an outer proxy already did.
fn set_forwarded_headers(parts: &mut Parts, host: &str, scheme: &Scheme) {
    if let Some(ConnectInfo(peer)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
        let prior: Vec<&str> = parts
            .headers
            .get_all(&X_FORWARDED_FOR)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        let chain = if prior.is_empty() {
            peer.ip().to_string()
        } else {
            format!("{}, {}", prior.join(", "), peer.ip())
        };
        if let Ok(value) = HeaderValue::from_str(&chain) {
            parts.headers.insert(X_FORWARDED_FOR, value);
        }
    }
    if !parts.headers.contains_key(&X_FORWARDED_HOST) {
        if let Ok(value) = HeaderValue::from_str(host) {
            parts.headers.insert(X_FORWARDED_HOST, value);
        }
    }
    if !parts.headers.contains_key(&X_FORWARDED_PROTO) {
        parts
            .headers
            .insert(X_FORWARDED_PROTO, HeaderValue::from_static(scheme_name(scheme)));
    }
}

fn scheme_name(scheme: &Scheme) -> &'static str {
    if *scheme == Scheme::HTTP {
        "http"
    } else {
        "https"
    }
}

/// Headers that describe a single connection and must not be forwarded.
static HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
];

/// Remove hop-by-hop headers, including any listed in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
    headers.remove(header::UPGRADE);
}

/// Point `request` at the tunnel's logical target.
///
/// The authority comes from the inbound `Host` header (or the URI when the
/// client sent absolute-form). h2 streams need an absolute URI; a yamux
/// stream carries plain HTTP/1.1 and gets origin-form plus `Host`. The
/// client address, public host and scheme go out as `X-Forwarded-*`.
pub fn rewrite_request(
    request: Request<Body>,
    kind: MuxKind,
    scheme: &Scheme,
) -> Result<Request<Body>, ForwardError> {
    let (mut parts, body) = request.into_parts();

    let authority = parts
        .headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .or_else(|| parts.uri.authority().map(|a| a.as_str().to_owned()))
        .ok_or_else(|| ForwardError::InvalidRequest("missing Host".into()))?;
    let authority: Authority = authority
        .parse()
        .map_err(|e| ForwardError::InvalidRequest(format!("bad Host: {e}")))?;
    let path_and_query = parts
        .uri
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));

    strip_hop_by_hop(&mut parts.headers);
    set_forwarded_headers(&mut parts, authority.as_str(), scheme);

    match kind {
        MuxKind::H2 => {
            parts.uri = Uri::builder()
                .scheme(scheme.clone())
                .authority(authority)
                .path_and_query(path_and_query)
                .build()
                .map_err(|e| ForwardError::InvalidRequest(e.to_string()))?;
            parts.version = Version::HTTP_2;
            // :authority carries it now.
            parts.headers.remove(header::HOST);
        }
        MuxKind::Yamux => {
            parts.uri = Uri::from(path_and_query);
            parts.version = Version::HTTP_11;
            let host = authority
                .as_str()
                .parse()
                .map_err(|_| ForwardError::InvalidRequest("bad Host".into()))?;
            parts.headers.insert(header::HOST, host);
        }
    }

    Ok(Request::from_parts(parts, body))
}
