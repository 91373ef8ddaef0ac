//! Stream multiplexing over a single hijacked connection.
//!
//! The public endpoint always opens streams ([`Transport`]); the dialer always
//! answers them ([`serve_responder`]). Two strategies are supported:
//!
//! - [`MuxKind::H2`]: HTTP/2 with roles swapped. The dialer runs the h2 server
//!   loop on the socket it dialed, the endpoint runs the h2 client on the
//!   socket it accepted. Every h2 stream is one request.
//! - [`MuxKind::Yamux`]: a symmetric yamux session. Every yamux stream carries
//!   one HTTP/1.1 exchange.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use bytes::Bytes;
use futures::StreamExt;
use http_body::{Frame, SizeHint};
use hyper::body::Incoming;
use hyper::client::conn::{http1 as client_http1, http2 as client_http2};
use hyper::server::conn::{http1 as server_http1, http2 as server_http2};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::service::TowerToHyperService;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::AbortHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tokio_util::task::task_tracker::TaskTrackerToken;
use tokio_util::task::TaskTracker;
use tokio_yamux::session::SessionType;
use tokio_yamux::{Control, Session};
use tracing::{debug, warn};

use super::sever::Severable;
use crate::config::{MuxKind, YamuxConfig};
use crate::error::{DialError, ForwardError, TunnelError};

/// How long a yamux GoAway may take before the driver is aborted anyway.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// How long the dialer waits for in-flight handlers after cancellation.
pub const RESPONDER_GRACE: Duration = Duration::from_secs(60);

/// Any owned duplex byte stream a tunnel can run over.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Io for T {}

/// Type-erased tunnel connection.
pub type BoxedIo = Box<dyn Io>;

enum Opener {
    H2(client_http2::SendRequest<Body>),
    Yamux(Control),
}

/// Stream-opening side of a multiplexed tunnel.
///
/// [`Transport::send`] takes `&self` and may be called from any number of
/// tasks at once; each call rides its own logical stream.
pub struct Transport {
    kind: MuxKind,
    opener: Opener,
    /// Set once shutdown starts; new requests are refused.
    closing: CancellationToken,
    /// Cancelled when the connection driver exits for any reason.
    dead: CancellationToken,
    /// Force-close: fails all I/O on the connection, wherever it is polled.
    sever: CancellationToken,
    /// One token per request whose response body is still streaming.
    inflight: TaskTracker,
    driver: AbortHandle,
}

impl Transport {
    /// Take over `io` and start the opener role of `kind` on it.
    pub async fn connect<I: Io>(
        kind: MuxKind,
        io: I,
        yamux: &YamuxConfig,
    ) -> Result<Self, TunnelError> {
        let dead = CancellationToken::new();
        let guard = dead.clone().drop_guard();
        let sever = CancellationToken::new();
        let io = Severable::new(io, sever.clone());

        let (opener, driver) = match kind {
            MuxKind::H2 => {
                let (sender, conn) = client_http2::Builder::new(TokioExecutor::new())
                    .handshake::<_, Body>(TokioIo::new(io))
                    .await
                    .map_err(|e| TunnelError::TransportInit(e.to_string()))?;
                let driver = tokio::spawn(async move {
                    let _guard = guard;
                    if let Err(e) = conn.await {
                        debug!("h2 tunnel connection ended: {e}");
                    }
                });
                (Opener::H2(sender), driver.abort_handle())
            }
            MuxKind::Yamux => {
                let mut session = Session::new(io, yamux.session_config(), SessionType::Client);
                let control = session.control();
                let driver = tokio::spawn(async move {
                    let _guard = guard;
                    while let Some(res) = session.next().await {
                        match res {
                            // The dialer never opens streams; drop any it tries.
                            Ok(_stream) => debug!("ignoring stream opened by dialer"),
                            Err(e) => {
                                debug!("yamux tunnel session ended: {e}");
                                break;
                            }
                        }
                    }
                });
                (Opener::Yamux(control), driver.abort_handle())
            }
        };

        Ok(Self {
            kind,
            opener,
            closing: CancellationToken::new(),
            dead,
            sever,
            inflight: TaskTracker::new(),
            driver,
        })
    }

    pub fn kind(&self) -> MuxKind {
        self.kind
    }

    /// Send `request` on a fresh logical stream.
    ///
    /// The request URI must already be in the form the strategy expects:
    /// absolute for h2, origin-form for yamux.
    pub async fn send(&self, request: Request<Body>) -> Result<Response<Body>, ForwardError> {
        if self.closing.is_cancelled() {
            return Err(ForwardError::Draining);
        }
        let token = self.inflight.token();

        let response = match &self.opener {
            Opener::H2(sender) => {
                let mut sender = sender.clone();
                sender.ready().await?;
                sender.send_request(request).await?
            }
            Opener::Yamux(control) => {
                let mut control = control.clone();
                let stream = control
                    .open_stream()
                    .await
                    .map_err(|e| ForwardError::OpenStream(format!("{e:?}")))?;
                let (mut sender, conn) =
                    client_http1::handshake::<_, Body>(TokioIo::new(stream)).await?;
                tokio::spawn(async move {
                    if let Err(e) = conn.with_upgrades().await {
                        debug!("tunnel stream ended with error: {e}");
                    }
                });
                sender.send_request(request).await?
            }
        };

        Ok(response.map(|inner| {
            Body::new(TrackedBody {
                inner,
                _token: token,
            })
        }))
    }

    /// Refuse new streams, wait up to `grace` for in-flight ones, then close.
    ///
    /// Returns [`TunnelError::DrainTimeout`] when the wait ran out; the
    /// connection is closed either way and requests still on it fail.
    pub async fn shutdown(&self, grace: Duration) -> Result<(), TunnelError> {
        self.closing.cancel();
        self.inflight.close();
        let drained = tokio::time::timeout(grace, self.inflight.wait())
            .await
            .is_ok();
        self.close().await;
        if drained {
            Ok(())
        } else {
            Err(TunnelError::DrainTimeout(grace))
        }
    }

    async fn close(&self) {
        if let Opener::Yamux(control) = &self.opener {
            if !self.dead.is_cancelled() {
                let mut control = control.clone();
                let _ = tokio::time::timeout(CLOSE_GRACE, control.close()).await;
            }
        }
        self.sever.cancel();
        self.driver.abort();
    }

    /// Resolves when the underlying connection is gone.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.dead.cancelled()
    }

    pub fn is_closed(&self) -> bool {
        self.dead.is_cancelled()
    }

    pub fn inflight(&self) -> usize {
        self.inflight.len()
    }

    /// Count something other than a response body as in flight, such as an
    /// upgraded stream, until the token is dropped.
    pub(crate) fn track(&self) -> TaskTrackerToken {
        self.inflight.token()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.sever.cancel();
        self.driver.abort();
    }
}

/// Response body that keeps its request counted as in flight until dropped.
struct TrackedBody {
    inner: Incoming,
    _token: TaskTrackerToken,
}

impl http_body::Body for TrackedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Answer streams opened by the endpoint, dispatching each request to `handler`.
///
/// Returns when the connection closes or, after `cancel` fires, once in-flight
/// handlers finished or [`RESPONDER_GRACE`] elapsed.
pub async fn serve_responder<I: Io>(
    kind: MuxKind,
    io: I,
    handler: Router,
    yamux: &YamuxConfig,
    cancel: CancellationToken,
) -> Result<(), DialError> {
    let service = TowerToHyperService::new(handler);
    match kind {
        MuxKind::H2 => {
            let conn = server_http2::Builder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(io), service);
            tokio::pin!(conn);

            tokio::select! {
                res = conn.as_mut() => return res.map_err(|e| DialError::Serve(e.to_string())),
                () = cancel.cancelled() => {}
            }

            conn.as_mut().graceful_shutdown();
            match tokio::time::timeout(RESPONDER_GRACE, conn.as_mut()).await {
                Ok(res) => res.map_err(|e| DialError::Serve(e.to_string())),
                Err(_) => {
                    warn!("h2 responder did not finish within {RESPONDER_GRACE:?}");
                    Ok(())
                }
            }
        }
        MuxKind::Yamux => {
            let mut session = Session::new(io, yamux.session_config(), SessionType::Server);
            let control = session.control();
            let handlers = TaskTracker::new();
            let mut closing = false;

            loop {
                tokio::select! {
                    next = session.next() => match next {
                        Some(Ok(stream)) if !closing => {
                            let service = service.clone();
                            handlers.spawn(async move {
                                if let Err(e) = server_http1::Builder::new()
                                    .serve_connection(TokioIo::new(stream), service)
                                    .with_upgrades()
                                    .await
                                {
                                    debug!("tunnel stream handler failed: {e}");
                                }
                            });
                        }
                        Some(Ok(_stream)) => debug!("refusing stream while closing"),
                        Some(Err(e)) => {
                            handlers.close();
                            return Err(DialError::Io(e));
                        }
                        None => break,
                    },
                    () = cancel.cancelled(), if !closing => {
                        closing = true;
                        handlers.close();
                        let mut control = control.clone();
                        let handlers = handlers.clone();
                        tokio::spawn(async move {
                            if tokio::time::timeout(RESPONDER_GRACE, handlers.wait()).await.is_err() {
                                warn!("yamux responder did not finish within {RESPONDER_GRACE:?}");
                            }
                            control.close().await;
                        });
                    }
                }
            }

            handlers.close();
            Ok(())
        }
    }
}
