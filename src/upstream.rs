//! Handlers for requests arriving over the tunnel on the dialing side.
//!
//! Either every request is relayed to a local HTTP service (`[dial] upstream`)
//! or a built-in greeting answers, which is enough to check a tunnel end to end.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::HOST;
use axum::http::uri::{Authority, PathAndQuery, Scheme};
use axum::http::{HeaderValue, StatusCode, Uri, Version};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use hyper::upgrade::OnUpgrade;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde_json::json;
use tower::limit::ConcurrencyLimitLayer;
use tracing::warn;

use crate::error::ConfigError;
use crate::tunnel::session::{restore_upgrade, splice, strip_hop_by_hop, upgrade_protocol};

/// Body returned by the built-in handler.
pub const GREETING: &str = "hello from the other side\n";

/// A local plain-HTTP service behind the tunnel.
#[derive(Clone)]
pub struct Upstream {
    client: Client<HttpConnector, Body>,
    authority: Authority,
}

impl Upstream {
    pub fn new(url: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidUpstream(url.to_string());
        let uri: Uri = url.parse().map_err(|_| invalid())?;
        if uri.scheme() != Some(&Scheme::HTTP) {
            return Err(invalid());
        }
        let authority = uri.authority().cloned().ok_or_else(invalid)?;
        let client = Client::builder(TokioExecutor::new()).build_http();
        Ok(Self { client, authority })
    }

    /// Relay `request` to the upstream, keeping the public `Host`.
    ///
    /// A protocol switch the upstream accepts is spliced through.
    pub async fn relay(&self, request: Request) -> Response {
        let (mut parts, body) = request.into_parts();

        // h2 tunnels deliver the public host as :authority only.
        if !parts.headers.contains_key(HOST) {
            if let Some(host) = parts
                .uri
                .authority()
                .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
            {
                parts.headers.insert(HOST, host);
            }
        }
        let switch = upgrade_protocol(&parts.headers).and_then(|protocol| {
            let client = parts.extensions.remove::<OnUpgrade>()?;
            Some((protocol, client))
        });
        strip_hop_by_hop(&mut parts.headers);

        let path_and_query = parts
            .uri
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));
        parts.uri = match Uri::builder()
            .scheme(Scheme::HTTP)
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()
        {
            Ok(uri) => uri,
            Err(e) => return bad_gateway(&e.to_string()),
        };
        parts.version = Version::HTTP_11;
        let client = switch.map(|(protocol, client)| {
            restore_upgrade(&mut parts.headers, protocol);
            client
        });

        match self.client.request(Request::from_parts(parts, body)).await {
            Ok(mut response) => {
                let accepted = upgrade_protocol(response.headers());
                strip_hop_by_hop(response.headers_mut());
                if let Some(client) = client {
                    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
                        if let Some(protocol) = accepted {
                            restore_upgrade(response.headers_mut(), protocol);
                        }
                        tokio::spawn(splice(client, hyper::upgrade::on(&mut response)));
                    }
                }
                response.map(Body::new)
            }
            Err(e) => {
                warn!(upstream = %self.authority, "Upstream request failed: {e}");
                bad_gateway(&e.to_string())
            }
        }
    }
}

fn bad_gateway(error: &str) -> Response {
    (
        StatusCode::BAD_GATEWAY,
        Json(json!({"error": error, "code": "UPSTREAM_UNAVAILABLE"})),
    )
        .into_response()
}

async fn relay(State(upstream): State<Upstream>, request: Request) -> Response {
    upstream.relay(request).await
}

async fn greeting() -> &'static str {
    GREETING
}

/// Router that answers tunneled requests, at most `max_concurrent` at a time.
pub fn local_router(upstream: Option<&str>, max_concurrent: usize) -> Result<Router, ConfigError> {
    let router = match upstream {
        Some(url) => Router::new()
            .fallback(relay)
            .with_state(Upstream::new(url)?),
        None => Router::new().fallback(greeting),
    };
    Ok(router.layer(ConcurrencyLimitLayer::new(max_concurrent.max(1))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use axum::routing::get;
    use http_body_util::BodyExt;
    use tokio::net::TcpListener;
    use tower::ServiceExt;

    async fn body_string(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn upstream_must_be_plain_http() {
        for url in ["https://127.0.0.1:3000", "127.0.0.1:3000", "http:///x"] {
            assert!(
                matches!(Upstream::new(url), Err(ConfigError::InvalidUpstream(_))),
                "{url} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn greets_without_upstream() {
        let response = local_router(None, 4)
            .unwrap()
            .oneshot(Request::builder().uri("/any").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, GREETING);
    }

    #[tokio::test]
    async fn relays_h2_request_as_http1_with_public_host() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route(
            "/echo",
            get(|request: Request<Body>| async move {
                let host = request.headers()[HOST].to_str().unwrap().to_string();
                format!("{host} {}", request.uri())
            }),
        );
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let request = Request::builder()
            .version(Version::HTTP_2)
            .uri("https://public.example.com/echo?x=1")
            .body(Body::empty())
            .unwrap();
        let response = local_router(Some(&format!("http://{addr}")), 4)
            .unwrap()
            .oneshot(request)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "public.example.com /echo?x=1");
    }

    #[tokio::test]
    async fn protocol_switch_is_spliced_to_upstream() {
        use hyper_util::rt::TokioIo;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpStream;

        async fn echo(mut request: Request<Body>) -> Response {
            let on_upgrade = hyper::upgrade::on(&mut request);
            tokio::spawn(async move {
                if let Ok(upgraded) = on_upgrade.await {
                    let (mut r, mut w) = tokio::io::split(TokioIo::new(upgraded));
                    tokio::io::copy(&mut r, &mut w).await.ok();
                }
            });
            Response::builder()
                .status(StatusCode::SWITCHING_PROTOCOLS)
                .header("connection", "upgrade")
                .header("upgrade", "echo")
                .body(Body::empty())
                .unwrap()
        }

        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(upstream, Router::new().route("/echo", get(echo)))
                .await
                .unwrap()
        });
        let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = relay.local_addr().unwrap();
        let router = local_router(Some(&format!("http://{upstream_addr}")), 4).unwrap();
        tokio::spawn(async move { axum::serve(relay, router).await.unwrap() });

        let tcp = TcpStream::connect(relay_addr).await.unwrap();
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tcp))
            .await
            .unwrap();
        tokio::spawn(conn.with_upgrades());
        let request = Request::builder()
            .uri("/echo")
            .header(HOST, "public.example.com")
            .header("connection", "upgrade")
            .header("upgrade", "echo")
            .body(Body::empty())
            .unwrap();
        let mut response = sender.send_request(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(response.headers()["upgrade"], "echo");

        let mut io = TokioIo::new(hyper::upgrade::on(&mut response).await.unwrap());
        io.write_all(b"hello upstream").await.unwrap();
        let mut echoed = [0u8; 14];
        io.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello upstream");
    }

    #[tokio::test]
    async fn unreachable_upstream_is_bad_gateway() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let response = local_router(Some(&format!("http://{addr}")), 4)
            .unwrap()
            .oneshot(
                Request::builder()
                    .uri("/x")
                    .header(HOST, "public.example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(body_string(response).await.contains("UPSTREAM_UNAVAILABLE"));
    }
}
