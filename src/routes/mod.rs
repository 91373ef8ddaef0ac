//! HTTP routes of the public endpoint.
//!
//! Everything except [`health`] goes through the client-proxy middleware
//! first; requests it does not claim fall through to [`not_found`].

pub mod health;

use axum::http::{StatusCode, Uri};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::proxy::{client_proxy, ClientProxy};

/// Path of the health route.
pub const HEALTH_PATH: &str = "/_dialback/health";

/// Fallback for requests nothing else answers.
pub async fn not_found(uri: Uri) -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": format!("no route for {}", uri.path()), "code": "NOT_FOUND"})),
    )
}

/// The public endpoint: health route, then proxy layer, then `fallback`.
pub fn public_router(proxy: ClientProxy, fallback: Router) -> Router {
    let proxied = fallback.layer(axum::middleware::from_fn_with_state(
        proxy.clone(),
        client_proxy,
    ));
    Router::new()
        .route(HEALTH_PATH, get(health::health))
        .with_state(proxy)
        .fallback_service(proxied)
        .layer(TraceLayer::new_for_http())
}

/// [`public_router`] with the 404 JSON fallback.
pub fn default_router(proxy: ClientProxy) -> Router {
    public_router(proxy, Router::new().fallback(not_found))
}
