//! Unauthenticated health-check endpoint.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::proxy::ClientProxy;

/// `GET /_dialback/health`: liveness probe plus tunnel status.
///
/// Served outside the proxy layer, so it answers locally even while a tunnel
/// is active. Never exposes the secret, only its fingerprint.
pub async fn health(State(proxy): State<ClientProxy>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "tunnel": proxy.status().await,
    }))
}
