//! Shared-secret recognition of tunnel handshakes.
//!
//! A request is a handshake when its discriminator (a header value or the
//! request path, depending on [`Placement`]) equals the configured secret
//! exactly. Anything else is ordinary traffic.

use axum::http::{HeaderName, Request};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

use crate::config::{Placement, ProxyConfig};

/// Matches requests against the configured secret.
#[derive(Debug, Clone)]
pub struct Discriminator {
    placement: Placement,
    header: Option<HeaderName>,
    expected: String,
}

impl Discriminator {
    /// Build from a validated [`ProxyConfig`].
    pub fn new(config: &ProxyConfig) -> Self {
        let (header, expected) = match config.placement {
            Placement::Header => (
                HeaderName::from_bytes(config.header_name.as_bytes()).ok(),
                config.secret.clone(),
            ),
            Placement::Path => (None, config.handshake_path()),
        };
        Self {
            placement: config.placement,
            header,
            expected,
        }
    }

    /// True when `request` carries the secret in the configured place.
    pub fn matches<B>(&self, request: &Request<B>) -> bool {
        if self.expected.is_empty() {
            return false;
        }
        let provided = match self.placement {
            Placement::Header => self
                .header
                .as_ref()
                .and_then(|name| request.headers().get(name))
                .map(|v| v.as_bytes()),
            Placement::Path => Some(request.uri().path().as_bytes()),
        };
        provided.is_some_and(|p| constant_time_eq(self.expected.as_bytes(), p))
    }
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so an attacker cannot determine the secret length from response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        let p = provided.get(i).copied().unwrap_or(0xff);
        diff |= e ^ p;
    }
    diff == 0
}

/// Short, log-safe identifier for a secret: base64url of the first 9 bytes of
/// its SHA-256. Both ends log it so operators can compare without leaking it.
pub fn fingerprint(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    URL_SAFE_NO_PAD.encode(&digest[..9])
}
