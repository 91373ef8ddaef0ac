#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]

//! dialback library: reverse HTTP tunnels for hosts without inbound connectivity.
//!
//! A private process dials a public endpoint once, authenticates with a shared
//! secret, and from then on the endpoint forwards its ordinary traffic back
//! over that connection.
//!
//! - `proxy`: axum middleware for the public endpoint
//! - `tunnel`: handshake, multiplexing, session registry, dialer
//! - `upstream`: dial-side handlers for tunneled requests
//! - `routes`: public router with health check and 404 fallback
//! - `config`: configuration loading
//! - `auth`: shared-secret matching
//! - `state`: tunnel counters and event history
//! - `error`: error types

pub mod auth;
pub mod config;
pub mod error;
pub mod proxy;
pub mod routes;
pub mod state;
pub mod tunnel;
pub mod upstream;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use error::{ConfigError, DialError, ForwardError, TunnelError};
pub use proxy::{client_proxy, ClientProxy};
pub use tunnel::{dial_and_serve, ActiveTunnel, DialOptions};
