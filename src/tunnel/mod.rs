//! Reverse tunnels: a private process dials out once and the public endpoint
//! sends requests back over that connection.
//!
//! Endpoint side, leaves first:
//!
//! - [`replay`]: re-delivers bytes a parser consumed before the hijack.
//! - [`sever`]: force-close switch under a tunnel connection.
//! - [`mux`]: many logical streams over one connection (h2 or yamux).
//! - [`session`]: one tunnel's lifecycle and its request [`Forwarder`].
//! - [`registry`]: the single active-tunnel slot with handover.
//! - [`acceptor`]: handshake to published session, and session teardown.
//!
//! Dialing side: [`dialer`].

pub mod acceptor;
pub mod dialer;
pub mod mux;
pub mod registry;
pub mod replay;
pub mod session;
pub mod sever;

pub use acceptor::Acceptor;
pub use dialer::{dial_and_serve, DialOptions};
pub use mux::Transport;
pub use registry::ActiveTunnel;
pub use replay::ReplayConn;
pub use session::{Forwarder, SessionState, TunnelSession};
