//! Tunnel counters and lifecycle event history.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tokio::sync::Mutex;

/// Tunnel lifecycle event types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TunnelEventType {
    Published,
    Superseded,
    TransportFailed,
    Drained,
    DrainTimeout,
    HandshakeFailed,
}

impl TunnelEventType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Published => "published",
            Self::Superseded => "superseded",
            Self::TransportFailed => "transport_failed",
            Self::Drained => "drained",
            Self::DrainTimeout => "drain_timeout",
            Self::HandshakeFailed => "handshake_failed",
        }
    }
}

/// A tunnel lifecycle event for observability.
#[derive(Clone, Debug)]
pub struct TunnelEvent {
    pub timestamp: Instant,
    pub event_type: TunnelEventType,
    pub detail: String,
}

/// Maximum number of recent events to retain.
const MAX_TUNNEL_EVENTS: usize = 50;

/// Tunnel statistics. Atomics for lock-free hot-path updates,
/// Mutex only for the event log (cold path).
pub struct TunnelStats {
    pub sessions_accepted: AtomicU64,
    pub supersessions: AtomicU64,
    pub transport_failures: AtomicU64,
    pub drain_timeouts: AtomicU64,
    pub handshake_rejections: AtomicU64,
    pub forwarded: AtomicU64,
    pub forward_errors: AtomicU64,
    pub fallback: AtomicU64,
    pub events: Mutex<VecDeque<TunnelEvent>>,
}

impl TunnelStats {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions_accepted: AtomicU64::new(0),
            supersessions: AtomicU64::new(0),
            transport_failures: AtomicU64::new(0),
            drain_timeouts: AtomicU64::new(0),
            handshake_rejections: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            forward_errors: AtomicU64::new(0),
            fallback: AtomicU64::new(0),
            events: Mutex::new(VecDeque::with_capacity(MAX_TUNNEL_EVENTS)),
        }
    }

    /// Bump `counter` by one.
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Push a lifecycle event, evicting oldest if at capacity.
    pub async fn push_event(&self, event_type: TunnelEventType, detail: String) {
        let mut events = self.events.lock().await;
        if events.len() >= MAX_TUNNEL_EVENTS {
            events.pop_front();
        }
        events.push_back(TunnelEvent {
            timestamp: Instant::now(),
            event_type,
            detail,
        });
    }

    /// Most recent events, newest first.
    pub async fn recent_events(&self, limit: usize) -> Vec<TunnelEvent> {
        let events = self.events.lock().await;
        events.iter().rev().take(limit).cloned().collect()
    }
}

impl Default for TunnelStats {
    fn default() -> Self {
        Self::new()
    }
}
