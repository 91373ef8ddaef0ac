//! The single active-tunnel slot.
//!
//! Publishing swaps the slot contents atomically and signals whatever it
//! displaced. Readers take one lock-free snapshot per request and never see
//! a half-replaced slot.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::session::{Forwarder, TunnelSession};

/// Holds at most one [`TunnelSession`].
#[derive(Clone)]
pub struct ActiveTunnel {
    slot: Arc<ArcSwapOption<TunnelSession>>,
}

impl ActiveTunnel {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(ArcSwapOption::new(None)),
        }
    }

    /// Make `session` the active tunnel.
    ///
    /// The displaced session (if any) is signalled after the swap, so the new
    /// session is reachable before the old one starts draining. Returns the
    /// signal `session` waits on to learn it has been replaced in turn.
    pub fn publish(&self, session: Arc<TunnelSession>) -> CancellationToken {
        let signal = session.superseded_signal();
        if let Some(previous) = self.slot.swap(Some(session)) {
            previous.supersede();
        }
        signal
    }

    /// Forwarder of the active session, if there is one.
    pub fn current(&self) -> Option<Forwarder> {
        let slot = self.slot.load();
        (*slot).as_ref().map(|s| s.forwarder())
    }

    pub fn current_session(&self) -> Option<Arc<TunnelSession>> {
        self.slot.load_full()
    }

    /// Clear the slot, but only if it still holds session `id`.
    pub fn evict(&self, id: Uuid) -> bool {
        let holds =
            |slot: &Option<Arc<TunnelSession>>| slot.as_ref().is_some_and(|s| s.id() == id);
        let previous = self
            .slot
            .rcu(|slot| if holds(slot) { None } else { slot.clone() });
        holds(&previous)
    }

    /// Empty the slot and signal its session (used on endpoint shutdown).
    pub fn clear(&self) -> Option<Arc<TunnelSession>> {
        let previous = self.slot.swap(None);
        if let Some(ref session) = previous {
            session.supersede();
        }
        previous
    }
}

impl Default for ActiveTunnel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MuxKind, YamuxConfig};
    use crate::tunnel::mux::Transport;
    use axum::http::uri::Scheme;

    async fn session() -> (Arc<TunnelSession>, tokio::io::DuplexStream) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let transport = Transport::connect(MuxKind::Yamux, local, &YamuxConfig::default())
            .await
            .unwrap();
        (Arc::new(TunnelSession::new(transport, Scheme::HTTPS)), remote)
    }

    #[tokio::test]
    async fn empty_registry_has_no_forwarder() {
        let registry = ActiveTunnel::new();
        assert!(registry.current().is_none());
        assert!(registry.current_session().is_none());
    }

    #[tokio::test]
    async fn publish_replaces_and_signals_previous() {
        let registry = ActiveTunnel::new();
        let (a, _ra) = session().await;
        let (b, _rb) = session().await;

        let a_signal = registry.publish(a.clone());
        assert_eq!(registry.current().unwrap().session_id(), a.id());
        assert!(!a_signal.is_cancelled());

        let b_signal = registry.publish(b.clone());
        assert_eq!(registry.current().unwrap().session_id(), b.id());
        assert!(a_signal.is_cancelled());
        assert!(a.is_superseded());
        assert!(!b_signal.is_cancelled());
    }

    #[tokio::test]
    async fn snapshot_outlives_replacement() {
        let registry = ActiveTunnel::new();
        let (a, _ra) = session().await;
        let (b, _rb) = session().await;
        registry.publish(a.clone());

        let snapshot = registry.current().unwrap();
        registry.publish(b.clone());
        assert_eq!(snapshot.session_id(), a.id());
        assert_eq!(registry.current().unwrap().session_id(), b.id());
    }

    #[tokio::test]
    async fn evict_only_clears_matching_session() {
        let registry = ActiveTunnel::new();
        let (a, _ra) = session().await;
        let (b, _rb) = session().await;
        registry.publish(a.clone());
        registry.publish(b.clone());

        assert!(!registry.evict(a.id()));
        assert_eq!(registry.current().unwrap().session_id(), b.id());
        assert!(registry.evict(b.id()));
        assert!(registry.current().is_none());
        assert!(!registry.evict(b.id()));
    }

    #[tokio::test]
    async fn concurrent_publishers_each_displace_one() {
        let registry = ActiveTunnel::new();
        let mut sessions = Vec::new();
        let mut remotes = Vec::new();
        for _ in 0..16 {
            let (s, r) = session().await;
            sessions.push(s);
            remotes.push(r);
        }

        let tasks: Vec<_> = sessions
            .iter()
            .cloned()
            .map(|s| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.publish(s) })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        // Exactly one survivor; everyone else was told to drain.
        let current = registry.current_session().unwrap();
        let superseded = sessions.iter().filter(|s| s.is_superseded()).count();
        assert_eq!(superseded, sessions.len() - 1);
        assert!(!current.is_superseded());
    }

    #[tokio::test]
    async fn clear_signals_active_session() {
        let registry = ActiveTunnel::new();
        let (a, _ra) = session().await;
        registry.publish(a.clone());
        let cleared = registry.clear().unwrap();
        assert_eq!(cleared.id(), a.id());
        assert!(a.is_superseded());
        assert!(registry.current().is_none());
    }
}
