//! Process-wide proxy counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sockd_proto::RejectionKind;

/// Counters shared by the supervisor and every session.
#[derive(Debug, Default)]
pub struct ProxyStats {
    /// Connections accepted.
    pub sessions_accepted: AtomicU64,
    /// Sessions currently running.
    pub sessions_active: AtomicU64,
    /// Sessions finished, for any reason.
    pub sessions_closed: AtomicU64,
    /// Credential mismatches.
    pub auth_failures: AtomicU64,
    /// Malformed or unexpected client bytes.
    pub protocol_rejections: AtomicU64,
    /// Unsupported commands and address types.
    pub unsupported_requests: AtomicU64,
    /// Individual connect attempts to targets.
    pub dial_attempts: AtomicU64,
    /// Targets that stayed unreachable after every attempt.
    pub dial_failures: AtomicU64,
    /// Sessions that reached the relay phase.
    pub relays_established: AtomicU64,
    /// Bytes relayed client to target.
    pub bytes_to_target: AtomicU64,
    /// Bytes relayed target to client.
    pub bytes_to_client: AtomicU64,
    /// Listener binds after the first one.
    pub listener_restarts: AtomicU64,
}

impl ProxyStats {
    /// Count a new session; the returned guard closes it on drop.
    pub fn open_session(self: &Arc<Self>) -> SessionGuard {
        self.sessions_accepted.fetch_add(1, Ordering::Relaxed);
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
        SessionGuard {
            stats: Arc::clone(self),
        }
    }

    pub fn active_sessions(&self) -> u64 {
        self.sessions_active.load(Ordering::Relaxed)
    }

    /// Count a session that ended in negotiation.
    pub fn record_rejection(&self, kind: RejectionKind) {
        let counter = match kind {
            RejectionKind::Protocol => &self.protocol_rejections,
            RejectionKind::Auth => &self.auth_failures,
            RejectionKind::Unsupported => &self.unsupported_requests,
            RejectionKind::Dial => &self.dial_failures,
            RejectionKind::Disconnected => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            sessions_accepted: load(&self.sessions_accepted),
            sessions_active: load(&self.sessions_active),
            sessions_closed: load(&self.sessions_closed),
            auth_failures: load(&self.auth_failures),
            protocol_rejections: load(&self.protocol_rejections),
            unsupported_requests: load(&self.unsupported_requests),
            dial_attempts: load(&self.dial_attempts),
            dial_failures: load(&self.dial_failures),
            relays_established: load(&self.relays_established),
            bytes_to_target: load(&self.bytes_to_target),
            bytes_to_client: load(&self.bytes_to_client),
            listener_restarts: load(&self.listener_restarts),
        }
    }
}

/// Keeps a session counted as active until dropped.
///
/// Dropping also covers panicked and cancelled session tasks.
#[derive(Debug)]
pub struct SessionGuard {
    stats: Arc<ProxyStats>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.stats.sessions_active.fetch_sub(1, Ordering::Relaxed);
        self.stats.sessions_closed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`ProxyStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub sessions_accepted: u64,
    pub sessions_active: u64,
    pub sessions_closed: u64,
    pub auth_failures: u64,
    pub protocol_rejections: u64,
    pub unsupported_requests: u64,
    pub dial_attempts: u64,
    pub dial_failures: u64,
    pub relays_established: u64,
    pub bytes_to_target: u64,
    pub bytes_to_client: u64,
    pub listener_restarts: u64,
}
