//! Error types for the proxy.

use std::io;

use sockd_proto::{Rejection, RejectionKind};
use thiserror::Error;

/// Why a target could not be reached.
#[derive(Debug, Error)]
pub enum DialError {
    /// Every attempt failed.
    #[error("target unreachable after {attempts} attempts: {last_error}")]
    Exhausted {
        attempts: u32,
        #[source]
        last_error: io::Error,
    },

    /// The client disconnected while dialing.
    #[error("client disconnected after {attempts} attempts")]
    ClientGone { attempts: u32 },
}

impl DialError {
    pub fn attempts(&self) -> u32 {
        match self {
            DialError::Exhausted { attempts, .. } | DialError::ClientGone { attempts } => *attempts,
        }
    }
}

/// How a single session ended, other than by a completed relay.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Malformed or unexpected client bytes.
    #[error("protocol error: {0}")]
    Protocol(Rejection),

    /// Credentials did not match.
    #[error("authentication failed")]
    Auth,

    /// Unsupported command or address type.
    #[error("unsupported request: {0}")]
    Unsupported(Rejection),

    /// Target unreachable, or client gone while dialing.
    #[error("dial failed: {0}")]
    Dial(#[from] DialError),

    /// Client closed the connection mid-negotiation.
    #[error("client disconnected")]
    ClientGone,

    /// Negotiation did not finish in time.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The proxy is shutting down.
    #[error("proxy shutting down")]
    Shutdown,

    /// Socket error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl From<Rejection> for SessionError {
    fn from(reason: Rejection) -> Self {
        match reason.kind() {
            RejectionKind::Protocol => SessionError::Protocol(reason),
            RejectionKind::Auth => SessionError::Auth,
            RejectionKind::Unsupported => SessionError::Unsupported(reason),
            RejectionKind::Disconnected => SessionError::ClientGone,
            // Unreachable targets arrive as DialError.
            RejectionKind::Dial => SessionError::Protocol(reason),
        }
    }
}

impl SessionError {
    /// Stable snake_case code for logs.
    pub fn reason_code(&self) -> &'static str {
        match self {
            SessionError::Protocol(_) => "protocol_error",
            SessionError::Auth => "auth_failed",
            SessionError::Unsupported(_) => "unsupported",
            SessionError::Dial(DialError::Exhausted { .. }) => "host_unreachable",
            SessionError::Dial(DialError::ClientGone { .. }) => "client_gone_while_dialing",
            SessionError::ClientGone => "client_gone",
            SessionError::HandshakeTimeout => "handshake_timeout",
            SessionError::Shutdown => "shutdown",
            SessionError::Io(_) => "io_error",
        }
    }
}

/// Listener failures. Never fatal; the supervisor rebinds.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Accepting failed in a way that ends the listener.
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    /// The accept task panicked or was cancelled.
    #[error("listener task ended: {0}")]
    Crashed(String),
}

impl ListenerError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            ListenerError::Bind { .. } => "bind_failed",
            ListenerError::Accept(_) => "accept_failed",
            ListenerError::Crashed(_) => "listener_crashed",
        }
    }
}
