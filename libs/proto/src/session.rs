//! SOCKS5 session state machine.
//!
//! A [`Session`] holds the protocol state of one client connection and maps
//! each [`Event`] to a [`Step`] the caller must perform. It does no I/O, so
//! the whole negotiation is testable without sockets.
//!
//! ```text
//! AwaitingGreeting ──► AwaitingAuth ──► AwaitingRequest ──► Dialing ──► Relaying
//!        │                  │                  │               │
//!        └──────────────────┴──────────────────┴───────────────┴──► Closed
//! ```

use std::fmt;

use crate::credentials::Credentials;
use crate::error::WireError;
use crate::wire::{
    auth_status, decode_greeting, decode_request, decode_user_pass, method_selection,
    reply_frame, Decoded, ReplyCode, Target, AUTH_VERSION, METHOD_NO_ACCEPTABLE,
    METHOD_NO_AUTH, METHOD_USER_PASS,
};

/// Protocol state of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    AwaitingGreeting,
    AwaitingAuth,
    AwaitingRequest,
    /// Request parsed; the target is being dialed.
    Dialing(Target),
    Relaying,
    Closed,
}

/// Input to the state machine.
#[derive(Debug, Clone, Copy)]
pub enum Event<'a> {
    /// All bytes received and not yet consumed.
    Received(&'a [u8]),
    /// The client closed its side.
    Eof,
    /// The target connection is open.
    DialSucceeded,
    /// Every dial attempt failed.
    DialFailed,
}

/// What the caller must do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Read more bytes and call again with the larger buffer.
    NeedMore,
    /// Write `bytes`, drop the first `consumed` input bytes, keep reading.
    Reply { bytes: Vec<u8>, consumed: usize },
    /// Write `bytes` and close the connection.
    ReplyAndClose { bytes: Vec<u8>, reason: Rejection },
    /// Close the connection without replying.
    Close { reason: Rejection },
    /// Drop the first `consumed` input bytes and dial `target`. Bytes left in
    /// the buffer belong to the relay.
    Dial { target: Target, consumed: usize },
    /// Write the success reply and start relaying.
    Relay { bytes: Vec<u8> },
}

/// Why a session ended before or instead of relaying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Greeting did not start with the SOCKS5 version byte.
    BadVersion(u8),
    /// None of the offered methods is acceptable.
    NoAcceptableMethod,
    /// Credentials did not match.
    AuthFailed,
    /// CONNECT request rejected.
    Request(WireError),
    /// Client closed mid-message.
    Truncated,
    /// Target could not be reached.
    HostUnreachable,
    /// Client went away while dialing or relaying.
    ClientGone,
    /// Event not valid in the current state.
    OutOfOrder,
}

/// Failure class of a [`Rejection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionKind {
    /// Malformed or unexpected bytes.
    Protocol,
    /// Credential mismatch.
    Auth,
    /// Command or address type not supported.
    Unsupported,
    /// Target unreachable.
    Dial,
    /// Client disconnected.
    Disconnected,
}

impl Rejection {
    pub fn kind(&self) -> RejectionKind {
        match self {
            Rejection::BadVersion(_)
            | Rejection::NoAcceptableMethod
            | Rejection::Truncated
            | Rejection::OutOfOrder => RejectionKind::Protocol,
            Rejection::AuthFailed => RejectionKind::Auth,
            Rejection::Request(WireError::Malformed(_)) => RejectionKind::Protocol,
            Rejection::Request(_) => RejectionKind::Unsupported,
            Rejection::HostUnreachable => RejectionKind::Dial,
            Rejection::ClientGone => RejectionKind::Disconnected,
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::BadVersion(v) => write!(f, "bad greeting version {:#04x}", v),
            Rejection::NoAcceptableMethod => f.write_str("no acceptable auth method"),
            Rejection::AuthFailed => f.write_str("authentication failed"),
            Rejection::Request(e) => write!(f, "request rejected: {}", e),
            Rejection::Truncated => f.write_str("client closed mid-message"),
            Rejection::HostUnreachable => f.write_str("host unreachable"),
            Rejection::ClientGone => f.write_str("client disconnected"),
            Rejection::OutOfOrder => f.write_str("event out of order"),
        }
    }
}

/// Per-connection protocol state machine.
#[derive(Debug)]
pub struct Session<'a> {
    state: SessionState,
    credentials: Option<&'a Credentials>,
    method: Option<u8>,
}

impl<'a> Session<'a> {
    /// New session; `credentials` enables username/password auth.
    pub fn new(credentials: Option<&'a Credentials>) -> Self {
        Self {
            state: SessionState::AwaitingGreeting,
            credentials,
            method: None,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Negotiated auth method, once the greeting is accepted.
    pub fn method(&self) -> Option<u8> {
        self.method
    }

    /// Target being dialed.
    pub fn target(&self) -> Option<&Target> {
        match &self.state {
            SessionState::Dialing(target) => Some(target),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// Advance the machine by one event.
    pub fn handle(&mut self, event: Event<'_>) -> Step {
        let state = std::mem::replace(&mut self.state, SessionState::Closed);

        let (next, step) = match (state, event) {
            (SessionState::AwaitingGreeting, Event::Received(buf)) => self.on_greeting(buf),
            (SessionState::AwaitingAuth, Event::Received(buf)) => self.on_auth(buf),
            (SessionState::AwaitingRequest, Event::Received(buf)) => on_request(buf),

            (SessionState::AwaitingGreeting | SessionState::AwaitingAuth, Event::Eof) => (
                SessionState::Closed,
                Step::Close {
                    reason: Rejection::Truncated,
                },
            ),
            (SessionState::AwaitingRequest, Event::Eof) => (
                SessionState::Closed,
                Step::ReplyAndClose {
                    bytes: reply_frame(ReplyCode::GeneralFailure).to_vec(),
                    reason: Rejection::Truncated,
                },
            ),

            (SessionState::Dialing(target), Event::Received(_)) => {
                (SessionState::Dialing(target), Step::NeedMore)
            }
            (SessionState::Dialing(_), Event::DialSucceeded) => (
                SessionState::Relaying,
                Step::Relay {
                    bytes: reply_frame(ReplyCode::Succeeded).to_vec(),
                },
            ),
            (SessionState::Dialing(_), Event::DialFailed) => (
                SessionState::Closed,
                Step::ReplyAndClose {
                    bytes: reply_frame(ReplyCode::HostUnreachable).to_vec(),
                    reason: Rejection::HostUnreachable,
                },
            ),

            (SessionState::Relaying, Event::Received(_)) => (SessionState::Relaying, Step::NeedMore),
            (SessionState::Dialing(_) | SessionState::Relaying, Event::Eof) => (
                SessionState::Closed,
                Step::Close {
                    reason: Rejection::ClientGone,
                },
            ),

            _ => (
                SessionState::Closed,
                Step::Close {
                    reason: Rejection::OutOfOrder,
                },
            ),
        };

        self.state = next;
        step
    }

    fn on_greeting(&mut self, buf: &[u8]) -> (SessionState, Step) {
        let greeting = match decode_greeting(buf) {
            Ok(Decoded::Complete { value, consumed }) => (value, consumed),
            Ok(Decoded::Incomplete) => return (SessionState::AwaitingGreeting, Step::NeedMore),
            Err(WireError::UnsupportedVersion(v)) => {
                return (
                    SessionState::Closed,
                    Step::Close {
                        reason: Rejection::BadVersion(v),
                    },
                )
            }
            Err(_) => {
                return (
                    SessionState::Closed,
                    Step::Close {
                        reason: Rejection::OutOfOrder,
                    },
                )
            }
        };
        let (greeting, consumed) = greeting;

        match self.credentials {
            None if greeting.offers(METHOD_NO_AUTH) => {
                self.method = Some(METHOD_NO_AUTH);
                (
                    SessionState::AwaitingRequest,
                    Step::Reply {
                        bytes: method_selection(METHOD_NO_AUTH).to_vec(),
                        consumed,
                    },
                )
            }
            Some(_) if greeting.offers(METHOD_USER_PASS) => {
                self.method = Some(METHOD_USER_PASS);
                (
                    SessionState::AwaitingAuth,
                    Step::Reply {
                        bytes: method_selection(METHOD_USER_PASS).to_vec(),
                        consumed,
                    },
                )
            }
            _ => (
                SessionState::Closed,
                Step::ReplyAndClose {
                    bytes: method_selection(METHOD_NO_ACCEPTABLE).to_vec(),
                    reason: Rejection::NoAcceptableMethod,
                },
            ),
        }
    }

    fn on_auth(&self, buf: &[u8]) -> (SessionState, Step) {
        let Some(credentials) = self.credentials else {
            return (
                SessionState::Closed,
                Step::Close {
                    reason: Rejection::OutOfOrder,
                },
            );
        };

        let reject = || {
            (
                SessionState::Closed,
                Step::ReplyAndClose {
                    bytes: auth_status(false).to_vec(),
                    reason: Rejection::AuthFailed,
                },
            )
        };

        // Structural pre-check on the length bytes, before the strings arrive.
        if buf.first().is_some_and(|&v| v != AUTH_VERSION) {
            return reject();
        }
        let ulen = credentials.username().len();
        if buf.get(1).is_some_and(|&len| len as usize != ulen) {
            return reject();
        }
        if buf
            .get(2 + ulen)
            .is_some_and(|&len| len as usize != credentials.password().len())
        {
            return reject();
        }

        match decode_user_pass(buf) {
            Ok(Decoded::Complete { value, consumed }) => {
                if credentials.matches(&value.username, &value.password) {
                    (
                        SessionState::AwaitingRequest,
                        Step::Reply {
                            bytes: auth_status(true).to_vec(),
                            consumed,
                        },
                    )
                } else {
                    reject()
                }
            }
            Ok(Decoded::Incomplete) => (SessionState::AwaitingAuth, Step::NeedMore),
            Err(_) => reject(),
        }
    }
}

fn on_request(buf: &[u8]) -> (SessionState, Step) {
    match decode_request(buf) {
        Ok(Decoded::Complete { value, consumed }) => (
            SessionState::Dialing(value.target.clone()),
            Step::Dial {
                target: value.target,
                consumed,
            },
        ),
        Ok(Decoded::Incomplete) => (SessionState::AwaitingRequest, Step::NeedMore),
        Err(e) => (
            SessionState::Closed,
            Step::ReplyAndClose {
                bytes: reply_frame(e.reply_code()).to_vec(),
                reason: Rejection::Request(e),
            },
        ),
    }
}
