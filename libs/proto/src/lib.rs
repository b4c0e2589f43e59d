//! SOCKS5 protocol for sockd.
//!
//! - [`wire`]: constants, frame builders and incremental decoders
//! - [`session`]: the per-connection state machine
//! - [`credentials`]: configured username/password

pub mod credentials;
pub mod error;
pub mod session;
pub mod wire;

pub use credentials::Credentials;
pub use error::{CredentialsError, WireError};
pub use session::{Event, Rejection, RejectionKind, Session, SessionState, Step};
pub use wire::{ReplyCode, Target, TargetAddr};
