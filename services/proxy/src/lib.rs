//! sockd: SOCKS5 proxy server.
//!
//! - [`supervisor`]: listener lifecycle, restart and health probe
//! - [`session`]: per-connection driver around [`sockd_proto::Session`]
//! - [`dialer`]: target connection with bounded retry
//! - [`relay`]: bidirectional byte pump

pub mod config;
pub mod dialer;
pub mod error;
pub mod logging;
pub mod relay;
pub mod session;
pub mod signal;
pub mod stats;
pub mod supervisor;

pub use config::{Config, ListenerConfig, SessionConfig};
pub use dialer::{Connector, Dialer, RetryPolicy, TcpConnector};
pub use error::{DialError, ListenerError, SessionError};
pub use relay::{relay, RelayOutcome, Side};
pub use session::SessionHandler;
pub use stats::{ProxyStats, StatsSnapshot};
pub use supervisor::{ListenerStatus, Supervisor, SupervisorHandle};
