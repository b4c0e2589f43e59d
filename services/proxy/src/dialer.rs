//! Target connection with bounded retry.
//!
//! Attempt n (counting from 0) waits `n * step` before connecting, so with
//! the default policy the gaps between the four attempts are 1s, 2s and 3s.
//! A client hangup cancels the loop at any point.

use std::future::Future;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use sockd_proto::{Target, TargetAddr};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::error::DialError;

/// Default number of connect attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;

/// Default backoff step.
pub const DEFAULT_BACKOFF_STEP: Duration = Duration::from_millis(1000);

/// Linear backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay unit; attempt n waits `n * step`.
    pub step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            step: DEFAULT_BACKOFF_STEP,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt` (0-based). The first attempt is immediate.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        self.step * attempt
    }
}

/// Opens transport connections to targets.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// One connection attempt.
    async fn connect(&self, target: &Target) -> io::Result<Self::Stream>;
}

/// Plain TCP connector with an optional per-attempt timeout.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    timeout: Option<Duration>,
}

impl TcpConnector {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, target: &Target) -> io::Result<TcpStream> {
        let connect = async {
            match &target.addr {
                TargetAddr::Ipv4(ip) => TcpStream::connect((*ip, target.port)).await,
                TargetAddr::Domain(name) => TcpStream::connect((name.as_str(), target.port)).await,
            }
        };

        let stream = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, connect)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??,
            None => connect.await?,
        };
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }
}

/// A connected target.
#[derive(Debug)]
pub struct Dialed<S> {
    pub stream: S,
    /// Attempts used, including the successful one.
    pub attempts: u32,
}

/// Retry loop around a [`Connector`].
#[derive(Debug, Clone)]
pub struct Dialer<C> {
    connector: C,
    policy: RetryPolicy,
}

impl<C: Connector> Dialer<C> {
    pub fn new(connector: C, policy: RetryPolicy) -> Self {
        Self { connector, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Connect to `target`, retrying with backoff.
    ///
    /// `hangup` resolves when the client is gone; it is raced against every
    /// backoff delay and every attempt.
    pub async fn dial<F>(&self, target: &Target, hangup: F) -> Result<Dialed<C::Stream>, DialError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(hangup);

        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = io::Error::other("no connect attempt made");

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let delay = self.policy.delay_before(attempt);
                debug!(target = %target, attempt, delay_ms = delay.as_millis() as u64, "Retrying target");
                tokio::select! {
                    biased;
                    _ = &mut hangup => return Err(DialError::ClientGone { attempts: attempt }),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let result = tokio::select! {
                biased;
                _ = &mut hangup => return Err(DialError::ClientGone { attempts: attempt }),
                result = self.connector.connect(target) => result,
            };

            match result {
                Ok(stream) => {
                    return Ok(Dialed {
                        stream,
                        attempts: attempt + 1,
                    })
                }
                Err(e) => {
                    debug!(target = %target, attempt = attempt + 1, error = %e, "Connect attempt failed");
                    last_error = e;
                }
            }
        }

        warn!(
            target = %target,
            attempts = max_attempts,
            error = %last_error,
            "Target unreachable"
        );
        Err(DialError::Exhausted {
            attempts: max_attempts,
            last_error,
        })
    }
}
