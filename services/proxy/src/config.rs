//! Proxy configuration (env-driven).

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sockd_proto::Credentials;

use crate::dialer::RetryPolicy;
use crate::logging::LogFormat;

/// Default bind host.
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default bind port.
pub const DEFAULT_PORT: u16 = 3039;

/// Delay before rebinding a failed listener.
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_millis(3000);

/// Interval of the listener liveness probe.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_millis(8000);

/// How long shutdown waits for sessions to finish.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_millis(1000);

/// Default per-attempt connect timeout (ms).
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Default negotiation deadline (ms).
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 30_000;

/// Listener lifecycle settings.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub bind_host: String,
    /// `0` picks a free port once; restarts reuse it.
    pub bind_port: u16,
    pub restart_delay: Duration,
    pub probe_interval: Duration,
    pub shutdown_grace: Duration,
}

impl ListenerConfig {
    pub fn new(bind_host: impl Into<String>, bind_port: u16) -> Self {
        Self {
            bind_host: bind_host.into(),
            bind_port,
            restart_delay: DEFAULT_RESTART_DELAY,
            probe_interval: DEFAULT_PROBE_INTERVAL,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

/// Per-session settings.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// `None` disables authentication.
    pub credentials: Option<Credentials>,
    pub retry: RetryPolicy,
    /// Per-attempt connect timeout; `None` waits for the OS.
    pub connect_timeout: Option<Duration>,
    /// Negotiation deadline; `None` waits forever.
    pub handshake_timeout: Option<Duration>,
}

/// Proxy configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub listener: ListenerConfig,
    pub session: SessionConfig,
    /// Log level (trace, debug, info, warn, error, off).
    pub log_level: String,
    pub log_format: LogFormat,
    /// Exactly one of username/password was set, so auth is off.
    pub partial_credentials: bool,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let bind_host = get("SOCKD_HOST").unwrap_or_else(|| DEFAULT_HOST.to_string());
        let bind_port: u16 = parse(get("SOCKD_PORT"))
            .context("SOCKD_PORT must be a port number (0-65535).")?
            .unwrap_or(DEFAULT_PORT);

        let username = get("SOCKD_USERNAME").unwrap_or_default();
        let password = get("SOCKD_PASSWORD").unwrap_or_default();
        let partial_credentials = username.is_empty() != password.is_empty();
        let credentials = Credentials::from_parts(username, password)
            .context("Invalid SOCKD_USERNAME/SOCKD_PASSWORD.")?;

        let connect_timeout = millis(
            parse(get("SOCKD_CONNECT_TIMEOUT_MS"))
                .context("SOCKD_CONNECT_TIMEOUT_MS must be an integer (milliseconds).")?
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
        );
        let handshake_timeout = millis(
            parse(get("SOCKD_HANDSHAKE_TIMEOUT_MS"))
                .context("SOCKD_HANDSHAKE_TIMEOUT_MS must be an integer (milliseconds).")?
                .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT_MS),
        );

        let log_level = get("SOCKD_LOG_LEVEL").unwrap_or_else(|| "info".to_string());
        let log_format = parse(get("SOCKD_LOG_FORMAT"))
            .context("SOCKD_LOG_FORMAT must be json or compact.")?
            .unwrap_or_default();

        Ok(Self {
            listener: ListenerConfig::new(bind_host, bind_port),
            session: SessionConfig {
                credentials,
                retry: RetryPolicy::default(),
                connect_timeout,
                handshake_timeout,
            },
            log_level,
            log_format,
            partial_credentials,
        })
    }

    pub fn auth_enabled(&self) -> bool {
        self.session.credentials.is_some()
    }
}

fn parse<T>(value: Option<String>) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Into<anyhow::Error>,
{
    value
        .map(|v| v.trim().parse::<T>().map_err(Into::into))
        .transpose()
}

/// `0` disables the timeout.
fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}
