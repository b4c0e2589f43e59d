//! Agent configuration (env-driven).
//!
//! Values are forwarded to the agent as-is; nothing here is validated beyond
//! presence.

use std::path::PathBuf;

/// Default install directory for the downloaded binary and its config.
pub const DEFAULT_INSTALL_DIR: &str = "./tmp";

/// Monitoring agent settings.
#[derive(Clone, Default)]
pub struct AgentConfig {
    /// Dashboard server, `host` or `host:port`.
    pub server: Option<String>,

    /// Legacy agent port. Its presence selects legacy mode.
    pub port: Option<String>,

    /// Client secret.
    pub key: Option<String>,

    /// Instance identifier reported to the dashboard.
    pub uuid: Option<String>,

    /// Where the binary and config are written.
    pub install_dir: PathBuf,

    /// Download URL template with `{arch}` and `{mode}` placeholders.
    pub download_url: Option<String>,
}

impl AgentConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            server: get("SOCKD_AGENT_SERVER"),
            port: get("SOCKD_AGENT_PORT"),
            key: get("SOCKD_AGENT_KEY"),
            uuid: get("SOCKD_AGENT_UUID"),
            install_dir: get("SOCKD_AGENT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_INSTALL_DIR)),
            download_url: get("SOCKD_AGENT_DOWNLOAD_URL"),
        }
    }

    /// The agent runs only when both server and key are set.
    pub fn is_enabled(&self) -> bool {
        self.server.is_some() && self.key.is_some()
    }
}

impl std::fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConfig")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .field("uuid", &self.uuid)
            .field("install_dir", &self.install_dir)
            .field("download_url", &self.download_url)
            .finish()
    }
}
