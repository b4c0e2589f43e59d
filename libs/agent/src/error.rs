//! Agent bootstrap errors.

use std::io;

use thiserror::Error;

/// Errors raised while installing or launching the agent.
///
/// None of these are fatal to the proxy; the caller only logs them.
#[derive(Debug, Error)]
pub enum AgentError {
    /// A required setting is missing, so the agent is skipped.
    #[error("agent not configured: {0}")]
    NotConfigured(&'static str),

    /// The agent binary could not be fetched.
    #[error("download failed: {0}")]
    Download(#[from] reqwest::Error),

    /// Writing the binary or its config failed.
    #[error("install failed: {context}: {source}")]
    Install {
        context: String,
        #[source]
        source: io::Error,
    },

    /// The agent process could not be started.
    #[error("spawn failed: {0}")]
    Spawn(#[source] io::Error),
}

impl AgentError {
    pub(crate) fn install(context: impl Into<String>, source: io::Error) -> Self {
        AgentError::Install {
            context: context.into(),
            source,
        }
    }

    /// Stable snake_case code for logs.
    pub fn reason_code(&self) -> &'static str {
        match self {
            AgentError::NotConfigured(_) => "not_configured",
            AgentError::Download(_) => "download_failed",
            AgentError::Install { .. } => "install_failed",
            AgentError::Spawn(_) => "spawn_failed",
        }
    }
}
