//! Optional external monitoring agent for sockd.
//!
//! The proxy only knows the [`AgentBootstrap`] interface: launch once,
//! best-effort, never block and never fail the caller.

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub mod config;
pub mod error;
pub mod monitor;

pub use config::AgentConfig;
pub use error::AgentError;
pub use monitor::{Arch, LaunchPlan, Mode, MonitoringAgent};

/// Something that installs and starts an external agent.
#[async_trait]
pub trait AgentBootstrap: Send + Sync {
    /// Name for logging.
    fn name(&self) -> &str;

    /// Install and start the agent. Must not wait for it to exit.
    async fn launch(&self) -> Result<(), AgentError>;
}

/// Launch `bootstrap` on its own task and log the outcome.
///
/// The returned handle may be dropped; errors never reach the caller.
pub fn spawn_best_effort<B>(bootstrap: B) -> JoinHandle<()>
where
    B: AgentBootstrap + 'static,
{
    tokio::spawn(async move {
        let name = bootstrap.name().to_string();
        match bootstrap.launch().await {
            Ok(()) => info!(agent = %name, "Agent launched"),
            Err(e @ AgentError::NotConfigured(_)) => {
                debug!(agent = %name, reason = %e, "Agent skipped")
            }
            Err(e) => warn!(
                agent = %name,
                error = %e,
                reason_code = e.reason_code(),
                "Agent launch failed"
            ),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingBootstrap {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl AgentBootstrap for CountingBootstrap {
        fn name(&self) -> &str {
            "counting"
        }

        async fn launch(&self) -> Result<(), AgentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(AgentError::Spawn(std::io::Error::other("boom")))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_spawn_best_effort_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        spawn_best_effort(CountingBootstrap {
            calls: Arc::clone(&calls),
            fail: false,
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_spawn_best_effort_swallows_errors() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handle = spawn_best_effort(CountingBootstrap {
            calls: Arc::clone(&calls),
            fail: true,
        });
        assert!(handle.await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
