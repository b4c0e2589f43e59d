//! Termination signals.

use std::future::Future;

use tracing::{info, warn};

/// Resolves on SIGTERM or SIGINT.
///
/// Handlers are installed when this is called, not when the future is first
/// polled, so a signal that arrives while the listener is binding is not lost.
#[cfg(unix)]
pub fn shutdown_signal() -> impl Future<Output = ()> {
    use tokio::signal::unix::{signal, SignalKind};

    let handlers = (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    );

    async move {
        let (mut term, mut int) = match handlers {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "Failed to install signal handlers, falling back to ctrl-c");
                ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = term.recv() => info!(signal = "SIGTERM", "Received shutdown signal"),
            _ = int.recv() => info!(signal = "SIGINT", "Received shutdown signal"),
        }
    }
}

/// Resolves on ctrl-c.
#[cfg(not(unix))]
pub fn shutdown_signal() -> impl Future<Output = ()> {
    ctrl_c()
}

async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!(signal = "ctrl-c", "Received shutdown signal"),
        Err(e) => {
            warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    }
}
