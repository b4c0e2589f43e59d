//! sockd entry point.
//!
//! Loads configuration from the environment, starts the optional monitoring
//! agent in the background and supervises the SOCKS5 listener until SIGTERM
//! or SIGINT.

use std::process::ExitCode;
use std::sync::Arc;

use sockd_agent::{AgentConfig, MonitoringAgent};
use sockd_proxy::{logging, signal, Config, ProxyStats, SessionHandler, Supervisor};
use tracing::{info, warn};

/// sockd version (semver).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {:#}", e);
            return ExitCode::from(2);
        }
    };

    if let Err(e) = logging::init(&config.log_level, config.log_format) {
        eprintln!("Failed to initialize logging: {:#}", e);
        return ExitCode::from(1);
    }

    info!(
        version = VERSION,
        bind_host = %config.listener.bind_host,
        bind_port = config.listener.bind_port,
        auth_enabled = config.auth_enabled(),
        "sockd starting"
    );
    if config.partial_credentials {
        warn!("Only one of SOCKD_USERNAME and SOCKD_PASSWORD is set; authentication disabled");
    }

    // Fire and forget; the proxy never waits on the agent.
    sockd_agent::spawn_best_effort(MonitoringAgent::new(AgentConfig::from_env()));

    let stats = Arc::new(ProxyStats::default());
    let handler = Arc::new(SessionHandler::new(&config.session, Arc::clone(&stats)));
    let supervisor = Supervisor::new(config.listener.clone(), handler, stats);

    let summary = supervisor.run(signal::shutdown_signal()).await;
    info!(
        sessions_accepted = summary.sessions_accepted,
        sessions_active = summary.sessions_active,
        "sockd exiting"
    );
    ExitCode::SUCCESS
}
