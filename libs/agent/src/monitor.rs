//! Monitoring agent installer and launcher.
//!
//! Two agent generations are supported:
//! - v1: driven by a `config.yaml` written next to the binary
//! - legacy: driven by command-line flags, selected when an agent port is set

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use futures_util::StreamExt;
use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::AgentBootstrap;

/// Ports on which the dashboard is expected to speak TLS.
pub const TLS_PORTS: [&str; 6] = ["443", "8443", "2096", "2087", "2083", "2053"];

/// Name of the v1 config file inside the install directory.
pub const CONFIG_FILE: &str = "config.yaml";

/// CPU architecture of the agent build to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    Arm64,
    Amd64,
}

impl Arch {
    /// Architecture of the running host.
    pub fn detect() -> Self {
        Self::from_target(std::env::consts::ARCH)
    }

    /// Map a Rust target arch name; anything not ARM gets the amd64 build.
    pub fn from_target(arch: &str) -> Self {
        match arch {
            "arm" | "aarch64" => Arch::Arm64,
            _ => Arch::Amd64,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::Arm64 => "arm64",
            Arch::Amd64 => "amd64",
        }
    }
}

/// Agent generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    V1,
    Legacy,
}

impl Mode {
    /// Value substituted for `{mode}` in the download URL.
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::V1 => "v1",
            Mode::Legacy => "agent",
        }
    }
}

/// Program and arguments ready to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub program: PathBuf,
    pub args: Vec<String>,
}

/// Downloads and starts the monitoring agent.
pub struct MonitoringAgent {
    config: AgentConfig,
    arch: Arch,
    http: reqwest::Client,
}

impl MonitoringAgent {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            arch: Arch::detect(),
            http: reqwest::Client::new(),
        }
    }

    /// Override the detected architecture.
    pub fn with_arch(mut self, arch: Arch) -> Self {
        self.arch = arch;
        self
    }

    pub fn mode(&self) -> Mode {
        if self.config.port.is_some() {
            Mode::Legacy
        } else {
            Mode::V1
        }
    }

    /// Whether the dashboard connection uses TLS.
    ///
    /// v1 looks at the port suffix of the server address; legacy mode at the
    /// agent port.
    pub fn tls(&self) -> bool {
        let port = match self.mode() {
            Mode::V1 => self
                .config
                .server
                .as_deref()
                .and_then(|s| s.rsplit_once(':'))
                .map(|(_, port)| port),
            Mode::Legacy => self.config.port.as_deref(),
        };
        port.is_some_and(|p| TLS_PORTS.contains(&p))
    }

    /// Download URL with placeholders filled in.
    pub fn download_url(&self) -> Result<String, AgentError> {
        let template = self
            .config
            .download_url
            .as_deref()
            .ok_or(AgentError::NotConfigured("download url"))?;
        Ok(template
            .replace("{arch}", self.arch.as_str())
            .replace("{mode}", self.mode().as_str()))
    }

    /// Render the v1 config file.
    pub fn render_config(&self, uuid: &str) -> String {
        let server = self.config.server.as_deref().unwrap_or_default();
        let key = self.config.key.as_deref().unwrap_or_default();

        format!(
            "client_secret: {key}\n\
             server: {server}\n\
             uuid: {uuid}\n\
             tls: {tls}\n\
             report_delay: 4\n\
             skip_connection_count: true\n\
             skip_procs_count: true\n\
             disable_auto_update: true\n\
             disable_command_execute: false\n\
             disable_force_update: true\n\
             disable_nat: false\n\
             disable_send_query: false\n\
             debug: false\n\
             temperature: false\n\
             gpu: false\n\
             use_gitee_to_upgrade: false\n\
             use_ipv6_country_code: false\n\
             insecure_tls: true\n",
            tls = self.tls(),
        )
    }

    /// Arguments for the given binary.
    pub fn launch_args(&self, config_path: &Path) -> Vec<String> {
        match self.mode() {
            Mode::V1 => vec!["-c".to_string(), config_path.display().to_string()],
            Mode::Legacy => {
                let server = self.config.server.as_deref().unwrap_or_default();
                let port = self.config.port.as_deref().unwrap_or_default();
                let key = self.config.key.as_deref().unwrap_or_default();

                let mut args = vec![
                    "-s".to_string(),
                    format!("{}:{}", server, port),
                    "-p".to_string(),
                    key.to_string(),
                ];
                if self.tls() {
                    args.push("--tls".to_string());
                }
                args.extend(
                    [
                        "--disable-auto-update",
                        "--report-delay",
                        "4",
                        "--skip-conn",
                        "--skip-procs",
                    ]
                    .map(String::from),
                );
                args
            }
        }
    }

    /// Download the binary and write its config, without starting it.
    pub async fn prepare(&self) -> Result<LaunchPlan, AgentError> {
        if !self.config.is_enabled() {
            return Err(AgentError::NotConfigured("server and key"));
        }
        let url = self.download_url()?;

        let dir = &self.config.install_dir;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| AgentError::install(format!("create {}", dir.display()), e))?;

        let program = dir.join(random_name());
        download(&self.http, &url, &program).await?;
        debug!(url = %url, path = %program.display(), "Agent binary downloaded");

        let config_path = dir.join(CONFIG_FILE);
        if self.mode() == Mode::V1 {
            let uuid = self
                .config
                .uuid
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            tokio::fs::write(&config_path, self.render_config(&uuid))
                .await
                .map_err(|e| AgentError::install(format!("write {}", config_path.display()), e))?;
        }

        Ok(LaunchPlan {
            args: self.launch_args(&config_path),
            program,
        })
    }
}

#[async_trait]
impl AgentBootstrap for MonitoringAgent {
    fn name(&self) -> &str {
        "monitoring-agent"
    }

    async fn launch(&self) -> Result<(), AgentError> {
        let plan = self.prepare().await?;

        let mut command = Command::new(&plan.program);
        command
            .args(&plan.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        command.process_group(0);

        // Not awaited: the agent outlives the launch.
        let child = command.spawn().map_err(AgentError::Spawn)?;
        info!(
            pid = child.id(),
            mode = self.mode().as_str(),
            arch = self.arch.as_str(),
            "Monitoring agent started"
        );
        Ok(())
    }
}

/// Random lowercase file name for the downloaded binary.
fn random_name() -> String {
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::rng();
    (0..6)
        .map(|_| CHARS[rng.random_range(0..CHARS.len())] as char)
        .collect()
}

/// Stream `url` into `dest` and mark it executable.
async fn download(http: &reqwest::Client, url: &str, dest: &Path) -> Result<(), AgentError> {
    let response = http.get(url).send().await?.error_for_status()?;

    let mut file = tokio::fs::File::create(dest)
        .await
        .map_err(|e| AgentError::install(format!("create {}", dest.display()), e))?;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        file.write_all(&chunk?)
            .await
            .map_err(|e| AgentError::install(format!("write {}", dest.display()), e))?;
    }
    file.flush()
        .await
        .map_err(|e| AgentError::install(format!("flush {}", dest.display()), e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(dest, std::fs::Permissions::from_mode(0o755))
            .await
            .map_err(|e| AgentError::install(format!("chmod {}", dest.display()), e))?;
    }

    Ok(())
}
