//! Listener supervisor.
//!
//! The [`Supervisor`] exclusively owns the listening socket. It:
//! - binds and runs the accept loop as its own task
//! - rebinds after a fixed delay when that task ends unexpectedly
//! - probes periodically and rebinds at once if the listener is missing
//! - on shutdown stops accepting and drains sessions for a grace period
//!
//! ```text
//!            start()                    accept task exits
//!   Down ─────────────► Listening ───────────────────────► Down + restart_at
//!    ▲  ◄───── stop() ──────┘                                   │
//!    └──────────── restart delay elapsed / probe tick ──────────┘
//! ```

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn, Instrument};

use crate::config::ListenerConfig;
use crate::dialer::{Connector, TcpConnector};
use crate::error::ListenerError;
use crate::session::SessionHandler;
use crate::stats::{ProxyStats, StatsSnapshot};

/// Back-off after descriptor exhaustion in the accept loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Poll interval while draining sessions.
const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Control mailbox capacity.
const CONTROL_CAPACITY: usize = 16;

/// Listener state as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerStatus {
    pub listening: bool,
    pub local_addr: Option<SocketAddr>,
}

type Ack = oneshot::Sender<ListenerStatus>;

#[derive(Debug)]
enum Control {
    Start(Ack),
    Stop(Ack),
    Restart(Ack),
    Status(Ack),
    Shutdown,
}

/// Cloneable handle for driving a running [`Supervisor`].
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<Control>,
}

impl SupervisorHandle {
    /// Bind now if not listening.
    pub async fn start(&self) -> Option<ListenerStatus> {
        self.request(Control::Start).await
    }

    /// Close the listener. The probe will bring it back.
    pub async fn stop(&self) -> Option<ListenerStatus> {
        self.request(Control::Stop).await
    }

    /// Close the listener and rebind after the restart delay.
    pub async fn restart(&self) -> Option<ListenerStatus> {
        self.request(Control::Restart).await
    }

    pub async fn status(&self) -> Option<ListenerStatus> {
        self.request(Control::Status).await
    }

    /// Ask the supervisor to shut down.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Control::Shutdown).await;
    }

    async fn request(&self, make: fn(Ack) -> Control) -> Option<ListenerStatus> {
        let (ack, rx) = oneshot::channel();
        self.tx.send(make(ack)).await.ok()?;
        rx.await.ok()
    }
}

struct ActiveListener {
    local_addr: SocketAddr,
    task: JoinHandle<io::Result<()>>,
}

enum Wake {
    Shutdown,
    Control(Control),
    ListenerExited(Result<io::Result<()>, JoinError>),
    Probe,
    Restart,
}

/// Owns the listening socket and its restart policy.
pub struct Supervisor<C = TcpConnector> {
    config: ListenerConfig,
    handler: Arc<SessionHandler<C>>,
    stats: Arc<ProxyStats>,
    listener: Option<ActiveListener>,
    /// Port of the first successful bind, reused by every restart.
    bound_port: Option<u16>,
    restart_at: Option<Instant>,
    binds: u64,
    control_tx: mpsc::Sender<Control>,
    control_rx: mpsc::Receiver<Control>,
    shutdown_tx: watch::Sender<bool>,
}

impl<C: Connector> Supervisor<C> {
    pub fn new(
        config: ListenerConfig,
        handler: Arc<SessionHandler<C>>,
        stats: Arc<ProxyStats>,
    ) -> Self {
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            handler,
            stats,
            listener: None,
            bound_port: None,
            restart_at: None,
            binds: 0,
            control_tx,
            control_rx,
            shutdown_tx,
        }
    }

    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            tx: self.control_tx.clone(),
        }
    }

    /// Whether the accept task is alive.
    pub fn is_listening(&self) -> bool {
        self.listener
            .as_ref()
            .is_some_and(|active| !active.task.is_finished())
    }

    pub fn status(&self) -> ListenerStatus {
        let listening = self.is_listening();
        ListenerStatus {
            listening,
            local_addr: self
                .listener
                .as_ref()
                .filter(|_| listening)
                .map(|active| active.local_addr),
        }
    }

    /// Bind and start accepting. No-op while already listening.
    pub async fn start(&mut self) -> Result<SocketAddr, ListenerError> {
        if let Some(active) = &self.listener {
            if !active.task.is_finished() {
                return Ok(active.local_addr);
            }
        }
        self.listener = None;
        self.restart_at = None;

        let port = self.bound_port.unwrap_or(self.config.bind_port);
        let addr = format!("{}:{}", self.config.bind_host, port);
        let listener = TcpListener::bind((self.config.bind_host.as_str(), port))
            .await
            .map_err(|source| ListenerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ListenerError::Bind { addr, source })?;

        self.bound_port = Some(local_addr.port());
        self.binds += 1;
        if self.binds > 1 {
            self.stats
                .listener_restarts
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }

        let task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.handler),
            Arc::clone(&self.stats),
            self.shutdown_tx.subscribe(),
        ));
        self.listener = Some(ActiveListener { local_addr, task });

        info!(
            bind_addr = %local_addr,
            auth_enabled = self.handler.auth_enabled(),
            "Listener up"
        );
        Ok(local_addr)
    }

    /// Close the listener. Safe when already stopped.
    pub async fn stop(&mut self) {
        self.restart_at = None;
        if let Some(active) = self.listener.take() {
            active.task.abort();
            // Wait for the socket to be dropped so the port can be rebound.
            let _ = active.task.await;
            info!(bind_addr = %active.local_addr, "Listener stopped");
        }
    }

    /// Stop, then rebind after the restart delay.
    pub async fn restart(&mut self) {
        self.stop().await;
        self.schedule_restart();
    }

    fn schedule_restart(&mut self) {
        let delay = self.config.restart_delay;
        self.restart_at = Some(Instant::now() + delay);
        info!(delay_ms = delay.as_millis() as u64, "Restart scheduled");
    }

    /// Start, scheduling a retry on failure.
    async fn try_start(&mut self) {
        if let Err(e) = self.start().await {
            error!(error = %e, reason_code = e.reason_code(), "Listener failed to start");
            self.schedule_restart();
        }
    }

    /// Supervise until `shutdown` resolves or a handle requests shutdown.
    pub async fn run<F>(mut self, shutdown: F) -> StatsSnapshot
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        self.try_start().await;

        let period = self.config.probe_interval;
        let mut probe = tokio::time::interval_at(Instant::now() + period, period);
        probe.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let wake = tokio::select! {
                _ = &mut shutdown => Wake::Shutdown,
                msg = self.control_rx.recv() => match msg {
                    Some(msg) => Wake::Control(msg),
                    None => Wake::Shutdown,
                },
                result = listener_exit(&mut self.listener) => Wake::ListenerExited(result),
                _ = probe.tick() => Wake::Probe,
                _ = restart_due(self.restart_at) => Wake::Restart,
            };

            match wake {
                Wake::Shutdown => break,
                Wake::Control(Control::Shutdown) => {
                    info!("Shutdown requested");
                    break;
                }
                Wake::Control(Control::Start(ack)) => {
                    self.try_start().await;
                    let _ = ack.send(self.status());
                }
                Wake::Control(Control::Stop(ack)) => {
                    self.stop().await;
                    let _ = ack.send(self.status());
                }
                Wake::Control(Control::Restart(ack)) => {
                    self.restart().await;
                    let _ = ack.send(self.status());
                }
                Wake::Control(Control::Status(ack)) => {
                    let _ = ack.send(self.status());
                }
                Wake::ListenerExited(result) => {
                    let addr = self.listener.take().map(|active| active.local_addr);
                    let err = match result {
                        Ok(Ok(())) => ListenerError::Crashed("accept loop returned".to_string()),
                        Ok(Err(e)) => ListenerError::Accept(e),
                        Err(e) => ListenerError::Crashed(e.to_string()),
                    };
                    error!(
                        bind_addr = ?addr,
                        error = %err,
                        reason_code = err.reason_code(),
                        "Listener down"
                    );
                    self.schedule_restart();
                }
                Wake::Probe => {
                    if !self.is_listening() {
                        warn!("Probe found listener down, rebinding");
                        self.try_start().await;
                    } else {
                        debug!("Probe ok");
                    }
                }
                Wake::Restart => {
                    self.restart_at = None;
                    self.try_start().await;
                }
            }
        }

        self.shutdown().await;
        self.stats.snapshot()
    }

    /// Stop accepting, drain sessions for the grace period, then cut the rest.
    async fn shutdown(&mut self) {
        info!(
            active_sessions = self.stats.active_sessions(),
            grace_ms = self.config.shutdown_grace.as_millis() as u64,
            "Shutting down"
        );
        self.stop().await;

        let deadline = Instant::now() + self.config.shutdown_grace;
        while self.stats.active_sessions() > 0 && Instant::now() < deadline {
            tokio::time::sleep(DRAIN_POLL).await;
        }

        let remaining = self.stats.active_sessions();
        if remaining > 0 {
            warn!(remaining, "Closing sessions still running after grace period");
        }
        self.shutdown_tx.send_replace(true);
        tokio::task::yield_now().await;

        let stats = self.stats.snapshot();
        info!(
            sessions_accepted = stats.sessions_accepted,
            relays_established = stats.relays_established,
            auth_failures = stats.auth_failures,
            dial_failures = stats.dial_failures,
            bytes_to_target = stats.bytes_to_target,
            bytes_to_client = stats.bytes_to_client,
            listener_restarts = stats.listener_restarts,
            "Shutdown complete"
        );
    }
}

async fn listener_exit(listener: &mut Option<ActiveListener>) -> Result<io::Result<()>, JoinError> {
    match listener {
        Some(active) => (&mut active.task).await,
        None => std::future::pending().await,
    }
}

async fn restart_due(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// What to do after a failed `accept`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptFailure {
    /// Only this connection is affected.
    Skip,
    /// Out of descriptors; wait and try again.
    Backoff,
    /// The listener itself is broken.
    Fatal,
}

fn classify_accept_error(e: &io::Error) -> AcceptFailure {
    match e.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock => return AcceptFailure::Skip,
        _ => {}
    }
    match e.raw_os_error() {
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM) => {
            AcceptFailure::Backoff
        }
        _ => AcceptFailure::Fatal,
    }
}

async fn accept_loop<C: Connector>(
    listener: TcpListener,
    handler: Arc<SessionHandler<C>>,
    stats: Arc<ProxyStats>,
    shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let guard = stats.open_session();
                let _ = stream.set_nodelay(true);
                let handler = Arc::clone(&handler);
                let shutdown = shutdown.clone();

                tokio::spawn(
                    async move {
                        debug!("Session started");
                        match handler.run(stream, shutdown).await {
                            Ok(outcome) => debug!(
                                bytes_to_target = outcome.bytes_to_target,
                                bytes_to_client = outcome.bytes_to_client,
                                "Session closed"
                            ),
                            Err(e) => debug!(
                                error = %e,
                                reason_code = e.reason_code(),
                                "Session ended"
                            ),
                        }
                        drop(guard);
                    }
                    .instrument(tracing::info_span!("session", peer = %peer_addr)),
                );
            }
            Err(e) => match classify_accept_error(&e) {
                AcceptFailure::Skip => debug!(error = %e, "Accept skipped"),
                AcceptFailure::Backoff => {
                    warn!(error = %e, "Accept failed, backing off");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
                AcceptFailure::Fatal => return Err(e),
            },
        }
    }
}
