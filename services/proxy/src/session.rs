//! Per-connection session driver.
//!
//! Owns the client socket, feeds bytes into [`sockd_proto::Session`] and
//! carries out each [`Step`]: replies, dialing, relaying.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use sockd_proto::{Credentials, Event, Session, Step, Target};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::config::SessionConfig;
use crate::dialer::{Connector, Dialer, TcpConnector};
use crate::error::{DialError, SessionError};
use crate::relay::{relay, RelayOutcome};
use crate::stats::ProxyStats;

/// Client bytes buffered while the target is being dialed.
const MAX_PENDING: usize = 64 * 1024;

/// Runs SOCKS5 sessions.
pub struct SessionHandler<C = TcpConnector> {
    credentials: Option<Credentials>,
    handshake_timeout: Option<Duration>,
    dialer: Dialer<C>,
    stats: Arc<ProxyStats>,
}

impl SessionHandler<TcpConnector> {
    pub fn new(config: &SessionConfig, stats: Arc<ProxyStats>) -> Self {
        Self::with_connector(config, TcpConnector::new(config.connect_timeout), stats)
    }
}

impl<C: Connector> SessionHandler<C> {
    pub fn with_connector(config: &SessionConfig, connector: C, stats: Arc<ProxyStats>) -> Self {
        Self {
            credentials: config.credentials.clone(),
            handshake_timeout: config.handshake_timeout,
            dialer: Dialer::new(connector, config.retry),
            stats,
        }
    }

    pub fn auth_enabled(&self) -> bool {
        self.credentials.is_some()
    }

    /// Run a session until it ends or `shutdown` turns true.
    pub async fn run<S>(
        &self,
        client: S,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<RelayOutcome, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        tokio::select! {
            result = self.handle(client) => result,
            _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => Err(SessionError::Shutdown),
        }
    }

    /// Negotiate, dial and relay.
    pub async fn handle<S>(&self, mut client: S) -> Result<RelayOutcome, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut session = Session::new(self.credentials.as_ref());
        let mut buf: Vec<u8> = Vec::with_capacity(512);
        let deadline = self.handshake_timeout.map(|limit| Instant::now() + limit);

        let target = loop {
            match session.handle(Event::Received(&buf)) {
                Step::NeedMore => {
                    let n = read_more(&mut client, &mut buf, deadline).await?;
                    if n == 0 {
                        let step = session.handle(Event::Eof);
                        return Err(self.finish(&mut client, step).await);
                    }
                }
                Step::Reply { bytes, consumed } => {
                    client.write_all(&bytes).await?;
                    buf.drain(..consumed);
                }
                Step::Dial { target, consumed } => {
                    buf.drain(..consumed);
                    break target;
                }
                step => return Err(self.finish(&mut client, step).await),
            }
        };

        debug!(target = %target, "Dialing target");
        let dialed = self
            .dialer
            .dial(&target, client_hangup(&mut client, &mut buf))
            .await;

        let mut upstream = match dialed {
            Ok(dialed) => {
                self.stats
                    .dial_attempts
                    .fetch_add(u64::from(dialed.attempts), Ordering::Relaxed);
                dialed.stream
            }
            Err(e) => {
                self.stats
                    .dial_attempts
                    .fetch_add(u64::from(e.attempts()), Ordering::Relaxed);
                let event = match e {
                    DialError::Exhausted { .. } => Event::DialFailed,
                    DialError::ClientGone { .. } => Event::Eof,
                };
                let step = session.handle(event);
                let _ = self.finish(&mut client, step).await;
                return Err(e.into());
            }
        };

        match session.handle(Event::DialSucceeded) {
            Step::Relay { bytes } => client.write_all(&bytes).await?,
            step => return Err(self.finish(&mut client, step).await),
        }
        if !buf.is_empty() {
            upstream.write_all(&buf).await?;
        }
        self.stats.relays_established.fetch_add(1, Ordering::Relaxed);
        debug!(target = %target, early_bytes = buf.len(), "Relaying");

        let mut outcome = relay(client, upstream).await;
        outcome.bytes_to_target += buf.len() as u64;
        self.record_relay(&target, &outcome);
        Ok(outcome)
    }

    /// Perform a terminal step and turn it into the session error.
    async fn finish<S>(&self, client: &mut S, step: Step) -> SessionError
    where
        S: AsyncWrite + Unpin,
    {
        let reason = match step {
            Step::ReplyAndClose { bytes, reason } => {
                if let Err(e) = client.write_all(&bytes).await {
                    debug!(error = %e, "Failed to send final reply");
                }
                let _ = client.shutdown().await;
                reason
            }
            Step::Close { reason } => reason,
            other => {
                debug!(step = ?other, "Unexpected step");
                sockd_proto::Rejection::OutOfOrder
            }
        };
        self.stats.record_rejection(reason.kind());
        debug!(reason = %reason, "Session rejected");
        reason.into()
    }

    fn record_relay(&self, target: &Target, outcome: &RelayOutcome) {
        self.stats
            .bytes_to_target
            .fetch_add(outcome.bytes_to_target, Ordering::Relaxed);
        self.stats
            .bytes_to_client
            .fetch_add(outcome.bytes_to_client, Ordering::Relaxed);

        match &outcome.error {
            Some(e) => debug!(
                target = %target,
                closed_by = %outcome.closed_by,
                error = %e,
                bytes_to_target = outcome.bytes_to_target,
                bytes_to_client = outcome.bytes_to_client,
                "Relay ended with error"
            ),
            None => debug!(
                target = %target,
                closed_by = %outcome.closed_by,
                bytes_to_target = outcome.bytes_to_target,
                bytes_to_client = outcome.bytes_to_client,
                "Relay closed"
            ),
        }
    }
}

/// Read into `buf`, honouring the negotiation deadline.
async fn read_more<S>(
    client: &mut S,
    buf: &mut Vec<u8>,
    deadline: Option<Instant>,
) -> Result<usize, SessionError>
where
    S: AsyncRead + Unpin,
{
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, client.read_buf(buf))
            .await
            .map_err(|_| SessionError::HandshakeTimeout)?
            .map_err(SessionError::from),
        None => Ok(client.read_buf(buf).await?),
    }
}

/// Resolves once the client has closed or failed.
///
/// Early bytes are collected into `pending` for the relay, up to a cap.
async fn client_hangup<S>(client: &mut S, pending: &mut Vec<u8>)
where
    S: AsyncRead + Unpin,
{
    loop {
        if pending.len() >= MAX_PENDING {
            std::future::pending::<()>().await;
        }
        match client.read_buf(pending).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialer::RetryPolicy;
    use async_trait::async_trait;
    use sockd_proto::wire::{encode_connect, encode_greeting, encode_user_pass};
    use sockd_proto::TargetAddr;
    use std::io;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;
    use tokio::io::{duplex, DuplexStream};

    const SUCCESS: [u8; 10] = [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];

    /// Hands out pre-built in-memory targets, or refuses when empty.
    #[derive(Default)]
    struct MemoryConnector {
        targets: Mutex<Vec<DuplexStream>>,
        dialed: Mutex<Vec<Target>>,
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        type Stream = DuplexStream;

        async fn connect(&self, target: &Target) -> io::Result<DuplexStream> {
            self.dialed.lock().unwrap().push(target.clone());
            self.targets
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionRefused))
        }
    }

    fn handler(
        credentials: Option<Credentials>,
        connector: MemoryConnector,
    ) -> (Arc<SessionHandler<MemoryConnector>>, Arc<ProxyStats>) {
        let stats = Arc::new(ProxyStats::default());
        let config = SessionConfig {
            credentials,
            retry: RetryPolicy {
                max_attempts: 4,
                step: Duration::from_millis(10),
            },
            connect_timeout: None,
            handshake_timeout: Some(Duration::from_secs(5)),
        };
        let handler = SessionHandler::with_connector(&config, connector, Arc::clone(&stats));
        (Arc::new(handler), stats)
    }

    fn target() -> Target {
        Target::new(TargetAddr::Ipv4(Ipv4Addr::new(10, 0, 0, 1)), 80)
    }

    #[tokio::test]
    async fn test_no_auth_connect_and_relay() {
        let (proxy_target, mut remote) = duplex(1024);
        let connector = MemoryConnector::default();
        connector.targets.lock().unwrap().push(proxy_target);
        let (handler, stats) = handler(None, connector);

        let (mut client, proxy_client) = duplex(1024);
        let task = tokio::spawn({
            let handler = Arc::clone(&handler);
            async move { handler.handle(proxy_client).await }
        });

        client.write_all(&encode_greeting(&[0x00])).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);

        let mut request = encode_connect(&target());
        request.extend_from_slice(b"hello");
        client.write_all(&request).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, SUCCESS);

        // Optimistic bytes reach the target first.
        let mut early = [0u8; 5];
        remote.read_exact(&mut early).await.unwrap();
        assert_eq!(&early, b"hello");

        remote.write_all(b"world").await.unwrap();
        let mut back = [0u8; 5];
        client.read_exact(&mut back).await.unwrap();
        assert_eq!(&back, b"world");

        drop(client);
        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome.bytes_to_target, 5);
        assert_eq!(outcome.bytes_to_client, 5);
        assert_eq!(stats.snapshot().relays_established, 1);
        assert_eq!(handler.dialer.policy().max_attempts, 4);
    }

    #[tokio::test]
    async fn test_pipelined_negotiation() {
        let (proxy_target, _remote) = duplex(1024);
        let connector = MemoryConnector::default();
        connector.targets.lock().unwrap().push(proxy_target);
        let creds = Credentials::from_parts("admin", "secure123").unwrap();
        let (handler, _stats) = handler(creds, connector);

        let (mut client, proxy_client) = duplex(1024);
        let task = tokio::spawn(async move { handler.handle(proxy_client).await });

        // Everything in one write.
        let mut all = encode_greeting(&[0x02]);
        all.extend(encode_user_pass(b"admin", b"secure123"));
        all.extend(encode_connect(&target()));
        client.write_all(&all).await.unwrap();

        let mut replies = [0u8; 14];
        client.read_exact(&mut replies).await.unwrap();
        assert_eq!(&replies[..2], &[0x05, 0x02]);
        assert_eq!(&replies[2..4], &[0x01, 0x00]);
        assert_eq!(&replies[4..], &SUCCESS);

        drop(client);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_wrong_password_counts_auth_failure() {
        let creds = Credentials::from_parts("admin", "secure123").unwrap();
        let (handler, stats) = handler(creds, MemoryConnector::default());

        let (mut client, proxy_client) = duplex(1024);
        let task = tokio::spawn(async move { handler.handle(proxy_client).await });

        client.write_all(&encode_greeting(&[0x02])).await.unwrap();
        client
            .write_all(&encode_user_pass(b"admin", b"secure124"))
            .await
            .unwrap();

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, vec![0x05, 0x02, 0x01, 0x01]);

        assert!(matches!(task.await.unwrap(), Err(SessionError::Auth)));
        assert_eq!(stats.snapshot().auth_failures, 1);
    }

    #[tokio::test]
    async fn test_unreachable_target_replies_04() {
        let connector = MemoryConnector::default();
        let (handler, stats) = handler(None, connector);

        let (mut client, proxy_client) = duplex(1024);
        let task = tokio::spawn({
            let handler = Arc::clone(&handler);
            async move { handler.handle(proxy_client).await }
        });

        client.write_all(&encode_greeting(&[0x00])).await.unwrap();
        client.write_all(&encode_connect(&target())).await.unwrap();

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(
            received,
            vec![0x05, 0x00, 0x05, 0x04, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
        );

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.reason_code(), "host_unreachable");
        assert_eq!(handler.dialer.connector().dialed.lock().unwrap().len(), 4);

        let snap = stats.snapshot();
        assert_eq!(snap.dial_attempts, 4);
        assert_eq!(snap.dial_failures, 1);
    }

    #[tokio::test]
    async fn test_client_leaving_during_dial_stops_retries() {
        let (handler, _stats) = handler(None, MemoryConnector::default());

        let (mut client, proxy_client) = duplex(1024);
        let task = tokio::spawn({
            let handler = Arc::clone(&handler);
            async move { handler.handle(proxy_client).await }
        });

        client.write_all(&encode_greeting(&[0x00])).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        client.write_all(&encode_connect(&target())).await.unwrap();
        drop(client);

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::Dial(DialError::ClientGone { .. })));
        assert!(handler.dialer.connector().dialed.lock().unwrap().len() < 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_deadline_closes_silently() {
        let (handler, _stats) = handler(None, MemoryConnector::default());

        let (mut client, proxy_client) = duplex(1024);
        let task = tokio::spawn(async move { handler.handle(proxy_client).await });

        client.write_all(&[0x05]).await.unwrap();
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::HandshakeTimeout));
    }

    #[tokio::test]
    async fn test_shutdown_ends_session() {
        let (handler, _stats) = handler(None, MemoryConnector::default());
        let (tx, rx) = watch::channel(false);

        let (_client, proxy_client) = duplex(1024);
        let task = tokio::spawn(async move { handler.run(proxy_client, rx).await });

        tx.send(true).unwrap();
        assert!(matches!(
            task.await.unwrap(),
            Err(SessionError::Shutdown)
        ));
    }
}
