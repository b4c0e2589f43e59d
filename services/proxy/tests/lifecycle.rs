//! Listener supervision and process shutdown.


use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use harness::{closed_port, open_tunnel, wait_listening, EchoBackend, ProxyHandle};

#[tokio::test]
async fn test_restart_keeps_port_and_serves() {
    let backend = EchoBackend::spawn().await.unwrap();
    let proxy = ProxyHandle::spawn(None).await;

    let status = proxy.control.restart().await.unwrap();
    assert!(!status.listening);

    // Rebinds after the 100ms restart delay.
    let rebound = wait_listening(&proxy.control, Duration::from_secs(2)).await;
    assert_eq!(rebound, Some(proxy.addr));

    let mut stream = open_tunnel(proxy.addr, &backend.target()).await.unwrap();
    stream.write_all(b"after restart").await.unwrap();
    let mut echoed = [0u8; 13];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"after restart");

    drop(stream);
    let snapshot = proxy.stop().await;
    assert_eq!(snapshot.listener_restarts, 1);
}

#[tokio::test]
async fn test_probe_revives_stopped_listener() {
    let proxy = ProxyHandle::spawn(None).await;

    let status = proxy.control.stop().await.unwrap();
    assert!(!status.listening);
    assert!(TcpStream::connect(proxy.addr).await.is_err());

    // Probe interval is 250ms.
    let revived = wait_listening(&proxy.control, Duration::from_secs(2)).await;
    assert_eq!(revived, Some(proxy.addr));
    assert!(TcpStream::connect(proxy.addr).await.is_ok());
}

#[tokio::test]
async fn test_shutdown_closes_open_tunnels() {
    let backend = EchoBackend::spawn().await.unwrap();
    let proxy = ProxyHandle::spawn(None).await;
    let addr = proxy.addr;

    let mut stream = open_tunnel(addr, &backend.target()).await.unwrap();

    let started = Instant::now();
    let snapshot = proxy.stop().await;
    // Grace is 300ms.
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(snapshot.sessions_accepted, 1);

    let mut buf = [0u8; 8];
    let read = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
    assert!(TcpStream::connect(addr).await.is_err());
}

#[cfg(unix)]
#[tokio::test]
async fn test_sigterm_stops_binary() {
    let port = closed_port().await;
    let mut child = Command::new(env!("CARGO_BIN_EXE_sockd"))
        .env_clear()
        .env("SOCKD_HOST", "127.0.0.1")
        .env("SOCKD_PORT", port.to_string())
        .env("SOCKD_LOG_LEVEL", "off")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    let addr = format!("127.0.0.1:{port}");
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut ready = false;
    while Instant::now() < deadline {
        if TcpStream::connect(&addr).await.is_ok() {
            ready = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    if !ready {
        let _ = child.kill();
        panic!("sockd did not start listening on {addr}");
    }

    let pid = child.id() as libc::pid_t;
    // SAFETY: `pid` is a child we spawned and have not reaped.
    assert_eq!(unsafe { libc::kill(pid, libc::SIGTERM) }, 0);

    let deadline = Instant::now() + Duration::from_secs(3);
    let status = loop {
        if let Some(status) = child.try_wait().unwrap() {
            break status;
        }
        if Instant::now() > deadline {
            let _ = child.kill();
            panic!("sockd did not exit after SIGTERM");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    };
    assert!(status.success());
    assert!(TcpStream::connect(&addr).await.is_err());
}
