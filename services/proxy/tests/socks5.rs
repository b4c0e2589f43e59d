//! End-to-end SOCKS5 negotiation and relay over loopback TCP.


use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use harness::{
    authenticate, closed_port, greet, is_closed, open_tunnel, read_reply, request, EchoBackend,
    ProxyHandle, SUCCESS_REPLY,
};
use sockd_proto::wire::encode_connect;
use sockd_proto::{Target, TargetAddr};

const CLOSE_WAIT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn test_no_auth_connect_relays_bytes() {
    let backend = EchoBackend::spawn().await.unwrap();
    let proxy = ProxyHandle::spawn(None).await;

    let mut stream = open_tunnel(proxy.addr, &backend.target()).await.unwrap();

    stream.write_all(b"hello through the tunnel").await.unwrap();
    let mut echoed = [0u8; 24];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"hello through the tunnel");

    drop(stream);
    let snapshot = proxy.stop().await;
    assert_eq!(snapshot.relays_established, 1);
    assert!(snapshot.bytes_to_target >= 24);
}

#[tokio::test]
async fn test_domain_target_resolves() {
    let backend = EchoBackend::spawn().await.unwrap();
    let proxy = ProxyHandle::spawn(None).await;

    let target = Target::new(
        TargetAddr::Domain("localhost".to_string()),
        backend.addr.port(),
    );
    let mut stream = open_tunnel(proxy.addr, &target).await.unwrap();

    stream.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping");
}

#[tokio::test]
async fn test_auth_required_rejects_no_auth_offer() {
    let proxy = ProxyHandle::spawn(Some(("admin", "secure123"))).await;

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    let reply = greet(&mut stream, &[0x00]).await.unwrap();
    assert_eq!(reply, [0x05, 0xFF]);
    assert!(is_closed(&mut stream, CLOSE_WAIT).await);
}

#[tokio::test]
async fn test_auth_success_then_relay() {
    let backend = EchoBackend::spawn().await.unwrap();
    let proxy = ProxyHandle::spawn(Some(("admin", "secure123"))).await;

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    assert_eq!(greet(&mut stream, &[0x00, 0x02]).await.unwrap(), [0x05, 0x02]);
    assert_eq!(
        authenticate(&mut stream, b"admin", b"secure123").await.unwrap(),
        [0x01, 0x00]
    );
    assert_eq!(request(&mut stream, &backend.target()).await.unwrap(), SUCCESS_REPLY);

    stream.write_all(b"authed").await.unwrap();
    let mut echoed = [0u8; 6];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"authed");
}

#[tokio::test]
async fn test_wrong_password_is_rejected_and_closed() {
    let proxy = ProxyHandle::spawn(Some(("admin", "secure123"))).await;

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    assert_eq!(greet(&mut stream, &[0x02]).await.unwrap(), [0x05, 0x02]);
    assert_eq!(
        authenticate(&mut stream, b"admin", b"secure124").await.unwrap(),
        [0x01, 0x01]
    );
    assert!(is_closed(&mut stream, CLOSE_WAIT).await);

    drop(stream);
    let snapshot = proxy.stop().await;
    assert_eq!(snapshot.auth_failures, 1);
    assert_eq!(snapshot.relays_established, 0);
}

#[tokio::test]
async fn test_ipv6_target_is_refused() {
    let proxy = ProxyHandle::spawn(None).await;

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    assert_eq!(greet(&mut stream, &[0x00]).await.unwrap(), [0x05, 0x00]);

    let mut ipv6 = vec![0x05, 0x01, 0x00, 0x04];
    ipv6.extend_from_slice(&[0u8; 15]);
    ipv6.push(1);
    ipv6.extend_from_slice(&443u16.to_be_bytes());
    stream.write_all(&ipv6).await.unwrap();

    let reply = read_reply(&mut stream).await.unwrap();
    assert_eq!(reply, [0x05, 0x08, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    assert!(is_closed(&mut stream, CLOSE_WAIT).await);

    drop(stream);
    let snapshot = proxy.stop().await;
    assert_eq!(snapshot.dial_attempts, 0);
}

#[tokio::test]
async fn test_bind_command_is_unsupported() {
    let proxy = ProxyHandle::spawn(None).await;

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    assert_eq!(greet(&mut stream, &[0x00]).await.unwrap(), [0x05, 0x00]);

    let mut bind = encode_connect(&Target::new(
        TargetAddr::Ipv4(std::net::Ipv4Addr::LOCALHOST),
        80,
    ));
    bind[1] = 0x02;
    stream.write_all(&bind).await.unwrap();

    let reply = read_reply(&mut stream).await.unwrap();
    assert_eq!(reply[1], 0x07);
    assert!(is_closed(&mut stream, CLOSE_WAIT).await);
}

#[tokio::test]
async fn test_unreachable_target_retries_then_fails() {
    let proxy = ProxyHandle::spawn(None).await;
    let target = Target::new(
        TargetAddr::Ipv4(std::net::Ipv4Addr::LOCALHOST),
        closed_port().await,
    );

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    assert_eq!(greet(&mut stream, &[0x00]).await.unwrap(), [0x05, 0x00]);

    let started = Instant::now();
    let reply = request(&mut stream, &target).await.unwrap();
    assert_eq!(reply, [0x05, 0x04, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    // Backoff of 50ms, 100ms and 150ms between the four attempts.
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(is_closed(&mut stream, CLOSE_WAIT).await);

    drop(stream);
    let snapshot = proxy.stop().await;
    assert_eq!(snapshot.dial_attempts, 4);
    assert_eq!(snapshot.dial_failures, 1);
}

#[tokio::test]
async fn test_pipelined_handshake_and_payload() {
    let backend = EchoBackend::spawn().await.unwrap();
    let proxy = ProxyHandle::spawn(None).await;

    let mut burst = vec![0x05, 0x01, 0x00];
    burst.extend_from_slice(&encode_connect(&backend.target()));
    burst.extend_from_slice(b"early");

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    stream.write_all(&burst).await.unwrap();

    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x00]);
    assert_eq!(read_reply(&mut stream).await.unwrap(), SUCCESS_REPLY);

    let mut echoed = [0u8; 5];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"early");
}

#[tokio::test]
async fn test_client_half_close_ends_session() {
    let backend = EchoBackend::spawn().await.unwrap();
    let proxy = ProxyHandle::spawn(None).await;

    let mut stream = open_tunnel(proxy.addr, &backend.target()).await.unwrap();
    stream.shutdown().await.unwrap();
    assert!(is_closed(&mut stream, CLOSE_WAIT).await);

    let deadline = Instant::now() + CLOSE_WAIT;
    while proxy.stats.active_sessions() > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(proxy.stats.active_sessions(), 0);
}
