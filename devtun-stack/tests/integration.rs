//! End-to-end tests: two virtual interfaces bridged by an in-memory
//! packet wire, talking real TCP through their userspace stacks.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

use devtun_protocol::transport::mock::MockDuplex;
use devtun_stack::{
    proxy, Error, IfaceConfig, TunnelStream, VirtualInterface, KEEPALIVE_IDLE, KEEPALIVE_INTERVAL,
};

const MTU: usize = 1280;

/// Opt-in diagnostics: `RUST_LOG=devtun_stack=trace cargo test`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn addr_a() -> IpAddr {
    "fd00::1".parse().unwrap()
}

fn addr_b() -> IpAddr {
    "fd00::2".parse().unwrap()
}

/// Two interfaces wired back to back, as if each end of the byte
/// stream sat on its own host.
fn bridged_pair() -> (VirtualInterface, VirtualInterface) {
    init_tracing();
    let (wire_a, wire_b) = MockDuplex::create_pair();
    let a = VirtualInterface::init(IfaceConfig::new(addr_a(), 64).with_mtu(MTU), wire_a).unwrap();
    let b = VirtualInterface::init(IfaceConfig::new(addr_b(), 64).with_mtu(MTU), wire_b).unwrap();
    (a, b)
}

async fn echo(mut stream: TunnelStream) {
    let mut buf = [0u8; 4096];
    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if stream.write_all(&buf[..n]).await.is_err() {
            break;
        }
    }
    let _ = stream.shutdown().await;
}

#[tokio::test]
async fn test_connect_and_exchange() {
    let (a, b) = bridged_pair();

    let accepted = tokio::spawn(async move {
        let stream = b.accept(7000).await.unwrap();
        echo(stream).await;
        b
    });

    let mut stream = timeout(Duration::from_secs(5), a.connect(addr_b(), 7000))
        .await
        .expect("connect timed out")
        .unwrap();
    assert_eq!(stream.remote_addr(), addr_b());
    assert_eq!(stream.remote_port(), 7000);

    stream.write_all(b"hello through the tunnel").await.unwrap();
    let mut buf = [0u8; 64];
    let n = timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("read timed out")
        .unwrap();
    assert_eq!(&buf[..n], b"hello through the tunnel");

    stream.shutdown().await.unwrap();
    // Echo task ends once it sees our close.
    let b = timeout(Duration::from_secs(5), accepted).await.unwrap().unwrap();

    a.close();
    b.close();
}

#[tokio::test]
async fn test_keepalive_visible_on_established_connection() {
    let (a, b) = bridged_pair();

    let accepted = tokio::spawn(async move {
        let stream = b.accept(7001).await.unwrap();
        (b, stream)
    });

    let stream = timeout(Duration::from_secs(5), a.connect(addr_b(), 7001))
        .await
        .expect("connect timed out")
        .unwrap();

    let (idle, interval) = stream.keepalive().expect("keep-alive must be enabled");
    assert_eq!(idle, KEEPALIVE_IDLE);
    assert_eq!(interval, KEEPALIVE_INTERVAL);
    assert_eq!(idle, Duration::from_secs(30));
    assert_eq!(interval, Duration::from_secs(1));

    let (b, remote) = accepted.await.unwrap();
    let (idle, interval) = remote.keepalive().expect("keep-alive on the accepted end too");
    assert_eq!(idle, Duration::from_secs(30));
    assert_eq!(interval, Duration::from_secs(1));

    a.close();
    b.close();
}

#[tokio::test]
async fn test_connect_refused_without_listener() {
    let (a, b) = bridged_pair();

    let err = timeout(Duration::from_secs(5), a.connect(addr_b(), 9999))
        .await
        .expect("refused connect must not hang")
        .unwrap_err();
    assert!(matches!(err, Error::Connect { port: 9999, .. }), "got {err:?}");

    a.close();
    b.close();
}

#[tokio::test]
async fn test_local_port_bind_and_conflict() {
    let (a, b) = bridged_pair();
    let a = Arc::new(a);

    let accepted = tokio::spawn(async move {
        let first = b.accept(7002).await.unwrap();
        (b, first)
    });

    let stream = timeout(
        Duration::from_secs(5),
        a.connect_from(40000, addr_b(), 7002),
    )
    .await
    .expect("connect timed out")
    .unwrap();
    let (b, remote) = accepted.await.unwrap();
    assert_eq!(remote.remote_port(), 40000, "peer must see the bound port");

    // Same local port again while the first connection is alive.
    let err = a
        .connect_from(40000, addr_b(), 7003)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Bind { port: 40000 }), "got {err:?}");

    drop(stream);
    drop(remote);
    a.close();
    b.close();
}

#[tokio::test]
async fn test_concurrent_connects_leave_interface_intact() {
    let (a, b) = bridged_pair();
    let a = Arc::new(a);
    let b = Arc::new(b);

    let nic_id = a.nic_id();
    let address = a.address();

    let mut acceptors = Vec::new();
    for i in 0..8u16 {
        let b = b.clone();
        acceptors.push(tokio::spawn(async move {
            let stream = b.accept(7100 + i).await.unwrap();
            echo(stream).await;
        }));
    }

    let mut connectors = Vec::new();
    for i in 0..8u16 {
        let a = a.clone();
        connectors.push(tokio::spawn(async move {
            let mut stream = a.connect(addr_b(), 7100 + i).await.unwrap();
            let message = format!("stream {i}");
            stream.write_all(message.as_bytes()).await.unwrap();
            let mut buf = [0u8; 32];
            let n = stream.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], message.as_bytes());
            stream.shutdown().await.unwrap();
        }));
    }

    for task in connectors {
        timeout(Duration::from_secs(10), task)
            .await
            .expect("connector timed out")
            .unwrap();
    }
    for task in acceptors {
        timeout(Duration::from_secs(10), task)
            .await
            .expect("acceptor timed out")
            .unwrap();
    }

    assert_eq!(a.nic_id(), nic_id);
    assert_eq!(a.address(), address);

    a.close();
    b.close();
}

#[tokio::test]
async fn test_connect_and_proxy_bridges_local_stream() {
    let (a, b) = bridged_pair();

    let accepted = tokio::spawn(async move {
        let stream = b.accept(7200).await.unwrap();
        echo(stream).await;
        b
    });

    let (mut client, proxy_end) = MockDuplex::create_pair();
    let capture = proxy_end.capture();
    let session = tokio::spawn(async move {
        let result = a.connect_and_proxy(0, addr_b(), 7200, proxy_end).await;
        (a, result)
    });

    client.write_all(b"proxied payload").await.unwrap();
    let mut buf = [0u8; 64];
    let n = timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("echo through proxy timed out")
        .unwrap();
    assert_eq!(&buf[..n], b"proxied payload");

    client.shutdown().await.unwrap();
    let (a, result) = timeout(Duration::from_secs(5), session)
        .await
        .expect("proxy session did not finish")
        .unwrap();
    result.unwrap();
    assert_eq!(capture.shutdown_count(), 1, "local stream closed exactly once");

    let b = accepted.await.unwrap();
    a.close();
    b.close();
}

#[tokio::test]
async fn test_connect_and_proxy_closes_local_on_connect_failure() {
    let (a, b) = bridged_pair();

    let (_client, proxy_end) = MockDuplex::create_pair();
    let capture = proxy_end.capture();

    // Nobody listens on this port; the connect is refused.
    let err = timeout(
        Duration::from_secs(5),
        a.connect_and_proxy(0, addr_b(), 9998, proxy_end),
    )
    .await
    .expect("must not hang")
    .unwrap_err();
    assert!(matches!(err, Error::Connect { .. }), "got {err:?}");
    assert_eq!(capture.shutdown_count(), 1, "local stream closed on failure too");

    a.close();
    b.close();
}

#[tokio::test]
async fn test_close_unblocks_blocked_read() {
    let (a, b) = bridged_pair();

    let accepted = tokio::spawn(async move {
        let stream = b.accept(7300).await.unwrap();
        (b, stream)
    });

    let mut stream = timeout(Duration::from_secs(5), a.connect(addr_b(), 7300))
        .await
        .expect("connect timed out")
        .unwrap();
    let (b, _remote) = accepted.await.unwrap();

    let reader = tokio::spawn(async move {
        let mut buf = [0u8; 16];
        stream.read(&mut buf).await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    a.close();
    let result = timeout(Duration::from_secs(1), reader)
        .await
        .expect("close must unblock the reader")
        .unwrap();
    assert!(result.is_err(), "aborted connection reads as an error");

    a.close();
    b.close();
}

#[tokio::test]
async fn test_close_unblocks_pending_accept() {
    let (a, b) = bridged_pair();
    let b = Arc::new(b);

    let waiting = {
        let b = b.clone();
        tokio::spawn(async move { b.accept(7400).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    b.close();
    let result = timeout(Duration::from_secs(1), waiting)
        .await
        .expect("close must unblock accept")
        .unwrap();
    assert!(result.is_err());

    a.close();
}

#[tokio::test]
async fn test_wire_loss_fails_connections() {
    let (wire_a, wire_b) = MockDuplex::create_pair();
    let a = VirtualInterface::init(IfaceConfig::new(addr_a(), 64).with_mtu(MTU), wire_a).unwrap();
    let b = VirtualInterface::init(IfaceConfig::new(addr_b(), 64).with_mtu(MTU), wire_b).unwrap();

    let accepted = tokio::spawn(async move {
        let stream = b.accept(7500).await.unwrap();
        (b, stream)
    });
    let mut stream = timeout(Duration::from_secs(5), a.connect(addr_b(), 7500))
        .await
        .expect("connect timed out")
        .unwrap();
    let (b, _remote) = accepted.await.unwrap();

    // Kill the wire from the far side.
    b.close();

    let mut buf = [0u8; 16];
    let result = timeout(Duration::from_secs(1), stream.read(&mut buf))
        .await
        .expect("wire loss must unblock the reader");
    // Either an aborted read or a clean EOF, but never a hang.
    drop(result);

    // New connects on the dead wire fail instead of hanging.
    let err = timeout(Duration::from_secs(5), a.connect(addr_b(), 7501))
        .await
        .expect("connect on dead wire must not hang");
    assert!(err.is_err());

    a.close();
}

#[tokio::test]
async fn test_proxy_between_two_tunnel_streams() {
    // The generic proxy also bridges two tunnel connections.
    let (a, b) = bridged_pair();
    let a = Arc::new(a);
    let b = Arc::new(b);

    let upstream_echo = {
        let b = b.clone();
        tokio::spawn(async move {
            let stream = b.accept(7600).await.unwrap();
            echo(stream).await;
        })
    };
    let relay_accept = {
        let b = b.clone();
        tokio::spawn(async move { b.accept(7601).await.unwrap() })
    };

    let to_relay = a.connect(addr_b(), 7601).await.unwrap();
    let relay_in = relay_accept.await.unwrap();
    let relay_out = a.connect(addr_b(), 7600).await.unwrap();

    // relay: b:7601 <-> a <-> b:7600 (echo)
    let relay = tokio::spawn(proxy(relay_in, relay_out));

    let mut stream = to_relay;
    stream.write_all(b"via relay").await.unwrap();
    let mut buf = [0u8; 32];
    let n = timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("relayed echo timed out")
        .unwrap();
    assert_eq!(&buf[..n], b"via relay");

    stream.shutdown().await.unwrap();
    timeout(Duration::from_secs(5), relay)
        .await
        .expect("relay did not finish")
        .unwrap()
        .unwrap();
    upstream_echo.await.unwrap();

    a.close();
    b.close();
}
