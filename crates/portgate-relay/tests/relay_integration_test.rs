//! End-to-end relay tests
//!
//! Every test runs a real `RelayServer` on 127.0.0.1:0 in front of a mock
//! upstream listener and drives it with plain TCP clients.

use async_trait::async_trait;
use portgate_config::Endpoint;
use portgate_relay::{
    bind_listener, ConnectError, PumpOptions, RelayMetrics, RelayServer, RelayServerConfig,
    TcpConnector, UpstreamConnector,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

const WAIT: Duration = Duration::from_secs(5);

fn server_config(max_sessions: usize) -> RelayServerConfig {
    RelayServerConfig {
        max_sessions,
        pump: PumpOptions {
            idle_tick: Duration::from_millis(100),
            ..PumpOptions::default()
        },
    }
}

/// Start a relay in front of `connector`; returns its address and metrics
async fn start_relay<C: UpstreamConnector>(
    connector: C,
    max_sessions: usize,
) -> (SocketAddr, Arc<RelayMetrics>) {
    let listener = bind_listener(&Endpoint::new("127.0.0.1", 0)).await.unwrap();
    let server = RelayServer::new(listener, connector, server_config(max_sessions));
    let addr = server.local_addr().unwrap();
    let metrics = server.metrics();
    tokio::spawn(server.run());
    (addr, metrics)
}

/// Bind a mock upstream and a connector pointing at it
async fn mock_upstream() -> (TcpListener, TcpConnector) {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = upstream.local_addr().unwrap().port();
    let connector = TcpConnector::new(Endpoint::new("127.0.0.1", port), WAIT);
    (upstream, connector)
}

/// A port with nothing listening on it
async fn dead_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// True once the relay has closed (or reset) the client connection
async fn closed_by_relay(client: &mut TcpStream) -> bool {
    let mut buf = [0u8; 1];
    matches!(
        tokio::time::timeout(WAIT, client.read(&mut buf)).await,
        Ok(Ok(0)) | Ok(Err(_))
    )
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Fails the first `failures` attempts, then connects to `target`
struct FlakyConnector {
    target: TcpConnector,
    failures: usize,
    attempts: AtomicUsize,
}

#[async_trait]
impl UpstreamConnector for FlakyConnector {
    async fn connect(&self) -> Result<TcpStream, ConnectError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err(ConnectError::ConnectionFailed {
                address: self.target.target(),
                source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
            });
        }
        self.target.connect().await
    }

    fn target(&self) -> String {
        self.target.target()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[tokio::test]
async fn test_query_and_reply_are_relayed() {
    let (upstream, connector) = mock_upstream().await;
    let (relay_addr, metrics) = start_relay(connector, 4).await;

    let upstream_task = tokio::spawn(async move {
        let (mut socket, _) = upstream.accept().await.unwrap();
        let mut query = [0u8; 8];
        socket.read_exact(&mut query).await.unwrap();
        socket.write_all(&[0x01, 0x02, 0x03, 0x04]).await.unwrap();
        query
    });

    let mut client = TcpStream::connect(relay_addr).await.unwrap();
    client.write_all(b"SELECT 1").await.unwrap();

    let mut reply = [0u8; 4];
    tokio::time::timeout(WAIT, client.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, [0x01, 0x02, 0x03, 0x04]);

    let query = upstream_task.await.unwrap();
    assert_eq!(&query, b"SELECT 1");

    drop(client);
    wait_for(|| {
        let snapshot = metrics.snapshot();
        snapshot.completed == 1 && snapshot.active == 0
    })
    .await;
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.bytes_to_upstream, 8);
    assert_eq!(snapshot.bytes_to_client, 4);
}

#[tokio::test]
async fn test_upstream_down_closes_client_and_keeps_accepting() {
    let port = dead_port().await;
    let connector = TcpConnector::new(Endpoint::new("127.0.0.1", port), WAIT);
    let (relay_addr, metrics) = start_relay(connector, 1).await;

    let mut first = TcpStream::connect(relay_addr).await.unwrap();
    assert!(closed_by_relay(&mut first).await);

    // The accept loop is still alive after the failure
    let mut second = TcpStream::connect(relay_addr).await.unwrap();
    assert!(closed_by_relay(&mut second).await);

    wait_for(|| metrics.snapshot().upstream_failures == 2).await;
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.accepted, 2);
    assert_eq!(snapshot.completed, 0);
    assert_eq!(snapshot.active, 0);
}

#[tokio::test]
async fn test_failed_connect_does_not_block_next_session() {
    let (upstream, target) = mock_upstream().await;
    let connector = FlakyConnector {
        target,
        failures: 1,
        attempts: AtomicUsize::new(0),
    };
    let (relay_addr, metrics) = start_relay(connector, 1).await;

    let mut rejected = TcpStream::connect(relay_addr).await.unwrap();
    assert!(closed_by_relay(&mut rejected).await);

    let mut client = TcpStream::connect(relay_addr).await.unwrap();
    let (mut socket, _) = tokio::time::timeout(WAIT, upstream.accept())
        .await
        .unwrap()
        .unwrap();

    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    socket.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    assert_eq!(metrics.snapshot().upstream_failures, 1);
}

#[tokio::test]
async fn test_one_mebibyte_burst_reaches_upstream_intact() {
    let (upstream, connector) = mock_upstream().await;
    let (relay_addr, _metrics) = start_relay(connector, 4).await;

    let payload: Vec<u8> = (0..1_048_576u32).map(|i| (i * 7 % 256) as u8).collect();
    let expected = payload.clone();

    let upstream_task = tokio::spawn(async move {
        let (mut socket, _) = upstream.accept().await.unwrap();
        let mut received = vec![0u8; 1_048_576];
        socket.read_exact(&mut received).await.unwrap();
        received
    });

    let mut client = TcpStream::connect(relay_addr).await.unwrap();
    client.write_all(&payload).await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(10), upstream_task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.len(), expected.len());
    assert!(received == expected);
}

#[tokio::test]
async fn test_client_eof_tears_down_pair() {
    let (upstream, connector) = mock_upstream().await;
    let (relay_addr, metrics) = start_relay(connector, 4).await;

    let mut client = TcpStream::connect(relay_addr).await.unwrap();
    let (mut socket, _) = tokio::time::timeout(WAIT, upstream.accept())
        .await
        .unwrap()
        .unwrap();

    client.shutdown().await.unwrap();

    // Upstream sees EOF even though it never closed its side
    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(WAIT, socket.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);

    // And the client socket was released as well
    assert!(closed_by_relay(&mut client).await);
    wait_for(|| metrics.snapshot().completed == 1).await;
}

#[tokio::test]
async fn test_idle_session_is_not_dropped() {
    let (upstream, connector) = mock_upstream().await;
    let (relay_addr, metrics) = start_relay(connector, 4).await;

    let mut client = TcpStream::connect(relay_addr).await.unwrap();
    let (mut socket, _) = tokio::time::timeout(WAIT, upstream.accept())
        .await
        .unwrap()
        .unwrap();

    // Several idle ticks (100ms each) pass without traffic
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(metrics.snapshot().active, 1);
    assert_eq!(metrics.snapshot().completed, 0);

    socket.write_all(b"late").await.unwrap();
    let mut buf = [0u8; 4];
    tokio::time::timeout(WAIT, client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"late");
}

#[tokio::test]
async fn test_sequential_mode_serves_one_pair_at_a_time() {
    let (upstream, connector) = mock_upstream().await;
    let (relay_addr, _metrics) = start_relay(connector, 1).await;

    let first = TcpStream::connect(relay_addr).await.unwrap();
    let (_first_upstream, _) = tokio::time::timeout(WAIT, upstream.accept())
        .await
        .unwrap()
        .unwrap();

    // The second client completes its TCP handshake via the backlog, but the
    // relay does not accept it while the first pair is alive
    let mut second = TcpStream::connect(relay_addr).await.unwrap();
    let pending = tokio::time::timeout(Duration::from_millis(300), upstream.accept()).await;
    assert!(pending.is_err(), "second session started too early");

    drop(first);

    let (mut second_upstream, _) = tokio::time::timeout(WAIT, upstream.accept())
        .await
        .unwrap()
        .unwrap();
    second.write_all(b"next").await.unwrap();
    let mut buf = [0u8; 4];
    second_upstream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"next");
}

#[tokio::test]
async fn test_concurrent_sessions_are_isolated() {
    let (upstream, connector) = mock_upstream().await;
    let (relay_addr, metrics) = start_relay(connector, 8).await;

    let mut first = TcpStream::connect(relay_addr).await.unwrap();
    let (first_upstream, _) = tokio::time::timeout(WAIT, upstream.accept())
        .await
        .unwrap()
        .unwrap();
    let mut second = TcpStream::connect(relay_addr).await.unwrap();
    let (mut second_upstream, _) = tokio::time::timeout(WAIT, upstream.accept())
        .await
        .unwrap()
        .unwrap();

    // Breaking the first pair leaves the second untouched
    drop(first_upstream);
    assert!(closed_by_relay(&mut first).await);

    second.write_all(b"alive").await.unwrap();
    let mut buf = [0u8; 5];
    second_upstream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"alive");

    wait_for(|| {
        let snapshot = metrics.snapshot();
        snapshot.completed == 1 && snapshot.active == 1
    })
    .await;
}

#[tokio::test]
async fn test_run_until_stops_accepting() {
    let (_upstream, connector) = mock_upstream().await;
    let listener = bind_listener(&Endpoint::new("127.0.0.1", 0)).await.unwrap();
    let server = RelayServer::new(listener, connector, server_config(4));

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server_task = tokio::spawn(server.run_until(async {
        let _ = stop_rx.await;
    }));

    stop_tx.send(()).unwrap();
    let result = tokio::time::timeout(WAIT, server_task).await.unwrap().unwrap();
    assert!(result.is_ok());
}
