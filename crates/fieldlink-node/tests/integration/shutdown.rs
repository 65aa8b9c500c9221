//! Shutdown tests -- the relay's one-way latch and the server's exit.

use std::time::Duration;

use fieldlink_node::relay::ShutdownError;
use fieldlink_node::server::ServerExit;
use fieldlink_protocol::Frame;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::harness::{relay_settings, FrameReader, TestRelay, TestServer, QUIET};

#[tokio::test]
async fn test_relay_shutdown_stops_server() {
    let server = TestServer::start(true).await.unwrap();
    let relay = TestRelay::start(relay_settings(&server.addr, QUIET)).await.unwrap();
    relay.wait_linked().await.unwrap();

    relay.handle.send_shutdown().await.unwrap();
    assert!(relay.handle.shutdown_sent());

    let exit = server.join(Duration::from_secs(5)).await.unwrap();
    assert_eq!(exit, ServerExit::ShutdownRequested);

    assert_eq!(
        relay.handle.send_shutdown().await,
        Err(ShutdownError::AlreadySent)
    );
    relay.stop().await;
}

/// After the latch nothing crosses the relay in either direction.
#[tokio::test]
async fn test_nothing_forwarded_after_shutdown() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = upstream.local_addr().unwrap().to_string();
    let mut relay = TestRelay::start(relay_settings(&addr, QUIET)).await.unwrap();
    let (server_side, _) = upstream.accept().await.unwrap();
    relay.wait_linked().await.unwrap();
    let mut server_side = FrameReader::new(server_side);

    relay.handle.send_shutdown().await.unwrap();
    assert_eq!(server_side.expect_frame().await, Frame::shutdown());

    // Serial port is closed by the latch; the poller end sees the hangup.
    let mut rest = Vec::new();
    let read = tokio::time::timeout(
        Duration::from_secs(5),
        relay.device.get_mut().read_to_end(&mut rest),
    )
    .await
    .expect("serial end should hang up");
    assert!(read.is_ok());
    assert!(rest.is_empty());

    // Upstream traffic is swallowed and the port stays closed.
    server_side.get_mut().write_all(Frame::ack(0).as_bytes()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!relay.handle.serial_open().await);
    assert!(relay.handle.tcp_connected().await);

    relay.stop().await;
}

#[tokio::test]
async fn test_shutdown_needs_server_link() {
    let closed = {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        probe.local_addr().unwrap().to_string()
    };
    let relay = TestRelay::start(relay_settings(&closed, QUIET)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        relay.handle.send_shutdown().await,
        Err(ShutdownError::NotConnected)
    );
    assert!(!relay.handle.shutdown_sent());
    relay.stop().await;
}
