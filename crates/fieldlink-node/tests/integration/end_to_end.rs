//! End-to-end tests -- polls crossing the relay to the server and back.

use std::time::Duration;

use fieldlink_node::poller::PollerExit;
use fieldlink_protocol::Frame;
use tokio::io::AsyncWriteExt;

use crate::harness::{
    poller_settings, relay_settings, wait_until, TestLink, TestRelay, TestServer, QUIET,
};

/// `06 01 00 00 00 00` comes back as `06 11 00 00 00 00`.
#[tokio::test]
async fn test_poll_is_acked_through_relay() {
    let server = TestServer::start(true).await.unwrap();
    let mut relay = TestRelay::start(relay_settings(&server.addr, QUIET)).await.unwrap();
    relay.wait_linked().await.unwrap();

    relay
        .device
        .get_mut()
        .write_all(&[0x06, 0x01, 0x00, 0x00, 0x00, 0x00])
        .await
        .unwrap();
    let ack = relay.device.expect_frame().await;
    assert_eq!(ack.as_bytes(), &[0x06, 0x11, 0x00, 0x00, 0x00, 0x00]);

    relay.device.get_mut().write_all(Frame::poll(1).as_bytes()).await.unwrap();
    assert_eq!(relay.device.expect_frame().await, Frame::ack(1));

    assert_eq!(server.status.pack_id.get(), 1);
    assert_eq!(relay.status.pack_id.get(), 1);

    relay.stop().await;
    server.stop().await;
}

/// A poll dribbled onto the serial line one byte at a time still gets through.
#[tokio::test]
async fn test_fragmented_serial_poll() {
    let server = TestServer::start(true).await.unwrap();
    let mut relay = TestRelay::start(relay_settings(&server.addr, QUIET)).await.unwrap();
    relay.wait_linked().await.unwrap();

    for byte in Frame::poll(0x0102).as_bytes() {
        relay.device.get_mut().write_all(&[*byte]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(relay.device.expect_frame().await, Frame::ack(0x0102));
    assert_eq!(server.status.pack_id.get(), 0x0102);

    relay.stop().await;
    server.stop().await;
}

/// With respond off the server records the pack-id but stays silent.
#[tokio::test]
async fn test_respond_toggle() {
    let server = TestServer::start(false).await.unwrap();
    let mut relay = TestRelay::start(relay_settings(&server.addr, QUIET)).await.unwrap();
    relay.wait_linked().await.unwrap();

    relay.device.get_mut().write_all(Frame::poll(4).as_bytes()).await.unwrap();
    assert!(relay.device.next_within(Duration::from_millis(300)).await.is_none());
    assert_eq!(server.status.pack_id.get(), 4);

    server.status.respond.set(true);
    relay.device.get_mut().write_all(Frame::poll(4).as_bytes()).await.unwrap();
    assert_eq!(relay.device.expect_frame().await, Frame::ack(4));

    relay.stop().await;
    server.stop().await;
}

/// A real poller walks the sequence forward one ack at a time.
#[tokio::test]
async fn test_poller_advances_over_full_link() {
    let link = TestLink::start(
        true,
        QUIET,
        poller_settings(Duration::from_secs(5), Duration::from_secs(10)),
    )
    .await
    .unwrap();

    let poller = link.poller.clone();
    wait_until(Duration::from_secs(5), "poller to reach pack 5", move || {
        let poller = poller.clone();
        async move { poller.pack_id.get() >= 5 }
    })
    .await
    .unwrap();

    let server_seen = link.server.status.pack_id.get();
    assert!(server_seen >= 4, "server saw pack {server_seen}");
    assert!(!link.poller_finished());
    assert_eq!(link.stop().await, PollerExit::Cancelled);
}

/// When the server stops answering, the poller repeats the same pack-id.
#[tokio::test]
async fn test_poller_retries_while_server_silent() {
    let link = TestLink::start(
        false,
        QUIET,
        poller_settings(Duration::from_millis(200), Duration::from_secs(10)),
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(link.poller.pack_id.get(), 0);
    assert_eq!(link.server.status.pack_id.get(), 0);

    link.server.status.respond.set(true);
    let poller = link.poller.clone();
    wait_until(Duration::from_secs(5), "poller to advance after retry", move || {
        let poller = poller.clone();
        async move { poller.pack_id.get() >= 1 }
    })
    .await
    .unwrap();

    link.stop().await;
}
