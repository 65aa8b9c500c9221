//! Heartbeat tests -- relay probes and the poller's idle watchdog.

use std::time::Duration;

use fieldlink_node::poller::PollerExit;
use fieldlink_protocol::Frame;
use tokio::net::TcpListener;

use crate::harness::{poller_settings, relay_settings, TestLink, TestRelay};

/// A silent upstream produces `04 FE 00 00` about once per interval.
#[tokio::test]
async fn test_heartbeats_while_upstream_silent() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = upstream.local_addr().unwrap().to_string();
    let mut relay = TestRelay::start(relay_settings(&addr, Duration::from_millis(200)))
        .await
        .unwrap();
    let (_server_side, _) = upstream.accept().await.unwrap();
    relay.wait_linked().await.unwrap();

    let frames = relay.device.collect(Duration::from_secs(1)).await;
    assert!(frames.len() >= 3, "only {} heartbeats", frames.len());
    assert!(frames.len() <= 12, "{} heartbeats", frames.len());
    for frame in &frames {
        assert_eq!(frame.as_bytes(), &[0x04, 0xFE, 0x00, 0x00]);
    }
    assert_eq!(frames[0], Frame::heartbeat());

    relay.stop().await;
}

/// Heartbeats alone keep a poller alive while the server is mute.
#[tokio::test]
async fn test_heartbeats_keep_poller_alive() {
    let link = TestLink::start(
        false,
        Duration::from_millis(200),
        poller_settings(Duration::from_millis(300), Duration::from_millis(800)),
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(!link.poller_finished());
    assert_eq!(link.poller.pack_id.get(), 0);
    assert_eq!(link.stop().await, PollerExit::Cancelled);
}
