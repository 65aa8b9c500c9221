//! Test harness for in-process fieldlink integration tests.
//!
//! Provides TestServer, TestRelay (with the poller end of its serial cable
//! exposed as a raw stream) and TestPoller, all running in the test's tokio
//! runtime over loopback TCP and in-memory serial pairs.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use fieldlink_node::poller::{Poller, PollerExit, PollerSettings};
use fieldlink_node::relay::{Relay, RelayHandle, RelaySettings};
use fieldlink_node::serial::VirtualPort;
use fieldlink_node::server::{Server, ServerExit, ServerSettings};
use fieldlink_node::status::{PollerStatus, RelayStatus, ServerStatus};
use fieldlink_protocol::{Frame, ReassemblyBuffer};
use tokio::io::{AsyncRead, AsyncReadExt, DuplexStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Heartbeat threshold that keeps probes out of a test's way.
pub const QUIET: Duration = Duration::from_secs(60);

/// Poll `check` every 20ms until it holds, or fail after `timeout`.
pub async fn wait_until<F, Fut>(
    timeout: Duration,
    what: &str,
    mut check: F,
) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return Ok(());
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("timeout waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Reads whole frames off a raw byte stream.
pub struct FrameReader<R> {
    inner: R,
    reassembly: ReassemblyBuffer,
}

#[allow(dead_code)]
impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            reassembly: ReassemblyBuffer::new(),
        }
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Next frame within `timeout`. `None` on timeout or end of stream.
    pub async fn next_within(&mut self, timeout: Duration) -> Option<Frame> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut chunk = [0u8; 256];
        loop {
            if let Some(frame) = self.reassembly.next_frame() {
                return Some(frame);
            }
            match tokio::time::timeout_at(deadline, self.inner.read(&mut chunk)).await {
                Ok(Ok(n)) if n > 0 => self.reassembly.extend(&chunk[..n]),
                _ => return None,
            }
        }
    }

    /// Next frame, failing the test after five seconds.
    pub async fn expect_frame(&mut self) -> Frame {
        self.next_within(Duration::from_secs(5))
            .await
            .expect("timed out waiting for a frame")
    }

    /// Every frame arriving within `window`.
    pub async fn collect(&mut self, window: Duration) -> Vec<Frame> {
        let deadline = tokio::time::Instant::now() + window;
        let mut frames = Vec::new();
        loop {
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            match self.next_within(left).await {
                Some(frame) => frames.push(frame),
                None => return frames,
            }
        }
    }
}

/// A running server on an ephemeral loopback port.
pub struct TestServer {
    pub addr: String,
    pub status: ServerStatus,
    cancel: CancellationToken,
    handle: JoinHandle<ServerExit>,
}

#[allow(dead_code)]
impl TestServer {
    pub async fn start(respond: bool) -> anyhow::Result<Self> {
        let settings = ServerSettings {
            listen_addr: "127.0.0.1:0".into(),
            ..ServerSettings::default()
        };
        let status = ServerStatus::new(respond);
        let server = Server::bind(settings, status.clone()).await?;
        let addr = server.local_addr()?.to_string();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(server.run(cancel.clone()));
        Ok(Self {
            addr,
            status,
            cancel,
            handle,
        })
    }

    /// Wait for the server to stop on its own.
    pub async fn join(self, timeout: Duration) -> anyhow::Result<ServerExit> {
        Ok(tokio::time::timeout(timeout, self.handle).await??)
    }

    pub async fn stop(self) -> ServerExit {
        self.cancel.cancel();
        self.handle.await.unwrap_or(ServerExit::Cancelled)
    }
}

pub fn relay_settings(server_addr: &str, heartbeat_threshold: Duration) -> RelaySettings {
    RelaySettings {
        server_addr: server_addr.to_string(),
        connect_timeout: Duration::from_secs(1),
        reconnect_interval: Duration::from_millis(50),
        heartbeat_threshold,
        heartbeat_interval: Duration::from_millis(100),
    }
}

/// A running relay whose serial peer is driven by the test.
pub struct TestRelay {
    pub handle: RelayHandle,
    pub status: RelayStatus,
    /// The far end of the relay's serial cable, where a poller would sit.
    pub device: FrameReader<DuplexStream>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

#[allow(dead_code)]
impl TestRelay {
    pub async fn start(settings: RelaySettings) -> anyhow::Result<Self> {
        let (relay_end, poller_end) = VirtualPort::pair("COM25", "COM52");
        let device = poller_end
            .take()
            .ok_or_else(|| anyhow::anyhow!("poller end already taken"))?;
        let status = RelayStatus::default();
        let relay = Relay::new(settings, Arc::new(relay_end), status.clone());
        let handle = relay.handle();
        let cancel = CancellationToken::new();
        let join = tokio::spawn(relay.run(cancel.clone()));
        Ok(Self {
            handle,
            status,
            device: FrameReader::new(device),
            cancel,
            join,
        })
    }

    /// Wait for both the server link and the serial port to come up.
    pub async fn wait_linked(&self) -> anyhow::Result<()> {
        let handle = self.handle.clone();
        wait_until(Duration::from_secs(5), "relay links", move || {
            let handle = handle.clone();
            async move { handle.tcp_connected().await && handle.serial_open().await }
        })
        .await
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.join.await;
    }
}

pub fn poller_settings(response_timeout: Duration, message_timeout: Duration) -> PollerSettings {
    PollerSettings {
        response_timeout,
        message_timeout,
        reopen_interval: Duration::from_millis(50),
        watch_interval: Duration::from_millis(50),
    }
}

/// Server, relay and poller joined over loopback TCP and a virtual cable.
pub struct TestLink {
    pub server: TestServer,
    pub relay: RelayHandle,
    pub poller: PollerStatus,
    cancel: CancellationToken,
    relay_join: JoinHandle<()>,
    poller_join: JoinHandle<PollerExit>,
}

#[allow(dead_code)]
impl TestLink {
    pub async fn start(
        respond: bool,
        heartbeat_threshold: Duration,
        poller: PollerSettings,
    ) -> anyhow::Result<Self> {
        let server = TestServer::start(respond).await?;
        let (relay_end, poller_end) = VirtualPort::pair("COM25", "COM52");
        let cancel = CancellationToken::new();

        let relay = Relay::new(
            relay_settings(&server.addr, heartbeat_threshold),
            Arc::new(relay_end),
            RelayStatus::default(),
        );
        let relay_handle = relay.handle();
        let relay_join = tokio::spawn(relay.run(cancel.clone()));

        let linked = relay_handle.clone();
        wait_until(Duration::from_secs(5), "relay links", move || {
            let linked = linked.clone();
            async move { linked.tcp_connected().await && linked.serial_open().await }
        })
        .await?;

        let poller_status = PollerStatus::default();
        let poller = Poller::new(poller, Arc::new(poller_end), poller_status.clone());
        let poller_join = tokio::spawn(poller.run(cancel.clone()));

        Ok(Self {
            server,
            relay: relay_handle,
            poller: poller_status,
            cancel,
            relay_join,
            poller_join,
        })
    }

    pub fn poller_finished(&self) -> bool {
        self.poller_join.is_finished()
    }

    /// Cancel relay and poller, then the server. Returns the poller's exit.
    pub async fn stop(self) -> PollerExit {
        self.cancel.cancel();
        let exit = self.poller_join.await.unwrap_or(PollerExit::Cancelled);
        let _ = self.relay_join.await;
        self.server.stop().await;
        exit
    }
}
