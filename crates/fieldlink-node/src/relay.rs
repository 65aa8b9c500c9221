//! Relay node -- store-and-forward bridge between a serial port and TCP.
//!
//! Three loops share one `RelayInner`:
//!   1. TCP loop: connect (fixed retry interval), forward every upstream
//!      byte verbatim to the serial side.
//!   2. Serial loop: open (fixed retry interval), reassemble frames, track
//!      pack-id, forward each frame to TCP.
//!   3. Heartbeat loop: probe the poller with `04 FE 00 00` while the
//!      upstream has been silent past the threshold.
//!
//! Each transport's write half is owned by a writer task behind a `LinkSlot`.
//! The shutdown latch is a one-way token: once fired, nothing is forwarded in
//! either direction and the serial port stays closed.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use fieldlink_protocol::{Frame, Message, Payload, ReassemblyBuffer};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::link::{
    run_writer, sleep_or_cancel, watchdog_ticker, ActivityClock, LinkSlot, READ_CHUNK,
};
use crate::serial::SerialOpener;
use crate::status::RelayStatus;

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub server_addr: String,
    pub connect_timeout: Duration,
    /// Wait before reconnecting or reopening after a failure or a dropped link.
    pub reconnect_interval: Duration,
    /// Upstream silence after which heartbeats start.
    pub heartbeat_threshold: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            server_addr: "localhost:12345".into(),
            connect_timeout: Duration::from_secs(5),
            reconnect_interval: Duration::from_secs(5),
            heartbeat_threshold: Duration::from_secs(3),
            heartbeat_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ShutdownError {
    #[error("not connected to the server")]
    NotConnected,
    #[error("shutdown already sent")]
    AlreadySent,
}

struct RelayInner {
    settings: RelaySettings,
    serial: Arc<dyn SerialOpener>,
    status: RelayStatus,
    tcp: LinkSlot,
    port: LinkSlot,
    /// Last byte received from the server.
    upstream: ActivityClock,
    /// Fired once the shutdown frame has been queued.
    latch: CancellationToken,
    shutdown_guard: Mutex<()>,
}

pub struct Relay {
    inner: Arc<RelayInner>,
}

/// Control surface of a running relay.
#[derive(Clone)]
pub struct RelayHandle {
    inner: Arc<RelayInner>,
}

impl Relay {
    pub fn new(settings: RelaySettings, serial: Arc<dyn SerialOpener>, status: RelayStatus) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                settings,
                serial,
                status,
                tcp: LinkSlot::new("tcp"),
                port: LinkSlot::new("serial"),
                upstream: ActivityClock::new(),
                latch: CancellationToken::new(),
                shutdown_guard: Mutex::new(()),
            }),
        }
    }

    pub fn handle(&self) -> RelayHandle {
        RelayHandle {
            inner: self.inner.clone(),
        }
    }

    /// Run all relay loops until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(
            server = %self.inner.settings.server_addr,
            serial = self.inner.serial.name(),
            "relay starting"
        );

        let tcp = tokio::spawn(run_tcp_loop(self.inner.clone(), cancel.clone()));
        let serial = tokio::spawn(run_serial_loop(self.inner.clone(), cancel.clone()));
        let heartbeat = tokio::spawn(run_heartbeat_loop(self.inner.clone(), cancel.clone()));

        let (tcp, serial, heartbeat) = tokio::join!(tcp, serial, heartbeat);
        for (task, joined) in [("tcp", tcp), ("serial", serial), ("heartbeat", heartbeat)] {
            if let Err(e) = joined {
                tracing::error!(task, "relay task failed: {e}");
            }
        }
        tracing::info!("relay stopped");
    }
}

impl RelayHandle {
    /// Send the shutdown frame upstream, latch, and close the serial port.
    pub async fn send_shutdown(&self) -> Result<(), ShutdownError> {
        let inner = &self.inner;
        let _guard = inner.shutdown_guard.lock().await;
        if inner.latch.is_cancelled() {
            return Err(ShutdownError::AlreadySent);
        }
        let frame = Frame::shutdown();
        let hex = frame.to_hex();
        if !inner.tcp.send(frame.into_bytes()).await {
            tracing::warn!("shutdown not sent: server link down");
            return Err(ShutdownError::NotConnected);
        }
        inner.latch.cancel();
        tracing::info!(frame = %hex, "shutdown sent, forwarding stopped");
        Ok(())
    }

    pub fn shutdown_sent(&self) -> bool {
        self.inner.latch.is_cancelled()
    }

    pub async fn tcp_connected(&self) -> bool {
        self.inner.tcp.is_attached().await
    }

    pub async fn serial_open(&self) -> bool {
        self.inner.port.is_attached().await
    }

    pub fn status(&self) -> &RelayStatus {
        &self.inner.status
    }
}

async fn run_tcp_loop(inner: Arc<RelayInner>, cancel: CancellationToken) {
    let settings = &inner.settings;
    loop {
        let attempt = tokio::time::timeout(
            settings.connect_timeout,
            TcpStream::connect(settings.server_addr.as_str()),
        );
        let connected = tokio::select! {
            _ = cancel.cancelled() => break,
            r = attempt => r,
        };

        match connected {
            Ok(Ok(stream)) => {
                tracing::info!(server = %settings.server_addr, "connected to server");
                inner.run_tcp_session(stream, &cancel).await;
                if !sleep_or_cancel(settings.reconnect_interval, &cancel).await {
                    break;
                }
            }
            Ok(Err(e)) => {
                tracing::warn!(server = %settings.server_addr, "connect failed: {e}");
                if !sleep_or_cancel(settings.reconnect_interval, &cancel).await {
                    break;
                }
            }
            Err(_) => {
                tracing::warn!(server = %settings.server_addr, "connect timed out");
                if !sleep_or_cancel(settings.reconnect_interval, &cancel).await {
                    break;
                }
            }
        }
    }
}

async fn run_serial_loop(inner: Arc<RelayInner>, cancel: CancellationToken) {
    let settings = &inner.settings;
    let device = inner.serial.name().to_string();
    loop {
        if cancel.is_cancelled() {
            break;
        }
        if inner.latch.is_cancelled() {
            // Port stays closed after shutdown.
            cancel.cancelled().await;
            break;
        }

        match inner.serial.open() {
            Ok(port) => {
                tracing::info!(%device, "serial port opened");
                match inner.run_serial_session(port, &cancel).await {
                    Ok(()) => tracing::info!(%device, "serial port closed"),
                    Err(e) => {
                        tracing::warn!(%device, "serial port error: {e}");
                        if !sleep_or_cancel(settings.reconnect_interval, &cancel).await {
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(%device, "serial open failed: {e}");
                if !sleep_or_cancel(settings.reconnect_interval, &cancel).await {
                    break;
                }
            }
        }
    }
}

async fn run_heartbeat_loop(inner: Arc<RelayInner>, cancel: CancellationToken) {
    let settings = &inner.settings;
    let mut ticker = watchdog_ticker(settings.heartbeat_interval).await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if inner.latch.is_cancelled() {
                    continue;
                }
                let silent = inner.upstream.elapsed().await;
                if silent <= settings.heartbeat_threshold {
                    continue;
                }
                let frame = Frame::heartbeat();
                let hex = frame.to_hex();
                if inner.port.send(frame.into_bytes()).await {
                    tracing::info!(frame = %hex, silent_ms = silent.as_millis() as u64, "heartbeat sent");
                }
            }
        }
    }
}

impl RelayInner {
    async fn run_tcp_session(&self, stream: TcpStream, cancel: &CancellationToken) {
        let (mut reader, writer) = stream.into_split();
        let rx = self.tcp.attach().await;

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            r = run_writer(writer, rx) => r,
            r = self.pump_upstream(&mut reader) => r,
        };
        self.tcp.detach().await;

        match outcome {
            Ok(()) => tracing::info!("server link closed"),
            Err(e) => tracing::warn!("server link error: {e}"),
        }
    }

    /// Server -> serial, byte for byte.
    async fn pump_upstream<R>(&self, reader: &mut R) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "server closed the connection",
                ));
            }
            self.upstream.touch().await;

            let data = &chunk[..n];
            if self.latch.is_cancelled() {
                tracing::debug!(data = %hex::encode(data), "shutdown sent, upstream bytes dropped");
                continue;
            }
            if self.port.send(Bytes::copy_from_slice(data)).await {
                tracing::info!(data = %hex::encode(data), "forwarded to poller");
            } else {
                tracing::debug!(data = %hex::encode(data), "serial port closed, upstream bytes dropped");
            }
        }
    }

    async fn run_serial_session(
        &self,
        port: crate::serial::BoxedSerial,
        cancel: &CancellationToken,
    ) -> io::Result<()> {
        let (mut reader, writer) = tokio::io::split(port);
        let rx = self.port.attach().await;

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            _ = self.latch.cancelled() => Ok(()),
            r = run_writer(writer, rx) => r,
            r = self.pump_downstream(&mut reader) => r,
        };
        self.port.detach().await;
        outcome
    }

    /// Serial -> server, one reassembled frame at a time.
    async fn pump_downstream<R>(&self, reader: &mut R) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut reassembly = ReassemblyBuffer::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "serial port hung up",
                ));
            }
            reassembly.extend(&chunk[..n]);

            while let Some(frame) = reassembly.next_frame() {
                match frame.message() {
                    Ok(Message::Poll {
                        seq,
                        payload: Payload::Normal,
                    }) => self.status.pack_id.set(seq),
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(frame = %frame.to_hex(), "discarding frame: {e}");
                        continue;
                    }
                }
                self.forward_upstream(frame).await;
            }
        }
    }

    async fn forward_upstream(&self, frame: Frame) {
        let hex = frame.to_hex();
        if self.latch.is_cancelled() {
            tracing::debug!(frame = %hex, "shutdown sent, frame dropped");
            return;
        }
        if self.tcp.send(frame.into_bytes()).await {
            tracing::info!(frame = %hex, "forwarded to server");
        } else {
            tracing::debug!(frame = %hex, "server link down, frame dropped");
        }
    }
}
