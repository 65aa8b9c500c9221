//! Poller node -- originates sequence-numbered polls on the serial side.
//!
//! IDLE -> AWAITING_ACK -> IDLE (seq+1) -> ..., plus TERMINATED from anywhere.
//!
//! Tasks:
//!   - port loop: open (fixed retry), send the first request, read frames
//!   - response watchdog: resend the outstanding request after a timeout
//!   - idle watchdog: end the node when nothing has arrived for too long
//!
//! Lock order: `state` before the port `LinkSlot`.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use fieldlink_protocol::{Frame, Message, PackId, ReassemblyBuffer};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::link::{run_writer, sleep_or_cancel, watchdog_ticker, LinkSlot, READ_CHUNK};
use crate::serial::{BoxedSerial, SerialOpener};
use crate::status::PollerStatus;

#[derive(Debug, Clone)]
pub struct PollerSettings {
    /// Resend the outstanding request after this long without its ack.
    pub response_timeout: Duration,
    /// Terminate after this long without any inbound byte.
    pub message_timeout: Duration,
    /// Wait between failed port opens.
    pub reopen_interval: Duration,
    /// How often both watchdogs check.
    pub watch_interval: Duration,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(5),
            message_timeout: Duration::from_secs(10),
            reopen_interval: Duration::from_secs(5),
            watch_interval: Duration::from_secs(1),
        }
    }
}

/// Why the poller stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerExit {
    Cancelled,
    /// Nothing was received for longer than the message timeout.
    IdleTimeout,
}

#[derive(Debug)]
struct PollerState {
    pack_number: PackId,
    waiting: bool,
    last_request: Instant,
    last_message: Instant,
}

struct PollerInner {
    settings: PollerSettings,
    serial: Arc<dyn SerialOpener>,
    status: PollerStatus,
    port: LinkSlot,
    state: Mutex<PollerState>,
}

pub struct Poller {
    inner: Arc<PollerInner>,
}

impl Poller {
    pub fn new(
        settings: PollerSettings,
        serial: Arc<dyn SerialOpener>,
        status: PollerStatus,
    ) -> Self {
        let now = Instant::now();
        Self {
            inner: Arc::new(PollerInner {
                settings,
                serial,
                status,
                port: LinkSlot::new("serial"),
                state: Mutex::new(PollerState {
                    pack_number: 0,
                    waiting: false,
                    last_request: now,
                    last_message: now,
                }),
            }),
        }
    }

    /// Poll until cancelled or the idle watchdog fires.
    pub async fn run(self, cancel: CancellationToken) -> PollerExit {
        tracing::info!(serial = self.inner.serial.name(), "poller starting");

        let stop = cancel.child_token();
        let port = tokio::spawn(run_port_loop(self.inner.clone(), stop.clone()));
        let retry = tokio::spawn(run_response_watchdog(self.inner.clone(), stop.clone()));

        let exit = run_idle_watchdog(&self.inner, &stop).await;
        stop.cancel();
        let (port, retry) = tokio::join!(port, retry);
        for (task, joined) in [("port", port), ("response watchdog", retry)] {
            if let Err(e) = joined {
                tracing::error!(task, "poller task failed: {e}");
            }
        }

        tracing::info!(?exit, "poller stopped");
        exit
    }
}

impl PollerInner {
    /// Write the poll for the current pack number. No-op while the port is closed.
    async fn send_request(&self, state: &mut PollerState) {
        let frame = Frame::poll(state.pack_number);
        let hex = frame.to_hex();
        if !self.port.send(frame.into_bytes()).await {
            tracing::debug!(seq = state.pack_number, "serial port closed, request not sent");
            return;
        }
        state.last_request = Instant::now();
        state.waiting = true;
        self.status.pack_id.set(state.pack_number);
        tracing::info!(seq = state.pack_number, frame = %hex, "request sent");
    }

    async fn handle_frame(&self, frame: Frame) {
        match frame.message() {
            Ok(Message::Ack { seq, .. }) => {
                let mut state = self.state.lock().await;
                if seq != state.pack_number {
                    tracing::debug!(seq, expected = state.pack_number, "stale ack ignored");
                    return;
                }
                tracing::info!(seq, "ack received");
                state.waiting = false;
                state.pack_number = state.pack_number.wrapping_add(1);
                self.send_request(&mut state).await;
            }
            Ok(Message::Heartbeat) => tracing::debug!("heartbeat received"),
            Ok(other) => tracing::debug!(?other, "frame ignored"),
            Err(e) => tracing::warn!(frame = %frame.to_hex(), "discarding frame: {e}"),
        }
    }

    async fn run_session(&self, port: BoxedSerial, stop: &CancellationToken) -> io::Result<()> {
        let (mut reader, writer) = tokio::io::split(port);
        let rx = self.port.attach().await;

        {
            let mut state = self.state.lock().await;
            self.send_request(&mut state).await;
        }

        let outcome = tokio::select! {
            _ = stop.cancelled() => Ok(()),
            r = run_writer(writer, rx) => r,
            r = self.pump(&mut reader) => r,
        };
        self.port.detach().await;
        outcome
    }

    async fn pump<R>(&self, reader: &mut R) -> io::Result<()>
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
            self.state.lock().await.last_message = Instant::now();
            tracing::debug!(data = %hex::encode(&chunk[..n]), "received");

            reassembly.extend(&chunk[..n]);
            while let Some(frame) = reassembly.next_frame() {
                self.handle_frame(frame).await;
            }
        }
    }
}

async fn run_port_loop(inner: Arc<PollerInner>, stop: CancellationToken) {
    let device = inner.serial.name().to_string();
    while !stop.is_cancelled() {
        match inner.serial.open() {
            Ok(port) => {
                tracing::info!(%device, "serial port opened");
                match inner.run_session(port, &stop).await {
                    Ok(()) => tracing::info!(%device, "serial port closed"),
                    Err(e) => {
                        tracing::warn!(%device, "serial port error: {e}");
                        if !sleep_or_cancel(inner.settings.reopen_interval, &stop).await {
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(%device, "serial open failed: {e}");
                if !sleep_or_cancel(inner.settings.reopen_interval, &stop).await {
                    break;
                }
            }
        }
    }
}

async fn run_response_watchdog(inner: Arc<PollerInner>, stop: CancellationToken) {
    let mut ticker = watchdog_ticker(inner.settings.watch_interval).await;
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                let mut state = inner.state.lock().await;
                if state.waiting && state.last_request.elapsed() > inner.settings.response_timeout {
                    tracing::warn!(seq = state.pack_number, "response timeout, resending");
                    inner.send_request(&mut state).await;
                }
            }
        }
    }
}

async fn run_idle_watchdog(inner: &PollerInner, stop: &CancellationToken) -> PollerExit {
    let mut ticker = watchdog_ticker(inner.settings.watch_interval).await;
    loop {
        tokio::select! {
            _ = stop.cancelled() => return PollerExit::Cancelled,
            _ = ticker.tick() => {
                let idle = inner.state.lock().await.last_message.elapsed();
                if idle > inner.settings.message_timeout {
                    tracing::error!(
                        idle_secs = idle.as_secs(),
                        "no messages within the message timeout, terminating"
                    );
                    return PollerExit::IdleTimeout;
                }
            }
        }
    }
}
