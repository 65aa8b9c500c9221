//! Server node -- answers poll requests arriving over TCP.
//!
//! LISTENING -> SERVING -> CLOSED. Each accepted connection runs in its own
//! task with its own reassembly buffer and owns both socket halves, so acks
//! are written inline by the reader. A shutdown frame on any connection stops
//! the accept loop and ends the node. A liveness watchdog logs prolonged
//! silence but never acts on it.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use fieldlink_protocol::{Frame, Message, Payload, ReassemblyBuffer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::link::{sleep_or_cancel, watchdog_ticker, ActivityClock, READ_CHUNK};
use crate::status::ServerStatus;

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub listen_addr: String,
    /// Silence after which the liveness watchdog starts logging.
    pub liveness_timeout: Duration,
    pub watch_interval: Duration,
    /// Wait between failed bind attempts.
    pub rebind_interval: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: "localhost:12345".into(),
            liveness_timeout: Duration::from_secs(30),
            watch_interval: Duration::from_secs(1),
            rebind_interval: Duration::from_secs(5),
        }
    }
}

/// Why the server stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerExit {
    Cancelled,
    /// A peer sent the shutdown frame.
    ShutdownRequested,
}

/// What a single inbound frame asks the server to do.
#[derive(Debug, PartialEq, Eq)]
enum Reaction {
    Reply(Frame),
    Shutdown,
    Ignore,
}

/// A bound server, ready to accept.
pub struct Server {
    listener: TcpListener,
    settings: ServerSettings,
    status: ServerStatus,
}

impl Server {
    pub async fn bind(settings: ServerSettings, status: ServerStatus) -> io::Result<Self> {
        let listener = TcpListener::bind(settings.listen_addr.as_str()).await?;
        Ok(Self {
            listener,
            settings,
            status,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept and serve until cancelled or a shutdown frame arrives.
    pub async fn run(self, cancel: CancellationToken) -> ServerExit {
        let stop = cancel.child_token();
        let requested = CancellationToken::new();
        let activity = ActivityClock::new();

        let watchdog = tokio::spawn(run_liveness_watchdog(
            activity.clone(),
            self.settings.liveness_timeout,
            self.settings.watch_interval,
            stop.clone(),
        ));

        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!(%addr, "server listening");
        }

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::info!(%peer, "client connected");
                        let conn = Connection {
                            peer,
                            status: self.status.clone(),
                            activity: activity.clone(),
                            stop: stop.clone(),
                            requested: requested.clone(),
                        };
                        tokio::spawn(conn.serve(stream));
                    }
                    Err(e) => {
                        tracing::warn!("accept failed: {e}");
                    }
                },
            }
        }

        // Dropping the listener closes the port before we report back.
        drop(self.listener);
        stop.cancel();
        let _ = watchdog.await;

        if requested.is_cancelled() {
            tracing::info!("server closed on shutdown request");
            ServerExit::ShutdownRequested
        } else {
            tracing::info!("server stopped");
            ServerExit::Cancelled
        }
    }
}

/// Bind (retrying at a fixed interval) and serve.
pub async fn run_server(
    settings: ServerSettings,
    status: ServerStatus,
    cancel: CancellationToken,
) -> ServerExit {
    loop {
        match Server::bind(settings.clone(), status.clone()).await {
            Ok(server) => return server.run(cancel).await,
            Err(e) => {
                tracing::warn!(addr = %settings.listen_addr, "bind failed: {e}");
                if !sleep_or_cancel(settings.rebind_interval, &cancel).await {
                    return ServerExit::Cancelled;
                }
            }
        }
    }
}

struct Connection {
    peer: SocketAddr,
    status: ServerStatus,
    activity: ActivityClock,
    stop: CancellationToken,
    requested: CancellationToken,
}

impl Connection {
    async fn serve(self, mut stream: TcpStream) {
        let outcome = tokio::select! {
            _ = self.stop.cancelled() => Ok(()),
            r = self.pump(&mut stream) => r,
        };
        match outcome {
            Ok(()) => tracing::info!(peer = %self.peer, "connection closed"),
            Err(e) => tracing::warn!(peer = %self.peer, "connection error: {e}"),
        }
    }

    async fn pump(&self, stream: &mut TcpStream) -> io::Result<()> {
        let mut reassembly = ReassemblyBuffer::new();
        let mut chunk = vec![0u8; READ_CHUNK];

        loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                if reassembly.pending() > 0 {
                    tracing::debug!(
                        peer = %self.peer,
                        pending = reassembly.pending(),
                        "partial frame dropped on disconnect"
                    );
                }
                tracing::info!(peer = %self.peer, "client disconnected");
                return Ok(());
            }
            self.activity.touch().await;
            tracing::debug!(peer = %self.peer, data = %hex::encode(&chunk[..n]), "received");
            reassembly.extend(&chunk[..n]);

            while let Some(frame) = reassembly.next_frame() {
                match react(&frame, &self.status) {
                    Reaction::Reply(ack) => {
                        stream.write_all(ack.as_bytes()).await?;
                        tracing::info!(peer = %self.peer, frame = %ack.to_hex(), "ack sent");
                    }
                    Reaction::Shutdown => {
                        tracing::info!(peer = %self.peer, "shutdown requested");
                        self.requested.cancel();
                        self.stop.cancel();
                        return Ok(());
                    }
                    Reaction::Ignore => {}
                }
            }
        }
    }
}

fn react(frame: &Frame, status: &ServerStatus) -> Reaction {
    let message = match frame.message() {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(frame = %frame.to_hex(), "discarding frame: {e}");
            return Reaction::Ignore;
        }
    };
    tracing::info!(frame = %frame.to_hex(), ?message, "frame received");

    match message {
        Message::Poll {
            seq,
            payload: Payload::Normal,
        } => {
            status.pack_id.set(seq);
            if status.respond.get() {
                Reaction::Reply(Frame::ack(seq))
            } else {
                tracing::info!(seq, "respond disabled, ack not sent");
                Reaction::Ignore
            }
        }
        Message::Poll {
            payload: Payload::Shutdown,
            ..
        } => Reaction::Shutdown,
        _ => Reaction::Ignore,
    }
}

async fn run_liveness_watchdog(
    activity: ActivityClock,
    timeout: Duration,
    interval: Duration,
    stop: CancellationToken,
) {
    let mut ticker = watchdog_ticker(interval).await;
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                let idle = activity.elapsed().await;
                if idle >= timeout {
                    tracing::warn!(idle_secs = idle.as_secs(), "no traffic from clients");
                }
            }
        }
    }
}
