//! In-process launcher -- Server, then Relay, then Poller in one runtime.
//!
//! Nodes start in dependency order with a fixed delay between them. When any
//! node stops, or the caller cancels, the rest are cancelled and joined.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::link::sleep_or_cancel;
use crate::poller::{Poller, PollerExit, PollerSettings};
use crate::relay::{Relay, RelayHandle, RelaySettings};
use crate::serial::SerialOpener;
use crate::server::{run_server, ServerExit, ServerSettings};
use crate::status::{PollerStatus, RelayStatus, ServerStatus};

/// Everything needed to bring up the three nodes.
pub struct LaunchPlan {
    pub server: ServerSettings,
    pub relay: RelaySettings,
    pub poller: PollerSettings,
    pub relay_port: Arc<dyn SerialOpener>,
    pub poller_port: Arc<dyn SerialOpener>,
    /// Pause between starting consecutive nodes.
    pub delay: Duration,
}

/// Status surfaces of the launched nodes.
#[derive(Clone)]
pub struct LaunchedNodes {
    pub server: ServerStatus,
    pub relay: RelayHandle,
    pub poller: PollerStatus,
}

/// The first node to stop, or why none did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeExit {
    Server(ServerExit),
    Relay,
    Poller(PollerExit),
    /// Cancelled before or without any node stopping.
    Cancelled,
}

pub struct Launcher {
    plan: LaunchPlan,
    nodes: LaunchedNodes,
    relay: Relay,
}

impl Launcher {
    pub fn new(plan: LaunchPlan, server_status: ServerStatus, relay_status: RelayStatus) -> Self {
        let relay = Relay::new(plan.relay.clone(), plan.relay_port.clone(), relay_status);
        let nodes = LaunchedNodes {
            server: server_status,
            relay: relay.handle(),
            poller: PollerStatus::default(),
        };
        Self { plan, nodes, relay }
    }

    pub fn nodes(&self) -> LaunchedNodes {
        self.nodes.clone()
    }

    /// Start all nodes and wait for the first to stop.
    pub async fn run(self, cancel: CancellationToken) -> NodeExit {
        let Launcher { plan, nodes, relay } = self;
        let stop = cancel.child_token();
        let mut running: JoinSet<NodeExit> = JoinSet::new();

        tracing::info!("launching server");
        {
            let settings = plan.server.clone();
            let status = nodes.server.clone();
            let stop = stop.clone();
            running.spawn(async move {
                NodeExit::Server(run_server(settings, status, stop).await)
            });
        }

        let first = 'launch: {
            if !sleep_or_cancel(plan.delay, &stop).await {
                break 'launch NodeExit::Cancelled;
            }
            tracing::info!("launching relay");
            {
                let stop = stop.clone();
                running.spawn(async move {
                    relay.run(stop).await;
                    NodeExit::Relay
                });
            }

            if !sleep_or_cancel(plan.delay, &stop).await {
                break 'launch NodeExit::Cancelled;
            }
            tracing::info!("launching poller");
            {
                let poller = Poller::new(
                    plan.poller.clone(),
                    plan.poller_port.clone(),
                    nodes.poller.clone(),
                );
                let stop = stop.clone();
                running.spawn(async move { NodeExit::Poller(poller.run(stop).await) });
            }

            tokio::select! {
                _ = stop.cancelled() => NodeExit::Cancelled,
                Some(done) = running.join_next() => match done {
                    Ok(exit) => exit,
                    Err(e) => {
                        tracing::error!("node task failed: {e}");
                        NodeExit::Cancelled
                    }
                },
            }
        };

        tracing::info!(?first, "stopping all nodes");
        stop.cancel();
        while running.join_next().await.is_some() {}
        first
    }
}
