//! Fieldlink Node -- server, relay and poller for the serial polling link.
//!
//! Usage:
//!   fieldlink-node server                     # TCP responder
//!   fieldlink-node relay                      # serial <-> TCP bridge
//!   fieldlink-node poller                     # serial requester
//!   fieldlink-node launch --null-modem        # all three in one process
//!   fieldlink-node --config path.toml config  # print effective config

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;

use fieldlink_node::config::{LinkConfig, SerialSection};
use fieldlink_node::console::{run_console, ConsoleTarget};
use fieldlink_node::expand_tilde;
use fieldlink_node::launcher::{LaunchPlan, Launcher, NodeExit};
use fieldlink_node::poller::{Poller, PollerExit};
use fieldlink_node::relay::Relay;
use fieldlink_node::serial::{DevicePort, SerialOpener, VirtualPort};
use fieldlink_node::server::{run_server, ServerExit};
use fieldlink_node::status::{PollerStatus, RelayStatus, ServerStatus};

#[derive(Parser)]
#[command(name = "fieldlink-node", about = "Serial polling link nodes")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "fieldlink.toml")]
    config: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer poll requests over TCP
    Server,
    /// Bridge the relay serial port to the server
    Relay,
    /// Poll over the poller serial port
    Poller,
    /// Run server, relay and poller in one process
    Launch {
        /// Join relay and poller with an in-memory cable instead of devices
        #[arg(long)]
        null_modem: bool,
    },
    /// Print the effective configuration
    Config,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "fieldlink_node=info,fieldlink_protocol=info".into());
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn device(section: &SerialSection) -> Arc<dyn SerialOpener> {
    Arc::new(DevicePort::new(section.device.clone(), section.baud_rate))
}

/// Cancel on Ctrl-C.
fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, stopping");
        }
        cancel.cancel();
    });
}

/// Serve console commands from stdin alongside the node.
fn spawn_console(target: ConsoleTarget, cancel: CancellationToken) {
    tokio::spawn(async move {
        let stdin = BufReader::new(tokio::io::stdin());
        if let Err(e) = run_console(stdin, tokio::io::stdout(), target, cancel).await {
            tracing::warn!("console error: {e}");
        }
    });
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(run(cli));
    // A pending console read on stdin would otherwise hold the runtime open.
    runtime.shutdown_background();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = expand_tilde(&cli.config);
    let cfg = LinkConfig::load_or_default(&config_path)?;

    if let Commands::Config = cli.command {
        print!("{}", toml::to_string_pretty(&cfg)?);
        return Ok(());
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "starting fieldlink-node"
    );

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    match cli.command {
        Commands::Server => {
            let status = ServerStatus::new(cfg.server.respond);
            spawn_console(ConsoleTarget::Server(status.clone()), cancel.clone());
            match run_server(cfg.server_settings(), status, cancel).await {
                ServerExit::ShutdownRequested => tracing::info!("server shut down by peer"),
                ServerExit::Cancelled => {}
            }
        }
        Commands::Relay => {
            let status = RelayStatus::new(cfg.relay.exchange);
            let relay = Relay::new(cfg.relay_settings(), device(&cfg.relay.serial), status);
            spawn_console(ConsoleTarget::Relay(relay.handle()), cancel.clone());
            relay.run(cancel).await;
        }
        Commands::Poller => {
            let status = PollerStatus::default();
            let poller = Poller::new(
                cfg.poller_settings(),
                device(&cfg.poller.serial),
                status.clone(),
            );
            spawn_console(ConsoleTarget::Poller(status), cancel.clone());
            if poller.run(cancel).await == PollerExit::IdleTimeout {
                anyhow::bail!("poller terminated: no messages within the message timeout");
            }
        }
        Commands::Launch { null_modem } => {
            let (relay_port, poller_port) = if null_modem {
                let (relay_end, poller_end) = VirtualPort::pair(
                    &cfg.relay.serial.device,
                    &cfg.poller.serial.device,
                );
                let relay_end: Arc<dyn SerialOpener> = Arc::new(relay_end);
                let poller_end: Arc<dyn SerialOpener> = Arc::new(poller_end);
                (relay_end, poller_end)
            } else {
                (device(&cfg.relay.serial), device(&cfg.poller.serial))
            };
            let plan = LaunchPlan {
                server: cfg.server_settings(),
                relay: cfg.relay_settings(),
                poller: cfg.poller_settings(),
                relay_port,
                poller_port,
                delay: cfg.launch_delay(),
            };
            let launcher = Launcher::new(
                plan,
                ServerStatus::new(cfg.server.respond),
                RelayStatus::new(cfg.relay.exchange),
            );
            // The relay is the node an operator steers in a combined run.
            spawn_console(ConsoleTarget::Relay(launcher.nodes().relay), cancel.clone());

            let exit = launcher.run(cancel).await;
            tracing::info!(?exit, "launch finished");
            if exit == NodeExit::Poller(PollerExit::IdleTimeout) {
                anyhow::bail!("poller terminated: no messages within the message timeout");
            }
        }
        Commands::Config => {}
    }

    Ok(())
}
