//! Operator console -- line commands against a running node's status surface.
//!
//! Reads from any `AsyncBufRead` (stdin in the binary), writes replies to any
//! `AsyncWrite`. Only `quit` cancels the node; a closed input just ends the
//! console.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::relay::RelayHandle;
use crate::status::{PollerStatus, ServerStatus};

/// The node a console is attached to.
#[derive(Clone)]
pub enum ConsoleTarget {
    Server(ServerStatus),
    Relay(RelayHandle),
    Poller(PollerStatus),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Status,
    Respond(bool),
    Exchange(bool),
    Shutdown,
    Quit,
    Help,
}

const HELP: &str = "commands: status | respond on|off | exchange on|off | shutdown | quit";

fn parse_switch(word: Option<&str>) -> Result<bool, String> {
    match word {
        Some("on") => Ok(true),
        Some("off") => Ok(false),
        Some(other) => Err(format!("expected on|off, got {other:?}")),
        None => Err("expected on|off".into()),
    }
}

/// Parse one console line. Blank lines yield `Ok(None)`.
pub fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let command = match verb.to_ascii_lowercase().as_str() {
        "status" => Command::Status,
        "respond" => Command::Respond(parse_switch(words.next())?),
        "exchange" => Command::Exchange(parse_switch(words.next())?),
        "shutdown" => Command::Shutdown,
        "quit" | "exit" => Command::Quit,
        "help" | "?" => Command::Help,
        other => return Err(format!("unknown command {other:?}")),
    };
    if let Some(extra) = words.next() {
        return Err(format!("unexpected argument {extra:?}"));
    }
    Ok(Some(command))
}

fn on_off(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}

async fn describe(target: &ConsoleTarget) -> String {
    match target {
        ConsoleTarget::Server(status) => format!(
            "server: pack_id={} respond={}",
            status.pack_id.get(),
            on_off(status.respond.get())
        ),
        ConsoleTarget::Relay(handle) => {
            let status = handle.status();
            let tcp = if handle.tcp_connected().await { "up" } else { "down" };
            let serial = if handle.serial_open().await { "open" } else { "closed" };
            format!(
                "relay: pack_id={} exchange={} tcp={tcp} serial={serial} shutdown_sent={}",
                status.pack_id.get(),
                on_off(status.exchange.get()),
                handle.shutdown_sent()
            )
        }
        ConsoleTarget::Poller(status) => format!("poller: pack_id={}", status.pack_id.get()),
    }
}

/// Apply a command. Returns the reply line.
pub async fn execute(
    command: Command,
    target: &ConsoleTarget,
    cancel: &CancellationToken,
) -> String {
    match (command, target) {
        (Command::Status, target) => describe(target).await,
        (Command::Respond(on), ConsoleTarget::Server(status)) => {
            status.respond.set(on);
            tracing::info!(respond = on, "respond toggled");
            format!("respond {}", on_off(on))
        }
        (Command::Exchange(on), ConsoleTarget::Relay(handle)) => {
            handle.status().exchange.set(on);
            tracing::info!(exchange = on, "exchange toggled");
            format!("exchange {}", on_off(on))
        }
        (Command::Shutdown, ConsoleTarget::Relay(handle)) => match handle.send_shutdown().await {
            Ok(()) => "shutdown sent".into(),
            Err(e) => format!("shutdown failed: {e}"),
        },
        (Command::Quit, _) => {
            cancel.cancel();
            "bye".into()
        }
        (Command::Help, _) => HELP.into(),
        (command, _) => format!("{command:?} is not available on this node"),
    }
}

/// Serve console commands until `quit`, end of input, or cancellation.
/// End of input leaves the node running.
pub async fn run_console<R, W>(
    input: R,
    mut output: W,
    target: ConsoleTarget,
    cancel: CancellationToken,
) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    loop {
        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            tracing::info!("console input closed");
            return Ok(());
        };

        let reply = match parse_command(&line) {
            Ok(Some(command)) => execute(command, &target, &cancel).await,
            Ok(None) => continue,
            Err(e) => format!("{e}; {HELP}"),
        };
        output.write_all(reply.as_bytes()).await?;
        output.write_all(b"\n").await?;
        output.flush().await?;

        if cancel.is_cancelled() {
            return Ok(());
        }
    }
}
