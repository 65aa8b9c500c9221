//! Fieldlink Node -- library crate for the three polling-link roles.
//!
//! Re-exports the node modules so the binary and integration tests can wire
//! servers, relays and pollers together in one runtime.

pub mod config;
pub mod console;
pub mod launcher;
pub mod link;
pub mod poller;
pub mod relay;
pub mod serial;
pub mod server;
pub mod status;

use std::path::PathBuf;

/// Expand a leading `~/` to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}
