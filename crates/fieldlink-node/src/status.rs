//! Status surface -- the only state a presentation layer observes or sets.
//!
//! Pack-id is a `watch` value so a display can subscribe to changes; flags
//! are shared atomics read by the node on every decision.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fieldlink_protocol::PackId;
use tokio::sync::watch;

/// Observable pack-id.
#[derive(Debug, Clone)]
pub struct PackIdCell {
    tx: Arc<watch::Sender<PackId>>,
}

impl PackIdCell {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    pub fn get(&self) -> PackId {
        *self.tx.borrow()
    }

    pub fn set(&self, pack_id: PackId) {
        self.tx.send_replace(pack_id);
    }

    pub fn subscribe(&self) -> watch::Receiver<PackId> {
        self.tx.subscribe()
    }
}

impl Default for PackIdCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared on/off flag.
#[derive(Debug, Clone, Default)]
pub struct Toggle(Arc<AtomicBool>);

impl Toggle {
    pub fn new(on: bool) -> Self {
        Self(Arc::new(AtomicBool::new(on)))
    }

    pub fn get(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, on: bool) {
        self.0.store(on, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone)]
pub struct ServerStatus {
    pub pack_id: PackIdCell,
    /// Acknowledge polls when on; drop them silently when off.
    pub respond: Toggle,
}

impl ServerStatus {
    pub fn new(respond: bool) -> Self {
        Self {
            pack_id: PackIdCell::new(),
            respond: Toggle::new(respond),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RelayStatus {
    pub pack_id: PackIdCell,
    /// Surface flag only; forwarding never consults it.
    pub exchange: Toggle,
}

impl RelayStatus {
    pub fn new(exchange: bool) -> Self {
        Self {
            pack_id: PackIdCell::new(),
            exchange: Toggle::new(exchange),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PollerStatus {
    pub pack_id: PackIdCell,
}
