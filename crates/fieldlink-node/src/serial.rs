//! Serial port access for the relay and poller.
//!
//! Nodes never open a port directly; they go through `SerialOpener` so the
//! reopen loop can retry on failure. `DevicePort` opens real hardware via
//! tokio-serial. `VirtualPort` is one end of an in-memory null-modem cable,
//! used by the in-process launcher and by tests.

use std::io;
use std::sync::Mutex;

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio_serial::SerialPortBuilderExt;

/// Buffer size of each direction of a virtual null-modem cable.
const VIRTUAL_PORT_BUFFER: usize = 4096;

/// Byte stream behind an open serial port.
pub trait SerialIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> SerialIo for T {}

pub type BoxedSerial = Box<dyn SerialIo>;

/// Something that can (re)open a serial port.
pub trait SerialOpener: Send + Sync {
    /// Device name for log lines.
    fn name(&self) -> &str;

    fn open(&self) -> io::Result<BoxedSerial>;
}

/// A hardware (or OS-virtual) serial device.
#[derive(Debug, Clone)]
pub struct DevicePort {
    device: String,
    baud_rate: u32,
}

impl DevicePort {
    pub fn new(device: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            device: device.into(),
            baud_rate,
        }
    }
}

impl SerialOpener for DevicePort {
    fn name(&self) -> &str {
        &self.device
    }

    fn open(&self) -> io::Result<BoxedSerial> {
        let port = tokio_serial::new(self.device.as_str(), self.baud_rate).open_native_async()?;
        Ok(Box::new(port))
    }
}

/// One end of an in-memory null-modem cable. Each end can be opened once.
#[derive(Debug)]
pub struct VirtualPort {
    name: String,
    end: Mutex<Option<DuplexStream>>,
}

impl VirtualPort {
    /// Create both ends of a cable.
    pub fn pair(a: &str, b: &str) -> (Self, Self) {
        let (end_a, end_b) = tokio::io::duplex(VIRTUAL_PORT_BUFFER);
        (
            Self {
                name: a.to_string(),
                end: Mutex::new(Some(end_a)),
            },
            Self {
                name: b.to_string(),
                end: Mutex::new(Some(end_b)),
            },
        )
    }

    /// Take the raw stream, bypassing the opener.
    pub fn take(&self) -> Option<DuplexStream> {
        self.end.lock().ok()?.take()
    }
}

impl SerialOpener for VirtualPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self) -> io::Result<BoxedSerial> {
        match self.take() {
            Some(stream) => Ok(Box::new(stream)),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("virtual port {} is already open or unplugged", self.name),
            )),
        }
    }
}
