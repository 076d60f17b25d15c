//! Byte-in/byte-out contract between the pipeline and physical links.
//!
//! A [`Transport`] moves raw bytes; it knows nothing about frames. Serial
//! ports, BLE characteristics and CAN sockets live outside this crate and
//! plug in through this trait. [`StreamTransport`] adapts any Tokio stream,
//! [`MemoryTransport`] backs tests and simulations, and
//! [`BlePacketTransport`] converts fixed-size BLE packets to JSON frames.

use std::{fmt, io};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

mod ble;
mod memory;
mod stream;

pub use ble::{BLE_DATA_LEN, BLE_PACKET_LEN, BlePacketTransport, message_to_packet, packet_to_message};
pub use memory::{MemoryPeer, MemoryTransport, memory_pair};
pub use stream::StreamTransport;

/// Identifier assigned to a transport when a session opens it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransportId(u16);

impl TransportId {
    /// Create a new [`TransportId`] with the provided value.
    #[must_use]
    pub const fn new(id: u16) -> Self { Self(id) }

    /// Return the inner `u16` representation.
    #[must_use]
    pub const fn as_u16(self) -> u16 { self.0 }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "transport-{}", self.0) }
}

/// Physical medium behind a transport, used for logging.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Serial,
    Ble,
    Can,
    Tcp,
    Memory,
}

impl TransportKind {
    /// Lower-case name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Serial => "serial",
            Self::Ble => "ble",
            Self::Can => "can",
            Self::Tcp => "tcp",
            Self::Memory => "memory",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Errors raised by a [`Transport`].
///
/// Transient errors are retried on the next poll tick. Fatal ones stop the
/// transport's worker and mark its modules disconnected.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A recoverable I/O hiccup.
    #[error("transient transport error: {0}")]
    Transient(#[source] io::Error),
    /// The peer or device went away.
    #[error("transport disconnected")]
    Disconnected,
    /// An unrecoverable I/O failure.
    #[error("transport failed: {0}")]
    Fatal(#[source] io::Error),
    /// The transport cannot carry this frame; the frame is dropped.
    #[error("transport rejected frame: {0}")]
    Rejected(String),
    /// The transport was used before `open` or after `close`.
    #[error("transport is not open")]
    NotOpen,
}

impl TransportError {
    /// Whether the error ends the transport's worker.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Fatal(_) | Self::NotOpen)
    }
}

impl From<io::Error> for TransportError {
    fn from(error: io::Error) -> Self {
        use io::ErrorKind::{
            BrokenPipe,
            ConnectionAborted,
            ConnectionReset,
            NotConnected,
            NotFound,
            PermissionDenied,
            UnexpectedEof,
        };
        match error.kind() {
            BrokenPipe | ConnectionReset | ConnectionAborted | NotConnected | UnexpectedEof
            | NotFound | PermissionDenied => Self::Fatal(error),
            _ => Self::Transient(error),
        }
    }
}

/// A physical link carrying the firmware byte stream.
///
/// Both loops of a worker share one transport, so methods take `&self`;
/// implementations guard their read and write halves independently.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Medium behind this transport.
    fn kind(&self) -> TransportKind;

    /// Acquire the underlying device.
    async fn open(&self) -> Result<(), TransportError> { Ok(()) }

    /// Release the underlying device. Must tolerate repeated calls.
    async fn close(&self) -> Result<(), TransportError> { Ok(()) }

    /// Return whatever bytes are available right now without waiting.
    ///
    /// `Ok(None)` means nothing is pending.
    async fn read_available(&self) -> Result<Option<Bytes>, TransportError>;

    /// Write one serialised frame.
    async fn write_frame(&self, frame: &[u8]) -> Result<(), TransportError>;
}
