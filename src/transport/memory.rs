//! In-process transport pair for tests and simulations.

use std::{
    collections::VecDeque,
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TryRecvError};

use super::{Transport, TransportError, TransportKind};

enum Chunk {
    Data(Bytes),
    Fail(io::ErrorKind),
}

#[derive(Default)]
struct Shared {
    open: AtomicBool,
    opens: AtomicUsize,
    closes: AtomicUsize,
    write_failures: Mutex<VecDeque<io::ErrorKind>>,
}

/// Host side of an in-memory link. See [`memory_pair`].
pub struct MemoryTransport {
    kind: TransportKind,
    inbound: Mutex<mpsc::UnboundedReceiver<Chunk>>,
    outbound: mpsc::UnboundedSender<Bytes>,
    shared: Arc<Shared>,
}

/// Device side of an in-memory link: feeds bytes in and observes writes.
pub struct MemoryPeer {
    inbound: mpsc::UnboundedSender<Chunk>,
    outbound: mpsc::UnboundedReceiver<Bytes>,
    shared: Arc<Shared>,
}

/// Create a connected transport and the peer that drives it.
///
/// Dropping the peer makes the transport report
/// [`TransportError::Disconnected`] once pending bytes are drained.
#[must_use]
pub fn memory_pair(kind: TransportKind) -> (MemoryTransport, MemoryPeer) {
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared::default());
    (
        MemoryTransport {
            kind,
            inbound: Mutex::new(in_rx),
            outbound: out_tx,
            shared: Arc::clone(&shared),
        },
        MemoryPeer {
            inbound: in_tx,
            outbound: out_rx,
            shared,
        },
    )
}

impl MemoryTransport {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.shared.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(TransportError::NotOpen)
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn kind(&self) -> TransportKind { self.kind }

    async fn open(&self) -> Result<(), TransportError> {
        self.shared.open.store(true, Ordering::Release);
        self.shared.opens.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.shared.open.swap(false, Ordering::AcqRel) {
            self.shared.closes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn read_available(&self) -> Result<Option<Bytes>, TransportError> {
        self.ensure_open()?;
        match self.inbound.lock().try_recv() {
            Ok(Chunk::Data(bytes)) => Ok(Some(bytes)),
            Ok(Chunk::Fail(kind)) => Err(io::Error::from(kind).into()),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(TransportError::Disconnected),
        }
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<(), TransportError> {
        self.ensure_open()?;
        let failure = self.shared.write_failures.lock().pop_front();
        if let Some(kind) = failure {
            return Err(io::Error::from(kind).into());
        }
        self.outbound
            .send(Bytes::copy_from_slice(frame))
            .map_err(|_| TransportError::Disconnected)
    }
}

impl MemoryPeer {
    /// Deliver bytes to the host. Returns `false` if the transport is gone.
    pub fn send(&self, bytes: impl Into<Bytes>) -> bool {
        self.inbound.send(Chunk::Data(bytes.into())).is_ok()
    }

    /// Make the host's next read fail with an error of `kind`.
    pub fn fail_next_read(&self, kind: io::ErrorKind) -> bool {
        self.inbound.send(Chunk::Fail(kind)).is_ok()
    }

    /// Make the host's next write fail with an error of `kind`.
    pub fn fail_next_write(&self, kind: io::ErrorKind) {
        self.shared.write_failures.lock().push_back(kind);
    }

    /// Wait for the next frame written by the host.
    pub async fn recv(&mut self) -> Option<Bytes> { self.outbound.recv().await }

    /// Take a frame written by the host, if one is pending.
    pub fn try_recv(&mut self) -> Option<Bytes> { self.outbound.try_recv().ok() }

    /// Whether the host currently holds the transport open.
    #[must_use]
    pub fn is_open(&self) -> bool { self.shared.open.load(Ordering::Acquire) }

    /// How many times the host opened the transport.
    #[must_use]
    pub fn open_count(&self) -> usize { self.shared.opens.load(Ordering::Relaxed) }

    /// How many times the host released the transport.
    #[must_use]
    pub fn close_count(&self) -> usize { self.shared.closes.load(Ordering::Relaxed) }
}
