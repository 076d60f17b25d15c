//! Per-transport read and write loops.
//!
//! A [`TransportWorker`] owns two tasks for one open transport. The read loop
//! polls the transport, frames the bytes and forwards every frame to the
//! shared event queue. The write loop drains the transport's outbound queue
//! and writes each frame, retrying transient failures. A fatal error on
//! either side reports [`TransportEventKind::Lost`] once and stops both
//! loops.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use log::{info, warn};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    time::sleep,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    config::SessionConfig,
    error::SendError,
    frame::FrameBuffer,
    metrics::{self, Direction},
    transport::{Transport, TransportError, TransportId, TransportKind},
};

/// What a worker reports to the dispatcher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEventKind {
    /// One complete frame extracted from the transport's bytes.
    Frame(Bytes),
    /// The transport failed fatally; its worker has stopped.
    Lost,
}

/// An event tagged with the transport it came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportEvent {
    pub transport: TransportId,
    pub kind: TransportEventKind,
}

/// Cloneable handle for queueing frames on one transport.
#[derive(Clone, Debug)]
pub struct OutboundHandle {
    transport: TransportId,
    tx: mpsc::Sender<Bytes>,
}

impl OutboundHandle {
    pub(crate) fn new(transport: TransportId, tx: mpsc::Sender<Bytes>) -> Self { Self { transport, tx } }

    /// Transport served by this handle.
    #[must_use]
    pub fn transport(&self) -> TransportId { self.transport }

    /// Queue `frame` without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::QueueFull`] if the queue is at capacity, in which
    /// case the frame is dropped, or [`SendError::Closed`] if the worker has
    /// stopped.
    pub fn try_push(&self, frame: Bytes) -> Result<(), SendError> {
        self.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => {
                warn!("outbound queue full, dropping frame: transport={}", self.transport);
                SendError::QueueFull
            }
            TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Queue `frame`, waiting for capacity.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Closed`] if the worker has stopped.
    pub async fn push(&self, frame: Bytes) -> Result<(), SendError> {
        self.tx.send(frame).await.map_err(|_| SendError::Closed)
    }

    /// Whether the worker behind this handle has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool { self.tx.is_closed() }
}

#[derive(Clone, Copy)]
struct Timing {
    poll_interval: Duration,
    dequeue_timeout: Duration,
    write_retries: u32,
}

#[derive(Clone)]
struct LoopContext {
    id: TransportId,
    transport: Arc<dyn Transport>,
    events: mpsc::Sender<TransportEvent>,
    token: CancellationToken,
    lost: Arc<AtomicBool>,
    timing: Timing,
}

impl LoopContext {
    /// Forward an event, giving up if the worker is cancelled or the
    /// dispatcher has gone away.
    async fn emit(&self, kind: TransportEventKind) -> bool {
        let event = TransportEvent {
            transport: self.id,
            kind,
        };
        tokio::select! {
            biased;
            () = self.token.cancelled() => false,
            sent = self.events.send(event) => sent.is_ok(),
        }
    }

    async fn fail(&self, error: &TransportError) {
        if self.lost.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!("transport lost: id={}, error={error}", self.id);
        self.token.cancel();
        let event = TransportEvent {
            transport: self.id,
            kind: TransportEventKind::Lost,
        };
        // The dispatcher owns the receiver; this only fails once it is gone.
        let _ = self.events.send(event).await;
    }

    async fn pause(&self) -> bool {
        tokio::select! {
            biased;
            () = self.token.cancelled() => false,
            () = sleep(self.timing.poll_interval) => true,
        }
    }
}

async fn read_loop(ctx: LoopContext, mut buffer: FrameBuffer) {
    loop {
        match ctx.transport.read_available().await {
            Ok(Some(bytes)) => {
                buffer.append(&bytes);
                for frame in buffer.drain_frames() {
                    metrics::inc_frames(Direction::Inbound);
                    if !ctx.emit(TransportEventKind::Frame(frame)).await {
                        return;
                    }
                }
            }
            Ok(None) => {}
            Err(e) if e.is_fatal() => {
                ctx.fail(&e).await;
                return;
            }
            Err(e) => tracing::debug!(transport = %ctx.id, error = %e, "transient read error"),
        }
        if !ctx.pause().await {
            return;
        }
    }
}

async fn write_loop(ctx: LoopContext, mut rx: mpsc::Receiver<Bytes>) {
    loop {
        let frame = tokio::select! {
            biased;
            () = ctx.token.cancelled() => return,
            next = tokio::time::timeout(ctx.timing.dequeue_timeout, rx.recv()) => match next {
                Err(_) => continue,
                Ok(None) => return,
                Ok(Some(frame)) => frame,
            },
        };
        if !write_with_retry(&ctx, &frame).await {
            return;
        }
    }
}

/// Write one frame. Returns `false` once the transport is lost.
async fn write_with_retry(ctx: &LoopContext, frame: &[u8]) -> bool {
    let mut attempt = 0;
    loop {
        match ctx.transport.write_frame(frame).await {
            Ok(()) => {
                metrics::inc_frames(Direction::Outbound);
                return true;
            }
            Err(TransportError::Rejected(reason)) => {
                warn!("frame rejected by transport: id={}, reason={reason}", ctx.id);
                return true;
            }
            Err(e) if e.is_fatal() => {
                ctx.fail(&e).await;
                return false;
            }
            Err(e) if attempt >= ctx.timing.write_retries => {
                warn!(
                    "dropping frame after {} attempts: id={}, error={e}",
                    attempt + 1,
                    ctx.id
                );
                return true;
            }
            Err(e) => {
                tracing::debug!(transport = %ctx.id, attempt, error = %e, "retrying write");
                attempt += 1;
                if !ctx.pause().await {
                    return false;
                }
            }
        }
    }
}

/// Read and write loops serving one open transport.
pub struct TransportWorker {
    id: TransportId,
    kind: TransportKind,
    transport: Arc<dyn Transport>,
    outbound: OutboundHandle,
    token: CancellationToken,
    tracker: TaskTracker,
    closed: AtomicBool,
}

impl TransportWorker {
    /// Open `transport` and start its loops.
    ///
    /// Frames and loss notifications go to `events`. Cancelling `parent`
    /// stops the loops without releasing the transport; call
    /// [`close`](Self::close) for that.
    ///
    /// # Errors
    ///
    /// Returns the transport's error if it fails to open.
    pub async fn open(
        id: TransportId,
        transport: Arc<dyn Transport>,
        events: mpsc::Sender<TransportEvent>,
        config: &SessionConfig,
        parent: &CancellationToken,
    ) -> Result<Self, TransportError> {
        transport.open().await?;
        let kind = transport.kind();
        let token = parent.child_token();
        let tracker = TaskTracker::new();
        let (tx, rx) = mpsc::channel(config.outbound_capacity());
        let ctx = LoopContext {
            id,
            transport: Arc::clone(&transport),
            events,
            token: token.clone(),
            lost: Arc::new(AtomicBool::new(false)),
            timing: Timing {
                poll_interval: config.poll_interval(),
                dequeue_timeout: config.dequeue_timeout(),
                write_retries: config.write_retries(),
            },
        };
        tracker.spawn(read_loop(
            ctx.clone(),
            FrameBuffer::with_capacity(config.buffer_capacity()),
        ));
        tracker.spawn(write_loop(ctx, rx));
        tracker.close();
        info!("transport opened: id={id}, kind={kind}");
        Ok(Self {
            id,
            kind,
            transport,
            outbound: OutboundHandle::new(id, tx),
            token,
            tracker,
            closed: AtomicBool::new(false),
        })
    }

    /// Identifier assigned at open.
    #[must_use]
    pub fn id(&self) -> TransportId { self.id }

    /// Medium behind the transport.
    #[must_use]
    pub fn kind(&self) -> TransportKind { self.kind }

    /// Handle for queueing frames on this transport.
    #[must_use]
    pub fn outbound(&self) -> OutboundHandle { self.outbound.clone() }

    /// Queue `frame` for writing without waiting.
    ///
    /// # Errors
    ///
    /// See [`OutboundHandle::try_push`].
    pub fn send(&self, frame: Bytes) -> Result<(), SendError> { self.outbound.try_push(frame) }

    /// Whether the loops are still running.
    #[must_use]
    pub fn is_running(&self) -> bool { !self.token.is_cancelled() }

    /// Stop both loops, wait for them and release the transport.
    ///
    /// Repeated calls return `Ok(())` without touching the transport again.
    ///
    /// # Errors
    ///
    /// Returns the transport's error if releasing it fails.
    pub async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.token.cancel();
        self.tracker.wait().await;
        let result = self.transport.close().await;
        info!("transport closed: id={}, kind={}", self.id, self.kind);
        result
    }
}

impl Drop for TransportWorker {
    fn drop(&mut self) { self.token.cancel(); }
}
