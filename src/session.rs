//! Public facade over one connection to a module network.
//!
//! A [`Session`] opens a [`TransportWorker`] per transport, runs the
//! [`Dispatcher`] on its own task fed by a single bounded event queue, and
//! exposes property reads, topology queries and raw passthrough.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use modilink::{
//!     registry::{ModuleId, PropertyType},
//!     session::Session,
//!     transport::{StreamTransport, TransportKind},
//! };
//!
//! # async fn demo() -> modilink::Result<()> {
//! let stream = tokio::net::TcpStream::connect("127.0.0.1:7000").await.expect("connect");
//! let session = Session::builder()
//!     .transport(StreamTransport::new(stream, TransportKind::Tcp))
//!     .expected_modules(3)
//!     .connect()
//!     .await?;
//! let modules = session.wait_for_topology(Duration::from_secs(5)).await?;
//! if let Some(property) = PropertyType::new(2) {
//!     let _ = session.property(modules[0].id, property);
//! }
//! session.close().await
//! # }
//! ```

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use bytes::Bytes;
use log::info;
use parking_lot::Mutex;
use tokio::{
    sync::{broadcast, mpsc},
    time::{Duration, Instant, MissedTickBehavior},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    config::SessionConfig,
    dispatch::Dispatcher,
    error::{ModiError, Result},
    message::Message,
    registry::{Module, ModuleId, ModuleKind, ModuleRegistry, PropertyType},
    topology::TopologyState,
    transport::{Transport, TransportId},
    worker::{TransportEvent, TransportWorker},
};

/// Interval at which [`Session::wait_for_topology`] re-checks completeness.
pub const TOPOLOGY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Collects transports and settings for a [`Session`].
#[derive(Default)]
pub struct SessionBuilder {
    config: SessionConfig,
    expected: Option<usize>,
    transports: Vec<Arc<dyn Transport>>,
}

impl SessionBuilder {
    /// Replace the session settings.
    #[must_use]
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a transport; ids are assigned in insertion order from zero.
    #[must_use]
    pub fn transport(self, transport: impl Transport) -> Self {
        self.shared_transport(Arc::new(transport))
    }

    /// Add a transport the caller keeps a handle to.
    #[must_use]
    pub fn shared_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.push(transport);
        self
    }

    /// Module count the topology must reach to be complete.
    #[must_use]
    pub fn expected_modules(mut self, count: usize) -> Self {
        self.expected = Some(count);
        self
    }

    /// Open every transport, start the dispatcher and broadcast discovery.
    ///
    /// # Errors
    ///
    /// Returns [`ModiError::Transport`] if a transport fails to open; any
    /// transports already opened are closed again.
    pub async fn connect(self) -> Result<Session> {
        let Self {
            config,
            expected,
            transports,
        } = self;
        let shutdown = CancellationToken::new();
        let dispatcher = Arc::new(Dispatcher::new(&config));
        if expected.is_some() {
            dispatcher.set_expected_modules(expected);
        }
        let tap = dispatcher.subscribe();
        let (events_tx, events_rx) = mpsc::channel(config.inbound_capacity());

        let mut workers = Vec::with_capacity(transports.len());
        for (index, transport) in transports.into_iter().enumerate() {
            let id = TransportId::new(u16::try_from(index).unwrap_or(u16::MAX));
            match TransportWorker::open(id, transport, events_tx.clone(), &config, &shutdown).await
            {
                Ok(worker) => {
                    dispatcher.add_route(worker.outbound());
                    workers.push(worker);
                }
                Err(e) => {
                    shutdown.cancel();
                    for worker in &workers {
                        let _ = worker.close().await;
                    }
                    return Err(e.into());
                }
            }
        }
        drop(events_tx);

        let tracker = TaskTracker::new();
        tracker.spawn(run_dispatcher(
            Arc::clone(&dispatcher),
            events_rx,
            shutdown.clone(),
            config.maintenance_interval(),
        ));
        tracker.close();

        dispatcher.discover();
        info!("session connected: transports={}", workers.len());
        Ok(Session {
            dispatcher,
            workers,
            tap: Mutex::new(tap),
            shutdown,
            tracker,
            closed: AtomicBool::new(false),
        })
    }
}

async fn run_dispatcher(
    dispatcher: Arc<Dispatcher>,
    mut events: mpsc::Receiver<TransportEvent>,
    shutdown: CancellationToken,
    period: Duration,
) {
    let mut maintenance = tokio::time::interval(period);
    maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            _ = maintenance.tick() => dispatcher.maintain(Instant::now()),
            Some(event) = events.recv() => dispatcher.on_event(event),
        }
    }
}

/// A live connection to a module network over one or more transports.
pub struct Session {
    dispatcher: Arc<Dispatcher>,
    workers: Vec<TransportWorker>,
    tap: Mutex<broadcast::Receiver<Bytes>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    closed: AtomicBool,
}

impl Session {
    /// Start configuring a session.
    #[must_use]
    pub fn builder() -> SessionBuilder { SessionBuilder::default() }

    /// Broadcast the discovery trigger again.
    pub fn discover(&self) { self.dispatcher.discover(); }

    /// Last known value of `property` on module `id`, requesting a fresh one
    /// when stale. `None` if the module was never seen.
    #[must_use]
    pub fn property(&self, id: ModuleId, property: PropertyType) -> Option<f32> {
        self.dispatcher.property(id, property)
    }

    /// Shared read-only view of the modules.
    #[must_use]
    pub fn registry(&self) -> Arc<ModuleRegistry> { Arc::clone(self.dispatcher.registry()) }

    /// Snapshot of one module.
    #[must_use]
    pub fn module(&self, id: ModuleId) -> Option<Module> { self.dispatcher.registry().get(id) }

    /// Snapshot of every module ever seen, ordered by id.
    #[must_use]
    pub fn modules(&self) -> Vec<Module> { self.dispatcher.registry().snapshot() }

    /// Snapshot of the modules of `kind`.
    #[must_use]
    pub fn modules_of_kind(&self, kind: ModuleKind) -> Vec<Module> {
        self.dispatcher.registry().of_kind(kind)
    }

    /// Set the module count required for a complete topology.
    pub fn set_expected_modules(&self, expected: Option<usize>) {
        self.dispatcher.set_expected_modules(expected);
    }

    /// Whether the expected modules are all present and positioned.
    #[must_use]
    pub fn is_topology_complete(&self) -> bool { self.dispatcher.is_topology_complete() }

    /// Current discovery state.
    #[must_use]
    pub fn topology_state(&self) -> TopologyState { self.dispatcher.topology_state() }

    /// Connected, positioned modules in topology order.
    #[must_use]
    pub fn ordered_modules(&self) -> Vec<Module> { self.dispatcher.ordered_modules() }

    /// Wait until the topology is complete and return it in order.
    ///
    /// # Errors
    ///
    /// Returns [`ModiError::TopologyTimeout`] if `timeout` elapses first.
    pub async fn wait_for_topology(&self, timeout: Duration) -> Result<Vec<Module>> {
        let wait = async {
            while !self.is_topology_complete() {
                tokio::time::sleep(TOPOLOGY_POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ModiError::TopologyTimeout)?;
        Ok(self.ordered_modules())
    }

    /// Write a raw frame to every open transport.
    ///
    /// # Errors
    ///
    /// Returns [`ModiError::Closed`] after [`close`](Self::close), or
    /// [`ModiError::Send`] if no transport accepted the frame.
    pub fn send(&self, frame: impl Into<Bytes>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ModiError::Closed);
        }
        Ok(self.dispatcher.send_all(&frame.into())?)
    }

    /// Encode and send `message` on every open transport.
    ///
    /// # Errors
    ///
    /// As for [`send`](Self::send), plus [`ModiError::Encode`].
    pub fn send_message(&self, message: &Message) -> Result<()> { self.send(message.encode()?) }

    /// Take the next inbound frame from the passthrough tap without waiting.
    ///
    /// Frames that arrived while the tap was full are skipped.
    pub fn recv(&self) -> Option<Bytes> {
        let mut tap = self.tap.lock();
        loop {
            match tap.try_recv() {
                Ok(frame) => return Some(frame),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "passthrough lagged");
                }
                Err(_) => return None,
            }
        }
    }

    /// Frames dropped because they failed to decode.
    #[must_use]
    pub fn malformed_frames(&self) -> u64 { self.dispatcher.malformed_frames() }

    /// Number of transports the session opened.
    #[must_use]
    pub fn transport_count(&self) -> usize { self.workers.len() }

    /// Stop the dispatcher and close every transport.
    ///
    /// Repeated calls return `Ok(())`.
    ///
    /// # Errors
    ///
    /// Returns the first error raised while releasing a transport; the
    /// remaining transports are still closed.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shutdown.cancel();
        self.tracker.wait().await;
        let mut first_error = None;
        for worker in &self.workers {
            self.dispatcher.remove_route(worker.id());
            if let Err(e) = worker.close().await {
                first_error.get_or_insert(e);
            }
        }
        info!("session closed");
        first_error.map_or(Ok(()), |e| Err(e.into()))
    }
}

impl Drop for Session {
    fn drop(&mut self) { self.shutdown.cancel(); }
}
