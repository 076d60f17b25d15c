//! Decoding and routing of inbound frames.
//!
//! The [`Dispatcher`] is the single writer of the [`ModuleRegistry`] and the
//! [`TopologyAssembler`]. It turns frames into typed [`Message`]s, applies
//! them to module state, and issues the outgoing requests the property and
//! discovery protocols need.
//!
//! Registry entries and the topology lock are never held at the same time.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::{
    sync::broadcast,
    time::{Duration, Instant},
};
use tracing::{debug, info, trace, warn};

use crate::{
    config::SessionConfig,
    error::SendError,
    message::{Command, MalformedFrame, Message},
    metrics,
    registry::{Module, ModuleId, ModuleKind, ModuleRegistry, PropertyType},
    topology::{Position, TopologyAssembler, TopologyState},
    transport::TransportId,
    worker::{OutboundHandle, TransportEvent, TransportEventKind},
};

/// Property numbers below this are reserved by the firmware.
const FIRST_USER_PROPERTY: u16 = 2;

/// Applies inbound messages to module state and issues requests.
pub struct Dispatcher {
    registry: Arc<ModuleRegistry>,
    topology: RwLock<TopologyAssembler>,
    routes: DashMap<TransportId, OutboundHandle>,
    tap: broadcast::Sender<Bytes>,
    freshness_window: Duration,
    module_timeout: Duration,
    malformed: AtomicU64,
}

impl Dispatcher {
    /// Create a dispatcher with an empty registry.
    #[must_use]
    pub fn new(config: &SessionConfig) -> Self {
        let mut topology = TopologyAssembler::new();
        topology.set_expected(config.expected_modules());
        let (tap, _) = broadcast::channel(config.passthrough_capacity());
        Self {
            registry: Arc::new(ModuleRegistry::default()),
            topology: RwLock::new(topology),
            routes: DashMap::new(),
            tap,
            freshness_window: config.freshness_window(),
            module_timeout: config.module_timeout(),
            malformed: AtomicU64::new(0),
        }
    }

    /// Shared read-only view of the modules.
    #[must_use]
    pub fn registry(&self) -> &Arc<ModuleRegistry> { &self.registry }

    /// Subscribe to every well-formed inbound frame.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> { self.tap.subscribe() }

    /// Make `handle` the outbound route for its transport.
    pub fn add_route(&self, handle: OutboundHandle) { self.routes.insert(handle.transport(), handle); }

    /// Forget the outbound route for `transport`.
    pub fn remove_route(&self, transport: TransportId) { self.routes.remove(&transport); }

    /// Number of transports with an outbound route.
    #[must_use]
    pub fn route_count(&self) -> usize { self.routes.len() }

    /// Frames dropped because they failed to decode.
    #[must_use]
    pub fn malformed_frames(&self) -> u64 { self.malformed.load(Ordering::Relaxed) }

    /// Apply one worker event.
    pub fn on_event(&self, event: TransportEvent) {
        match event.kind {
            TransportEventKind::Frame(frame) => {
                // Already logged and counted.
                let _ = self.on_frame(event.transport, frame);
            }
            TransportEventKind::Lost => self.on_transport_lost(event.transport),
        }
    }

    /// Decode `frame` from `transport` and apply it.
    ///
    /// # Errors
    ///
    /// Returns [`MalformedFrame`] if the frame is not a valid message or its
    /// payload does not fit its command. The frame is dropped and counted.
    pub fn on_frame(&self, transport: TransportId, frame: Bytes) -> Result<(), MalformedFrame> {
        let result = Message::decode(&frame)
            .and_then(|message| self.handle_message(transport, &message, Instant::now()));
        match &result {
            Ok(()) => {
                let _ = self.tap.send(frame);
            }
            Err(e) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                metrics::inc_malformed();
                warn!(
                    transport = %transport,
                    frame = %String::from_utf8_lossy(&frame),
                    error = %e,
                    "dropping malformed frame"
                );
            }
        }
        result
    }

    /// Apply a decoded message observed at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`MalformedFrame`] if the payload is too short for the
    /// command or names a property outside the table.
    pub fn handle_message(
        &self,
        transport: TransportId,
        message: &Message,
        now: Instant,
    ) -> Result<(), MalformedFrame> {
        let id = ModuleId::new(message.source);
        if id.is_broadcast() {
            return Ok(());
        }
        match message.command {
            Command::Health | Command::Warning => {
                if self.touch(id, now).is_none() {
                    debug!(module_id = %id, "traffic from unregistered module");
                    self.send_to(transport, &Message::request_uuid(id));
                }
            }
            Command::AssignId => self.on_registration(transport, id, message, now)?,
            Command::Topology => {
                let links = message.neighbours()?;
                if self.upsert_live(transport, id, now) {
                    self.send_to(transport, &Message::request_uuid(id));
                }
                let assigned = self.topology.write().observe_links(id, links);
                self.apply_positions(&assigned);
            }
            Command::PropertyUpdate => self.on_update(transport, id, message, now)?,
            Command::RequestProperty | Command::RequestUuid | Command::Other(_) => {
                trace!(module_id = %id, command = %message.command, "ignoring message");
            }
        }
        Ok(())
    }

    fn on_registration(
        &self,
        transport: TransportId,
        id: ModuleId,
        message: &Message,
        now: Instant,
    ) -> Result<(), MalformedFrame> {
        let registration = message.registration()?;
        let kind = ModuleKind::from_uuid(registration.uuid);
        let (created, reconnected) = {
            let (mut entry, created) = self.registry.upsert(id, transport, now);
            let module = entry.value_mut();
            let reconnected = !created && !module.connected;
            module.uuid = registration.uuid;
            module.kind = kind;
            module.version = registration.version;
            module.transport = transport;
            module.connected = true;
            module.last_updated = now;
            (created, reconnected)
        };
        if created || reconnected {
            info!(module_id = %id, kind = %kind, uuid = registration.uuid, "module connected");
        }

        let assigned = {
            let mut topology = self.topology.write();
            topology.register(id, registration.uuid);
            if kind == ModuleKind::Network && topology.root().is_none() {
                topology.set_root(id);
            }
            topology.resolve()
        };
        self.apply_positions(&assigned);
        metrics::set_modules_connected(self.registry.connected_count());
        Ok(())
    }

    fn on_update(
        &self,
        transport: TransportId,
        id: ModuleId,
        message: &Message,
        now: Instant,
    ) -> Result<(), MalformedFrame> {
        if message.destination < FIRST_USER_PROPERTY {
            self.touch(id, now);
            return Ok(());
        }
        let property = PropertyType::new(message.destination)
            .ok_or(MalformedFrame::PropertyOutOfRange(message.destination))?;
        let value = message.property_value()?;
        let created = self.upsert_live(transport, id, now);
        self.registry.with_module(id, |module| {
            let slot = module.properties.get_or_insert(property);
            slot.value = value;
            slot.last_update = Some(now);
        });
        trace!(module_id = %id, property = %property, value, "property updated");
        if created {
            // Present on the bus but never registered.
            self.send_to(transport, &Message::request_uuid(id));
        }
        Ok(())
    }

    /// Stamp liveness on a known module. Returns `None` if `id` is unseen.
    fn touch(&self, id: ModuleId, now: Instant) -> Option<()> {
        let revived = self.registry.with_module(id, |module| {
            module.last_updated = now;
            let revived = !module.connected;
            module.connected = true;
            revived.then_some(module.uuid)
        })?;
        if let Some(uuid) = revived {
            self.revive(id, uuid);
        }
        Some(())
    }

    /// Stamp liveness, creating the module if unseen. Returns whether it was
    /// created.
    fn upsert_live(&self, transport: TransportId, id: ModuleId, now: Instant) -> bool {
        let (created, revived) = {
            let (mut entry, created) = self.registry.upsert(id, transport, now);
            let module = entry.value_mut();
            module.last_updated = now;
            let revived = !module.connected;
            module.connected = true;
            (created, (created || revived).then_some(module.uuid))
        };
        if let Some(uuid) = revived {
            self.revive(id, uuid);
        }
        created
    }

    fn revive(&self, id: ModuleId, uuid: u64) {
        info!(module_id = %id, "module seen");
        let assigned = {
            let mut topology = self.topology.write();
            topology.register(id, uuid);
            topology.resolve()
        };
        self.apply_positions(&assigned);
        metrics::set_modules_connected(self.registry.connected_count());
    }

    fn apply_positions(&self, assigned: &[(ModuleId, Position)]) {
        for &(id, position) in assigned {
            self.registry.with_module(id, |module| module.position = Some(position));
        }
    }

    /// Last known value of `property` on module `id`.
    ///
    /// Issues a request when the cached value is missing or stale and
    /// returns the cached value regardless, `0.0` before the first update.
    /// Returns `None` if the module was never seen.
    pub fn property(&self, id: ModuleId, property: PropertyType) -> Option<f32> {
        self.property_at(id, property, Instant::now())
    }

    pub(crate) fn property_at(
        &self,
        id: ModuleId,
        property: PropertyType,
        now: Instant,
    ) -> Option<f32> {
        let window = self.freshness_window;
        let (value, request_on) = self.registry.with_module(id, |module| {
            let slot = module.properties.get_or_insert(property);
            let due = slot.needs_request(now, window);
            if due {
                slot.last_request = Some(now);
            }
            (slot.value, due.then_some(module.transport))
        })?;
        if let Some(transport) = request_on {
            self.request_property(transport, id, property);
        }
        Some(value)
    }

    /// Re-request every observed property whose value has gone stale.
    ///
    /// Only properties a caller asked for at least once are polled.
    pub fn request_stale_properties(&self, now: Instant) {
        let window = self.freshness_window;
        let mut due = Vec::new();
        self.registry.for_each_mut(|module| {
            if !module.connected {
                return;
            }
            let (id, transport) = (module.id, module.transport);
            for (property, slot) in module.properties.iter_mut() {
                if slot.last_request.is_some() && slot.needs_request(now, window) {
                    slot.last_request = Some(now);
                    due.push((transport, id, property));
                }
            }
        });
        for (transport, id, property) in due {
            self.request_property(transport, id, property);
        }
    }

    fn request_property(&self, transport: TransportId, id: ModuleId, property: PropertyType) {
        debug!(module_id = %id, property = %property, "requesting property");
        metrics::inc_property_requests();
        self.send_to(transport, &Message::request_property(id, property));
    }

    /// Mark modules silent for longer than the module timeout as
    /// disconnected. Returns the ids that changed.
    pub fn expire_idle_modules(&self, now: Instant) -> Vec<ModuleId> {
        let timeout = self.module_timeout;
        self.disconnect_where(|module| now.saturating_duration_since(module.last_updated) > timeout)
    }

    /// Mark every module reached through `transport` as disconnected.
    pub fn on_transport_lost(&self, transport: TransportId) {
        self.remove_route(transport);
        let lost = self.disconnect_where(|module| module.transport == transport);
        warn!(transport = %transport, modules = lost.len(), "transport lost");
    }

    fn disconnect_where(&self, mut predicate: impl FnMut(&Module) -> bool) -> Vec<ModuleId> {
        let mut gone = Vec::new();
        self.registry.for_each_mut(|module| {
            if module.connected && predicate(module) {
                module.connected = false;
                gone.push(module.id);
            }
        });
        if gone.is_empty() {
            return gone;
        }
        {
            let mut topology = self.topology.write();
            for &id in &gone {
                topology.mark_disconnected(id);
            }
        }
        for id in &gone {
            info!(module_id = %id, "module disconnected");
        }
        metrics::set_modules_connected(self.registry.connected_count());
        gone
    }

    /// Periodic housekeeping: expire silent modules, then poll stale
    /// properties.
    pub fn maintain(&self, now: Instant) {
        self.expire_idle_modules(now);
        self.request_stale_properties(now);
    }

    /// Broadcast the discovery trigger on every transport.
    pub fn discover(&self) {
        let request = Message::request_uuid(ModuleId::BROADCAST);
        for route in &self.routes {
            Self::push(route.value(), &request);
        }
    }

    /// Queue a raw frame on every transport.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::NoTransport`] if no transport is open, or the
    /// last queueing error if no transport accepted the frame.
    pub fn send_all(&self, frame: &Bytes) -> Result<(), SendError> {
        let mut outcome = Err(SendError::NoTransport);
        for route in &self.routes {
            match route.try_push(frame.clone()) {
                Ok(()) => outcome = Ok(()),
                Err(e) if outcome.is_err() => outcome = Err(e),
                Err(_) => {}
            }
        }
        outcome
    }

    fn send_to(&self, transport: TransportId, message: &Message) {
        match self.routes.get(&transport) {
            Some(route) => Self::push(route.value(), message),
            None => debug!(transport = %transport, "no route for outgoing message"),
        }
    }

    fn push(route: &OutboundHandle, message: &Message) {
        match message.encode() {
            Ok(frame) => {
                // A full queue is logged by the handle.
                let _ = route.try_push(frame);
            }
            Err(e) => warn!(command = %message.command, error = %e, "failed to encode message"),
        }
    }

    /// Set the module count required for a complete topology.
    pub fn set_expected_modules(&self, expected: Option<usize>) {
        self.topology.write().set_expected(expected);
    }

    /// Whether the expected number of modules is present and positioned.
    #[must_use]
    pub fn is_topology_complete(&self) -> bool {
        self.topology_state() == TopologyState::Complete
    }

    /// Current discovery state.
    #[must_use]
    pub fn topology_state(&self) -> TopologyState { self.topology.read().state() }

    /// Connected, positioned modules in topology order.
    #[must_use]
    pub fn ordered_modules(&self) -> Vec<Module> {
        let order = self.topology.read().order();
        order.into_iter().filter_map(|id| self.registry.get(id)).collect()
    }
}

#[cfg(test)]
mod tests;
