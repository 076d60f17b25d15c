//! Simulated firmware for a bus of modules.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bytes::Bytes;
use modilink::{
    Command,
    Message,
    ModuleId,
    Neighbours,
    PropertyType,
    transport::{MemoryPeer, MemoryTransport, TransportKind, memory_pair},
};
use tokio::sync::mpsc;

/// Firmware version reported by simulated modules unless overridden.
pub const DEFAULT_VERSION: u16 = 0x2A05;

/// One simulated module.
#[derive(Clone, Debug)]
pub struct FakeModule {
    pub id: ModuleId,
    pub uuid: u64,
    pub version: u16,
    pub links: Neighbours,
    properties: HashMap<u8, f32>,
}

impl FakeModule {
    /// A module with `id` and `uuid` and no neighbours.
    #[must_use]
    pub fn new(id: u16, uuid: u64) -> Self {
        Self {
            id: ModuleId::new(id),
            uuid,
            version: DEFAULT_VERSION,
            links: Neighbours::default(),
            properties: HashMap::new(),
        }
    }

    /// A network module, which becomes the topology root.
    #[must_use]
    pub fn network(id: u16) -> Self { Self::new(id, u64::from(id)) }

    /// A button module.
    #[must_use]
    pub fn button(id: u16) -> Self { Self::new(id, 0x2030_0000_0000 | u64::from(id)) }

    /// A motor module.
    #[must_use]
    pub fn motor(id: u16) -> Self { Self::new(id, 0x4010_0000_0000 | u64::from(id)) }

    /// Set the neighbour links reported on discovery.
    #[must_use]
    pub fn links(mut self, links: Neighbours) -> Self {
        self.links = links;
        self
    }

    /// Set the value reported for property `index`.
    #[must_use]
    pub fn property(mut self, index: u8, value: f32) -> Self {
        self.properties.insert(index, value);
        self
    }
}

#[derive(Debug, Default)]
struct BusState {
    modules: Vec<FakeModule>,
    silent: bool,
    discovery_requests: usize,
    property_requests: HashMap<(ModuleId, u8), usize>,
    written: Vec<Message>,
}

enum Control {
    Emit(Bytes),
    Unplug,
}

/// Simulated firmware driving the device side of a [`MemoryTransport`].
///
/// Modules answer `RequestUuid` with a registration followed by their
/// neighbour links, and `RequestProperty` with a property update. Every
/// frame the host writes is recorded.
pub struct FakeBus {
    state: Arc<Mutex<BusState>>,
    control: mpsc::UnboundedSender<Control>,
}

impl FakeBus {
    /// Start simulating `modules` and return the transport the host should
    /// open.
    ///
    /// Must be called inside a Tokio runtime.
    #[must_use]
    pub fn spawn(modules: Vec<FakeModule>) -> (Self, MemoryTransport) {
        let (transport, peer) = memory_pair(TransportKind::Memory);
        let state = Arc::new(Mutex::new(BusState {
            modules,
            ..BusState::default()
        }));
        let (control, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(peer, Arc::clone(&state), rx));
        (Self { state, control }, transport)
    }

    fn state(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Change the value a module reports for property `index`.
    pub fn set_property(&self, id: u16, index: u8, value: f32) {
        if let Some(module) = self.state().modules.iter_mut().find(|m| m.id.as_u16() == id) {
            module.properties.insert(index, value);
        }
    }

    /// Stop answering property requests.
    pub fn set_silent(&self, silent: bool) { self.state().silent = silent; }

    /// Push an unsolicited property update from module `id`.
    pub fn push_update(&self, id: u16, index: u8, value: f32) {
        if let Some(property) = PropertyType::new(u16::from(index)) {
            self.emit(&Message::property_update(ModuleId::new(id), property, value));
        }
    }

    /// Send a heartbeat from module `id`.
    pub fn heartbeat(&self, id: u16) { self.emit(&Message::health(ModuleId::new(id))); }

    /// Send `message` to the host.
    pub fn emit(&self, message: &Message) {
        if let Ok(frame) = message.encode() {
            self.emit_raw(frame);
        }
    }

    /// Send raw bytes to the host.
    pub fn emit_raw(&self, bytes: impl Into<Bytes>) {
        let _ = self.control.send(Control::Emit(bytes.into()));
    }

    /// Drop the device side of the link, as if the cable was pulled.
    pub fn unplug(&self) { let _ = self.control.send(Control::Unplug); }

    /// Discovery triggers received so far.
    #[must_use]
    pub fn discovery_requests(&self) -> usize { self.state().discovery_requests }

    /// Requests received for property `index` of module `id`.
    #[must_use]
    pub fn property_requests(&self, id: u16, index: u8) -> usize {
        self.state()
            .property_requests
            .get(&(ModuleId::new(id), index))
            .copied()
            .unwrap_or(0)
    }

    /// Every message the host wrote, in order.
    #[must_use]
    pub fn written(&self) -> Vec<Message> { self.state().written.clone() }
}

async fn run(
    mut peer: MemoryPeer,
    state: Arc<Mutex<BusState>>,
    mut control: mpsc::UnboundedReceiver<Control>,
) {
    loop {
        tokio::select! {
            frame = peer.recv() => {
                let Some(frame) = frame else { return };
                let replies = respond(&state, &frame);
                for reply in replies {
                    peer.send(reply);
                }
            }
            command = control.recv() => match command {
                Some(Control::Emit(bytes)) => {
                    peer.send(bytes);
                }
                Some(Control::Unplug) | None => return,
            },
        }
    }
}

fn respond(state: &Mutex<BusState>, frame: &[u8]) -> Vec<Bytes> {
    let Ok(message) = Message::decode(frame) else {
        log::debug!("fake bus ignoring undecodable frame");
        return Vec::new();
    };
    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
    state.written.push(message.clone());
    let target = ModuleId::new(message.destination);
    let mut replies = Vec::new();
    match message.command {
        Command::RequestUuid => {
            state.discovery_requests += 1;
            for module in state
                .modules
                .iter()
                .filter(|m| target.is_broadcast() || m.id == target)
            {
                replies.push(Message::assign_id(module.id, module.uuid, module.version));
                replies.push(Message::topology(module.id, module.links));
            }
        }
        Command::RequestProperty => {
            let Some(&index) = message.payload.first() else {
                return Vec::new();
            };
            *state.property_requests.entry((target, index)).or_default() += 1;
            let value = state
                .modules
                .iter()
                .find(|m| m.id == target)
                .map(|m| m.properties.get(&index).copied().unwrap_or_default());
            if let (false, Some(value), Some(property)) =
                (state.silent, value, PropertyType::new(u16::from(index)))
            {
                replies.push(Message::property_update(target, property, value));
            }
        }
        _ => {}
    }
    replies.into_iter().filter_map(|m| m.encode().ok()).collect()
}
