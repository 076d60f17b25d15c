//! Live set of discovered modules and their property tables.
//!
//! [`ModuleRegistry`] stores modules in a [`DashMap`], so readers never
//! observe a property table half-way through an update. Entries are never
//! removed: a module that goes quiet is marked disconnected instead, and ids
//! held by callers stay valid for the life of the registry. Mutation is
//! crate-private and performed by the [`Dispatcher`](crate::dispatch::Dispatcher).

use std::fmt;

use dashmap::{DashMap, mapref::one::RefMut};
use tokio::time::{Duration, Instant};

use crate::{topology::Position, transport::TransportId};

/// Identifier assigned to a module by the network.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleId(u16);

impl ModuleId {
    /// Reserved id addressing every module at once.
    pub const BROADCAST: Self = Self(0xFFF);

    /// Create a new [`ModuleId`] with the provided value.
    #[must_use]
    pub const fn new(id: u16) -> Self { Self(id) }

    /// Return the inner `u16` representation.
    #[must_use]
    pub const fn as_u16(self) -> u16 { self.0 }

    /// Whether this is [`ModuleId::BROADCAST`].
    #[must_use]
    pub const fn is_broadcast(self) -> bool { self.0 == Self::BROADCAST.0 }
}

impl From<u16> for ModuleId {
    fn from(value: u16) -> Self { Self(value) }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{:#05x}", self.0) }
}

/// Number of property slots held per module.
pub const PROPERTY_SLOTS: usize = 32;

/// Property tag indexing a slot of a [`PropertyTable`].
///
/// Tags are bounded by [`PROPERTY_SLOTS`]; their meaning depends on the
/// module kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PropertyType(u8);

impl PropertyType {
    /// Create a tag for slot `index`, or `None` if it is out of range.
    #[must_use]
    pub fn new(index: u16) -> Option<Self> {
        u8::try_from(index)
            .ok()
            .filter(|&i| usize::from(i) < PROPERTY_SLOTS)
            .map(Self)
    }

    /// Slot number used on the wire.
    #[must_use]
    pub const fn index(self) -> u8 { self.0 }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

/// Module kinds known to the network, derived from the uuid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ModuleKind {
    Network,
    Env,
    Gyro,
    Mic,
    Button,
    Dial,
    Ultrasonic,
    Ir,
    Display,
    Motor,
    Led,
    Speaker,
    /// Kind not recognised, or not yet registered.
    Unknown,
}

impl ModuleKind {
    /// Derive the kind from the category bits of a 48-bit uuid.
    #[must_use]
    pub fn from_uuid(uuid: u64) -> Self {
        match uuid >> 32 {
            0x0000 => Self::Network,
            0x2000 => Self::Env,
            0x2010 => Self::Gyro,
            0x2020 => Self::Mic,
            0x2030 => Self::Button,
            0x2040 => Self::Dial,
            0x2050 => Self::Ultrasonic,
            0x2060 => Self::Ir,
            0x4000 => Self::Display,
            0x4010 => Self::Motor,
            0x4020 => Self::Led,
            0x4030 => Self::Speaker,
            _ => Self::Unknown,
        }
    }

    /// Lower-case name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Env => "env",
            Self::Gyro => "gyro",
            Self::Mic => "mic",
            Self::Button => "button",
            Self::Dial => "dial",
            Self::Ultrasonic => "ultrasonic",
            Self::Ir => "ir",
            Self::Display => "display",
            Self::Motor => "motor",
            Self::Led => "led",
            Self::Speaker => "speaker",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Last known value of one module property.
///
/// `last_update` only advances when the module reports the property.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Property {
    pub value: f32,
    pub last_update: Option<Instant>,
    pub last_request: Option<Instant>,
}

impl Default for Property {
    fn default() -> Self {
        Self {
            value: 0.0,
            last_update: None,
            last_request: None,
        }
    }
}

impl Property {
    /// Whether a fresh request should be sent at `now`.
    ///
    /// True if the property was never requested, or if neither an update nor
    /// a request happened within `window`. A property updating faster than
    /// the window is never re-requested.
    #[must_use]
    pub fn needs_request(&self, now: Instant, window: Duration) -> bool {
        let Some(requested) = self.last_request else {
            return true;
        };
        let newest = self
            .last_update
            .map_or(requested, |updated| updated.max(requested));
        now.saturating_duration_since(newest) > window
    }
}

/// Fixed-size property table indexed by [`PropertyType`].
///
/// An empty slot means the property was never observed or requested.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PropertyTable([Option<Property>; PROPERTY_SLOTS]);

impl PropertyTable {
    /// Borrow the property in `slot`, if present.
    #[must_use]
    pub fn get(&self, slot: PropertyType) -> Option<&Property> {
        self.0[usize::from(slot.index())].as_ref()
    }

    /// Borrow the property in `slot`, inserting a default entry if empty.
    pub fn get_or_insert(&mut self, slot: PropertyType) -> &mut Property {
        self.0[usize::from(slot.index())].get_or_insert_with(Property::default)
    }

    /// Iterate over populated slots in tag order.
    pub fn iter(&self) -> impl Iterator<Item = (PropertyType, &Property)> {
        self.0.iter().enumerate().filter_map(|(i, slot)| {
            let tag = PropertyType(u8::try_from(i).ok()?);
            slot.as_ref().map(|property| (tag, property))
        })
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = (PropertyType, &mut Property)> {
        self.0.iter_mut().enumerate().filter_map(|(i, slot)| {
            let tag = PropertyType(u8::try_from(i).ok()?);
            slot.as_mut().map(|property| (tag, property))
        })
    }

    /// Number of populated slots.
    #[must_use]
    pub fn len(&self) -> usize { self.0.iter().flatten().count() }

    /// Whether no slot is populated.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

/// One module attached to the network.
#[derive(Clone, Debug, PartialEq)]
pub struct Module {
    pub id: ModuleId,
    /// 48-bit uuid, zero until the module registers.
    pub uuid: u64,
    pub kind: ModuleKind,
    /// Packed firmware version, zero until the module registers.
    pub version: u16,
    /// Transport the module was last heard on.
    pub transport: TransportId,
    pub properties: PropertyTable,
    /// Grid position, once topology has resolved it.
    pub position: Option<Position>,
    pub connected: bool,
    pub last_updated: Instant,
}

impl Module {
    pub(crate) fn new(id: ModuleId, transport: TransportId, now: Instant) -> Self {
        Self {
            id,
            uuid: 0,
            kind: ModuleKind::Unknown,
            version: 0,
            transport,
            properties: PropertyTable::default(),
            position: None,
            connected: true,
            last_updated: now,
        }
    }

    /// Firmware version rendered as `major.minor.patch`.
    #[must_use]
    pub fn version_string(&self) -> String {
        let v = self.version;
        format!("{}.{}.{}", v >> 13, (v % (1 << 13)) >> 8, v % (1 << 8))
    }

    /// Last known value of `property` without triggering a request.
    #[must_use]
    pub fn cached_property(&self, property: PropertyType) -> Option<f32> {
        self.properties.get(property).map(|p| p.value)
    }
}

/// Concurrent registry of modules keyed by [`ModuleId`].
#[derive(Debug, Default)]
pub struct ModuleRegistry(DashMap<ModuleId, Module>);

impl ModuleRegistry {
    /// Snapshot of the module with `id`, if it was ever registered.
    #[must_use]
    pub fn get(&self, id: ModuleId) -> Option<Module> { self.0.get(&id).map(|m| m.value().clone()) }

    /// Whether a module with `id` has ever been seen.
    #[must_use]
    pub fn contains(&self, id: ModuleId) -> bool { self.0.contains_key(&id) }

    /// Number of modules ever seen.
    #[must_use]
    pub fn len(&self) -> usize { self.0.len() }

    /// Whether no module has been seen.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    /// Snapshot of every module, ordered by id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Module> {
        let mut modules: Vec<Module> = self.0.iter().map(|m| m.value().clone()).collect();
        modules.sort_by_key(|m| m.id);
        modules
    }

    /// Snapshot of the modules of `kind`, ordered by id.
    #[must_use]
    pub fn of_kind(&self, kind: ModuleKind) -> Vec<Module> {
        let mut modules: Vec<Module> = self
            .0
            .iter()
            .filter(|m| m.kind == kind)
            .map(|m| m.value().clone())
            .collect();
        modules.sort_by_key(|m| m.id);
        modules
    }

    /// Number of modules currently marked connected.
    #[must_use]
    pub fn connected_count(&self) -> usize { self.0.iter().filter(|m| m.connected).count() }

    /// Fetch `id` for mutation, creating it on `transport` if unseen.
    ///
    /// Returns the entry and whether it was created.
    pub(crate) fn upsert(
        &self,
        id: ModuleId,
        transport: TransportId,
        now: Instant,
    ) -> (RefMut<'_, ModuleId, Module>, bool) {
        let mut created = false;
        let entry = self.0.entry(id).or_insert_with(|| {
            created = true;
            Module::new(id, transport, now)
        });
        (entry, created)
    }

    /// Run `f` against the module with `id`, if present.
    pub(crate) fn with_module<R>(&self, id: ModuleId, f: impl FnOnce(&mut Module) -> R) -> Option<R> {
        self.0.get_mut(&id).map(|mut m| f(m.value_mut()))
    }

    /// Run `f` against every module.
    ///
    /// Holds per-shard write locks while iterating.
    pub(crate) fn for_each_mut(&self, mut f: impl FnMut(&mut Module)) {
        for mut m in self.0.iter_mut() {
            f(m.value_mut());
        }
    }
}

#[cfg(test)]
mod tests;
