//! Spatial view of the modules attached to the network.
//!
//! The assembler learns module positions either directly through
//! [`TopologyAssembler::observe`] or from neighbour links reported by the
//! modules themselves. Links are resolved breadth-first from the root
//! (the network module), which sits at the origin.
//!
//! Completeness is not sticky: a module that disconnects after the topology
//! was complete drops it back to [`TopologyState::Accumulating`].

use std::{
    cmp::Ordering,
    collections::{HashMap, HashSet, VecDeque},
};

use crate::registry::ModuleId;

/// Neighbour id meaning "nothing attached on this side".
pub const NO_NEIGHBOUR: u16 = 0xFFFF;

/// Grid position of a module relative to the root.
///
/// Positions are totally ordered by squared distance from the origin.
/// Ties at equal radius go to the smaller `x`, then to the larger `y`.
///
/// ```
/// use modilink::topology::Position;
///
/// let mut cells = vec![Position::new(1, 0), Position::new(0, 1), Position::new(0, 0)];
/// cells.sort();
/// assert_eq!(cells, vec![Position::new(0, 0), Position::new(0, 1), Position::new(1, 0)]);
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Position {
    /// The root module's position.
    pub const ORIGIN: Self = Self { x: 0, y: 0 };

    /// Create a position.
    #[must_use]
    pub const fn new(x: i32, y: i32) -> Self { Self { x, y } }

    /// Squared Euclidean distance from the origin.
    #[must_use]
    pub fn radius_squared(self) -> i64 {
        let (x, y) = (i64::from(self.x), i64::from(self.y));
        x * x + y * y
    }

    fn step(self, side: Side) -> Self {
        match side {
            Side::Right => Self::new(self.x + 1, self.y),
            Side::Top => Self::new(self.x, self.y + 1),
            Side::Left => Self::new(self.x - 1, self.y),
            Side::Bottom => Self::new(self.x, self.y - 1),
        }
    }
}

impl Ord for Position {
    fn cmp(&self, other: &Self) -> Ordering {
        self.radius_squared()
            .cmp(&other.radius_squared())
            .then(self.x.cmp(&other.x))
            .then(other.y.cmp(&self.y))
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}

#[derive(Clone, Copy, Debug)]
enum Side {
    Right,
    Top,
    Left,
    Bottom,
}

/// Neighbour links reported by one module.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Neighbours {
    pub right: Option<ModuleId>,
    pub top: Option<ModuleId>,
    pub left: Option<ModuleId>,
    pub bottom: Option<ModuleId>,
}

impl Neighbours {
    /// Decode four little-endian ids: right, top, left, bottom.
    ///
    /// `bytes` must hold at least eight bytes.
    pub(crate) fn from_payload(bytes: &[u8]) -> Self {
        let id = |i: usize| {
            let raw = u16::from_le_bytes([bytes[i], bytes[i + 1]]);
            (raw != NO_NEIGHBOUR).then_some(ModuleId::new(raw))
        };
        Self {
            right: id(0),
            top: id(2),
            left: id(4),
            bottom: id(6),
        }
    }

    /// Encode as four little-endian ids, [`NO_NEIGHBOUR`] for empty sides.
    #[must_use]
    pub fn to_payload(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        for (i, side) in [self.right, self.top, self.left, self.bottom].into_iter().enumerate() {
            let raw = side.map_or(NO_NEIGHBOUR, ModuleId::as_u16);
            out[i * 2..i * 2 + 2].copy_from_slice(&raw.to_le_bytes());
        }
        out
    }

    fn sides(&self) -> [(Side, Option<ModuleId>); 4] {
        [
            (Side::Right, self.right),
            (Side::Top, self.top),
            (Side::Left, self.left),
            (Side::Bottom, self.bottom),
        ]
    }
}

/// Progress of topology discovery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TopologyState {
    /// Nothing observed yet.
    Empty,
    /// Modules observed, but not all positioned or not all present.
    Accumulating,
    /// Every expected module is present and positioned.
    Complete,
}

#[derive(Clone, Debug)]
struct Entry {
    uuid: u64,
    position: Option<Position>,
    links: Option<Neighbours>,
    connected: bool,
}

impl Entry {
    fn new(uuid: u64) -> Self {
        Self {
            uuid,
            position: None,
            links: None,
            connected: true,
        }
    }
}

/// Builds the spatial graph of modules and answers completeness queries.
#[derive(Debug, Default)]
pub struct TopologyAssembler {
    entries: HashMap<ModuleId, Entry>,
    root: Option<ModuleId>,
    expected: Option<usize>,
}

impl TopologyAssembler {
    /// Create an empty assembler.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Record a module reporting its position directly.
    pub fn observe(&mut self, id: ModuleId, uuid: u64, position: Position) {
        let entry = self.entry(id, uuid);
        entry.position = Some(position);
    }

    /// Record a module as present without a known position yet.
    pub fn register(&mut self, id: ModuleId, uuid: u64) { self.entry(id, uuid); }

    fn entry(&mut self, id: ModuleId, uuid: u64) -> &mut Entry {
        let entry = self.entries.entry(id).or_insert_with(|| Entry::new(uuid));
        if uuid != 0 {
            entry.uuid = uuid;
        }
        entry.connected = true;
        entry
    }

    /// Use `id` as the origin for link resolution.
    pub fn set_root(&mut self, id: ModuleId) {
        self.root = Some(id);
        self.entry(id, 0).position = Some(Position::ORIGIN);
    }

    /// Module currently used as the origin, if any.
    #[must_use]
    pub fn root(&self) -> Option<ModuleId> { self.root }

    /// Store the neighbour links reported by `id` and re-resolve positions.
    ///
    /// Returns the positions assigned by this resolution pass.
    pub fn observe_links(&mut self, id: ModuleId, links: Neighbours) -> Vec<(ModuleId, Position)> {
        self.entry(id, 0).links = Some(links);
        self.resolve()
    }

    /// Walk neighbour links breadth-first from the root and assign positions.
    ///
    /// Positions reported directly through [`observe`](Self::observe) for
    /// modules the walk cannot reach are left untouched.
    pub fn resolve(&mut self) -> Vec<(ModuleId, Position)> {
        let Some(root) = self.root.filter(|r| self.is_connected(*r)) else {
            return Vec::new();
        };
        let mut assigned = HashSet::from([root]);
        let mut order = vec![(root, Position::ORIGIN)];
        let mut queue = VecDeque::from([(root, Position::ORIGIN)]);

        while let Some((id, here)) = queue.pop_front() {
            let Some(links) = self.entries.get(&id).and_then(|e| e.links) else {
                continue;
            };
            for (side, neighbour) in links.sides() {
                let Some(next) = neighbour else { continue };
                if assigned.contains(&next) || !self.is_connected(next) {
                    continue;
                }
                let there = here.step(side);
                assigned.insert(next);
                order.push((next, there));
                queue.push_back((next, there));
            }
        }

        for (id, position) in &order {
            if let Some(entry) = self.entries.get_mut(id) {
                entry.position = Some(*position);
            }
        }
        order
    }

    /// Mark `id` as gone; completeness is re-evaluated on the next query.
    pub fn mark_disconnected(&mut self, id: ModuleId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.connected = false;
        }
    }

    fn is_connected(&self, id: ModuleId) -> bool {
        self.entries.get(&id).is_some_and(|e| e.connected)
    }

    /// Known position of `id`.
    #[must_use]
    pub fn position(&self, id: ModuleId) -> Option<Position> {
        self.entries.get(&id).and_then(|e| e.position)
    }

    /// Uuid recorded for `id`, zero if it never registered.
    #[must_use]
    pub fn uuid(&self, id: ModuleId) -> Option<u64> { self.entries.get(&id).map(|e| e.uuid) }

    /// Number of connected modules observed.
    #[must_use]
    pub fn observed_count(&self) -> usize { self.entries.values().filter(|e| e.connected).count() }

    /// Record the module count announced by the discovery trigger.
    pub fn set_expected(&mut self, expected: Option<usize>) { self.expected = expected; }

    /// Expected module count, if announced.
    #[must_use]
    pub fn expected(&self) -> Option<usize> { self.expected }

    /// Whether exactly `expected` modules are connected and all of them
    /// have a position.
    #[must_use]
    pub fn is_complete(&self, expected: usize) -> bool {
        let mut connected = self.entries.values().filter(|e| e.connected).peekable();
        if connected.peek().is_none() {
            return false;
        }
        let mut count = 0;
        for entry in connected {
            if entry.position.is_none() {
                return false;
            }
            count += 1;
        }
        count == expected
    }

    /// Current discovery state against the announced expected count.
    #[must_use]
    pub fn state(&self) -> TopologyState {
        if self.entries.is_empty() {
            TopologyState::Empty
        } else if self.expected.is_some_and(|n| self.is_complete(n)) {
            TopologyState::Complete
        } else {
            TopologyState::Accumulating
        }
    }

    /// Connected, positioned modules sorted by [`Position`] order.
    #[must_use]
    pub fn order(&self) -> Vec<ModuleId> {
        let mut positioned: Vec<(Position, ModuleId)> = self
            .entries
            .iter()
            .filter(|(_, e)| e.connected)
            .filter_map(|(id, e)| e.position.map(|p| (p, *id)))
            .collect();
        positioned.sort();
        positioned.into_iter().map(|(_, id)| id).collect()
    }
}
