//! Two-tier endpoint cache.
//!
//! - [`EndpointCache`] lives on each conduit and holds short-lived
//!   [`TargetInfo`] snapshots of what each neighbor could accept.
//! - [`TopologyRegistry`] is owned by the world and shared by every
//!   conduit. It maps a coordinate to the [`TopologyEntry`] last built for
//!   it, so a conduit can re-adopt a recent scan instead of probing again.
//!
//! Cached values are hints. Anything used to commit a transfer is re-read
//! through the two-phase handler protocol first. Expiry is checked eagerly
//! on every read; the registry additionally gets a periodic sweep that
//! drops entries nobody has touched in a long time.

use std::collections::{BTreeMap, BTreeSet};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::direction::{Direction, DirectionMap};
use crate::handler::ManaHandler;
use crate::id::{GridPos, NodeId};
use crate::sim::{Mana, Ticks};

/// True while `scanned_at` is younger than `ttl` at `now`.
#[inline]
fn within(now: Ticks, scanned_at: Ticks, ttl: Ticks) -> bool {
    now.saturating_sub(scanned_at) < ttl
}

// ---------------------------------------------------------------------------
// Target snapshots
// ---------------------------------------------------------------------------

/// What a neighbor could accept when it was last looked at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetInfo {
    pub available_space: Mana,
    pub stored_amount: Mana,
    pub can_receive: bool,
    pub is_network_peer: bool,
    pub scan_tick: Ticks,
}

impl TargetInfo {
    /// Snapshot a handler as it is right now.
    pub fn snapshot(handler: &dyn ManaHandler, is_network_peer: bool, now: Ticks) -> Self {
        Self {
            available_space: handler.available_space(),
            stored_amount: handler.stored(),
            can_receive: handler.can_receive(),
            is_network_peer,
            scan_tick: now,
        }
    }

    pub fn is_fresh(&self, now: Ticks, ttl: Ticks) -> bool {
        within(now, self.scan_tick, ttl)
    }
}

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

/// What sits on the other side of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndpointKind {
    /// Another conduit; mana stays inside the network.
    Peer(NodeId),
    /// A producer or consumer outside the network.
    Terminal,
}

/// A cached handle to a neighbor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub pos: GridPos,
    pub kind: EndpointKind,
    pub priority: i32,
    pub last_access_tick: Ticks,
}

impl Endpoint {
    pub fn is_network_peer(&self) -> bool {
        matches!(self.kind, EndpointKind::Peer(_))
    }

    /// Whether two handles point at the same neighbor, ignoring bookkeeping.
    pub fn same_target(&self, other: &Endpoint) -> bool {
        self.pos == other.pos && self.kind == other.kind
    }
}

// ---------------------------------------------------------------------------
// Shared topology registry
// ---------------------------------------------------------------------------

/// The topology last built for one coordinate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyEntry {
    pub endpoints: DirectionMap<Option<Endpoint>>,
    /// Coordinates of every terminal (non-peer) endpoint.
    pub terminals: BTreeSet<GridPos>,
    pub last_scan: Ticks,
    pub last_touch: Ticks,
}

impl TopologyEntry {
    pub fn new(endpoints: DirectionMap<Option<Endpoint>>, now: Ticks) -> Self {
        let mut entry = Self {
            endpoints,
            terminals: BTreeSet::new(),
            last_scan: now,
            last_touch: now,
        };
        entry.rebuild_terminals();
        entry
    }

    pub fn is_fresh(&self, now: Ticks, ttl: Ticks) -> bool {
        within(now, self.last_scan, ttl)
    }

    fn rebuild_terminals(&mut self) {
        self.terminals = self
            .endpoints
            .iter()
            .filter_map(|(_, ep)| ep.filter(|e| !e.is_network_peer()).map(|e| e.pos))
            .collect();
    }
}

/// Coordinate-keyed topology cache shared by all conduits in a world.
#[derive(Debug, Clone, Default)]
pub struct TopologyRegistry {
    entries: BTreeMap<GridPos, TopologyEntry>,
    last_maintenance: Ticks,
}

impl TopologyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read an entry without touching it or checking its age.
    pub fn peek(&self, pos: GridPos) -> Option<&TopologyEntry> {
        self.entries.get(&pos)
    }

    /// Return the entry for `pos` if it is younger than `ttl`, marking it
    /// as used. Expired entries are never returned.
    pub fn lookup(&mut self, pos: GridPos, now: Ticks, ttl: Ticks) -> Option<&TopologyEntry> {
        let entry = self.entries.get_mut(&pos)?;
        if !entry.is_fresh(now, ttl) {
            return None;
        }
        entry.last_touch = now;
        Some(entry)
    }

    /// Replace the entry for `pos` with a freshly built one.
    pub fn store(&mut self, pos: GridPos, endpoints: DirectionMap<Option<Endpoint>>, now: Ticks) {
        self.entries.insert(pos, TopologyEntry::new(endpoints, now));
    }

    /// Overwrite one direction of an existing entry. No-op if absent.
    pub fn update_direction(
        &mut self,
        pos: GridPos,
        direction: Direction,
        endpoint: Option<Endpoint>,
        now: Ticks,
    ) {
        if let Some(entry) = self.entries.get_mut(&pos) {
            entry.endpoints[direction] = endpoint;
            entry.last_touch = now;
            entry.rebuild_terminals();
        }
    }

    /// Mark an entry as used without rebuilding it.
    pub fn touch(&mut self, pos: GridPos, now: Ticks) {
        if let Some(entry) = self.entries.get_mut(&pos) {
            entry.last_touch = now;
        }
    }

    /// Drop the whole entry for `pos`.
    pub fn invalidate(&mut self, pos: GridPos) {
        self.entries.remove(&pos);
    }

    /// Drop one direction of the entry for `pos`.
    pub fn invalidate_direction(&mut self, pos: GridPos, direction: Direction) {
        if let Some(entry) = self.entries.get_mut(&pos) {
            entry.endpoints[direction] = None;
            entry.rebuild_terminals();
        }
    }

    /// Drop every entry whose coordinate has not been touched for at
    /// least `stale_age` ticks. Returns how many were purged.
    pub fn perform_maintenance(&mut self, now: Ticks, stale_age: Ticks) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| within(now, entry.last_touch, stale_age));
        self.last_maintenance = now;
        let purged = before - self.entries.len();
        if purged > 0 {
            debug!("topology maintenance at tick {now}: purged {purged} stale entries");
        }
        purged
    }

    /// Wipe everything (world unload).
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn last_maintenance(&self) -> Ticks {
        self.last_maintenance
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Per-node cache
// ---------------------------------------------------------------------------

/// Short-lived target snapshots for one conduit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointCache {
    pos: GridPos,
    targets: DirectionMap<Option<TargetInfo>>,
    last_scan: Option<Ticks>,
}

impl EndpointCache {
    pub fn new(pos: GridPos) -> Self {
        Self {
            pos,
            targets: DirectionMap::default(),
            last_scan: None,
        }
    }

    /// The snapshot for `direction`, or `None` if absent or expired.
    pub fn cached_target(&self, direction: Direction, now: Ticks, ttl: Ticks) -> Option<TargetInfo> {
        self.targets[direction].filter(|info| info.is_fresh(now, ttl))
    }

    /// Snapshot `handler` as the current target on `direction`.
    pub fn set_cached_target(
        &mut self,
        direction: Direction,
        handler: &dyn ManaHandler,
        is_network_peer: bool,
        now: Ticks,
    ) -> TargetInfo {
        let info = TargetInfo::snapshot(handler, is_network_peer, now);
        self.targets[direction] = Some(info);
        info
    }

    /// Store a snapshot taken elsewhere.
    pub fn store_target(&mut self, direction: Direction, info: TargetInfo) {
        self.targets[direction] = Some(info);
    }

    /// Forget the snapshot on one port without touching shared state.
    pub fn clear_target(&mut self, direction: Direction) {
        self.targets[direction] = None;
    }

    /// Record that a scan finished at `now`.
    pub fn mark_scanned(&mut self, now: Ticks) {
        self.last_scan = Some(now);
    }

    pub fn last_scan(&self) -> Option<Ticks> {
        self.last_scan
    }

    /// True when nothing is cached or the last scan is at least
    /// `rescan_interval` old.
    pub fn needs_rescan(&self, now: Ticks, rescan_interval: Ticks) -> bool {
        let empty = self.targets.iter().all(|(_, t)| t.is_none());
        match self.last_scan {
            None => true,
            Some(_) if empty => true,
            Some(at) => !within(now, at, rescan_interval),
        }
    }

    /// Clear every snapshot and the shared entry for this coordinate.
    pub fn invalidate_all(&mut self, registry: &mut TopologyRegistry) {
        for slot in self.targets.values_mut() {
            *slot = None;
        }
        self.last_scan = None;
        registry.invalidate(self.pos);
    }

    /// Clear one port, locally and in the shared entry.
    pub fn invalidate_direction(&mut self, direction: Direction, registry: &mut TopologyRegistry) {
        self.targets[direction] = None;
        registry.invalidate_direction(self.pos, direction);
    }
}
