//! The world: conduit arena, coordinate index, terminal handlers, and the
//! tick scheduler.
//!
//! # Tick
//!
//! Each [`ManaWorld::step`] visits every conduit in arena order and:
//! 1. runs whatever topology scan its schedule calls for;
//! 2. calls the transfer engine up to `max_transfers_per_tick` times,
//!    stopping at the first attempt that moves nothing;
//!
//! then runs the registry sweep on maintenance ticks and delivers
//! buffered events to listeners.
//!
//! Placement and removal notify the six neighbors so their caches drop
//! whatever they knew about that coordinate.

use std::collections::BTreeMap;

use log::debug;
use slotmap::SlotMap;

use crate::cache::{EndpointCache, TopologyRegistry};
use crate::config::{ConfigError, NetworkConfig};
use crate::direction::Direction;
use crate::dirty::DirtyTracker;
use crate::event::{EventBus, NetworkEvent};
use crate::handler::{ManaBuffer, ManaHandler};
use crate::id::{GridPos, NodeId};
use crate::io::{IoConfig, PortMode};
use crate::persist::{self, PersistError, RestoreError};
use crate::scanner::{Diagnostics, NetworkManager, ScanGuard, ScanOutcome, ScanState};
use crate::sim::{Mana, StateHash, TickStats, Ticks};
use crate::tier::Tier;
use crate::transfer::{TransferManager, TransferOutcome, TransferState};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum WorldError {
    #[error("position {0:?} is already occupied")]
    Occupied(GridPos),
    #[error("no conduit with id {0:?}")]
    UnknownNode(NodeId),
    #[error("no terminal at {0:?}")]
    UnknownTerminal(GridPos),
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error(transparent)]
    Restore(#[from] RestoreError),
}

// ---------------------------------------------------------------------------
// Conduit
// ---------------------------------------------------------------------------

/// Which routing model a conduit uses. A conduit uses exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RoutingMode {
    /// Point-to-point transfers between neighbors.
    #[default]
    Direct,
    /// Part of a pooled network; the transfer engine leaves it alone.
    Pooled,
}

/// A network node: a mana buffer with six configurable ports.
#[derive(Debug, Clone)]
pub struct Conduit {
    pos: GridPos,
    buffer: ManaBuffer,
    tier: Option<Tier>,
    io: IoConfig,
    routing: RoutingMode,
    pub(crate) transfer: TransferState,
    pub(crate) scan: ScanState,
    pub(crate) cache: EndpointCache,
}

impl Conduit {
    fn new(pos: GridPos, buffer: ManaBuffer, tier: Option<Tier>, config: &NetworkConfig) -> Self {
        Self {
            pos,
            buffer,
            tier,
            io: IoConfig::new(),
            routing: RoutingMode::Direct,
            transfer: TransferState::new(),
            scan: ScanState::new(pos, config),
            cache: EndpointCache::new(pos),
        }
    }

    pub fn pos(&self) -> GridPos {
        self.pos
    }

    pub fn buffer(&self) -> &ManaBuffer {
        &self.buffer
    }

    pub(crate) fn buffer_mut(&mut self) -> &mut ManaBuffer {
        &mut self.buffer
    }

    pub fn tier(&self) -> Option<Tier> {
        self.tier
    }

    pub fn io(&self) -> &IoConfig {
        &self.io
    }

    pub fn routing(&self) -> RoutingMode {
        self.routing
    }

    pub fn transfer_state(&self) -> &TransferState {
        &self.transfer
    }

    pub fn scan_state(&self) -> &ScanState {
        &self.scan
    }

    pub fn cache(&self) -> &EndpointCache {
        &self.cache
    }

    /// Whether this conduit would take mana arriving through `port` now.
    pub fn accepts_input(&self, port: Direction) -> bool {
        self.routing == RoutingMode::Direct
            && self.io.can_input(port)
            && self.buffer.can_receive()
            && self.buffer.available_space() > 0
    }

    /// Drop caches and scan state; keep the durable transfer fields.
    fn reset_transient(&mut self, config: &NetworkConfig) {
        self.transfer.reset_transient();
        self.scan = ScanState::reloaded(self.pos, config);
        self.cache = EndpointCache::new(self.pos);
    }
}

// ---------------------------------------------------------------------------
// Grid
// ---------------------------------------------------------------------------

/// Coordinate index over conduits and terminal handlers. A coordinate
/// holds at most one of either.
#[derive(Debug, Default)]
pub struct Grid {
    conduits: BTreeMap<GridPos, NodeId>,
    terminals: BTreeMap<GridPos, Box<dyn ManaHandler>>,
}

impl Grid {
    pub fn conduit_at(&self, pos: GridPos) -> Option<NodeId> {
        self.conduits.get(&pos).copied()
    }

    pub fn terminal(&self, pos: GridPos) -> Option<&dyn ManaHandler> {
        self.terminals.get(&pos).map(|h| h.as_ref())
    }

    pub fn terminal_mut(&mut self, pos: GridPos) -> Option<&mut dyn ManaHandler> {
        match self.terminals.get_mut(&pos) {
            Some(h) => Some(h.as_mut()),
            None => None,
        }
    }

    pub fn is_occupied(&self, pos: GridPos) -> bool {
        self.conduits.contains_key(&pos) || self.terminals.contains_key(&pos)
    }

    pub fn terminal_positions(&self) -> impl Iterator<Item = GridPos> + '_ {
        self.terminals.keys().copied()
    }
}

// ---------------------------------------------------------------------------
// ManaWorld
// ---------------------------------------------------------------------------

/// Owns every conduit and terminal and advances the network one tick at a
/// time.
#[derive(Debug)]
pub struct ManaWorld {
    config: NetworkConfig,
    conduits: SlotMap<NodeId, Conduit>,
    grid: Grid,
    registry: TopologyRegistry,
    diagnostics: Diagnostics,
    events: EventBus,
    dirty: DirtyTracker,
    tick: Ticks,
}

impl Default for ManaWorld {
    fn default() -> Self {
        Self::build(NetworkConfig::default())
    }
}

impl ManaWorld {
    /// A world with default tunables.
    pub fn new() -> Self {
        Self::default()
    }

    /// A world with custom tunables. Fails if they do not validate.
    pub fn with_config(config: NetworkConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: NetworkConfig) -> Self {
        Self {
            events: EventBus::new(config.event_capacity),
            config,
            conduits: SlotMap::with_key(),
            grid: Grid::default(),
            registry: TopologyRegistry::new(),
            diagnostics: Diagnostics::default(),
            dirty: DirtyTracker::new(),
            tick: 0,
        }
    }

    fn network(&mut self) -> NetworkManager<'_> {
        NetworkManager {
            conduits: &mut self.conduits,
            grid: &self.grid,
            registry: &mut self.registry,
            config: &self.config,
            diagnostics: &mut self.diagnostics,
            tick: self.tick,
        }
    }

    fn transfers(&mut self) -> TransferManager<'_> {
        TransferManager {
            conduits: &mut self.conduits,
            grid: &mut self.grid,
            registry: &mut self.registry,
            config: &self.config,
            diagnostics: &mut self.diagnostics,
            events: &mut self.events,
            dirty: &mut self.dirty,
            tick: self.tick,
        }
    }

    // -- Placement --------------------------------------------------------

    /// Place a conduit. Its ports all start in `Both` mode.
    pub fn add_conduit(
        &mut self,
        pos: GridPos,
        buffer: ManaBuffer,
        tier: Option<Tier>,
    ) -> Result<NodeId, WorldError> {
        if self.grid.is_occupied(pos) {
            return Err(WorldError::Occupied(pos));
        }
        let id = self
            .conduits
            .insert(Conduit::new(pos, buffer, tier, &self.config));
        self.grid.conduits.insert(pos, id);
        self.registry.invalidate(pos);
        self.notify_around(pos);
        Ok(id)
    }

    /// Remove a conduit and hand back its buffer. The caller owns whatever
    /// mana it still holds.
    pub fn remove_conduit(&mut self, node: NodeId) -> Result<ManaBuffer, WorldError> {
        let conduit = self
            .conduits
            .remove(node)
            .ok_or(WorldError::UnknownNode(node))?;
        let pos = conduit.pos;
        self.grid.conduits.remove(&pos);
        self.registry.invalidate(pos);
        self.dirty.forget(node);
        self.notify_around(pos);
        self.events.emit(NetworkEvent::ConduitRemoved {
            node,
            pos,
            tick: self.tick,
        });
        Ok(conduit.buffer)
    }

    /// Place a producer or consumer at the network edge.
    pub fn add_terminal(
        &mut self,
        pos: GridPos,
        handler: Box<dyn ManaHandler>,
    ) -> Result<(), WorldError> {
        if self.grid.is_occupied(pos) {
            return Err(WorldError::Occupied(pos));
        }
        self.grid.terminals.insert(pos, handler);
        self.notify_around(pos);
        Ok(())
    }

    pub fn remove_terminal(&mut self, pos: GridPos) -> Result<Box<dyn ManaHandler>, WorldError> {
        let handler = self
            .grid
            .terminals
            .remove(&pos)
            .ok_or(WorldError::UnknownTerminal(pos))?;
        self.notify_around(pos);
        Ok(handler)
    }

    fn notify_around(&mut self, pos: GridPos) {
        for d in Direction::ALL {
            if let Some(id) = self.grid.conduit_at(pos.offset(d)) {
                self.network().on_neighbor_changed(id);
            }
        }
    }

    /// Tell `node` that something next to it changed outside the world's
    /// own placement calls.
    pub fn notify_neighbor_changed(&mut self, node: NodeId) -> Result<(), WorldError> {
        if !self.conduits.contains_key(node) {
            return Err(WorldError::UnknownNode(node));
        }
        self.network().on_neighbor_changed(node);
        Ok(())
    }

    // -- Configuration ----------------------------------------------------

    fn conduit_mut(&mut self, node: NodeId) -> Result<&mut Conduit, WorldError> {
        self.conduits
            .get_mut(node)
            .ok_or(WorldError::UnknownNode(node))
    }

    /// Change one port's mode. Only that direction is invalidated.
    pub fn set_port(
        &mut self,
        node: NodeId,
        direction: Direction,
        mode: PortMode,
    ) -> Result<(), WorldError> {
        let change = self.conduit_mut(node)?.io.set_port(direction, mode);
        if let Some(change) = change {
            self.network().on_port_config_changed(node, direction);
            self.events.emit(NetworkEvent::PortChanged {
                node,
                direction,
                mode: change.current,
                tick: self.tick,
            });
        }
        Ok(())
    }

    /// Set every port of `node` to `mode`.
    pub fn set_all_ports(&mut self, node: NodeId, mode: PortMode) -> Result<(), WorldError> {
        for d in Direction::ALL {
            self.set_port(node, d, mode)?;
        }
        Ok(())
    }

    pub fn set_priority(
        &mut self,
        node: NodeId,
        direction: Direction,
        priority: i32,
    ) -> Result<(), WorldError> {
        let conduit = self.conduit_mut(node)?;
        conduit.io.set_priority(direction, priority);
        let clamped = conduit.io.priority(direction);
        if let Some(endpoint) = conduit.scan.endpoints[direction].as_mut() {
            endpoint.priority = clamped;
        }
        Ok(())
    }

    pub fn set_tier(&mut self, node: NodeId, tier: Option<Tier>) -> Result<(), WorldError> {
        self.conduit_mut(node)?.tier = tier;
        Ok(())
    }

    /// Switch routing model. Neighbors rescan so their handshakes see it.
    pub fn set_routing(&mut self, node: NodeId, routing: RoutingMode) -> Result<(), WorldError> {
        let conduit = self.conduit_mut(node)?;
        if conduit.routing == routing {
            return Ok(());
        }
        conduit.routing = routing;
        let pos = conduit.pos;
        self.notify_around(pos);
        Ok(())
    }

    /// Direct access to a conduit's buffer, e.g. for a pooled network
    /// absorbing it.
    pub fn buffer_mut(&mut self, node: NodeId) -> Result<&mut ManaBuffer, WorldError> {
        Ok(&mut self.conduit_mut(node)?.buffer)
    }

    // -- Simulation -------------------------------------------------------

    /// Advance one tick.
    pub fn step(&mut self) -> TickStats {
        self.tick += 1;
        let tick = self.tick;
        let mut stats = TickStats::default();

        let nodes: Vec<NodeId> = self.conduits.keys().collect();
        for node in nodes {
            let outcome = self.network().update_if_needed(node);
            match outcome {
                ScanOutcome::Full => stats.full_scans += 1,
                ScanOutcome::Quick { .. } => stats.quick_checks += 1,
                _ => {}
            }
            if !matches!(outcome, ScanOutcome::Skipped | ScanOutcome::Throttled) {
                self.events.emit(NetworkEvent::TopologyScanned {
                    node,
                    outcome,
                    tick,
                });
            }

            let mut guard = ScanGuard::new();
            for _ in 0..self.config.max_transfers_per_tick {
                match self.transfers().process(node, &mut guard) {
                    TransferOutcome::Executed { amount, .. } => {
                        stats.transfers += 1;
                        stats.mana_moved += amount;
                    }
                    TransferOutcome::Blocked { .. } => {
                        stats.blocked += 1;
                        break;
                    }
                    TransferOutcome::Idle(_) => break,
                }
            }
        }

        if tick % self.config.maintenance_interval == 0 {
            self.run_maintenance();
        }
        self.events.deliver();
        stats
    }

    /// Run `n` ticks and sum their statistics.
    pub fn run(&mut self, n: u64) -> TickStats {
        let mut total = TickStats::default();
        for _ in 0..n {
            total.accumulate(&self.step());
        }
        total
    }

    /// One transfer attempt out of `node`, outside the tick loop.
    pub fn process(&mut self, node: NodeId) -> TransferOutcome {
        let mut guard = ScanGuard::new();
        self.transfers().process(node, &mut guard)
    }

    /// Run the scan schedule for `node` outside the tick loop.
    pub fn update_topology(&mut self, node: NodeId) -> ScanOutcome {
        self.network().update_if_needed(node)
    }

    /// Output ports of `node` that can take mana right now.
    pub fn valid_targets(&mut self, node: NodeId) -> Vec<Direction> {
        self.valid_targets_with(node, &mut ScanGuard::new())
    }

    /// As [`valid_targets`](Self::valid_targets), inside an enumeration
    /// already in progress.
    pub fn valid_targets_with(&mut self, node: NodeId, guard: &mut ScanGuard) -> Vec<Direction> {
        self.network().valid_targets(node, guard)
    }

    /// Purge registry entries nobody has touched in `stale_entry_age`.
    pub fn run_maintenance(&mut self) -> usize {
        let purged = self
            .registry
            .perform_maintenance(self.tick, self.config.stale_entry_age);
        debug!(
            "maintenance at tick {}: {} registry entries remain",
            self.tick,
            self.registry.len()
        );
        purged
    }

    /// Wipe every cache in the world, shared and per-conduit.
    pub fn clear_all_caches(&mut self) {
        self.registry.clear();
        for conduit in self.conduits.values_mut() {
            conduit.cache = EndpointCache::new(conduit.pos);
            conduit.scan.reset();
        }
    }

    // -- Persistence ------------------------------------------------------

    /// Encode the durable transfer fields of `node`.
    pub fn save_conduit(&self, node: NodeId) -> Result<Vec<u8>, WorldError> {
        let conduit = self
            .conduits
            .get(node)
            .ok_or(WorldError::UnknownNode(node))?;
        Ok(persist::save_transfer_state(&conduit.transfer)?)
    }

    /// Load durable transfer fields into `node` as if it had just been
    /// reloaded: caches and scan state start empty.
    pub fn restore_conduit(&mut self, node: NodeId, data: &[u8]) -> Result<(), WorldError> {
        let state = persist::load_transfer_state(data)?;
        let conduit = self
            .conduits
            .get_mut(node)
            .ok_or(WorldError::UnknownNode(node))?;
        conduit.transfer = state;
        conduit.reset_transient(&self.config);
        Ok(())
    }

    /// Drop transient state on every conduit, as a chunk reload would.
    pub fn reset_transient(&mut self) {
        for conduit in self.conduits.values_mut() {
            conduit.reset_transient(&self.config);
        }
    }

    /// Conduits whose durable state changed since the last call.
    pub fn take_dirty(&mut self) -> Vec<NodeId> {
        self.dirty.take()
    }

    // -- Queries ----------------------------------------------------------

    pub fn tick(&self) -> Ticks {
        self.tick
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn conduit(&self, node: NodeId) -> Option<&Conduit> {
        self.conduits.get(node)
    }

    pub fn conduit_at(&self, pos: GridPos) -> Option<NodeId> {
        self.grid.conduit_at(pos)
    }

    pub fn conduits(&self) -> impl Iterator<Item = (NodeId, &Conduit)> {
        self.conduits.iter()
    }

    pub fn conduit_count(&self) -> usize {
        self.conduits.len()
    }

    pub fn terminal(&self, pos: GridPos) -> Option<&dyn ManaHandler> {
        self.grid.terminal(pos)
    }

    pub fn stored(&self, node: NodeId) -> Option<Mana> {
        self.conduits.get(node).map(|c| c.buffer.stored())
    }

    pub fn registry(&self) -> &TopologyRegistry {
        &self.registry
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut EventBus {
        &mut self.events
    }

    pub fn dirty(&self) -> &DirtyTracker {
        &self.dirty
    }

    /// Mana held by every conduit and terminal.
    pub fn total_mana(&self) -> Mana {
        let in_conduits: Mana = self.conduits.values().map(|c| c.buffer.stored()).sum();
        let in_terminals: Mana = self.grid.terminals.values().map(|h| h.stored()).sum();
        in_conduits + in_terminals
    }

    /// Deterministic hash of positions, stored mana, and durable transfer
    /// fields, in coordinate order.
    pub fn state_hash(&self) -> u64 {
        let mut h = StateHash::new();
        h.write_u64(self.tick);
        for (pos, id) in &self.grid.conduits {
            let Some(c) = self.conduits.get(*id) else {
                continue;
            };
            h.write_pos(*pos);
            h.write_u64(c.buffer.stored());
            h.write_u64(c.transfer.last_transfer_tick);
            h.write_u64(c.transfer.last_receive_tick);
            h.write_direction(c.transfer.last_transfer_direction);
            h.write_direction(c.transfer.last_receive_direction);
        }
        for (pos, handler) in &self.grid.terminals {
            h.write_pos(*pos);
            h.write_u64(handler.stored());
        }
        h.finish()
    }
}
