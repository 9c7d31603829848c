//! Topology discovery: staggered scans, quick liveness checks, and the
//! re-entrancy guard around target enumeration.
//!
//! [`NetworkManager`] borrows the world's storage for the duration of one
//! operation, the same way a module context does. It never moves mana; it
//! only decides which neighbors exist and which of them can take mana right
//! now.
//!
//! Scans are spread over time. Each conduit gets a stable offset derived
//! from its coordinate and only rescans on its own slot of the
//! `scan_interval` cycle, so a large build does not rescan in one tick.
//! Most scheduled scans are quick checks of a single endpoint; one in
//! `full_scan_ratio` probes every port.

use log::{debug, trace, warn};
use slotmap::SlotMap;

use crate::cache::{Endpoint, EndpointKind, TargetInfo, TopologyRegistry};
use crate::config::NetworkConfig;
use crate::direction::{Direction, DirectionMap, DirectionSet};
use crate::handler::ManaHandler;
use crate::id::{GridPos, NodeId};
use crate::sim::{Ticks, pos_hash};
use crate::world::{Conduit, Grid};

// ---------------------------------------------------------------------------
// Per-conduit scan state
// ---------------------------------------------------------------------------

/// What [`NetworkManager::update_if_needed`] did for one conduit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanOutcome {
    /// Not this conduit's slot and nothing was dirty.
    Skipped,
    /// Due, but the previous scan was too recent.
    Throttled,
    /// Took a fresh shared registry entry instead of probing.
    Adopted,
    /// Probed every port.
    Full,
    /// Re-probed one cached endpoint.
    Quick { stale: bool },
}

/// Discovery state for one conduit. Rebuilt from scratch on load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanState {
    node_offset: Ticks,
    pub(crate) endpoints: DirectionMap<Option<Endpoint>>,
    topology_dirty: bool,
    pending: DirectionSet,
    last_scan_tick: Option<Ticks>,
}

impl ScanState {
    /// State for a newly placed conduit. The first update runs a full scan.
    pub fn new(pos: GridPos, config: &NetworkConfig) -> Self {
        Self {
            topology_dirty: true,
            ..Self::reloaded(pos, config)
        }
    }

    /// State for a conduit coming back from a save. The first update tries
    /// to adopt the shared registry entry before probing.
    pub fn reloaded(pos: GridPos, config: &NetworkConfig) -> Self {
        Self {
            node_offset: pos_hash(pos) % config.scan_interval.max(1),
            endpoints: DirectionMap::default(),
            topology_dirty: false,
            pending: DirectionSet::EMPTY,
            last_scan_tick: None,
        }
    }

    pub fn node_offset(&self) -> Ticks {
        self.node_offset
    }

    pub fn endpoint(&self, direction: Direction) -> Option<Endpoint> {
        self.endpoints[direction]
    }

    pub fn endpoints(&self) -> &DirectionMap<Option<Endpoint>> {
        &self.endpoints
    }

    /// Whether the last scan found anything on any port.
    pub fn has_endpoints(&self) -> bool {
        self.endpoints.iter().any(|(_, e)| e.is_some())
    }

    pub fn is_topology_dirty(&self) -> bool {
        self.topology_dirty
    }

    /// Directions waiting to be re-probed after a port change.
    pub fn pending(&self) -> DirectionSet {
        self.pending
    }

    pub fn last_scan_tick(&self) -> Option<Ticks> {
        self.last_scan_tick
    }

    /// Due when dirty or on this conduit's slot of the schedule.
    pub fn is_due(&self, tick: Ticks, config: &NetworkConfig) -> bool {
        self.topology_dirty || (tick + self.node_offset) % config.scan_interval == 0
    }

    /// Whether this slot of the schedule calls for a full rescan.
    pub fn is_full_scan_slot(&self, tick: Ticks, config: &NetworkConfig) -> bool {
        ((tick + self.node_offset) / config.scan_interval) % config.full_scan_ratio == 0
    }

    fn is_throttled(&self, tick: Ticks, config: &NetworkConfig) -> bool {
        self.last_scan_tick
            .is_some_and(|at| tick.saturating_sub(at) < config.min_scan_interval)
    }

    /// Forget everything learned about the neighborhood.
    pub(crate) fn reset(&mut self) {
        self.endpoints = DirectionMap::default();
        self.pending.clear();
        self.topology_dirty = true;
    }
}

// ---------------------------------------------------------------------------
// Re-entrancy guard
// ---------------------------------------------------------------------------

/// Conduits whose target enumeration is in progress.
///
/// A handler callback that leads back into the same conduit's enumeration
/// would otherwise recurse without bound. The guard is threaded through
/// every call instead of living on the conduit, so a nested call sees it
/// and backs off.
#[derive(Debug, Clone, Default)]
pub struct ScanGuard {
    stack: Vec<NodeId>,
}

impl ScanGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push `node`. Returns false if it is already being enumerated.
    pub fn enter(&mut self, node: NodeId) -> bool {
        if self.stack.contains(&node) {
            return false;
        }
        self.stack.push(node);
        true
    }

    pub fn exit(&mut self, node: NodeId) {
        if self.stack.last() == Some(&node) {
            self.stack.pop();
        } else {
            self.stack.retain(|n| *n != node);
        }
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.stack.contains(&node)
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

/// Counters for conditions that are handled silently but worth a warning.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    suppressed_reentries: u64,
    last_reentry_warning: Option<Ticks>,
}

impl Diagnostics {
    pub fn suppressed_reentries(&self) -> u64 {
        self.suppressed_reentries
    }

    /// Count a suppressed re-entry and warn at most once per `window`.
    /// Returns whether a warning was logged.
    pub(crate) fn note_reentry(&mut self, node: NodeId, now: Ticks, window: Ticks) -> bool {
        self.suppressed_reentries += 1;
        let due = self
            .last_reentry_warning
            .is_none_or(|at| now.saturating_sub(at) >= window);
        if due {
            warn!(
                "re-entrant target scan of {node:?} at tick {now} suppressed ({} total)",
                self.suppressed_reentries
            );
            self.last_reentry_warning = Some(now);
        }
        due
    }
}

// ---------------------------------------------------------------------------
// NetworkManager
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Probe {
    endpoint: Endpoint,
    target: TargetInfo,
}

/// Borrowed view of the world used for discovery.
pub struct NetworkManager<'a> {
    pub conduits: &'a mut SlotMap<NodeId, Conduit>,
    pub grid: &'a Grid,
    pub registry: &'a mut TopologyRegistry,
    pub config: &'a NetworkConfig,
    pub diagnostics: &'a mut Diagnostics,
    pub tick: Ticks,
}

impl NetworkManager<'_> {
    /// Run whatever scan the schedule calls for on `node`.
    pub fn update_if_needed(&mut self, node: NodeId) -> ScanOutcome {
        let tick = self.tick;
        let Some(conduit) = self.conduits.get(node) else {
            return ScanOutcome::Skipped;
        };
        let has_pending = !conduit.scan.pending.is_empty();
        let never_scanned = conduit.scan.last_scan_tick.is_none();
        let dirty = conduit.scan.topology_dirty;

        if has_pending {
            self.reprobe_pending(node);
        }

        if never_scanned && !dirty {
            if self.adopt(node) {
                return ScanOutcome::Adopted;
            }
            self.mark_dirty(node);
        }

        let Some(conduit) = self.conduits.get(node) else {
            return ScanOutcome::Skipped;
        };
        let scan = &conduit.scan;
        if !scan.is_due(tick, self.config) {
            return ScanOutcome::Skipped;
        }
        if scan.is_throttled(tick, self.config) {
            return ScanOutcome::Throttled;
        }

        // Nothing to cache when nothing is around; only age counts then.
        let rescan = if scan.has_endpoints() {
            conduit.cache.needs_rescan(tick, self.config.rescan_interval)
        } else {
            conduit
                .cache
                .last_scan()
                .is_none_or(|at| tick.saturating_sub(at) >= self.config.rescan_interval)
        };
        let full = scan.topology_dirty || scan.is_full_scan_slot(tick, self.config) || rescan;
        if full {
            self.full_scan(node);
            ScanOutcome::Full
        } else {
            let stale = self.quick_check(node);
            ScanOutcome::Quick { stale }
        }
    }

    /// Probe every enabled port of `node` and publish the result.
    pub fn full_scan(&mut self, node: NodeId) {
        let tick = self.tick;
        let Some(conduit) = self.conduits.get(node) else {
            return;
        };
        let pos = conduit.pos();
        let probes = DirectionMap::from_fn(|d| {
            if conduit.io().is_disabled(d) {
                None
            } else {
                self.probe(pos, d, conduit.io().priority(d))
            }
        });
        let endpoints = DirectionMap::from_fn(|d| probes[d].map(|p: Probe| p.endpoint));

        self.registry.store(pos, endpoints.clone(), tick);

        let Some(conduit) = self.conduits.get_mut(node) else {
            return;
        };
        for (d, probe) in probes.iter() {
            match probe {
                Some(p) => conduit.cache.store_target(d, p.target),
                None => conduit.cache.clear_target(d),
            }
        }
        let found = endpoints.iter().filter(|(_, e)| e.is_some()).count();
        conduit.scan.endpoints = endpoints;
        conduit.scan.topology_dirty = false;
        conduit.scan.pending.clear();
        conduit.scan.last_scan_tick = Some(tick);
        conduit.cache.mark_scanned(tick);
        debug!("full scan of {pos:?} at tick {tick}: {found} endpoints");
    }

    /// Re-probe one cached endpoint, chosen round-robin. Returns whether it
    /// had gone stale, in which case the conduit is marked for a full scan.
    pub fn quick_check(&mut self, node: NodeId) -> bool {
        let tick = self.tick;
        let Some(conduit) = self.conduits.get(node) else {
            return false;
        };
        let pos = conduit.pos();
        let known: Vec<(Direction, Endpoint)> = conduit
            .scan
            .endpoints
            .iter()
            .filter_map(|(d, e)| e.map(|e| (d, e)))
            .collect();
        if known.is_empty() {
            return false;
        }
        let slot = (tick / self.config.scan_interval) as usize % known.len();
        let (direction, cached) = known[slot];
        let live = self.probe(pos, direction, cached.priority);

        let Some(conduit) = self.conduits.get_mut(node) else {
            return false;
        };
        conduit.scan.last_scan_tick = Some(tick);
        match live {
            Some(p) if p.endpoint.same_target(&cached) => {
                conduit.cache.store_target(direction, p.target);
                if let Some(e) = conduit.scan.endpoints[direction].as_mut() {
                    e.last_access_tick = tick;
                }
                self.registry.touch(pos, tick);
                false
            }
            _ => {
                trace!("quick check of {pos:?} found {direction} stale");
                conduit.scan.topology_dirty = true;
                conduit.cache.clear_target(direction);
                true
            }
        }
    }

    /// Output ports of `node` whose endpoint can take mana right now.
    ///
    /// Returns an empty list when `node` is already being enumerated
    /// further up the call stack.
    pub fn valid_targets(&mut self, node: NodeId, guard: &mut ScanGuard) -> Vec<Direction> {
        if !guard.enter(node) {
            self.diagnostics
                .note_reentry(node, self.tick, self.config.log_window_ticks);
            return Vec::new();
        }
        let targets = self.collect_targets(node, guard);
        guard.exit(node);
        targets
    }

    /// Drop everything cached for `node` and schedule a full rescan.
    pub fn on_neighbor_changed(&mut self, node: NodeId) {
        let Some(conduit) = self.conduits.get_mut(node) else {
            return;
        };
        conduit.cache.invalidate_all(self.registry);
        conduit.scan.reset();
    }

    /// Drop one direction of `node` and re-probe it on the next update.
    pub fn on_port_config_changed(&mut self, node: NodeId, direction: Direction) {
        let Some(conduit) = self.conduits.get_mut(node) else {
            return;
        };
        conduit.cache.invalidate_direction(direction, self.registry);
        conduit.scan.endpoints[direction] = None;
        conduit.scan.pending.insert(direction);
    }

    fn mark_dirty(&mut self, node: NodeId) {
        if let Some(conduit) = self.conduits.get_mut(node) {
            conduit.scan.topology_dirty = true;
        }
    }

    fn probe(&self, pos: GridPos, direction: Direction, priority: i32) -> Option<Probe> {
        let neighbor = pos.offset(direction);
        let tick = self.tick;
        let (kind, target) = if let Some(peer) = self.grid.conduit_at(neighbor) {
            let conduit = self.conduits.get(peer)?;
            (
                EndpointKind::Peer(peer),
                TargetInfo::snapshot(conduit.buffer(), true, tick),
            )
        } else {
            let handler = self.grid.terminal(neighbor)?;
            (
                EndpointKind::Terminal,
                TargetInfo::snapshot(handler, false, tick),
            )
        };
        Some(Probe {
            endpoint: Endpoint {
                pos: neighbor,
                kind,
                priority,
                last_access_tick: tick,
            },
            target,
        })
    }

    /// The live handler behind a cached endpoint, if it still resolves.
    fn resolve(&self, endpoint: &Endpoint) -> Option<&dyn ManaHandler> {
        match endpoint.kind {
            EndpointKind::Peer(id) => {
                if self.grid.conduit_at(endpoint.pos) != Some(id) {
                    return None;
                }
                self.conduits.get(id).map(|c| c.buffer() as &dyn ManaHandler)
            }
            EndpointKind::Terminal => self.grid.terminal(endpoint.pos),
        }
    }

    fn reprobe_pending(&mut self, node: NodeId) {
        let tick = self.tick;
        let Some(conduit) = self.conduits.get(node) else {
            return;
        };
        let pos = conduit.pos();
        let probes: Vec<(Direction, Option<Probe>)> = conduit
            .scan
            .pending
            .iter()
            .map(|d| {
                let probe = if conduit.io().is_disabled(d) {
                    None
                } else {
                    self.probe(pos, d, conduit.io().priority(d))
                };
                (d, probe)
            })
            .collect();

        let Some(conduit) = self.conduits.get_mut(node) else {
            return;
        };
        for (d, probe) in probes {
            let endpoint = probe.map(|p| p.endpoint);
            match probe {
                Some(p) => conduit.cache.store_target(d, p.target),
                None => conduit.cache.clear_target(d),
            }
            conduit.scan.endpoints[d] = endpoint;
            self.registry.update_direction(pos, d, endpoint, tick);
        }
        conduit.scan.pending.clear();
    }

    /// Take a fresh shared entry for `node` if every endpoint in it still
    /// resolves. Returns false (and adopts nothing) otherwise.
    fn adopt(&mut self, node: NodeId) -> bool {
        let tick = self.tick;
        let Some(pos) = self.conduits.get(node).map(|c| c.pos()) else {
            return false;
        };
        let Some(entry) = self
            .registry
            .lookup(pos, tick, self.config.topology_ttl)
            .map(|e| e.endpoints.clone())
        else {
            return false;
        };

        let mut targets: DirectionMap<Option<TargetInfo>> = DirectionMap::default();
        for (d, endpoint) in entry.iter() {
            let Some(endpoint) = endpoint else {
                continue;
            };
            let Some(handler) = self.resolve(endpoint) else {
                trace!("registry entry for {pos:?} is stale on {d}");
                return false;
            };
            targets[d] = Some(TargetInfo::snapshot(
                handler,
                endpoint.is_network_peer(),
                tick,
            ));
        }

        let Some(conduit) = self.conduits.get_mut(node) else {
            return false;
        };
        for (d, info) in targets.iter() {
            match info {
                Some(info) => conduit.cache.store_target(d, *info),
                None => conduit.cache.clear_target(d),
            }
        }
        conduit.scan.endpoints = entry;
        conduit.scan.topology_dirty = false;
        conduit.scan.last_scan_tick = Some(tick);
        conduit.cache.mark_scanned(tick);
        debug!("adopted registry topology for {pos:?} at tick {tick}");
        true
    }

    fn collect_targets(&mut self, node: NodeId, guard: &ScanGuard) -> Vec<Direction> {
        let tick = self.tick;
        let ttl = self.config.target_ttl;
        let Some(conduit) = self.conduits.get(node) else {
            return Vec::new();
        };
        let pos = conduit.pos();
        let candidates: Vec<(Direction, Endpoint, Option<TargetInfo>)> = conduit
            .io()
            .outputs()
            .iter()
            .filter_map(|d| {
                let endpoint = conduit.scan.endpoints[d]?;
                Some((d, endpoint, conduit.cache.cached_target(d, tick, ttl)))
            })
            .collect();

        let mut refreshed = Vec::new();
        let mut stale = Vec::new();
        let mut targets = Vec::new();
        for (d, endpoint, cached) in candidates {
            let info = match cached {
                Some(info) => info,
                None => match self.probe(pos, d, endpoint.priority) {
                    Some(p) if p.endpoint.same_target(&endpoint) => {
                        refreshed.push((d, p.target));
                        p.target
                    }
                    _ => {
                        stale.push(d);
                        continue;
                    }
                },
            };
            if !info.can_receive || info.available_space == 0 {
                continue;
            }
            if let EndpointKind::Peer(peer) = endpoint.kind {
                if !self.handshake(peer, d.opposite(), guard) {
                    continue;
                }
            }
            targets.push(d);
        }

        if let Some(conduit) = self.conduits.get_mut(node) {
            for (d, info) in refreshed {
                conduit.cache.store_target(d, info);
            }
            if !stale.is_empty() {
                conduit.scan.topology_dirty = true;
                for d in stale {
                    conduit.cache.clear_target(d);
                }
            }
        }
        targets
    }

    /// Whether a peer agrees to receive through its `reciprocal` port.
    /// Reads the peer directly; never enumerates the peer's own targets.
    fn handshake(&self, peer: NodeId, reciprocal: Direction, guard: &ScanGuard) -> bool {
        if guard.contains(peer) {
            return false;
        }
        self.conduits
            .get(peer)
            .is_some_and(|c| c.accepts_input(reciprocal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(count: usize) -> Vec<NodeId> {
        let mut sm: SlotMap<NodeId, ()> = SlotMap::with_key();
        (0..count).map(|_| sm.insert(())).collect()
    }

    #[test]
    fn guard_refuses_nested_entry() {
        let n = ids(2);
        let mut guard = ScanGuard::new();
        assert!(guard.enter(n[0]));
        assert!(guard.enter(n[1]));
        assert!(!guard.enter(n[0]));
        assert_eq!(guard.depth(), 2);

        guard.exit(n[1]);
        guard.exit(n[0]);
        assert_eq!(guard.depth(), 0);
        assert!(guard.enter(n[0]));
    }

    #[test]
    fn guard_exit_out_of_order() {
        let n = ids(2);
        let mut guard = ScanGuard::new();
        guard.enter(n[0]);
        guard.enter(n[1]);
        guard.exit(n[0]);
        assert!(!guard.contains(n[0]));
        assert!(guard.contains(n[1]));
    }

    #[test]
    fn reentry_warning_is_rate_limited() {
        let n = ids(1);
        let mut diag = Diagnostics::default();
        assert!(diag.note_reentry(n[0], 10, 200));
        assert!(!diag.note_reentry(n[0], 11, 200));
        assert!(!diag.note_reentry(n[0], 209, 200));
        assert!(diag.note_reentry(n[0], 210, 200));
        assert_eq!(diag.suppressed_reentries(), 4);
    }

    #[test]
    fn offsets_are_stable_and_bounded() {
        let config = NetworkConfig::default();
        for x in -5..5 {
            let pos = GridPos::new(x, 64, -x * 3);
            let a = ScanState::new(pos, &config);
            let b = ScanState::reloaded(pos, &config);
            assert_eq!(a.node_offset(), b.node_offset());
            assert!(a.node_offset() < config.scan_interval);
        }
    }

    #[test]
    fn schedule_slots() {
        let config = NetworkConfig::default();
        let mut state = ScanState::reloaded(GridPos::ORIGIN, &config);
        let offset = state.node_offset();
        let first_due = config.scan_interval - offset % config.scan_interval;

        let due: Vec<Ticks> = (1..=2 * config.scan_interval)
            .filter(|t| state.is_due(*t, &config))
            .collect();
        assert_eq!(due[0] % config.scan_interval, first_due % config.scan_interval);
        assert_eq!(due.len(), 2);

        state.topology_dirty = true;
        assert!(state.is_due(first_due + 1, &config));
    }

    #[test]
    fn one_in_ratio_slots_is_full() {
        let config = NetworkConfig::default();
        let state = ScanState::reloaded(GridPos::new(9, 9, 9), &config);
        let full = (1..=1000)
            .filter(|t| state.is_due(*t, &config))
            .filter(|t| state.is_full_scan_slot(*t, &config))
            .count();
        let due = (1..=1000).filter(|t| state.is_due(*t, &config)).count();
        assert_eq!(due, 50);
        let expected = due as u64 / config.full_scan_ratio;
        assert!((full as u64).abs_diff(expected) <= 1);
    }

    #[test]
    fn new_state_starts_dirty() {
        let config = NetworkConfig::default();
        assert!(ScanState::new(GridPos::ORIGIN, &config).is_topology_dirty());
        assert!(!ScanState::reloaded(GridPos::ORIGIN, &config).is_topology_dirty());
    }
}
