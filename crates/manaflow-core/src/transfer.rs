//! Load-balanced mana transfer with anti-oscillation gates.
//!
//! Each call to [`TransferManager::process`] performs at most one transfer
//! from one conduit: enumerate valid targets, pick the one with the most
//! room, run it through the gates, then move mana with a simulate/execute
//! pair so nothing is ever created or destroyed.
//!
//! The gates, in order:
//!
//! 1. a direction already used this tick is busy;
//! 2. a direction mana arrived through within `backflow_window` ticks is
//!    not sent back through;
//! 3. the previous transfer's direction is not repeated in the same tick;
//! 4. a direction that would extend an oscillating path is refused.

use std::collections::VecDeque;

use log::trace;
use slotmap::SlotMap;

use crate::cache::{Endpoint, EndpointKind, TargetInfo, TopologyRegistry};
use crate::config::NetworkConfig;
use crate::direction::{Direction, DirectionMap, DirectionSet};
use crate::dirty::DirtyTracker;
use crate::event::{EventBus, NetworkEvent};
use crate::handler::{ManaHandler, TransferMode};
use crate::id::NodeId;
use crate::scanner::{Diagnostics, NetworkManager, ScanGuard};
use crate::sim::{Mana, Ticks};
use crate::tier::transfer_rate;
use crate::world::{Conduit, Grid, RoutingMode};

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Which gate stopped a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockReason {
    /// The direction was already used this tick.
    Busy,
    /// Mana arrived through this direction too recently.
    Backflow,
    /// Same direction as the previous transfer within the same tick.
    DoubleSend,
    /// Would extend an oscillating path.
    Cycle,
}

/// Why nothing moved, when no gate was involved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdleReason {
    /// No conduit with that id.
    Missing,
    /// The conduit routes through a pooled network.
    Pooled,
    Empty,
    /// The per-tick transfer cap was reached.
    TickCap,
    NoTarget,
    /// The peer refused the final handshake.
    PeerRefused,
    /// Rate, stored mana, or live space was zero.
    ZeroCeiling,
    /// The receiver accepted nothing.
    Rejected,
}

/// Result of one [`TransferManager::process`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Idle(IdleReason),
    Blocked {
        direction: Direction,
        reason: BlockReason,
    },
    Executed {
        direction: Direction,
        amount: Mana,
    },
}

impl TransferOutcome {
    pub fn moved(&self) -> Mana {
        match self {
            TransferOutcome::Executed { amount, .. } => *amount,
            _ => 0,
        }
    }
}

// ---------------------------------------------------------------------------
// TransferState
// ---------------------------------------------------------------------------

/// Per-conduit transfer bookkeeping.
///
/// The four `last_*` fields are durable and survive save/load. Everything
/// else is rebuilt on load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferState {
    pub last_receive_direction: Option<Direction>,
    pub last_receive_tick: Ticks,
    pub last_transfer_direction: Option<Direction>,
    pub last_transfer_tick: Ticks,
    busy_directions: DirectionSet,
    busy_tick: Ticks,
    transfers_this_tick: u32,
    recent_path: VecDeque<Direction>,
    received_at: DirectionMap<Option<Ticks>>,
}

impl TransferState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from the durable fields. Transient state starts empty.
    pub fn from_durable(
        last_receive_direction: Option<Direction>,
        last_receive_tick: Ticks,
        last_transfer_direction: Option<Direction>,
        last_transfer_tick: Ticks,
    ) -> Self {
        let mut state = Self {
            last_receive_direction,
            last_receive_tick,
            last_transfer_direction,
            last_transfer_tick,
            ..Self::default()
        };
        if let Some(d) = last_receive_direction {
            state.received_at[d] = Some(last_receive_tick);
        }
        state
    }

    /// Reset the per-tick counters when `now` is a new tick.
    pub fn begin_tick(&mut self, now: Ticks) {
        if self.busy_tick != now {
            self.busy_tick = now;
            self.busy_directions.clear();
            self.transfers_this_tick = 0;
        }
    }

    pub fn busy_directions(&self) -> DirectionSet {
        self.busy_directions
    }

    pub fn transfers_this_tick(&self) -> u32 {
        self.transfers_this_tick
    }

    /// Direction switches, oldest first.
    pub fn recent_path(&self) -> impl Iterator<Item = Direction> + '_ {
        self.recent_path.iter().copied()
    }

    /// The first gate that refuses `direction` at `now`, if any.
    ///
    /// Within a live tick the busy set already holds every direction sent
    /// on, so `DoubleSend` only fires when the durable send fields say
    /// `now` but the busy set is empty, as after restoring a record saved
    /// mid-tick.
    pub fn check_gate(
        &self,
        direction: Direction,
        now: Ticks,
        config: &NetworkConfig,
    ) -> Option<BlockReason> {
        if self.busy_tick == now && self.busy_directions.contains(direction) {
            return Some(BlockReason::Busy);
        }
        if self.received_at[direction]
            .is_some_and(|at| now.saturating_sub(at) < config.backflow_window)
        {
            return Some(BlockReason::Backflow);
        }
        if self.last_transfer_direction == Some(direction) && self.last_transfer_tick == now {
            return Some(BlockReason::DoubleSend);
        }
        if self.path_is_live(now, config) && self.would_cycle(direction) {
            return Some(BlockReason::Cycle);
        }
        None
    }

    /// Whether sending through `direction` would extend an oscillation.
    ///
    /// Continuing in the newest direction never does. Switching does when
    /// the window already switched to `direction` twice, or when the last
    /// four switches alternate A,B,A,B and `direction` is A.
    pub fn would_cycle(&self, direction: Direction) -> bool {
        if self.recent_path.back() == Some(&direction) {
            return false;
        }
        if self.recent_path.iter().filter(|d| **d == direction).count() >= 2 {
            return true;
        }
        let n = self.recent_path.len();
        if n >= 4 {
            let tail = &[
                self.recent_path[n - 4],
                self.recent_path[n - 3],
                self.recent_path[n - 2],
                self.recent_path[n - 1],
            ];
            return tail[0] == tail[2] && tail[1] == tail[3] && tail[0] == direction;
        }
        false
    }

    fn path_is_live(&self, now: Ticks, config: &NetworkConfig) -> bool {
        now.saturating_sub(self.last_transfer_tick) < config.history_decay_ticks
    }

    /// Book a committed send through `direction`.
    pub fn record_transfer(&mut self, direction: Direction, now: Ticks, config: &NetworkConfig) {
        self.begin_tick(now);
        if !self.path_is_live(now, config) {
            self.recent_path.clear();
        }
        if self.recent_path.back() != Some(&direction) {
            self.recent_path.push_back(direction);
            while self.recent_path.len() > config.history_len {
                self.recent_path.pop_front();
            }
        }
        self.busy_directions.insert(direction);
        self.transfers_this_tick += 1;
        self.last_transfer_direction = Some(direction);
        self.last_transfer_tick = now;
    }

    /// Book mana arriving through `from`.
    pub fn record_receive(&mut self, from: Direction, now: Ticks) {
        self.received_at[from] = Some(now);
        self.last_receive_direction = Some(from);
        self.last_receive_tick = now;
    }

    /// Keep only the durable fields.
    pub fn reset_transient(&mut self) {
        *self = Self::from_durable(
            self.last_receive_direction,
            self.last_receive_tick,
            self.last_transfer_direction,
            self.last_transfer_tick,
        );
    }
}

// ---------------------------------------------------------------------------
// TransferManager
// ---------------------------------------------------------------------------

/// Borrowed view of the world used to move mana.
pub struct TransferManager<'a> {
    pub conduits: &'a mut SlotMap<NodeId, Conduit>,
    pub grid: &'a mut Grid,
    pub registry: &'a mut TopologyRegistry,
    pub config: &'a NetworkConfig,
    pub diagnostics: &'a mut Diagnostics,
    pub events: &'a mut EventBus,
    pub dirty: &'a mut DirtyTracker,
    pub tick: Ticks,
}

impl TransferManager<'_> {
    fn network(&mut self) -> NetworkManager<'_> {
        NetworkManager {
            conduits: &mut *self.conduits,
            grid: &*self.grid,
            registry: &mut *self.registry,
            config: self.config,
            diagnostics: &mut *self.diagnostics,
            tick: self.tick,
        }
    }

    /// Attempt one transfer out of `node`.
    pub fn process(&mut self, node: NodeId, guard: &mut ScanGuard) -> TransferOutcome {
        let now = self.tick;
        let config = self.config;
        let Some(conduit) = self.conduits.get_mut(node) else {
            return TransferOutcome::Idle(IdleReason::Missing);
        };
        if conduit.routing() == RoutingMode::Pooled {
            return TransferOutcome::Idle(IdleReason::Pooled);
        }
        conduit.transfer.begin_tick(now);
        if conduit.buffer().is_empty() {
            return TransferOutcome::Idle(IdleReason::Empty);
        }
        if conduit.transfer.transfers_this_tick() >= config.max_transfers_per_tick {
            return TransferOutcome::Idle(IdleReason::TickCap);
        }

        let candidates = self.network().valid_targets(node, guard);
        let Some(direction) = self.select_target(node, &candidates) else {
            return TransferOutcome::Idle(IdleReason::NoTarget);
        };

        let Some(conduit) = self.conduits.get(node) else {
            return TransferOutcome::Idle(IdleReason::Missing);
        };
        if let Some(reason) = conduit.transfer.check_gate(direction, now, config) {
            trace!("{node:?} blocked on {direction} at tick {now}: {reason:?}");
            self.events.emit(NetworkEvent::TransferBlocked {
                node,
                direction,
                reason,
                tick: now,
            });
            return TransferOutcome::Blocked { direction, reason };
        }
        let Some(endpoint) = conduit.scan.endpoints[direction] else {
            return TransferOutcome::Idle(IdleReason::NoTarget);
        };
        let rate = transfer_rate(conduit.tier(), config);
        let stored = conduit.buffer().stored();

        if let EndpointKind::Peer(peer) = endpoint.kind {
            let accepts = self
                .conduits
                .get(peer)
                .is_some_and(|p| p.accepts_input(direction.opposite()));
            if !accepts {
                self.refresh_target(node, direction, &endpoint);
                return TransferOutcome::Idle(IdleReason::PeerRefused);
            }
        }

        let ceiling = rate.min(stored).min(self.live_space(&endpoint));
        if ceiling == 0 {
            self.refresh_target(node, direction, &endpoint);
            return TransferOutcome::Idle(IdleReason::ZeroCeiling);
        }

        let moved = self.commit(node, &endpoint, ceiling);
        if moved == 0 {
            self.refresh_target(node, direction, &endpoint);
            return TransferOutcome::Idle(IdleReason::Rejected);
        }

        if let Some(conduit) = self.conduits.get_mut(node) {
            conduit.transfer.record_transfer(direction, now, config);
        }
        self.dirty.mark_node(node);
        if let EndpointKind::Peer(peer) = endpoint.kind {
            if let Some(p) = self.conduits.get_mut(peer) {
                p.transfer.record_receive(direction.opposite(), now);
                self.dirty.mark_node(peer);
            }
        }
        self.refresh_target(node, direction, &endpoint);

        trace!("{node:?} sent {moved} through {direction} at tick {now}");
        self.events.emit(NetworkEvent::ManaTransferred {
            node,
            direction,
            target: endpoint.pos,
            amount: moved,
            tick: now,
        });
        TransferOutcome::Executed {
            direction,
            amount: moved,
        }
    }

    /// Most available space, then highest port priority, then lowest
    /// direction index.
    pub fn select_target(&self, node: NodeId, candidates: &[Direction]) -> Option<Direction> {
        let conduit = self.conduits.get(node)?;
        candidates
            .iter()
            .filter_map(|d| {
                let info = conduit
                    .cache
                    .cached_target(*d, self.tick, self.config.target_ttl)?;
                info.can_receive
                    .then_some((*d, info.available_space, conduit.io().priority(*d)))
            })
            .max_by(|a, b| {
                a.1.cmp(&b.1)
                    .then(a.2.cmp(&b.2))
                    .then(b.0.index().cmp(&a.0.index()))
            })
            .map(|(d, _, _)| d)
    }

    /// Simulate, extract, execute, and hand back any remainder. Returns
    /// what the receiver actually kept.
    fn commit(&mut self, node: NodeId, endpoint: &Endpoint, ceiling: Mana) -> Mana {
        let accepted = self.receive_into(endpoint, ceiling, TransferMode::Simulate);
        if accepted == 0 {
            return 0;
        }
        let Some(source) = self.conduits.get_mut(node) else {
            return 0;
        };
        let withdrawn = source.buffer_mut().extract(accepted, TransferMode::Execute);
        let kept = self.receive_into(endpoint, withdrawn, TransferMode::Execute);
        if kept < withdrawn {
            if let Some(source) = self.conduits.get_mut(node) {
                source
                    .buffer_mut()
                    .receive(withdrawn - kept, TransferMode::Execute);
            }
        }
        kept
    }

    fn receive_into(&mut self, endpoint: &Endpoint, amount: Mana, mode: TransferMode) -> Mana {
        match endpoint.kind {
            EndpointKind::Peer(id) => {
                if self.grid.conduit_at(endpoint.pos) != Some(id) {
                    return 0;
                }
                self.conduits
                    .get_mut(id)
                    .map_or(0, |c| c.buffer_mut().receive(amount, mode))
            }
            EndpointKind::Terminal => self
                .grid
                .terminal_mut(endpoint.pos)
                .map_or(0, |h| h.receive(amount, mode)),
        }
    }

    fn live_space(&self, endpoint: &Endpoint) -> Mana {
        match endpoint.kind {
            EndpointKind::Peer(id) => self
                .conduits
                .get(id)
                .map_or(0, |c| c.buffer().available_space()),
            EndpointKind::Terminal => self
                .grid
                .terminal(endpoint.pos)
                .filter(|h| h.can_receive())
                .map_or(0, |h| h.available_space()),
        }
    }

    /// Re-snapshot the target on `direction` after a transfer attempt.
    fn refresh_target(&mut self, node: NodeId, direction: Direction, endpoint: &Endpoint) {
        let now = self.tick;
        match endpoint.kind {
            EndpointKind::Peer(id) => {
                let info = self
                    .conduits
                    .get(id)
                    .map(|c| TargetInfo::snapshot(c.buffer(), true, now));
                if let (Some(info), Some(conduit)) = (info, self.conduits.get_mut(node)) {
                    conduit.cache.store_target(direction, info);
                }
            }
            EndpointKind::Terminal => {
                if let (Some(handler), Some(conduit)) = (
                    self.grid.terminal(endpoint.pos),
                    self.conduits.get_mut(node),
                ) {
                    conduit
                        .cache
                        .set_cached_target(direction, handler, false, now);
                }
            }
        }
    }
}
