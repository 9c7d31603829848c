//! Typed network events with pre-allocated ring buffers.
//!
//! Events are emitted while a tick runs and delivered to passive listeners
//! at the end of [`ManaWorld::step`](crate::world::ManaWorld::step). Each
//! event kind has its own [`EventBuffer`]; when full, the oldest events are
//! dropped. Suppressed kinds are never allocated or recorded.

use crate::direction::Direction;
use crate::id::{GridPos, NodeId};
use crate::io::PortMode;
use crate::scanner::ScanOutcome;
use crate::sim::{Mana, Ticks};
use crate::transfer::BlockReason;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// A network event. All events carry the tick at which they occurred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    ManaTransferred {
        node: NodeId,
        direction: Direction,
        target: GridPos,
        amount: Mana,
        tick: Ticks,
    },
    TransferBlocked {
        node: NodeId,
        direction: Direction,
        reason: BlockReason,
        tick: Ticks,
    },
    TopologyScanned {
        node: NodeId,
        outcome: ScanOutcome,
        tick: Ticks,
    },
    PortChanged {
        node: NodeId,
        direction: Direction,
        mode: PortMode,
        tick: Ticks,
    },
    ConduitRemoved {
        node: NodeId,
        pos: GridPos,
        tick: Ticks,
    },
}

/// Discriminant tag for event types, used for suppression and lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ManaTransferred,
    TransferBlocked,
    TopologyScanned,
    PortChanged,
    ConduitRemoved,
}

const EVENT_KIND_COUNT: usize = 5;

impl NetworkEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            NetworkEvent::ManaTransferred { .. } => EventKind::ManaTransferred,
            NetworkEvent::TransferBlocked { .. } => EventKind::TransferBlocked,
            NetworkEvent::TopologyScanned { .. } => EventKind::TopologyScanned,
            NetworkEvent::PortChanged { .. } => EventKind::PortChanged,
            NetworkEvent::ConduitRemoved { .. } => EventKind::ConduitRemoved,
        }
    }

    pub fn tick(&self) -> Ticks {
        match self {
            NetworkEvent::ManaTransferred { tick, .. }
            | NetworkEvent::TransferBlocked { tick, .. }
            | NetworkEvent::TopologyScanned { tick, .. }
            | NetworkEvent::PortChanged { tick, .. }
            | NetworkEvent::ConduitRemoved { tick, .. } => *tick,
        }
    }
}

impl EventKind {
    fn index(self) -> usize {
        self as usize
    }
}

// ---------------------------------------------------------------------------
// EventBuffer
// ---------------------------------------------------------------------------

/// A fixed-capacity ring buffer. When full, the oldest event is dropped.
#[derive(Debug)]
pub struct EventBuffer {
    events: Vec<Option<NetworkEvent>>,
    /// Next write position.
    head: usize,
    len: usize,
    total_written: u64,
}

impl EventBuffer {
    /// A capacity of 0 is clamped to 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: (0..capacity).map(|_| None).collect(),
            head: 0,
            len: 0,
            total_written: 0,
        }
    }

    pub fn push(&mut self, event: NetworkEvent) {
        let capacity = self.capacity();
        self.events[self.head] = Some(event);
        self.head = (self.head + 1) % capacity;
        if self.len < capacity {
            self.len += 1;
        }
        self.total_written += 1;
    }

    pub fn capacity(&self) -> usize {
        self.events.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total events written since creation, including dropped ones.
    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &NetworkEvent> {
        let capacity = self.capacity();
        let start = if self.len < capacity { 0 } else { self.head };
        (0..self.len).filter_map(move |i| self.events[(start + i) % capacity].as_ref())
    }

    pub fn clear(&mut self) {
        for slot in &mut self.events {
            *slot = None;
        }
        self.head = 0;
        self.len = 0;
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// A passive listener receives events read-only.
pub type PassiveListener = Box<dyn FnMut(&NetworkEvent)>;

/// One ring buffer per event kind, plus suppression flags and listeners.
pub struct EventBus {
    buffers: [Option<EventBuffer>; EVENT_KIND_COUNT],
    suppressed: [bool; EVENT_KIND_COUNT],
    /// Per-kind `total_written` at the last delivery.
    delivered: [u64; EVENT_KIND_COUNT],
    listeners: Vec<(EventKind, PassiveListener)>,
    default_capacity: usize,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("buffers", &self.buffers)
            .field("suppressed", &self.suppressed)
            .field("listeners", &self.listeners.len())
            .field("default_capacity", &self.default_capacity)
            .finish()
    }
}

impl EventBus {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            buffers: Default::default(),
            suppressed: [false; EVENT_KIND_COUNT],
            delivered: [0; EVENT_KIND_COUNT],
            listeners: Vec::new(),
            default_capacity,
        }
    }

    /// Stop recording a kind and free its buffer.
    pub fn suppress(&mut self, kind: EventKind) {
        self.suppressed[kind.index()] = true;
        self.buffers[kind.index()] = None;
        self.delivered[kind.index()] = 0;
    }

    pub fn unsuppress(&mut self, kind: EventKind) {
        self.suppressed[kind.index()] = false;
    }

    pub fn is_suppressed(&self, kind: EventKind) -> bool {
        self.suppressed[kind.index()]
    }

    /// Record an event. No-op if its kind is suppressed.
    pub fn emit(&mut self, event: NetworkEvent) {
        let idx = event.kind().index();
        if self.suppressed[idx] {
            return;
        }
        let capacity = self.default_capacity;
        self.buffers[idx]
            .get_or_insert_with(|| EventBuffer::new(capacity))
            .push(event);
    }

    /// Register a listener called for every delivered event of `kind`.
    pub fn on_passive(&mut self, kind: EventKind, listener: PassiveListener) {
        self.listeners.push((kind, listener));
    }

    /// Hand events emitted since the previous delivery to listeners, in
    /// registration order. Buffers are left intact so the host can still
    /// read them. Events dropped by a full ring are never delivered.
    pub fn deliver(&mut self) {
        for idx in 0..EVENT_KIND_COUNT {
            let Some(buffer) = &self.buffers[idx] else {
                continue;
            };
            let total = buffer.total_written();
            let fresh = (total - self.delivered[idx]).min(buffer.len() as u64) as usize;
            if fresh > 0 {
                let skip = buffer.len() - fresh;
                for (kind, listener) in &mut self.listeners {
                    if kind.index() != idx {
                        continue;
                    }
                    for event in buffer.iter().skip(skip) {
                        listener(event);
                    }
                }
            }
            self.delivered[idx] = total;
        }
    }

    pub fn buffer(&self, kind: EventKind) -> Option<&EventBuffer> {
        self.buffers[kind.index()].as_ref()
    }

    /// Buffered events of one kind, oldest first.
    pub fn events(&self, kind: EventKind) -> Vec<NetworkEvent> {
        self.buffer(kind)
            .map(|b| b.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn buffered_count(&self, kind: EventKind) -> usize {
        self.buffer(kind).map_or(0, EventBuffer::len)
    }

    pub fn total_emitted(&self, kind: EventKind) -> u64 {
        self.buffer(kind).map_or(0, EventBuffer::total_written)
    }

    /// Empty every buffer. Totals restart from zero.
    pub fn clear_all(&mut self) {
        for buffer in self.buffers.iter_mut().flatten() {
            buffer.clear();
            buffer.total_written = 0;
        }
        self.delivered = [0; EVENT_KIND_COUNT];
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
