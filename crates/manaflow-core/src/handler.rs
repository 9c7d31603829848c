//! The resource handler interface exposed at network edges.
//!
//! Every transfer is two-phase: the caller first asks a handler how much it
//! would move under [`TransferMode::Simulate`], then repeats the call with
//! that exact amount under [`TransferMode::Execute`]. Implementations must
//! keep `Simulate` free of side effects and must return the same value a
//! subsequent `Execute` with that amount would move.

use serde::{Deserialize, Serialize};

use crate::sim::Mana;

/// Whether a handler call only reports or actually moves mana.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferMode {
    Simulate,
    Execute,
}

impl TransferMode {
    #[inline]
    pub fn is_execute(self) -> bool {
        matches!(self, TransferMode::Execute)
    }
}

/// Anything that can hold, accept, or provide mana.
pub trait ManaHandler: std::fmt::Debug {
    /// Mana currently held.
    fn stored(&self) -> Mana;

    /// Maximum mana this handler can hold.
    fn capacity(&self) -> Mana;

    /// Room left before the handler is full.
    fn available_space(&self) -> Mana {
        self.capacity().saturating_sub(self.stored())
    }

    /// Whether the handler accepts mana at all.
    fn can_receive(&self) -> bool {
        true
    }

    /// Whether mana may be drawn from the handler at all.
    fn can_extract(&self) -> bool {
        true
    }

    /// Offer up to `amount`. Returns how much was (or would be) accepted.
    fn receive(&mut self, amount: Mana, mode: TransferMode) -> Mana;

    /// Request up to `amount`. Returns how much was (or would be) removed.
    fn extract(&mut self, amount: Mana, mode: TransferMode) -> Mana;
}

// ---------------------------------------------------------------------------
// ManaBuffer
// ---------------------------------------------------------------------------

/// A bounded mana store. `stored <= capacity` holds after every call.
///
/// Conduits own one each. The same type doubles as a terminal sink or
/// source when receive or extract is switched off, and `rate_limit` caps
/// how much a single call may move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManaBuffer {
    stored: Mana,
    capacity: Mana,
    accepts: bool,
    provides: bool,
    rate_limit: Option<Mana>,
}

impl ManaBuffer {
    /// An empty buffer that both accepts and provides mana.
    pub fn new(capacity: Mana) -> Self {
        Self {
            stored: 0,
            capacity,
            accepts: true,
            provides: true,
            rate_limit: None,
        }
    }

    /// A buffer pre-filled with `stored`, clamped to `capacity`.
    pub fn with_stored(stored: Mana, capacity: Mana) -> Self {
        Self {
            stored: stored.min(capacity),
            ..Self::new(capacity)
        }
    }

    /// A receive-only handler (a consumer at the network edge).
    pub fn sink(capacity: Mana) -> Self {
        Self {
            provides: false,
            ..Self::new(capacity)
        }
    }

    /// An extract-only handler holding `stored` (a producer at the edge).
    pub fn source(stored: Mana) -> Self {
        Self {
            accepts: false,
            ..Self::with_stored(stored, stored)
        }
    }

    /// Cap how much a single receive or extract call may move.
    pub fn with_rate_limit(mut self, limit: Mana) -> Self {
        self.rate_limit = Some(limit);
        self
    }

    /// Change the capacity. Never drops below what is stored, so no mana
    /// is lost; the effective capacity is `max(capacity, stored)`.
    pub fn resize(&mut self, capacity: Mana) {
        self.capacity = capacity.max(self.stored);
    }

    pub fn is_empty(&self) -> bool {
        self.stored == 0
    }

    pub fn is_full(&self) -> bool {
        self.stored >= self.capacity
    }

    fn limited(&self, amount: Mana) -> Mana {
        match self.rate_limit {
            Some(limit) => amount.min(limit),
            None => amount,
        }
    }
}

impl ManaHandler for ManaBuffer {
    fn stored(&self) -> Mana {
        self.stored
    }

    fn capacity(&self) -> Mana {
        self.capacity
    }

    fn can_receive(&self) -> bool {
        self.accepts
    }

    fn can_extract(&self) -> bool {
        self.provides
    }

    fn receive(&mut self, amount: Mana, mode: TransferMode) -> Mana {
        if !self.accepts {
            return 0;
        }
        let accepted = self.limited(amount).min(self.available_space());
        if mode.is_execute() {
            self.stored += accepted;
        }
        accepted
    }

    fn extract(&mut self, amount: Mana, mode: TransferMode) -> Mana {
        if !self.provides {
            return 0;
        }
        let removed = self.limited(amount).min(self.stored);
        if mode.is_execute() {
            self.stored -= removed;
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_stored_clamps_to_capacity() {
        let buf = ManaBuffer::with_stored(500, 100);
        assert_eq!(buf.stored(), 100);
        assert!(buf.is_full());
    }

    #[test]
    fn simulate_has_no_side_effects() {
        let mut buf = ManaBuffer::with_stored(30, 100);
        assert_eq!(buf.receive(50, TransferMode::Simulate), 50);
        assert_eq!(buf.extract(10, TransferMode::Simulate), 10);
        assert_eq!(buf.stored(), 30);
    }

    #[test]
    fn simulate_predicts_execute() {
        let mut buf = ManaBuffer::with_stored(90, 100).with_rate_limit(25);
        let predicted = buf.receive(40, TransferMode::Simulate);
        let moved = buf.receive(predicted, TransferMode::Execute);
        assert_eq!(predicted, 10, "limited by space, not rate");
        assert_eq!(moved, predicted);
        assert_eq!(buf.stored(), 100);
    }

    #[test]
    fn receive_respects_space() {
        let mut buf = ManaBuffer::with_stored(80, 100);
        assert_eq!(buf.receive(50, TransferMode::Execute), 20);
        assert_eq!(buf.stored(), 100);
        assert_eq!(buf.receive(1, TransferMode::Execute), 0);
    }

    #[test]
    fn extract_respects_stored() {
        let mut buf = ManaBuffer::with_stored(15, 100);
        assert_eq!(buf.extract(50, TransferMode::Execute), 15);
        assert!(buf.is_empty());
    }

    #[test]
    fn rate_limit_caps_each_call() {
        let mut buf = ManaBuffer::new(1000).with_rate_limit(7);
        assert_eq!(buf.receive(100, TransferMode::Execute), 7);
        assert_eq!(buf.extract(100, TransferMode::Execute), 7);
    }

    #[test]
    fn sink_and_source_are_one_way() {
        let mut sink = ManaBuffer::sink(50);
        assert!(sink.can_receive());
        assert!(!sink.can_extract());
        assert_eq!(sink.receive(20, TransferMode::Execute), 20);
        assert_eq!(sink.extract(20, TransferMode::Execute), 0);

        let mut source = ManaBuffer::source(40);
        assert!(!source.can_receive());
        assert_eq!(source.receive(5, TransferMode::Execute), 0);
        assert_eq!(source.extract(25, TransferMode::Execute), 25);
        assert_eq!(source.stored(), 15);
    }

    #[test]
    fn resize_never_drops_mana() {
        let mut buf = ManaBuffer::with_stored(60, 100);
        buf.resize(40);
        assert_eq!(buf.stored(), 60);
        assert_eq!(buf.capacity(), 60);
        buf.resize(200);
        assert_eq!(buf.available_space(), 140);
    }
}
