//! Simulation units, per-tick statistics, and state hashing.
//!
//! The routing core has exactly one notion of time: the tick. Every TTL,
//! scan interval, and anti-oscillation window is expressed in [`Ticks`].
//! Mana is quantized, so it is carried as an unsigned integer ([`Mana`]).

use serde::{Deserialize, Serialize};

use crate::direction::Direction;
use crate::id::GridPos;

/// Ticks are the atomic unit of simulation time.
pub type Ticks = u64;

/// A quantity of mana. Mana is conserved and never fractional.
pub type Mana = u64;

// ---------------------------------------------------------------------------
// Tick statistics
// ---------------------------------------------------------------------------

/// Counters collected by one call to [`ManaWorld::step`](crate::world::ManaWorld::step).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickStats {
    /// Transfers that committed mana this tick.
    pub transfers: u32,
    /// Transfer attempts stopped by an anti-cycle gate.
    pub blocked: u32,
    /// Full topology rescans.
    pub full_scans: u32,
    /// Single-endpoint liveness checks.
    pub quick_checks: u32,
    /// Total mana moved across all transfers.
    pub mana_moved: Mana,
}

impl TickStats {
    /// Fold another tick's counters into this one.
    pub fn accumulate(&mut self, other: &TickStats) {
        self.transfers += other.transfers;
        self.blocked += other.blocked;
        self.full_scans += other.full_scans;
        self.quick_checks += other.quick_checks;
        self.mana_moved += other.mana_moved;
    }
}

// ---------------------------------------------------------------------------
// State hash
// ---------------------------------------------------------------------------

/// 64-bit FNV-1a over the durable parts of a world, for desync checks
/// between two runs. Not cryptographic.
///
/// Every field goes in as fixed-width little-endian bytes, so the result
/// depends only on values and order, never on platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateHash(u64);

impl StateHash {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    pub fn new() -> Self {
        Self(Self::OFFSET_BASIS)
    }

    pub fn write(&mut self, bytes: &[u8]) {
        self.0 = bytes.iter().fold(self.0, |h, b| {
            (h ^ u64::from(*b)).wrapping_mul(Self::PRIME)
        });
    }

    pub fn write_u64(&mut self, v: u64) {
        self.write(&v.to_le_bytes());
    }

    /// A coordinate, axis by axis.
    pub fn write_pos(&mut self, pos: GridPos) {
        for axis in [pos.x, pos.y, pos.z] {
            self.write(&axis.to_le_bytes());
        }
    }

    /// An optional port; unset hashes as a byte no port index uses.
    pub fn write_direction(&mut self, direction: Option<Direction>) {
        self.write(&[direction.map_or(u8::MAX, |d| d.index() as u8)]);
    }

    pub fn finish(self) -> u64 {
        self.0
    }
}

impl Default for StateHash {
    fn default() -> Self {
        Self::new()
    }
}

/// Stable hash of a coordinate, used to stagger scan schedules.
pub fn pos_hash(pos: GridPos) -> u64 {
    let mut h = StateHash::new();
    h.write_pos(pos);
    h.finish()
}
