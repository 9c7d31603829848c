//! Conduit tiers and the per-tick transfer cap each one grants.

use serde::{Deserialize, Serialize};

use crate::config::NetworkConfig;
use crate::sim::Mana;

/// Number of tiers.
pub const TIER_COUNT: usize = 4;

/// Flat per-tick cap from before tiers existed.
#[deprecated(note = "assign a `Tier`; this only applies to conduits without one")]
pub const FALLBACK_TRANSFER_RATE: Mana = 20;

/// A conduit classification. Higher tiers move more mana per transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Tier {
    Basic,
    Advanced,
    Elite,
    Ultimate,
}

impl Tier {
    pub const ALL: [Tier; TIER_COUNT] = [Tier::Basic, Tier::Advanced, Tier::Elite, Tier::Ultimate];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Per-tick transfer cap read from the tier table.
    pub fn rate(self, config: &NetworkConfig) -> Mana {
        config.tier_rates[self.index()]
    }
}

/// Per-tick cap for a conduit, falling back to the flat rate when no tier
/// has been assigned.
#[allow(deprecated)]
pub fn transfer_rate(tier: Option<Tier>, config: &NetworkConfig) -> Mana {
    match tier {
        Some(tier) => tier.rate(config),
        None => FALLBACK_TRANSFER_RATE,
    }
}
