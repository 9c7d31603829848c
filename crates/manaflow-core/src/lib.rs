//! Manaflow Core -- the routing engine for block-based mana networks.
//!
//! A network is a set of conduits on an integer grid. Each conduit holds a
//! bounded mana buffer and has six ports, one per axis direction. Every tick
//! a conduit may push mana to neighbors: other conduits (peers) or external
//! producers and consumers (terminals).
//!
//! # Tick
//!
//! Each call to [`world::ManaWorld::step`] visits every conduit and:
//!
//! 1. **Scan** -- runs the staggered topology schedule: a full rescan, a
//!    quick check of one endpoint, or nothing.
//! 2. **Transfer** -- moves mana to the neighbor with the most free space,
//!    subject to the anti-backflow, double-send, and cycle gates and the
//!    tier's per-tick rate.
//!
//! Then the shared registry is swept on maintenance ticks and buffered
//! events are delivered.
//!
//! # Key Types
//!
//! - [`world::ManaWorld`] -- Owns conduits, terminals, caches, and the tick.
//! - [`io::IoConfig`] -- Per-port modes and priorities.
//! - [`cache::EndpointCache`] / [`cache::TopologyRegistry`] -- The per-node
//!   and shared tiers of the endpoint cache.
//! - [`scanner::NetworkManager`] -- Discovery and target enumeration.
//! - [`transfer::TransferManager`] -- Target selection, gates, and the
//!   simulate/execute transfer.
//! - [`handler::ManaHandler`] -- The two-phase interface at network edges.
//! - [`persist`] -- Versioned save records for durable transfer state.

pub mod cache;
pub mod config;
pub mod direction;
pub mod dirty;
pub mod event;
pub mod handler;
pub mod id;
pub mod io;
pub mod persist;
pub mod scanner;
pub mod sim;
pub mod tier;
pub mod transfer;
pub mod world;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
