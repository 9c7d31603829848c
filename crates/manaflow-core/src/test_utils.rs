//! Shared test helpers for integration tests and benchmarks.
//!
//! Gated behind `#[cfg(any(test, feature = "test-utils"))]` so these helpers
//! are available in unit tests, integration tests, and benchmarks (via the
//! `test-utils` feature).

use crate::direction::Direction;
use crate::handler::ManaBuffer;
use crate::id::{GridPos, NodeId};
use crate::io::PortMode;
use crate::sim::Mana;
use crate::tier::Tier;
use crate::world::ManaWorld;

// ===========================================================================
// Coordinates
// ===========================================================================

pub fn pos(x: i32, y: i32, z: i32) -> GridPos {
    GridPos::new(x, y, z)
}

/// The four corners of a unit square in the x/z plane, in ring order.
pub fn square() -> [GridPos; 4] {
    [pos(0, 0, 0), pos(1, 0, 0), pos(1, 0, 1), pos(0, 0, 1)]
}

// ===========================================================================
// Builders
// ===========================================================================

/// Place a basic-tier conduit holding `stored` of `capacity`.
pub fn conduit(world: &mut ManaWorld, at: GridPos, stored: Mana, capacity: Mana) -> NodeId {
    world
        .add_conduit(at, ManaBuffer::with_stored(stored, capacity), Some(Tier::Basic))
        .expect("position is free")
}

/// A row of `n` conduits running east from the origin. The first holds
/// `stored`; the rest start empty.
pub fn line(world: &mut ManaWorld, n: usize, stored: Mana, capacity: Mana) -> Vec<NodeId> {
    (0..n)
        .map(|i| {
            let amount = if i == 0 { stored } else { 0 };
            conduit(world, pos(i as i32, 0, 0), amount, capacity)
        })
        .collect()
}

/// Four conduits on [`square`], each holding `stored`.
pub fn ring(world: &mut ManaWorld, stored: Mana, capacity: Mana) -> [NodeId; 4] {
    square().map(|at| conduit(world, at, stored, capacity))
}

pub fn sink(world: &mut ManaWorld, at: GridPos, capacity: Mana) {
    world
        .add_terminal(at, Box::new(ManaBuffer::sink(capacity)))
        .expect("position is free");
}

pub fn source(world: &mut ManaWorld, at: GridPos, stored: Mana) {
    world
        .add_terminal(at, Box::new(ManaBuffer::source(stored)))
        .expect("position is free");
}

/// Two neighbors: a full sender at the origin with every port `Output`
/// and an empty receiver east of it with every port `Input`.
pub fn sender_receiver(world: &mut ManaWorld, capacity: Mana) -> (NodeId, NodeId) {
    let a = conduit(world, pos(0, 0, 0), capacity, capacity);
    let b = conduit(world, pos(0, 0, 0).offset(Direction::East), 0, capacity);
    world.set_all_ports(a, PortMode::Output).expect("a exists");
    world.set_all_ports(b, PortMode::Input).expect("b exists");
    (a, b)
}

/// Mana held by a conduit, panicking if it is gone.
pub fn stored(world: &ManaWorld, node: NodeId) -> Mana {
    world.stored(node).expect("conduit exists")
}
