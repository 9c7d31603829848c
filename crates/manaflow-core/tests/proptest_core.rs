//! Property-based tests for the routing engine.
//!
//! Uses proptest to generate random layouts on a small grid, runs them for
//! a number of ticks, and checks the invariants every tick must uphold.

use std::collections::BTreeMap;

use manaflow_core::direction::{Direction, PORT_COUNT};
use manaflow_core::event::{EventKind, NetworkEvent};
use manaflow_core::handler::{ManaBuffer, ManaHandler};
use manaflow_core::id::{GridPos, NodeId};
use manaflow_core::io::PortMode;
use manaflow_core::tier::{Tier, transfer_rate};
use manaflow_core::world::ManaWorld;
use proptest::prelude::*;

// ===========================================================================
// Generators
// ===========================================================================

#[derive(Debug, Clone)]
enum Cell {
    Empty,
    Conduit {
        stored: u64,
        capacity: u64,
        tier: Option<Tier>,
        ports: [PortMode; PORT_COUNT],
    },
    Sink(u64),
}

fn arb_mode() -> impl Strategy<Value = PortMode> {
    prop_oneof![
        6 => Just(PortMode::Both),
        1 => Just(PortMode::Input),
        1 => Just(PortMode::Output),
        1 => Just(PortMode::Disabled),
    ]
}

fn arb_tier() -> impl Strategy<Value = Option<Tier>> {
    prop_oneof![
        Just(None),
        Just(Some(Tier::Basic)),
        Just(Some(Tier::Advanced)),
        Just(Some(Tier::Elite)),
    ]
}

fn arb_cell() -> impl Strategy<Value = Cell> {
    prop_oneof![
        2 => Just(Cell::Empty),
        6 => (0..500u64, 1..500u64, arb_tier(), proptest::array::uniform6(arb_mode()))
            .prop_map(|(stored, capacity, tier, ports)| Cell::Conduit {
                stored,
                capacity,
                tier,
                ports,
            }),
        1 => (1..300u64).prop_map(Cell::Sink),
    ]
}

/// A 4x2x4 block of random cells.
fn arb_layout() -> impl Strategy<Value = Vec<Cell>> {
    proptest::collection::vec(arb_cell(), 32)
}

fn cell_pos(i: usize) -> GridPos {
    GridPos::new((i % 4) as i32, ((i / 4) % 2) as i32, (i / 8) as i32)
}

fn build(layout: &[Cell]) -> (ManaWorld, BTreeMap<NodeId, GridPos>) {
    let mut world = ManaWorld::new();
    let mut nodes = BTreeMap::new();
    for (i, cell) in layout.iter().enumerate() {
        let at = cell_pos(i);
        match cell {
            Cell::Empty => {}
            Cell::Conduit {
                stored,
                capacity,
                tier,
                ports,
            } => {
                let id = world
                    .add_conduit(at, ManaBuffer::with_stored(*stored, *capacity), *tier)
                    .unwrap();
                for (d, mode) in Direction::ALL.into_iter().zip(ports) {
                    world.set_port(id, d, *mode).unwrap();
                }
                nodes.insert(id, at);
            }
            Cell::Sink(capacity) => {
                world
                    .add_terminal(at, Box::new(ManaBuffer::sink(*capacity)))
                    .unwrap();
            }
        }
    }
    (world, nodes)
}

/// Transfers emitted during the last tick, in emission order.
fn drain_transfers(world: &mut ManaWorld) -> Vec<(NodeId, Direction, GridPos, u64, u64)> {
    let out = world
        .events()
        .events(EventKind::ManaTransferred)
        .into_iter()
        .filter_map(|e| match e {
            NetworkEvent::ManaTransferred {
                node,
                direction,
                target,
                amount,
                tick,
            } => Some((node, direction, target, amount, tick)),
            _ => None,
        })
        .collect();
    world.events_mut().clear_all();
    out
}

// ===========================================================================
// Properties
// ===========================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Mana is never created or destroyed.
    #[test]
    fn mana_is_conserved(layout in arb_layout(), ticks in 1..120u64) {
        let (mut world, _) = build(&layout);
        let total = world.total_mana();
        for _ in 0..ticks {
            world.step();
            prop_assert_eq!(world.total_mana(), total);
        }
    }

    /// No transfer exceeds its tier's rate and no conduit exceeds the
    /// per-tick cap.
    #[test]
    fn rate_and_cap_hold(layout in arb_layout(), ticks in 1..80u64) {
        let (mut world, _) = build(&layout);
        let cap = world.config().max_transfers_per_tick as usize;
        for _ in 0..ticks {
            world.step();
            let mut per_node: BTreeMap<NodeId, usize> = BTreeMap::new();
            for (node, _, _, amount, _) in drain_transfers(&mut world) {
                let tier = world.conduit(node).unwrap().tier();
                prop_assert!(amount > 0);
                prop_assert!(amount <= transfer_rate(tier, world.config()));
                *per_node.entry(node).or_default() += 1;
            }
            for count in per_node.values() {
                prop_assert!(*count <= cap);
            }
        }
    }

    /// A conduit never sends back through a port it received on within
    /// the backflow window.
    #[test]
    fn no_backflow(layout in arb_layout(), ticks in 1..80u64) {
        let (mut world, nodes) = build(&layout);
        let window = world.config().backflow_window;
        let by_pos: BTreeMap<GridPos, NodeId> = nodes.iter().map(|(id, p)| (*p, *id)).collect();
        let mut received: BTreeMap<(NodeId, Direction), u64> = BTreeMap::new();

        for _ in 0..ticks {
            world.step();
            for (node, direction, target, _, tick) in drain_transfers(&mut world) {
                if let Some(at) = received.get(&(node, direction)) {
                    prop_assert!(
                        tick - at >= window,
                        "{:?} sent {} at {} after receiving at {}", node, direction, tick, at
                    );
                }
                if let Some(peer) = by_pos.get(&target) {
                    received.insert((*peer, direction.opposite()), tick);
                }
            }
        }
    }

    /// No direction appears more than twice in any recent path.
    #[test]
    fn path_stays_bounded(layout in arb_layout(), ticks in 1..150u64) {
        let (mut world, nodes) = build(&layout);
        for _ in 0..ticks {
            world.step();
            for id in nodes.keys() {
                let state = world.conduit(*id).unwrap().transfer_state();
                for d in Direction::ALL {
                    prop_assert!(state.recent_path().filter(|p| *p == d).count() <= 2);
                }
                prop_assert!(state.recent_path().count() <= world.config().history_len);
            }
        }
    }

    /// Stored mana never exceeds capacity anywhere.
    #[test]
    fn buffers_stay_in_bounds(layout in arb_layout(), ticks in 1..60u64) {
        let (mut world, _) = build(&layout);
        for _ in 0..ticks {
            world.step();
            for (_, conduit) in world.conduits() {
                prop_assert!(conduit.buffer().stored() <= conduit.buffer().capacity());
            }
        }
    }
}
