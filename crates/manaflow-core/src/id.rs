use serde::{Deserialize, Serialize};
use slotmap::new_key_type;

use crate::direction::Direction;

new_key_type! {
    /// Identifies a conduit in the world arena. Versioned, so a key held
    /// past the conduit's removal never resolves to a newer conduit.
    pub struct NodeId;
}

/// A block coordinate. Conduits and terminal handlers are keyed by it.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct GridPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl GridPos {
    pub const ORIGIN: GridPos = GridPos { x: 0, y: 0, z: 0 };

    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// The coordinate one step through `direction`.
    pub fn offset(self, direction: Direction) -> GridPos {
        let (dx, dy, dz) = direction.offset();
        GridPos {
            x: self.x.wrapping_add(dx),
            y: self.y.wrapping_add(dy),
            z: self.z.wrapping_add(dz),
        }
    }

    /// The port of `self` that faces `other`, if they are adjacent.
    pub fn direction_to(self, other: GridPos) -> Option<Direction> {
        Direction::ALL.into_iter().find(|d| self.offset(*d) == other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    #[test]
    fn offset_and_back() {
        let p = GridPos::new(3, -2, 7);
        for d in Direction::ALL {
            assert_eq!(p.offset(d).offset(d.opposite()), p);
        }
        assert_eq!(p.offset(Direction::East), GridPos::new(4, -2, 7));
        assert_eq!(p.offset(Direction::Down), GridPos::new(3, -3, 7));
    }

    #[test]
    fn direction_to_adjacent_only() {
        let a = GridPos::ORIGIN;
        assert_eq!(a.direction_to(GridPos::new(0, 0, 1)), Some(Direction::South));
        assert_eq!(a.direction_to(GridPos::new(2, 0, 0)), None);
        assert_eq!(a.direction_to(a), None);
    }

    #[test]
    fn stale_node_ids_do_not_resolve() {
        let mut sm: SlotMap<NodeId, u32> = SlotMap::with_key();
        let a = sm.insert(1);
        sm.remove(a);
        let b = sm.insert(2);
        assert_ne!(a, b);
        assert!(sm.get(a).is_none());
    }
}
