//! Port directions and the fixed-size neighbor list the engine runs on.
//!
//! Every conduit has [`PORT_COUNT`] ports. The rest of the crate never
//! matches on individual directions except to compute grid offsets; it
//! iterates [`Direction::ALL`], indexes [`DirectionMap`], and stores sets of
//! ports in a [`DirectionSet`] bitset.

use std::fmt;
use std::ops::{Index, IndexMut};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Number of ports on a conduit.
pub const PORT_COUNT: usize = 6;

/// One of the six axis-aligned port directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Direction {
    Down,
    Up,
    North,
    South,
    West,
    East,
}

impl Direction {
    /// All ports in index order.
    pub const ALL: [Direction; PORT_COUNT] = [
        Direction::Down,
        Direction::Up,
        Direction::North,
        Direction::South,
        Direction::West,
        Direction::East,
    ];

    /// Dense index in `0..PORT_COUNT`.
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Inverse of [`index`](Direction::index). `None` for out-of-range values.
    pub fn from_index(index: usize) -> Option<Direction> {
        Self::ALL.get(index).copied()
    }

    /// The port on the neighbor that faces back at this one.
    pub fn opposite(self) -> Direction {
        match self {
            Direction::Down => Direction::Up,
            Direction::Up => Direction::Down,
            Direction::North => Direction::South,
            Direction::South => Direction::North,
            Direction::West => Direction::East,
            Direction::East => Direction::West,
        }
    }

    /// Unit offset `(dx, dy, dz)` toward the neighbor on this port.
    pub fn offset(self) -> (i32, i32, i32) {
        match self {
            Direction::Down => (0, -1, 0),
            Direction::Up => (0, 1, 0),
            Direction::North => (0, 0, -1),
            Direction::South => (0, 0, 1),
            Direction::West => (-1, 0, 0),
            Direction::East => (1, 0, 0),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Direction::Down => "down",
            Direction::Up => "up",
            Direction::North => "north",
            Direction::South => "south",
            Direction::West => "west",
            Direction::East => "east",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Returned when a string does not name a port.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown direction: {0:?}")]
pub struct UnknownDirection(pub String);

impl FromStr for Direction {
    type Err = UnknownDirection;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Direction::ALL
            .into_iter()
            .find(|d| d.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownDirection(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// DirectionMap
// ---------------------------------------------------------------------------

/// One value per port, stored inline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectionMap<T> {
    slots: [T; PORT_COUNT],
}

impl<T: Default> Default for DirectionMap<T> {
    fn default() -> Self {
        Self {
            slots: Default::default(),
        }
    }
}

impl<T> DirectionMap<T> {
    /// Build a map by evaluating `f` once per port.
    pub fn from_fn(mut f: impl FnMut(Direction) -> T) -> Self {
        Self {
            slots: std::array::from_fn(|i| f(Direction::ALL[i])),
        }
    }

    pub fn get(&self, direction: Direction) -> &T {
        &self.slots[direction.index()]
    }

    pub fn get_mut(&mut self, direction: Direction) -> &mut T {
        &mut self.slots[direction.index()]
    }

    /// Overwrite the value for `direction`, returning the old one.
    pub fn set(&mut self, direction: Direction, value: T) -> T {
        std::mem::replace(&mut self.slots[direction.index()], value)
    }

    /// Iterate `(direction, value)` pairs in port order.
    pub fn iter(&self) -> impl Iterator<Item = (Direction, &T)> {
        Direction::ALL.into_iter().zip(self.slots.iter())
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots.iter_mut()
    }
}

impl<T> Index<Direction> for DirectionMap<T> {
    type Output = T;

    fn index(&self, direction: Direction) -> &T {
        self.get(direction)
    }
}

impl<T> IndexMut<Direction> for DirectionMap<T> {
    fn index_mut(&mut self, direction: Direction) -> &mut T {
        self.get_mut(direction)
    }
}

// ---------------------------------------------------------------------------
// DirectionSet
// ---------------------------------------------------------------------------

/// A set of ports packed into a bitmask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DirectionSet(u8);

impl DirectionSet {
    pub const EMPTY: DirectionSet = DirectionSet(0);

    pub fn new() -> Self {
        Self::EMPTY
    }

    /// Every port.
    pub fn all() -> Self {
        Self((1 << PORT_COUNT) - 1)
    }

    /// Insert a port. Returns `false` if it was already present.
    pub fn insert(&mut self, direction: Direction) -> bool {
        let bit = 1u8 << direction.index();
        let fresh = self.0 & bit == 0;
        self.0 |= bit;
        fresh
    }

    /// Remove a port. Returns `true` if it was present.
    pub fn remove(&mut self, direction: Direction) -> bool {
        let bit = 1u8 << direction.index();
        let present = self.0 & bit != 0;
        self.0 &= !bit;
        present
    }

    pub fn contains(&self, direction: Direction) -> bool {
        self.0 & (1u8 << direction.index()) != 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Iterate members in port order.
    pub fn iter(&self) -> impl Iterator<Item = Direction> + use<> {
        let set = *self;
        Direction::ALL.into_iter().filter(move |d| set.contains(*d))
    }
}

impl FromIterator<Direction> for DirectionSet {
    fn from_iter<I: IntoIterator<Item = Direction>>(iter: I) -> Self {
        let mut set = DirectionSet::new();
        for d in iter {
            set.insert(d);
        }
        set
    }
}
