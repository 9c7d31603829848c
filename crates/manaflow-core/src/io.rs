//! Per-port modes and routing priorities.
//!
//! [`IoConfig`] is pure state: every port always has a mode and a
//! priority, and every query is a constant-time lookup. Changing a mode
//! reports a [`PortChange`] to the caller, which is how the world learns
//! that one direction of the topology cache has to be dropped.

use serde::{Deserialize, Serialize};

use crate::direction::{Direction, DirectionMap, DirectionSet};

/// Lowest priority a port can be given.
pub const MIN_PRIORITY: i32 = -1_000_000;
/// Highest priority a port can be given.
pub const MAX_PRIORITY: i32 = 1_000_000;

/// What a port is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PortMode {
    /// Accepts mana only.
    Input,
    /// Sends mana only.
    Output,
    /// Accepts and sends.
    #[default]
    Both,
    /// Neither; the port is ignored by scanning and routing.
    Disabled,
}

impl PortMode {
    pub fn can_input(self) -> bool {
        matches!(self, PortMode::Input | PortMode::Both)
    }

    pub fn can_output(self) -> bool {
        matches!(self, PortMode::Output | PortMode::Both)
    }
}

/// Mode and tie-break priority for one port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PortConfig {
    pub mode: PortMode,
    pub priority: i32,
}

/// A mode change reported by [`IoConfig::set_port`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortChange {
    pub direction: Direction,
    pub previous: PortMode,
    pub current: PortMode,
}

/// Port configuration for one conduit.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IoConfig {
    ports: DirectionMap<PortConfig>,
}

impl IoConfig {
    /// All ports in `Both` mode with priority 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// All ports in the given mode.
    pub fn uniform(mode: PortMode) -> Self {
        Self {
            ports: DirectionMap::from_fn(|_| PortConfig { mode, priority: 0 }),
        }
    }

    /// Overwrite a port's mode. Returns the change when the mode actually
    /// differs, so the caller can invalidate that direction.
    pub fn set_port(&mut self, direction: Direction, mode: PortMode) -> Option<PortChange> {
        let port = &mut self.ports[direction];
        let previous = port.mode;
        port.mode = mode;
        (previous != mode).then_some(PortChange {
            direction,
            previous,
            current: mode,
        })
    }

    pub fn mode(&self, direction: Direction) -> PortMode {
        self.ports[direction].mode
    }

    pub fn can_output(&self, direction: Direction) -> bool {
        self.ports[direction].mode.can_output()
    }

    pub fn can_input(&self, direction: Direction) -> bool {
        self.ports[direction].mode.can_input()
    }

    pub fn is_disabled(&self, direction: Direction) -> bool {
        self.ports[direction].mode == PortMode::Disabled
    }

    /// Store a tie-break priority, clamped to `[MIN_PRIORITY, MAX_PRIORITY]`.
    pub fn set_priority(&mut self, direction: Direction, priority: i32) {
        self.ports[direction].priority = priority.clamp(MIN_PRIORITY, MAX_PRIORITY);
    }

    pub fn priority(&self, direction: Direction) -> i32 {
        self.ports[direction].priority
    }

    pub fn port(&self, direction: Direction) -> PortConfig {
        self.ports[direction]
    }

    /// Ports that may send mana.
    pub fn outputs(&self) -> DirectionSet {
        self.ports
            .iter()
            .filter(|(_, p)| p.mode.can_output())
            .map(|(d, _)| d)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_both() {
        let io = IoConfig::new();
        for d in Direction::ALL {
            assert!(io.can_input(d));
            assert!(io.can_output(d));
            assert!(!io.is_disabled(d));
            assert_eq!(io.priority(d), 0);
        }
    }

    #[test]
    fn mode_predicates() {
        let mut io = IoConfig::new();
        io.set_port(Direction::North, PortMode::Input);
        io.set_port(Direction::South, PortMode::Output);
        io.set_port(Direction::East, PortMode::Disabled);

        assert!(io.can_input(Direction::North));
        assert!(!io.can_output(Direction::North));
        assert!(!io.can_input(Direction::South));
        assert!(io.can_output(Direction::South));
        assert!(io.is_disabled(Direction::East));
        assert!(!io.can_input(Direction::East));
        assert!(!io.can_output(Direction::East));
    }

    #[test]
    fn set_port_reports_only_real_changes() {
        let mut io = IoConfig::new();
        assert_eq!(io.set_port(Direction::Up, PortMode::Both), None);

        let change = io.set_port(Direction::Up, PortMode::Output).unwrap();
        assert_eq!(change.direction, Direction::Up);
        assert_eq!(change.previous, PortMode::Both);
        assert_eq!(change.current, PortMode::Output);

        assert_eq!(io.set_port(Direction::Up, PortMode::Output), None);
    }

    #[test]
    fn priority_is_clamped() {
        let mut io = IoConfig::new();
        io.set_priority(Direction::West, i32::MAX);
        assert_eq!(io.priority(Direction::West), MAX_PRIORITY);
        io.set_priority(Direction::West, i32::MIN);
        assert_eq!(io.priority(Direction::West), MIN_PRIORITY);
        io.set_priority(Direction::West, -3);
        assert_eq!(io.priority(Direction::West), -3);
    }

    #[test]
    fn outputs_set() {
        let mut io = IoConfig::uniform(PortMode::Input);
        assert!(io.outputs().is_empty());
        io.set_port(Direction::East, PortMode::Output);
        io.set_port(Direction::Down, PortMode::Both);
        let outputs: Vec<Direction> = io.outputs().iter().collect();
        assert_eq!(outputs, vec![Direction::Down, Direction::East]);
    }
}
