use crate::id::NodeId;
use std::collections::BTreeSet;

/// Tracks which conduits changed durable state since the host last saved.
///
/// A conduit is marked when a committed transfer updates its send or
/// receive bookkeeping. The host drains the set with
/// [`take`](DirtyTracker::take) and persists only those conduits.
#[derive(Debug, Clone, Default)]
pub struct DirtyTracker {
    dirty_nodes: BTreeSet<NodeId>,
}

impl DirtyTracker {
    /// Create a new tracker with nothing dirty.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a single conduit as needing a save.
    pub fn mark_node(&mut self, node: NodeId) {
        self.dirty_nodes.insert(node);
    }

    /// Returns `true` if anything has been marked since the last drain.
    pub fn is_dirty(&self) -> bool {
        !self.dirty_nodes.is_empty()
    }

    pub fn is_node_dirty(&self, node: NodeId) -> bool {
        self.dirty_nodes.contains(&node)
    }

    pub fn dirty_nodes(&self) -> &BTreeSet<NodeId> {
        &self.dirty_nodes
    }

    /// Drain the dirty set in key order.
    pub fn take(&mut self) -> Vec<NodeId> {
        std::mem::take(&mut self.dirty_nodes).into_iter().collect()
    }

    /// Drop a removed conduit so it is never reported.
    pub fn forget(&mut self, node: NodeId) {
        self.dirty_nodes.remove(&node);
    }

    /// Reset without reporting anything.
    pub fn mark_clean(&mut self) {
        self.dirty_nodes.clear();
    }
}
