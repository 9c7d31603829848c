//! Pooled mana networks for the Manaflow engine.
//!
//! An alternative to point-to-point routing: a set of conduits shares one
//! buffer. Joining moves the conduit's mana into the pool and grows the
//! pool by the conduit's capacity; leaving hands back a share proportional
//! to the capacity the conduit brought in.
//!
//! # Design
//!
//! - A conduit belongs to at most one pool and is routed by exactly one
//!   model at a time. Members are switched to [`RoutingMode::Pooled`], which
//!   the transfer engine skips and peers refuse in handshakes.
//! - The pool itself is a [`ManaHandler`], so producers and consumers talk
//!   to it with the same simulate/execute calls as any terminal.
//! - No per-edge rate limits apply inside a pool.
//! - Mana is never created or destroyed: the world total plus
//!   [`PoolModule::total_mana`] is constant across joins and leaves.

use std::collections::BTreeMap;

use log::debug;
use manaflow_core::handler::{ManaBuffer, ManaHandler, TransferMode};
use manaflow_core::id::NodeId;
use manaflow_core::sim::{Mana, Ticks};
use manaflow_core::world::{ManaWorld, RoutingMode, WorldError};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Pool identifier
// ---------------------------------------------------------------------------

/// Identifies a pooled network. Cheap to copy and compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PoolId(pub u32);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("no pooled network {0:?}")]
    UnknownNetwork(PoolId),
    #[error("{node:?} already belongs to {network:?}")]
    AlreadyPooled { node: NodeId, network: PoolId },
    #[error("{node:?} is not a member of {network:?}")]
    NotAMember { node: NodeId, network: PoolId },
    #[error(transparent)]
    World(#[from] WorldError),
}

// ---------------------------------------------------------------------------
// Pooled network
// ---------------------------------------------------------------------------

/// A set of conduits sharing one buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PooledNetwork {
    pub id: PoolId,
    /// Member conduits and the capacity each contributed.
    members: BTreeMap<NodeId, Mana>,
    pool: ManaBuffer,
}

impl PooledNetwork {
    pub fn new(id: PoolId) -> Self {
        Self {
            id,
            members: BTreeMap::new(),
            pool: ManaBuffer::new(0),
        }
    }

    pub fn members(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.members.keys().copied()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.members.contains_key(&node)
    }

    /// Capacity `node` brought into the pool.
    pub fn contribution(&self, node: NodeId) -> Option<Mana> {
        self.members.get(&node).copied()
    }

    /// The share a leaving member with contribution `c` takes with it.
    ///
    /// Proportional to `c` over the pool capacity, but never less than what
    /// the remaining capacity cannot hold, and never more than `c`.
    pub fn share_for(&self, c: Mana) -> Mana {
        let stored = self.pool.stored();
        let capacity = self.pool.capacity();
        if capacity == 0 {
            return 0;
        }
        let proportional = (stored as u128 * c as u128 / capacity as u128) as Mana;
        let forced = stored.saturating_sub(capacity.saturating_sub(c));
        proportional.max(forced).min(c)
    }

    fn join(&mut self, node: NodeId, capacity: Mana, mana: Mana) {
        self.members.insert(node, capacity);
        self.pool.resize(self.pool.capacity().saturating_add(capacity));
        self.pool.receive(mana, TransferMode::Execute);
    }

    /// Detach `node` and return the mana it takes, at most `room`.
    fn leave(&mut self, node: NodeId, room: Mana) -> Option<Mana> {
        let contribution = self.members.remove(&node)?;
        let share = self.share_for(contribution).min(room);
        let taken = self.pool.extract(share, TransferMode::Execute);
        self.pool
            .resize(self.pool.capacity().saturating_sub(contribution));
        Some(taken)
    }
}

impl ManaHandler for PooledNetwork {
    fn stored(&self) -> Mana {
        self.pool.stored()
    }

    fn capacity(&self) -> Mana {
        self.pool.capacity()
    }

    fn receive(&mut self, amount: Mana, mode: TransferMode) -> Mana {
        self.pool.receive(amount, mode)
    }

    fn extract(&mut self, amount: Mana, mode: TransferMode) -> Mana {
        self.pool.extract(amount, mode)
    }
}

// ---------------------------------------------------------------------------
// Pool events
// ---------------------------------------------------------------------------

/// Membership changes, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    NodeJoined {
        network: PoolId,
        node: NodeId,
        /// Mana moved from the conduit into the pool.
        amount: Mana,
        tick: Ticks,
    },
    NodeLeft {
        network: PoolId,
        node: NodeId,
        /// Mana handed back to the conduit.
        share: Mana,
        tick: Ticks,
    },
    NetworkRemoved {
        network: PoolId,
        /// Mana no surviving member could take.
        residue: Mana,
        tick: Ticks,
    },
}

/// What [`PoolModule::remove_network`] handed back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dissolved {
    pub shares: Vec<(NodeId, Mana)>,
    pub residue: Mana,
}

// ---------------------------------------------------------------------------
// Pool module
// ---------------------------------------------------------------------------

/// Owns every pooled network and the node-to-network index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolModule {
    networks: BTreeMap<PoolId, PooledNetwork>,
    membership: BTreeMap<NodeId, PoolId>,
    next_network_id: u32,
    #[serde(skip)]
    events: Vec<PoolEvent>,
}

impl PoolModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty pooled network and return its ID.
    pub fn create_network(&mut self) -> PoolId {
        let id = PoolId(self.next_network_id);
        self.next_network_id += 1;
        self.networks.insert(id, PooledNetwork::new(id));
        id
    }

    pub fn network(&self, id: PoolId) -> Option<&PooledNetwork> {
        self.networks.get(&id)
    }

    pub fn networks(&self) -> impl Iterator<Item = &PooledNetwork> {
        self.networks.values()
    }

    /// The network `node` belongs to, if any.
    pub fn network_of(&self, node: NodeId) -> Option<PoolId> {
        self.membership.get(&node).copied()
    }

    /// Merge `node`'s buffer into the pool and switch it to pooled routing.
    ///
    /// Returns the mana moved into the pool.
    pub fn add_node(
        &mut self,
        world: &mut ManaWorld,
        network: PoolId,
        node: NodeId,
    ) -> Result<Mana, PoolError> {
        if let Some(current) = self.network_of(node) {
            return Err(PoolError::AlreadyPooled {
                node,
                network: current,
            });
        }
        let net = self
            .networks
            .get_mut(&network)
            .ok_or(PoolError::UnknownNetwork(network))?;

        let buffer = world.buffer_mut(node)?;
        let capacity = buffer.capacity();
        let held = buffer.stored();
        let amount = buffer.extract(held, TransferMode::Execute);
        net.join(node, capacity, amount);
        world.set_routing(node, RoutingMode::Pooled)?;
        self.membership.insert(node, network);

        debug!("{node:?} joined {network:?} with {amount} of {capacity}");
        self.events.push(PoolEvent::NodeJoined {
            network,
            node,
            amount,
            tick: world.tick(),
        });
        Ok(amount)
    }

    /// Detach `node`, hand its share back to its buffer, and restore direct
    /// routing. Returns the share.
    pub fn remove_node(
        &mut self,
        world: &mut ManaWorld,
        network: PoolId,
        node: NodeId,
    ) -> Result<Mana, PoolError> {
        let net = self
            .networks
            .get_mut(&network)
            .ok_or(PoolError::UnknownNetwork(network))?;
        if !net.contains(node) {
            return Err(PoolError::NotAMember { node, network });
        }

        let buffer = world.buffer_mut(node)?;
        let room = buffer.available_space();
        let share = net.leave(node, room).unwrap_or(0);
        buffer.receive(share, TransferMode::Execute);
        world.set_routing(node, RoutingMode::Direct)?;
        self.membership.remove(&node);

        debug!("{node:?} left {network:?} with {share}");
        self.events.push(PoolEvent::NodeLeft {
            network,
            node,
            share,
            tick: world.tick(),
        });
        Ok(share)
    }

    /// Drop a member whose conduit no longer exists. Its capacity leaves the
    /// pool; its mana stays for the remaining members.
    pub fn forget_node(&mut self, node: NodeId) -> Option<PoolId> {
        let network = self.membership.remove(&node)?;
        if let Some(net) = self.networks.get_mut(&network) {
            net.leave(node, 0);
        }
        debug!("{node:?} forgotten by {network:?}");
        Some(network)
    }

    /// Detach every member and delete the network.
    ///
    /// Members whose conduits are gone are forgotten first. Mana that no
    /// member could take back is reported as residue.
    pub fn remove_network(
        &mut self,
        world: &mut ManaWorld,
        network: PoolId,
    ) -> Result<Dissolved, PoolError> {
        let members: Vec<NodeId> = self
            .networks
            .get(&network)
            .ok_or(PoolError::UnknownNetwork(network))?
            .members()
            .collect();

        let (live, gone): (Vec<NodeId>, Vec<NodeId>) = members
            .into_iter()
            .partition(|node| world.conduit(*node).is_some());
        for node in gone {
            self.forget_node(node);
        }

        let mut dissolved = Dissolved::default();
        for node in live {
            let share = self.remove_node(world, network, node)?;
            dissolved.shares.push((node, share));
        }

        if let Some(net) = self.networks.remove(&network) {
            dissolved.residue = net.stored();
        }
        debug!("{network:?} removed, residue {}", dissolved.residue);
        self.events.push(PoolEvent::NetworkRemoved {
            network,
            residue: dissolved.residue,
            tick: world.tick(),
        });
        Ok(dissolved)
    }

    /// Offer mana to a pool.
    pub fn receive(
        &mut self,
        network: PoolId,
        amount: Mana,
        mode: TransferMode,
    ) -> Result<Mana, PoolError> {
        self.networks
            .get_mut(&network)
            .map(|net| net.receive(amount, mode))
            .ok_or(PoolError::UnknownNetwork(network))
    }

    /// Draw mana from a pool.
    pub fn extract(
        &mut self,
        network: PoolId,
        amount: Mana,
        mode: TransferMode,
    ) -> Result<Mana, PoolError> {
        self.networks
            .get_mut(&network)
            .map(|net| net.extract(amount, mode))
            .ok_or(PoolError::UnknownNetwork(network))
    }

    /// Mana held across every pool.
    pub fn total_mana(&self) -> Mana {
        self.networks.values().map(|n| n.stored()).sum()
    }

    /// Take the events recorded since the last call.
    pub fn drain_events(&mut self) -> Vec<PoolEvent> {
        std::mem::take(&mut self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manaflow_core::test_utils::*;
    use manaflow_core::transfer::{IdleReason, TransferOutcome};

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn total(world: &ManaWorld, pools: &PoolModule) -> Mana {
        world.total_mana() + pools.total_mana()
    }

    /// Three separated conduits with the given stored/capacity pairs.
    fn spread(world: &mut ManaWorld, specs: &[(Mana, Mana)]) -> Vec<NodeId> {
        specs
            .iter()
            .enumerate()
            .map(|(i, (s, c))| conduit(world, pos(i as i32 * 3, 0, 0), *s, *c))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Test 1: Joining moves the buffer into the pool
    // -----------------------------------------------------------------------
    #[test]
    fn join_moves_buffer_into_pool() {
        let mut world = ManaWorld::new();
        let mut pools = PoolModule::new();
        let nodes = spread(&mut world, &[(40, 100), (10, 50)]);
        let net = pools.create_network();

        assert_eq!(pools.add_node(&mut world, net, nodes[0]).unwrap(), 40);
        assert_eq!(pools.add_node(&mut world, net, nodes[1]).unwrap(), 10);

        let pool = pools.network(net).unwrap();
        assert_eq!(pool.stored(), 50);
        assert_eq!(pool.capacity(), 150);
        assert_eq!(stored(&world, nodes[0]), 0);
        assert_eq!(stored(&world, nodes[1]), 0);
        assert_eq!(total(&world, &pools), 50);
    }

    // -----------------------------------------------------------------------
    // Test 2: Members switch routing model
    // -----------------------------------------------------------------------
    #[test]
    fn members_are_pooled_until_they_leave() {
        let mut world = ManaWorld::new();
        let mut pools = PoolModule::new();
        let nodes = spread(&mut world, &[(40, 100)]);
        let net = pools.create_network();

        pools.add_node(&mut world, net, nodes[0]).unwrap();
        assert_eq!(
            world.conduit(nodes[0]).unwrap().routing(),
            RoutingMode::Pooled
        );
        assert_eq!(pools.network_of(nodes[0]), Some(net));
        assert_eq!(
            world.process(nodes[0]),
            TransferOutcome::Idle(IdleReason::Pooled)
        );

        pools.remove_node(&mut world, net, nodes[0]).unwrap();
        assert_eq!(
            world.conduit(nodes[0]).unwrap().routing(),
            RoutingMode::Direct
        );
        assert_eq!(pools.network_of(nodes[0]), None);
    }

    // -----------------------------------------------------------------------
    // Test 3: Leaving takes a capacity-proportional share
    // -----------------------------------------------------------------------
    #[test]
    fn leave_takes_proportional_share() {
        let mut world = ManaWorld::new();
        let mut pools = PoolModule::new();
        let nodes = spread(&mut world, &[(100, 100), (0, 300)]);
        let net = pools.create_network();
        pools.add_node(&mut world, net, nodes[0]).unwrap();
        pools.add_node(&mut world, net, nodes[1]).unwrap();

        // 100 stored over 400 capacity; the 300 member takes three quarters.
        let share = pools.remove_node(&mut world, net, nodes[1]).unwrap();
        assert_eq!(share, 75);
        assert_eq!(stored(&world, nodes[1]), 75);
        assert_eq!(pools.network(net).unwrap().stored(), 25);
        assert_eq!(pools.network(net).unwrap().capacity(), 100);
        assert_eq!(total(&world, &pools), 100);
    }

    // -----------------------------------------------------------------------
    // Test 4: A near-full pool never ends up over capacity
    // -----------------------------------------------------------------------
    #[test]
    fn leave_never_overfills_remaining_pool() {
        let mut world = ManaWorld::new();
        let mut pools = PoolModule::new();
        let nodes = spread(&mut world, &[(10, 10), (90, 90)]);
        let net = pools.create_network();
        pools.add_node(&mut world, net, nodes[0]).unwrap();
        pools.add_node(&mut world, net, nodes[1]).unwrap();

        // Full pool of 100: the 90 member must take all 90 back.
        let share = pools.remove_node(&mut world, net, nodes[1]).unwrap();
        assert_eq!(share, 90);
        let pool = pools.network(net).unwrap();
        assert!(pool.stored() <= pool.capacity());
        assert_eq!(pool.stored(), 10);
    }

    // -----------------------------------------------------------------------
    // Test 5: Share arithmetic
    // -----------------------------------------------------------------------
    #[test]
    fn share_is_bounded_by_contribution() {
        let mut net = PooledNetwork::new(PoolId(0));
        assert_eq!(net.share_for(10), 0, "empty pool has nothing to share");

        let mut world = ManaWorld::new();
        let a = conduit(&mut world, pos(0, 0, 0), 0, 0);
        let b = conduit(&mut world, pos(3, 0, 0), 0, 0);
        net.join(a, 40, 40);
        net.join(b, 60, 30);
        // 70 of 100: proportional 28 for a, forced 70 - 60 = 10.
        assert_eq!(net.share_for(40), 28);
        // proportional 42 for b, forced 70 - 40 = 30.
        assert_eq!(net.share_for(60), 42);
        assert!(net.share_for(60) <= 60);
    }

    // -----------------------------------------------------------------------
    // Test 6: Pool handler follows simulate/execute
    // -----------------------------------------------------------------------
    #[test]
    fn pool_receive_and_extract() {
        let mut world = ManaWorld::new();
        let mut pools = PoolModule::new();
        let nodes = spread(&mut world, &[(20, 100)]);
        let net = pools.create_network();
        pools.add_node(&mut world, net, nodes[0]).unwrap();

        assert_eq!(pools.receive(net, 500, TransferMode::Simulate).unwrap(), 80);
        assert_eq!(pools.network(net).unwrap().stored(), 20);
        assert_eq!(pools.receive(net, 30, TransferMode::Execute).unwrap(), 30);
        assert_eq!(pools.extract(net, 100, TransferMode::Simulate).unwrap(), 50);
        assert_eq!(pools.extract(net, 45, TransferMode::Execute).unwrap(), 45);
        assert_eq!(pools.network(net).unwrap().stored(), 5);
    }

    // -----------------------------------------------------------------------
    // Test 7: Membership errors
    // -----------------------------------------------------------------------
    #[test]
    fn membership_errors() {
        let mut world = ManaWorld::new();
        let mut pools = PoolModule::new();
        let nodes = spread(&mut world, &[(20, 100), (0, 10)]);
        let first = pools.create_network();
        let second = pools.create_network();
        pools.add_node(&mut world, first, nodes[0]).unwrap();

        assert!(matches!(
            pools.add_node(&mut world, second, nodes[0]),
            Err(PoolError::AlreadyPooled { network, .. }) if network == first
        ));
        assert!(matches!(
            pools.remove_node(&mut world, second, nodes[1]),
            Err(PoolError::NotAMember { .. })
        ));
        assert!(matches!(
            pools.add_node(&mut world, PoolId(99), nodes[1]),
            Err(PoolError::UnknownNetwork(PoolId(99)))
        ));
        assert!(matches!(
            pools.receive(PoolId(99), 1, TransferMode::Execute),
            Err(PoolError::UnknownNetwork(_))
        ));
    }

    // -----------------------------------------------------------------------
    // Test 8: Removing a network returns every share
    // -----------------------------------------------------------------------
    #[test]
    fn remove_network_returns_all_members() {
        let mut world = ManaWorld::new();
        let mut pools = PoolModule::new();
        let nodes = spread(&mut world, &[(50, 100), (30, 100), (0, 200)]);
        let net = pools.create_network();
        for node in &nodes {
            pools.add_node(&mut world, net, *node).unwrap();
        }

        let dissolved = pools.remove_network(&mut world, net).unwrap();
        assert_eq!(dissolved.shares.len(), 3);
        assert_eq!(dissolved.residue, 0);
        assert!(pools.network(net).is_none());
        assert_eq!(pools.total_mana(), 0);
        assert_eq!(world.total_mana(), 80);
        for node in &nodes {
            assert_eq!(world.conduit(*node).unwrap().routing(), RoutingMode::Direct);
        }
    }

    // -----------------------------------------------------------------------
    // Test 9: Vanished members leave their mana behind
    // -----------------------------------------------------------------------
    #[test]
    fn vanished_member_is_forgotten() {
        let mut world = ManaWorld::new();
        let mut pools = PoolModule::new();
        let nodes = spread(&mut world, &[(40, 100), (20, 100)]);
        let net = pools.create_network();
        pools.add_node(&mut world, net, nodes[0]).unwrap();
        pools.add_node(&mut world, net, nodes[1]).unwrap();

        world.remove_conduit(nodes[0]).unwrap();
        let dissolved = pools.remove_network(&mut world, net).unwrap();

        assert_eq!(dissolved.shares, vec![(nodes[1], 60)]);
        assert_eq!(dissolved.residue, 0);
        assert_eq!(pools.network_of(nodes[0]), None);
    }

    // -----------------------------------------------------------------------
    // Test 10: Events record membership changes
    // -----------------------------------------------------------------------
    #[test]
    fn events_record_membership() {
        let mut world = ManaWorld::new();
        let mut pools = PoolModule::new();
        let nodes = spread(&mut world, &[(40, 100)]);
        let net = pools.create_network();
        pools.add_node(&mut world, net, nodes[0]).unwrap();
        pools.remove_node(&mut world, net, nodes[0]).unwrap();

        let events = pools.drain_events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], PoolEvent::NodeJoined { amount: 40, .. }));
        assert!(matches!(events[1], PoolEvent::NodeLeft { share: 40, .. }));
        assert!(pools.drain_events().is_empty());
    }
}
