//! Control-side node graph and schedule builder
//!
//! The graph model owns topology: which nodes exist, which slot each one
//! occupies in the audio context's unit table, and the channel-level edges
//! between them. Every mutation validates before applying, so a rejected
//! call leaves both the model and the published schedule untouched. After
//! a successful mutation the caller rebuilds and publishes a fresh
//! `Schedule`.

use std::collections::{HashMap, HashSet, VecDeque};

use smallvec::SmallVec;

use wf_core::{ChannelCounts, Connection, GraphError, NodeId};

use crate::schedule::{EdgeRef, Schedule, ScheduleStep};

#[derive(Debug, Clone, Copy)]
struct NodeInfo {
    counts: ChannelCounts,
    slot: usize,
}

/// Mutable topology owned by the control context.
pub struct GraphModel {
    nodes: HashMap<NodeId, NodeInfo>,
    connections: Vec<Connection>,
    /// Vacated unit-table slots, reused before fresh ones
    free_slots: Vec<usize>,
    next_id: u32,
    next_generation: u64,
}

impl GraphModel {
    /// Create a graph holding only the master node at slot 0.
    pub fn new(max_nodes: usize, master_counts: ChannelCounts) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            NodeId::MASTER,
            NodeInfo {
                counts: master_counts,
                slot: 0,
            },
        );
        // Pop order hands out ascending slots
        let free_slots = (1..max_nodes).rev().collect();
        Self {
            nodes,
            connections: Vec::new(),
            free_slots,
            next_id: 1,
            next_generation: 1,
        }
    }

    /// Insert a node, assigning it a fresh id and a unit-table slot.
    pub fn add_node(&mut self, counts: ChannelCounts) -> Result<(NodeId, usize), GraphError> {
        if !counts.is_valid() {
            return Err(GraphError::InvalidChannelCount);
        }
        let slot = self.free_slots.pop().ok_or(GraphError::NoFreeSlot)?;
        let node = NodeId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(node, NodeInfo { counts, slot });
        Ok((node, slot))
    }

    /// Remove a node and every edge touching it. Returns its vacated slot.
    pub fn remove_node(&mut self, node: NodeId) -> Result<usize, GraphError> {
        if node == NodeId::MASTER {
            return Err(GraphError::CannotRemoveMaster);
        }
        let info = self
            .nodes
            .remove(&node)
            .ok_or(GraphError::UnknownNode(node))?;
        self.connections
            .retain(|c| c.src != node && c.dst != node);
        self.free_slots.push(info.slot);
        Ok(info.slot)
    }

    /// Add a channel-level edge with full validation.
    pub fn connect(&mut self, conn: Connection) -> Result<(), GraphError> {
        let src = self
            .nodes
            .get(&conn.src)
            .ok_or(GraphError::UnknownNode(conn.src))?;
        let dst = self
            .nodes
            .get(&conn.dst)
            .ok_or(GraphError::UnknownNode(conn.dst))?;

        if conn.src_channel >= src.counts.outputs {
            return Err(GraphError::ChannelOutOfRange {
                node: conn.src,
                channel: conn.src_channel,
                count: src.counts.outputs,
            });
        }
        if conn.dst_channel >= dst.counts.inputs {
            return Err(GraphError::ChannelOutOfRange {
                node: conn.dst,
                channel: conn.dst_channel,
                count: dst.counts.inputs,
            });
        }
        if self.connections.contains(&conn) {
            return Err(GraphError::DuplicateConnection);
        }
        // A self-edge is the shortest cycle
        if conn.src == conn.dst || self.would_create_cycle(conn.src, conn.dst) {
            return Err(GraphError::WouldCreateCycle {
                src: conn.src,
                dst: conn.dst,
            });
        }

        self.connections.push(conn);
        Ok(())
    }

    /// Remove one exact edge.
    pub fn disconnect(&mut self, conn: &Connection) -> Result<(), GraphError> {
        let index = self
            .connections
            .iter()
            .position(|c| c == conn)
            .ok_or(GraphError::UnknownConnection)?;
        self.connections.remove(index);
        Ok(())
    }

    /// Check if adding src -> dst would create a cycle (DFS).
    fn would_create_cycle(&self, src: NodeId, dst: NodeId) -> bool {
        // The edge closes a cycle iff src is already reachable from dst
        let mut visited = HashSet::new();
        let mut stack = vec![dst];

        while let Some(current) = stack.pop() {
            if current == src {
                return true;
            }
            if visited.insert(current) {
                for conn in &self.connections {
                    if conn.src == current {
                        stack.push(conn.dst);
                    }
                }
            }
        }

        false
    }

    /// Build a fresh execution plan using Kahn's algorithm.
    ///
    /// Initial sources are visited in id order and later nodes in
    /// connection order, so rebuilding an unchanged graph always produces
    /// an identical plan.
    pub fn rebuild(&mut self) -> Schedule {
        let generation = self.next_generation;
        self.next_generation += 1;

        // Count incoming edges
        let mut in_degree: HashMap<NodeId, usize> =
            self.nodes.keys().map(|&id| (id, 0)).collect();
        for conn in &self.connections {
            if let Some(degree) = in_degree.get_mut(&conn.dst) {
                *degree += 1;
            }
        }

        // Start with source nodes (no inputs)
        let mut sources: Vec<NodeId> = in_degree
            .iter()
            .filter(|&(_, &degree)| degree == 0)
            .map(|(&id, _)| id)
            .collect();
        sources.sort_unstable_by_key(|id| id.0);
        let mut queue: VecDeque<NodeId> = sources.into();

        // Process in topological order
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = queue.pop_front() {
            order.push(id);
            for conn in &self.connections {
                if conn.src == id {
                    if let Some(degree) = in_degree.get_mut(&conn.dst) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(conn.dst);
                        }
                    }
                }
            }
        }
        debug_assert_eq!(order.len(), self.nodes.len());

        let step_of: HashMap<NodeId, usize> = order
            .iter()
            .enumerate()
            .map(|(index, &id)| (id, index))
            .collect();

        let mut steps = Vec::with_capacity(order.len());
        for &node in &order {
            let info = &self.nodes[&node];
            let mut in_edges: SmallVec<[EdgeRef; 4]> = SmallVec::new();
            for conn in &self.connections {
                if conn.dst == node {
                    in_edges.push(EdgeRef {
                        src_step: step_of[&conn.src],
                        src_channel: conn.src_channel,
                        dst_channel: conn.dst_channel,
                    });
                }
            }
            steps.push(ScheduleStep {
                node,
                slot: info.slot,
                channels: info.counts.inputs.max(info.counts.outputs),
                num_inputs: info.counts.inputs,
                num_outputs: info.counts.outputs,
                in_edges,
            });
        }
        let master_step = order.iter().position(|&id| id == NodeId::MASTER);

        Schedule {
            generation,
            steps,
            master_step,
        }
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains_key(&node)
    }

    pub fn slot_of(&self, node: NodeId) -> Option<usize> {
        self.nodes.get(&node).map(|info| info.slot)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo_graph() -> GraphModel {
        GraphModel::new(8, ChannelCounts::STEREO)
    }

    #[test]
    fn test_master_seeded_at_slot_zero() {
        let graph = stereo_graph();
        assert!(graph.contains(NodeId::MASTER));
        assert_eq!(graph.slot_of(NodeId::MASTER), Some(0));
        assert_eq!(graph.node_count(), 1);
    }

    #[test]
    fn test_slots_ascend_and_recycle() {
        let mut graph = stereo_graph();
        let (a, slot_a) = graph.add_node(ChannelCounts::STEREO).unwrap();
        let (_b, slot_b) = graph.add_node(ChannelCounts::STEREO).unwrap();
        assert_eq!(slot_a, 1);
        assert_eq!(slot_b, 2);

        assert_eq!(graph.remove_node(a).unwrap(), 1);
        let (_c, slot_c) = graph.add_node(ChannelCounts::STEREO).unwrap();
        assert_eq!(slot_c, 1);
    }

    #[test]
    fn test_node_capacity() {
        let mut graph = GraphModel::new(3, ChannelCounts::STEREO);
        graph.add_node(ChannelCounts::STEREO).unwrap();
        graph.add_node(ChannelCounts::STEREO).unwrap();
        assert_eq!(
            graph.add_node(ChannelCounts::STEREO),
            Err(GraphError::NoFreeSlot)
        );
    }

    #[test]
    fn test_connect_validation() {
        let mut graph = stereo_graph();
        let (a, _) = graph.add_node(ChannelCounts::STEREO).unwrap();

        assert_eq!(
            graph.connect(Connection::new(NodeId(99), 0, NodeId::MASTER, 0)),
            Err(GraphError::UnknownNode(NodeId(99)))
        );
        assert_eq!(
            graph.connect(Connection::new(a, 2, NodeId::MASTER, 0)),
            Err(GraphError::ChannelOutOfRange {
                node: a,
                channel: 2,
                count: 2
            })
        );
        assert_eq!(
            graph.connect(Connection::new(a, 0, a, 1)),
            Err(GraphError::WouldCreateCycle { src: a, dst: a })
        );

        let edge = Connection::new(a, 0, NodeId::MASTER, 0);
        graph.connect(edge).unwrap();
        assert_eq!(graph.connect(edge), Err(GraphError::DuplicateConnection));
    }

    #[test]
    fn test_cycle_rejected() {
        let mut graph = stereo_graph();
        let (a, _) = graph.add_node(ChannelCounts::STEREO).unwrap();
        let (b, _) = graph.add_node(ChannelCounts::STEREO).unwrap();
        graph.connect(Connection::new(a, 0, b, 0)).unwrap();
        assert_eq!(
            graph.connect(Connection::new(b, 0, a, 0)),
            Err(GraphError::WouldCreateCycle { src: b, dst: a })
        );
        // The rejected edge left nothing behind
        assert_eq!(graph.connections().len(), 1);
    }

    #[test]
    fn test_remove_master_rejected() {
        let mut graph = stereo_graph();
        assert_eq!(
            graph.remove_node(NodeId::MASTER),
            Err(GraphError::CannotRemoveMaster)
        );
    }

    #[test]
    fn test_remove_drops_touching_edges() {
        let mut graph = stereo_graph();
        let (a, _) = graph.add_node(ChannelCounts::STEREO).unwrap();
        graph.connect(Connection::new(a, 0, NodeId::MASTER, 0)).unwrap();
        graph.connect(Connection::new(a, 1, NodeId::MASTER, 1)).unwrap();
        graph.remove_node(a).unwrap();
        assert!(graph.connections().is_empty());

        let schedule = graph.rebuild();
        assert_eq!(schedule.steps.len(), 1);
        assert!(schedule.steps[0].in_edges.is_empty());
    }

    #[test]
    fn test_rebuild_orders_upstream_first() {
        let mut graph = stereo_graph();
        let (a, _) = graph.add_node(ChannelCounts::STEREO).unwrap();
        let (b, _) = graph.add_node(ChannelCounts::STEREO).unwrap();
        graph.connect(Connection::new(a, 0, NodeId::MASTER, 0)).unwrap();
        graph.connect(Connection::new(a, 1, NodeId::MASTER, 1)).unwrap();
        graph.connect(Connection::new(b, 0, NodeId::MASTER, 0)).unwrap();
        graph.connect(Connection::new(b, 1, NodeId::MASTER, 1)).unwrap();

        let schedule = graph.rebuild();
        assert_eq!(schedule.generation, 1);
        let ids: Vec<NodeId> = schedule.steps.iter().map(|s| s.node).collect();
        assert_eq!(ids, vec![a, b, NodeId::MASTER]);
        assert_eq!(schedule.master_step, Some(2));

        let master = &schedule.steps[2];
        assert_eq!(master.in_edges.len(), 4);
        assert!(master.in_edges.iter().all(|e| e.src_step < 2));

        // Identical topology, identical plan, fresh generation
        let again = graph.rebuild();
        assert_eq!(again.generation, 2);
        let again_ids: Vec<NodeId> = again.steps.iter().map(|s| s.node).collect();
        assert_eq!(again_ids, ids);
    }

    #[test]
    fn test_rebuild_chain() {
        let mut graph = stereo_graph();
        let (a, _) = graph.add_node(ChannelCounts::STEREO).unwrap();
        let (b, _) = graph.add_node(ChannelCounts::STEREO).unwrap();
        graph.connect(Connection::new(a, 0, b, 0)).unwrap();
        graph.connect(Connection::new(b, 0, NodeId::MASTER, 0)).unwrap();

        let schedule = graph.rebuild();
        let ids: Vec<NodeId> = schedule.steps.iter().map(|s| s.node).collect();
        assert_eq!(ids, vec![a, b, NodeId::MASTER]);
    }
}
