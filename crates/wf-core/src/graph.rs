//! Shared graph primitives
//!
//! Node identity and connection records are serializable so sessions can
//! persist topology. The engine-side graph and schedule live in wf-engine;
//! only the plain data shapes belong here.

use serde::{Deserialize, Serialize};

/// Maximum channels a single node may declare per direction
pub const MAX_NODE_CHANNELS: usize = 8;

/// Unique node identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    /// The master output node (always present, never removable)
    pub const MASTER: Self = Self(0);

    #[inline]
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node{}", self.0)
    }
}

/// Declared I/O channel counts for a node, fixed at insertion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelCounts {
    pub inputs: usize,
    pub outputs: usize,
}

impl ChannelCounts {
    pub const STEREO: Self = Self {
        inputs: 2,
        outputs: 2,
    };

    pub fn new(inputs: usize, outputs: usize) -> Self {
        Self { inputs, outputs }
    }

    /// A node must declare at least one channel overall and stay under the
    /// per-direction cap.
    #[inline]
    pub fn is_valid(&self) -> bool {
        (self.inputs > 0 || self.outputs > 0)
            && self.inputs <= MAX_NODE_CHANNELS
            && self.outputs <= MAX_NODE_CHANNELS
    }
}

/// Directed edge between node channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub src: NodeId,
    pub src_channel: usize,
    pub dst: NodeId,
    pub dst_channel: usize,
}

impl Connection {
    pub fn new(src: NodeId, src_channel: usize, dst: NodeId, dst_channel: usize) -> Self {
        Self {
            src,
            src_channel,
            dst,
            dst_channel,
        }
    }
}
