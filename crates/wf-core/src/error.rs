//! Error types for WaveFrame

use thiserror::Error;

use crate::{NodeId, ParamId, TrackId, MAX_NODE_CHANNELS};

/// Core error type
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("unknown track {0}")]
    UnknownTrack(TrackId),

    #[error("no automation lane on {track} for parameter {param:?}")]
    UnknownLane { track: TrackId, param: ParamId },

    /// Rejected loop range; the previously set loop state is retained.
    #[error("invalid loop range [{start}, {end})")]
    InvalidLoop { start: f64, end: f64 },

    /// The command queue had no free slot; the caller must retry.
    #[error("command queue full")]
    QueueFull,

    /// A render job was cancelled; partial output was produced.
    #[error("render cancelled")]
    RenderCancelled,

    #[error("session error: {0}")]
    Session(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Structural graph errors. Every variant leaves the previously published
/// schedule active.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphError {
    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    #[error("channel {channel} out of range for {node} ({count} available)")]
    ChannelOutOfRange {
        node: NodeId,
        channel: usize,
        count: usize,
    },

    #[error("{src} -> {dst} would create a cycle")]
    WouldCreateCycle { src: NodeId, dst: NodeId },

    #[error("connection already exists")]
    DuplicateConnection,

    #[error("no such connection")]
    UnknownConnection,

    #[error("node must declare at least one channel (max {MAX_NODE_CHANNELS} per direction)")]
    InvalidChannelCount,

    #[error("node capacity reached")]
    NoFreeSlot,

    #[error("master node cannot be removed")]
    CannotRemoveMaster,
}

/// Result type alias
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graph_error_display() {
        let err = GraphError::WouldCreateCycle {
            src: NodeId(3),
            dst: NodeId(1),
        };
        assert_eq!(err.to_string(), "node3 -> node1 would create a cycle");
    }

    #[test]
    fn test_graph_error_converts() {
        let err: EngineError = GraphError::NoFreeSlot.into();
        assert!(matches!(err, EngineError::Graph(GraphError::NoFreeSlot)));
    }
}
