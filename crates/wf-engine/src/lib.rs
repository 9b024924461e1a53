//! wf-engine: Real-time Multi-Track Audio Engine Core
//!
//! Provides:
//! - Validated node graph with topologically ordered schedule rebuilds
//! - Lock-free control/audio hand-off (command ring, schedule cell, reclaim ring)
//! - Sample-accurate transport with drift-free looping
//! - Block-granular parameter automation
//! - Metronome click generation
//! - Session save/load

// Too many arguments is common in audio processing functions
#![allow(clippy::too_many_arguments)]

mod automation;
mod click;
mod commands;
mod engine;
mod graph;
mod node;
mod processor;
mod schedule;
mod session;
mod track;
mod transport;

pub use automation::{
    bezier_segments, insert_sorted, value_at, AutomationPoint, AutomationStore, BezierSegment,
    Lane, LaneTable, StoredLane,
};
pub use click::{ClickSettings, Metronome};
pub use commands::{
    command_channel, reclaim_channel, Command, CommandReceiver, CommandSender, ReclaimReceiver,
    ReclaimSender, Retired,
};
pub use engine::{AudioEngine, EngineMetrics};
pub use graph::GraphModel;
pub use node::{MixBusUnit, NodeBuffer, PassthroughUnit, ProcessorUnit};
pub use processor::{AudioProcessor, EngineTelemetry};
pub use schedule::{
    schedule_cell, BufferPool, EdgeRef, Schedule, ScheduleConsumer, SchedulePublisher,
    ScheduleStep, SlotEntry,
};
pub use session::{
    SessionConnection, SessionDocument, SessionLane, SessionTrack, SESSION_VERSION,
};
pub use track::{Track, TrackTable, TrackUnit};
pub use transport::{Transport, TransportMirror, TransportSnapshot, TransportState};

use wf_core::{EngineError, EngineResult, SampleRate, MAX_NODE_CHANNELS};

/// Unit-table slots available to the audio context (master included)
pub const MAX_NODES: usize = 64;

/// Automation lane slots available to the audio context
pub const MAX_LANES: usize = 64;

/// Point capacity a fresh lane ships with
pub const INITIAL_LANE_CAPACITY: usize = 64;

/// Reclaim ring capacity. The control context keeps outstanding
/// retirements strictly below this, so the audio side always finds a slot.
pub const RECLAIM_CAPACITY: usize = MAX_NODES + MAX_LANES;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub sample_rate: SampleRate,
    pub block_size: usize,
    /// Device output channels (master bus width)
    pub num_channels: usize,
    pub command_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: SampleRate::Hz48000,
            block_size: 256,
            num_channels: 2,
            command_capacity: 256,
        }
    }
}

impl EngineConfig {
    /// Create config for minimum latency
    pub fn low_latency() -> Self {
        Self {
            block_size: 64,
            ..Default::default()
        }
    }

    /// Create config for maximum quality
    pub fn high_quality() -> Self {
        Self {
            sample_rate: SampleRate::Hz96000,
            block_size: 512,
            ..Default::default()
        }
    }

    /// Device block latency in milliseconds.
    #[inline]
    pub fn latency_ms(&self) -> f64 {
        self.block_size as f64 / self.sample_rate.as_f64() * 1000.0
    }

    pub fn validate(&self) -> EngineResult<()> {
        if !(16..=8192).contains(&self.block_size) {
            return Err(EngineError::Configuration(format!(
                "block size {} outside 16..=8192",
                self.block_size
            )));
        }
        if self.num_channels == 0 || self.num_channels > MAX_NODE_CHANNELS {
            return Err(EngineError::Configuration(format!(
                "channel count {} outside 1..={}",
                self.num_channels, MAX_NODE_CHANNELS
            )));
        }
        if self.command_capacity < 8 {
            return Err(EngineError::Configuration(format!(
                "command capacity {} below minimum 8",
                self.command_capacity
            )));
        }
        Ok(())
    }
}
