//! Control → audio command channel and the reverse reclaim ring
//!
//! Both directions are fixed-capacity SPSC rings, allocated once at engine
//! construction:
//! - `Command` carries structural and parameter changes into the audio
//!   context. `push` never blocks; a full ring hands the command back so the
//!   caller owns backpressure (retry or surface `QueueFull`, never silent
//!   loss).
//! - `Retired` carries heap payloads (node units, lane storage) out of the
//!   audio context so deallocation always happens control-side.
//!
//! Topology edges are not queue variants: they reach the audio context
//! inside the published schedule. The queue carries only payloads the audio
//! context must own.

use rtrb::{Consumer, Producer, PushError, RingBuffer};

use wf_core::{NodeId, ParamId};

use crate::automation::AutomationPoint;
use crate::node::ProcessorUnit;

/// Commands applied by the audio context at the next block boundary
pub enum Command {
    // Node lifecycle
    /// Install a freshly allocated unit into a node slot
    AddNode {
        node: NodeId,
        slot: usize,
        unit: Box<dyn ProcessorUnit>,
    },
    /// Extract a unit and return it through the reclaim ring. Sent only
    /// after the schedule that excludes the node is confirmed adopted.
    RemoveNode { node: NodeId, slot: usize },

    // Parameters
    /// Set one parameter on one node's unit
    SetParameter {
        node: NodeId,
        param: ParamId,
        value: f64,
    },

    // Transport
    Play,
    Stop,
    /// Engage or release the record overlay
    SetRecording(bool),
    /// Seek in seconds (clamped to >= 0)
    SetPosition { seconds: f64 },
    /// Install a loop region, validated control-side
    SetLoop { start_samples: u64, end_samples: u64 },
    ClearLoop,
    /// Tempo in BPM (clamped again audio-side)
    SetTempo { bpm: f64 },

    // Metronome
    SetClickEnabled(bool),
    SetClickLevel(f64),
    SetClickRhythm { beats_per_bar: u32, subdivision: u32 },

    // Automation lane table (storage always ships pre-allocated)
    /// Install a lane with its point storage (carries the first points)
    CreateLane {
        index: usize,
        node: NodeId,
        param: ParamId,
        storage: Vec<AutomationPoint>,
    },
    /// Insert one point into a lane's spare capacity
    AddAutomationPoint { index: usize, point: AutomationPoint },
    /// Swap in re-allocated storage (growth or bulk edit); the displaced
    /// storage returns through the reclaim ring
    ReplaceLane {
        index: usize,
        storage: Vec<AutomationPoint>,
    },
    /// Drop all points; the lane and its storage stay installed
    ClearLane { index: usize },
}

impl Command {
    /// Variant name for control-side logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::AddNode { .. } => "AddNode",
            Self::RemoveNode { .. } => "RemoveNode",
            Self::SetParameter { .. } => "SetParameter",
            Self::Play => "Play",
            Self::Stop => "Stop",
            Self::SetRecording(_) => "SetRecording",
            Self::SetPosition { .. } => "SetPosition",
            Self::SetLoop { .. } => "SetLoop",
            Self::ClearLoop => "ClearLoop",
            Self::SetTempo { .. } => "SetTempo",
            Self::SetClickEnabled(_) => "SetClickEnabled",
            Self::SetClickLevel(_) => "SetClickLevel",
            Self::SetClickRhythm { .. } => "SetClickRhythm",
            Self::CreateLane { .. } => "CreateLane",
            Self::AddAutomationPoint { .. } => "AddAutomationPoint",
            Self::ReplaceLane { .. } => "ReplaceLane",
            Self::ClearLane { .. } => "ClearLane",
        }
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Heap payloads travelling audio → control for deallocation
pub enum Retired {
    /// A node unit extracted by `RemoveNode`
    Unit {
        slot: usize,
        unit: Box<dyn ProcessorUnit>,
    },
    /// Lane storage displaced by `ReplaceLane`
    LaneStorage { points: Vec<AutomationPoint> },
}

impl std::fmt::Debug for Retired {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unit { slot, .. } => write!(f, "Unit {{ slot: {slot} }}"),
            Self::LaneStorage { points } => {
                write!(f, "LaneStorage {{ len: {} }}", points.len())
            }
        }
    }
}

/// Control-side handle for sending commands (lock-free, non-blocking)
pub struct CommandSender {
    tx: Producer<Command>,
}

impl CommandSender {
    /// Send a command. A full ring hands the command back to the caller.
    pub fn push(&mut self, cmd: Command) -> Result<(), Command> {
        match self.tx.push(cmd) {
            Ok(()) => Ok(()),
            Err(PushError::Full(cmd)) => Err(cmd),
        }
    }

    /// Free slots remaining, for all-or-nothing batch sends
    #[inline]
    pub fn slots(&self) -> usize {
        self.tx.slots()
    }
}

/// Audio-side consumer, drained once per block
pub struct CommandReceiver {
    rx: Consumer<Command>,
}

impl CommandReceiver {
    #[inline]
    pub fn pop(&mut self) -> Option<Command> {
        self.rx.pop().ok()
    }
}

/// Audio-side producer returning retired payloads
pub struct ReclaimSender {
    tx: Producer<Retired>,
}

impl ReclaimSender {
    /// Hand a retired payload back for control-side deallocation.
    ///
    /// The control side caps outstanding retirements at the ring capacity,
    /// so a full ring indicates a bookkeeping fault; the caller counts the
    /// failure and lets the payload drop.
    pub fn push(&mut self, retired: Retired) -> Result<(), Retired> {
        match self.tx.push(retired) {
            Ok(()) => Ok(()),
            Err(PushError::Full(retired)) => Err(retired),
        }
    }
}

/// Control-side consumer, pumped before every facade operation
pub struct ReclaimReceiver {
    rx: Consumer<Retired>,
}

impl ReclaimReceiver {
    #[inline]
    pub fn pop(&mut self) -> Option<Retired> {
        self.rx.pop().ok()
    }
}

/// Create the control → audio command channel
pub fn command_channel(capacity: usize) -> (CommandSender, CommandReceiver) {
    let (tx, rx) = RingBuffer::new(capacity);
    (CommandSender { tx }, CommandReceiver { rx })
}

/// Create the audio → control reclaim ring
pub fn reclaim_channel(capacity: usize) -> (ReclaimSender, ReclaimReceiver) {
    let (tx, rx) = RingBuffer::new(capacity);
    (ReclaimSender { tx }, ReclaimReceiver { rx })
}
