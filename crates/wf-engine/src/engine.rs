//! Control-context engine facade
//!
//! `AudioEngine` is the application-facing half of the engine pair. It owns
//! the mutable models (graph, track table, automation store), validates
//! every operation, and talks to the `AudioProcessor` half exclusively
//! through the command ring and the schedule cell. Allocation, locking, and
//! logging all happen here; nothing on this side ever blocks the audio
//! context.
//!
//! Memory discipline: every heap payload shipped to the audio context comes
//! back through the reclaim ring and is freed here. The facade keeps the
//! number of outstanding retirements below the reclaim ring's capacity, so
//! the audio side can always push.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use wf_core::{
    ChannelCounts, Connection, EngineError, EngineResult, NodeId, ParamId, SamplePosition, Tempo,
    TrackConfig, TrackId, MAX_GAIN, MIN_GAIN,
};

use crate::automation::{
    bezier_segments, insert_sorted, AutomationPoint, AutomationStore, BezierSegment, StoredLane,
};
use crate::click::ClickSettings;
use crate::commands::{command_channel, reclaim_channel, Command, CommandSender, ReclaimReceiver};
use crate::graph::GraphModel;
use crate::node::{MixBusUnit, ProcessorUnit};
use crate::processor::{AudioProcessor, EngineTelemetry};
use crate::schedule::{schedule_cell, SchedulePublisher};
use crate::track::{Track, TrackTable, TrackUnit};
use crate::transport::{TransportMirror, TransportState};
use crate::{EngineConfig, INITIAL_LANE_CAPACITY, MAX_LANES, MAX_NODES, RECLAIM_CAPACITY};

/// Live counters surfaced to the application
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineMetrics {
    pub latency_ms: f64,
    pub xruns: u64,
    /// Fraction of the block budget the last callback used
    pub cpu_usage: f64,
    /// Panics contained at node boundaries since construction
    pub unit_faults: u64,
}

/// A node removal waiting for the audio context to adopt the schedule
/// that no longer references it.
#[derive(Debug, Clone, Copy)]
struct PendingRemoval {
    node: NodeId,
    slot: usize,
    /// Generation of the first schedule excluding the node
    gate: u64,
}

pub struct AudioEngine {
    config: EngineConfig,
    graph: GraphModel,
    tracks: TrackTable,
    automation: AutomationStore,
    commands: CommandSender,
    reclaim: ReclaimReceiver,
    publisher: SchedulePublisher,
    mirror: Arc<TransportMirror>,
    telemetry: Arc<EngineTelemetry>,
    click: ClickSettings,
    tempo_bpm: f64,
    master_gain: f64,
    loop_range: Option<(f64, f64)>,
    pending_removals: Vec<PendingRemoval>,
    /// Retired payloads still in flight through the reclaim ring
    outstanding: usize,
    /// Lane-table indices vacated by removed tracks
    free_lane_indices: Vec<usize>,
    next_lane_index: usize,
}

impl AudioEngine {
    /// Build the engine pair. The `AudioProcessor` half moves to the device
    /// callback (or an offline render loop); this half stays with the
    /// application.
    pub fn new(config: EngineConfig) -> EngineResult<(AudioEngine, AudioProcessor)> {
        config.validate()?;

        let sample_rate = config.sample_rate.as_f64();
        let (mut command_tx, command_rx) = command_channel(config.command_capacity);
        let (reclaim_tx, reclaim_rx) = reclaim_channel(RECLAIM_CAPACITY);
        let (publisher, consumer) = schedule_cell();
        let mirror = Arc::new(TransportMirror::new(config.sample_rate.as_u32()));
        let telemetry = Arc::new(EngineTelemetry::new());

        let processor = AudioProcessor::new(
            sample_rate,
            config.block_size,
            command_rx,
            reclaim_tx,
            consumer,
            mirror.clone(),
            telemetry.clone(),
        );

        let master_counts = ChannelCounts::new(config.num_channels, config.num_channels);
        let mut graph = GraphModel::new(MAX_NODES, master_counts);

        let mut master = MixBusUnit::new(config.num_channels);
        master.prepare(sample_rate, config.block_size);
        if command_tx
            .push(Command::AddNode {
                node: NodeId::MASTER,
                slot: 0,
                unit: Box::new(master),
            })
            .is_err()
        {
            return Err(EngineError::QueueFull);
        }
        publisher.publish(Box::new(graph.rebuild()));

        log::info!(
            "engine initialized: {} Hz, {} frame blocks, {} output channels",
            config.sample_rate.as_u32(),
            config.block_size,
            config.num_channels
        );

        let engine = AudioEngine {
            config,
            graph,
            tracks: TrackTable::new(),
            automation: AutomationStore::new(),
            commands: command_tx,
            reclaim: reclaim_rx,
            publisher,
            mirror,
            telemetry,
            click: ClickSettings::default(),
            tempo_bpm: Tempo::DEFAULT.0,
            master_gain: 1.0,
            loop_range: None,
            pending_removals: Vec::new(),
            outstanding: 0,
            free_lane_indices: Vec::new(),
            next_lane_index: 0,
        };
        Ok((engine, processor))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // MAINTENANCE
    // ═══════════════════════════════════════════════════════════════════════

    /// Free returned payloads, collect superseded schedules, and fire node
    /// removals whose gate generation has been adopted. Runs at the start
    /// of every facade operation; applications with long idle control
    /// periods may also call it directly.
    pub fn pump(&mut self) {
        while let Some(retired) = self.reclaim.pop() {
            self.outstanding = self.outstanding.saturating_sub(1);
            drop(retired);
        }
        self.publisher.collect();

        let adopted = self.publisher.adopted_generation();
        let mut index = 0;
        while index < self.pending_removals.len() {
            let pending = self.pending_removals[index];
            if pending.gate <= adopted {
                let command = Command::RemoveNode {
                    node: pending.node,
                    slot: pending.slot,
                };
                if self.commands.push(command).is_err() {
                    // Queue full; retry on the next pump
                    break;
                }
                self.pending_removals.remove(index);
            } else {
                index += 1;
            }
        }
    }

    /// Rebuild from the graph model and hand the plan to the audio context.
    fn publish_schedule(&mut self) -> u64 {
        let schedule = self.graph.rebuild();
        let generation = schedule.generation;
        log::debug!(
            "published schedule generation {} ({} steps)",
            generation,
            schedule.steps.len()
        );
        self.publisher.publish(Box::new(schedule));
        generation
    }

    /// Push after a capacity precheck. Only this side produces into the
    /// ring, so a prechecked push cannot fail.
    fn push_checked(&mut self, command: Command) {
        let pushed = self.commands.push(command);
        debug_assert!(pushed.is_ok());
    }

    fn push_or_queue_full(&mut self, command: Command) -> EngineResult<()> {
        match self.commands.push(command) {
            Ok(()) => Ok(()),
            Err(rejected) => {
                log::warn!("command queue full, rejecting {:?}", rejected);
                Err(EngineError::QueueFull)
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // TRACKS & TOPOLOGY
    // ═══════════════════════════════════════════════════════════════════════

    /// Create a stereo track routed to the master bus.
    pub fn add_track(&mut self, config: TrackConfig) -> EngineResult<TrackId> {
        self.add_track_inner(config, true)
    }

    pub(crate) fn add_track_inner(
        &mut self,
        config: TrackConfig,
        auto_route: bool,
    ) -> EngineResult<TrackId> {
        self.pump();

        let config = config.sanitized();
        let (node, slot) = self.graph.add_node(ChannelCounts::STEREO)?;
        let id = self.tracks.allocate_id();
        self.tracks.push(Track {
            id,
            node,
            name: config.name.clone(),
            gain: config.gain,
            pan: config.pan,
            muted: config.muted,
            soloed: config.soloed,
            // The unit ships carrying the plain mute; any solo fan-out
            // follows in the same command batch
            effective_mute: config.muted,
        });

        let changes = self.tracks.effective_mute_changes();
        if self.commands.slots() < 1 + changes.len() {
            self.tracks.remove(id);
            let _ = self.graph.remove_node(node);
            return Err(EngineError::QueueFull);
        }

        let mut unit = TrackUnit::new(&config);
        unit.prepare(self.config.sample_rate.as_f64(), self.config.block_size);
        self.push_checked(Command::AddNode {
            node,
            slot,
            unit: Box::new(unit),
        });
        self.apply_mute_batch(&changes);

        if auto_route {
            let width = self.config.num_channels.min(2);
            for channel in 0..width {
                self.graph
                    .connect(Connection::new(node, channel, NodeId::MASTER, channel))?;
            }
        }
        self.publish_schedule();

        log::debug!("added {} '{}' as {} (slot {})", id, config.name, node, slot);
        Ok(id)
    }

    /// Remove a track, its edges, and its automation lanes. The unit itself
    /// is vacated only after the audio context adopts the excluding
    /// schedule, then returns through the reclaim ring.
    pub fn remove_track(&mut self, track: TrackId) -> EngineResult<()> {
        self.pump();

        let node = self
            .tracks
            .get(track)
            .ok_or(EngineError::UnknownTrack(track))?
            .node;
        let lane_indices: Vec<usize> = self
            .automation
            .iter()
            .filter(|((owner, _), _)| *owner == track)
            .map(|(_, stored)| stored.index)
            .collect();

        if self.outstanding + 1 > RECLAIM_CAPACITY {
            return Err(EngineError::QueueFull);
        }
        // Upper bound: one ClearLane per lane plus the mute fan-out
        if self.commands.slots() < lane_indices.len() + self.tracks.len() {
            return Err(EngineError::QueueFull);
        }

        let slot = self.graph.remove_node(node)?;
        self.tracks.remove(track);
        self.automation.remove_track(track);
        for index in lane_indices {
            self.push_checked(Command::ClearLane { index });
            self.free_lane_indices.push(index);
        }

        let gate = self.publish_schedule();
        self.pending_removals.push(PendingRemoval { node, slot, gate });
        self.outstanding += 1;

        let changes = self.tracks.effective_mute_changes();
        self.apply_mute_batch(&changes);

        log::debug!("removed {} ({}, slot {})", track, node, slot);
        Ok(())
    }

    /// Insert an externally hosted processing unit as a graph node.
    ///
    /// Hosted units carry no mix parameters, no solo scope, and no
    /// automation lanes; wire them explicitly with [`AudioEngine::connect`].
    pub fn add_unit(&mut self, mut unit: Box<dyn ProcessorUnit>) -> EngineResult<NodeId> {
        self.pump();

        let (node, slot) = self.graph.add_node(unit.channel_counts())?;
        if self.commands.slots() < 1 {
            let _ = self.graph.remove_node(node);
            return Err(EngineError::QueueFull);
        }

        unit.prepare(self.config.sample_rate.as_f64(), self.config.block_size);
        self.push_checked(Command::AddNode { node, slot, unit });
        self.publish_schedule();

        log::debug!("hosted unit added as {} (slot {})", node, slot);
        Ok(node)
    }

    /// Remove a hosted unit and all of its edges. Track nodes must go
    /// through [`AudioEngine::remove_track`] so mix state follows.
    pub fn remove_unit(&mut self, node: NodeId) -> EngineResult<()> {
        self.pump();

        if self.tracks.iter().any(|track| track.node == node) {
            return Err(EngineError::Configuration(format!(
                "{} is a track node; remove the track instead",
                node
            )));
        }
        if self.outstanding + 1 > RECLAIM_CAPACITY {
            return Err(EngineError::QueueFull);
        }

        let slot = self.graph.remove_node(node)?;
        let gate = self.publish_schedule();
        self.pending_removals.push(PendingRemoval { node, slot, gate });
        self.outstanding += 1;

        log::debug!("hosted unit {} removed (slot {})", node, slot);
        Ok(())
    }

    /// Add a channel-level edge between two nodes.
    pub fn connect(
        &mut self,
        src: NodeId,
        src_channel: usize,
        dst: NodeId,
        dst_channel: usize,
    ) -> EngineResult<()> {
        self.pump();
        self.graph
            .connect(Connection::new(src, src_channel, dst, dst_channel))?;
        self.publish_schedule();
        log::debug!("connected {}:{} -> {}:{}", src, src_channel, dst, dst_channel);
        Ok(())
    }

    pub fn disconnect(
        &mut self,
        src: NodeId,
        src_channel: usize,
        dst: NodeId,
        dst_channel: usize,
    ) -> EngineResult<()> {
        self.pump();
        self.graph
            .disconnect(&Connection::new(src, src_channel, dst, dst_channel))?;
        self.publish_schedule();
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // MIX PARAMETERS
    // ═══════════════════════════════════════════════════════════════════════

    pub fn set_track_gain(&mut self, track: TrackId, gain: f64) -> EngineResult<()> {
        self.pump();
        let gain = gain.clamp(MIN_GAIN, MAX_GAIN);
        let node = self
            .tracks
            .get(track)
            .ok_or(EngineError::UnknownTrack(track))?
            .node;
        self.push_or_queue_full(Command::SetParameter {
            node,
            param: ParamId::GAIN,
            value: gain,
        })?;
        if let Some(entry) = self.tracks.get_mut(track) {
            entry.gain = gain;
        }
        Ok(())
    }

    pub fn set_track_pan(&mut self, track: TrackId, pan: f64) -> EngineResult<()> {
        self.pump();
        let pan = pan.clamp(-1.0, 1.0);
        let node = self
            .tracks
            .get(track)
            .ok_or(EngineError::UnknownTrack(track))?
            .node;
        self.push_or_queue_full(Command::SetParameter {
            node,
            param: ParamId::PAN,
            value: pan,
        })?;
        if let Some(entry) = self.tracks.get_mut(track) {
            entry.pan = pan;
        }
        Ok(())
    }

    pub fn set_track_mute(&mut self, track: TrackId, muted: bool) -> EngineResult<()> {
        self.pump();
        self.tracks
            .get_mut(track)
            .ok_or(EngineError::UnknownTrack(track))?
            .muted = muted;
        self.sync_effective_mutes()
    }

    pub fn set_track_solo(&mut self, track: TrackId, soloed: bool) -> EngineResult<()> {
        self.pump();
        self.tracks
            .get_mut(track)
            .ok_or(EngineError::UnknownTrack(track))?
            .soloed = soloed;
        self.sync_effective_mutes()
    }

    pub fn set_track_name(&mut self, track: TrackId, name: impl Into<String>) -> EngineResult<()> {
        self.tracks
            .get_mut(track)
            .ok_or(EngineError::UnknownTrack(track))?
            .name = name.into();
        Ok(())
    }

    pub fn set_master_gain(&mut self, gain: f64) -> EngineResult<()> {
        self.pump();
        let gain = gain.clamp(MIN_GAIN, MAX_GAIN);
        self.push_or_queue_full(Command::SetParameter {
            node: NodeId::MASTER,
            param: ParamId::GAIN,
            value: gain,
        })?;
        self.master_gain = gain;
        Ok(())
    }

    pub fn master_gain(&self) -> f64 {
        self.master_gain
    }

    /// Ship every effective-mute change as one all-or-nothing batch.
    ///
    /// On `QueueFull` the user flags stay as set; retrying the same call
    /// recomputes the identical diff.
    fn sync_effective_mutes(&mut self) -> EngineResult<()> {
        let changes = self.tracks.effective_mute_changes();
        if changes.is_empty() {
            return Ok(());
        }
        if self.commands.slots() < changes.len() {
            return Err(EngineError::QueueFull);
        }
        self.apply_mute_batch(&changes);
        Ok(())
    }

    fn apply_mute_batch(&mut self, changes: &[(NodeId, bool)]) {
        for &(node, mute) in changes {
            self.push_checked(Command::SetParameter {
                node,
                param: ParamId::MUTE,
                value: if mute { 1.0 } else { 0.0 },
            });
        }
        self.tracks.commit_effective_mutes(changes);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // TRANSPORT
    // ═══════════════════════════════════════════════════════════════════════

    pub fn play(&mut self) -> EngineResult<()> {
        self.pump();
        self.push_or_queue_full(Command::Play)
    }

    pub fn stop(&mut self) -> EngineResult<()> {
        self.pump();
        self.push_or_queue_full(Command::Stop)
    }

    pub fn set_recording(&mut self, recording: bool) -> EngineResult<()> {
        self.pump();
        self.push_or_queue_full(Command::SetRecording(recording))
    }

    /// Seek. Legal in any transport state; negative values clamp to zero.
    pub fn set_position(&mut self, seconds: f64) -> EngineResult<()> {
        self.pump();
        if !seconds.is_finite() {
            return Err(EngineError::Configuration(
                "position must be finite".to_string(),
            ));
        }
        self.push_or_queue_full(Command::SetPosition {
            seconds: seconds.max(0.0),
        })
    }

    /// Set the loop region `[start, end)` in seconds. A degenerate range is
    /// rejected and the previous loop state is retained.
    pub fn set_loop(&mut self, start_seconds: f64, end_seconds: f64) -> EngineResult<()> {
        self.pump();
        if !start_seconds.is_finite() || !end_seconds.is_finite() || end_seconds <= start_seconds {
            return Err(EngineError::InvalidLoop {
                start: start_seconds,
                end: end_seconds,
            });
        }
        let sample_rate = self.config.sample_rate.as_f64();
        let start = SamplePosition::from_seconds(start_seconds, sample_rate).0;
        let end = SamplePosition::from_seconds(end_seconds, sample_rate).0;
        if end <= start {
            // Sub-sample range collapsed by rounding
            return Err(EngineError::InvalidLoop {
                start: start_seconds,
                end: end_seconds,
            });
        }
        self.push_or_queue_full(Command::SetLoop {
            start_samples: start,
            end_samples: end,
        })?;
        self.loop_range = Some((start_seconds, end_seconds));
        Ok(())
    }

    pub fn clear_loop(&mut self) -> EngineResult<()> {
        self.pump();
        self.push_or_queue_full(Command::ClearLoop)?;
        self.loop_range = None;
        Ok(())
    }

    pub fn set_tempo(&mut self, bpm: f64) -> EngineResult<()> {
        self.pump();
        if !bpm.is_finite() {
            return Err(EngineError::Configuration(
                "tempo must be finite".to_string(),
            ));
        }
        let clamped = Tempo::clamped(bpm).0;
        self.push_or_queue_full(Command::SetTempo { bpm: clamped })?;
        self.tempo_bpm = clamped;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // METRONOME
    // ═══════════════════════════════════════════════════════════════════════

    pub fn set_click_enabled(&mut self, enabled: bool) -> EngineResult<()> {
        self.pump();
        self.push_or_queue_full(Command::SetClickEnabled(enabled))?;
        self.click.enabled = enabled;
        Ok(())
    }

    pub fn set_click_level(&mut self, level: f64) -> EngineResult<()> {
        self.pump();
        let level = level.clamp(0.0, 2.0);
        self.push_or_queue_full(Command::SetClickLevel(level))?;
        self.click.level = level;
        Ok(())
    }

    pub fn set_click_rhythm(&mut self, beats_per_bar: u32, subdivision: u32) -> EngineResult<()> {
        self.pump();
        let beats_per_bar = beats_per_bar.clamp(1, 16);
        let subdivision = subdivision.clamp(1, 16);
        self.push_or_queue_full(Command::SetClickRhythm {
            beats_per_bar,
            subdivision,
        })?;
        self.click.beats_per_bar = beats_per_bar;
        self.click.subdivision = subdivision;
        Ok(())
    }

    pub fn click_settings(&self) -> &ClickSettings {
        &self.click
    }

    // ═══════════════════════════════════════════════════════════════════════
    // AUTOMATION
    // ═══════════════════════════════════════════════════════════════════════

    /// Insert a point, creating the lane on first use. The control mirror
    /// and the audio-side lane stay point-for-point identical.
    pub fn add_automation_point(
        &mut self,
        track: TrackId,
        param: ParamId,
        point: AutomationPoint,
    ) -> EngineResult<()> {
        self.pump();
        if !point.time.is_finite() || !point.value.is_finite() || !point.shape.is_finite() {
            return Err(EngineError::Configuration(
                "automation point must be finite".to_string(),
            ));
        }
        let node = self
            .tracks
            .get(track)
            .ok_or(EngineError::UnknownTrack(track))?
            .node;

        if let Some(stored) = self.automation.get(track, param) {
            let will_grow = stored.points.len() + 1 > stored.capacity;
            if will_grow && self.outstanding + 1 > RECLAIM_CAPACITY {
                return Err(EngineError::QueueFull);
            }
            if self.commands.slots() == 0 {
                return Err(EngineError::QueueFull);
            }
            if let Some(stored) = self.automation.get_mut(track, param) {
                insert_sorted(&mut stored.points, point);
                if will_grow {
                    stored.capacity = (stored.capacity * 2).max(stored.points.len());
                    let index = stored.index;
                    let storage = stored.build_storage();
                    self.push_checked(Command::ReplaceLane { index, storage });
                    self.outstanding += 1;
                } else {
                    let index = stored.index;
                    self.push_checked(Command::AddAutomationPoint { index, point });
                }
            }
            return Ok(());
        }

        // First point for this pair creates the lane
        let (index, reuses_slot) = if let Some(&index) = self.free_lane_indices.last() {
            (index, true)
        } else if self.next_lane_index < MAX_LANES {
            (self.next_lane_index, false)
        } else {
            return Err(EngineError::Configuration(format!(
                "automation lane capacity {MAX_LANES} reached"
            )));
        };
        // A reused index displaces the old cleared lane, which must come back
        if reuses_slot && self.outstanding + 1 > RECLAIM_CAPACITY {
            return Err(EngineError::QueueFull);
        }

        let stored = StoredLane {
            index,
            node,
            points: vec![point],
            capacity: INITIAL_LANE_CAPACITY,
        };
        let storage = stored.build_storage();
        self.push_or_queue_full(Command::CreateLane {
            index,
            node,
            param,
            storage,
        })?;
        if reuses_slot {
            self.free_lane_indices.pop();
            self.outstanding += 1;
        } else {
            self.next_lane_index += 1;
        }
        self.automation.insert(track, param, stored);
        log::debug!("created automation lane {} for {} {:?}", index, track, param);
        Ok(())
    }

    /// Delete one point by position in the time-sorted lane.
    pub fn remove_automation_point(
        &mut self,
        track: TrackId,
        param: ParamId,
        point_index: usize,
    ) -> EngineResult<()> {
        self.pump();
        self.tracks
            .get(track)
            .ok_or(EngineError::UnknownTrack(track))?;
        if self.outstanding + 1 > RECLAIM_CAPACITY || self.commands.slots() == 0 {
            return Err(EngineError::QueueFull);
        }
        let Some(stored) = self.automation.get_mut(track, param) else {
            return Err(EngineError::UnknownLane { track, param });
        };
        if point_index >= stored.points.len() {
            return Err(EngineError::Configuration(format!(
                "point index {point_index} out of range"
            )));
        }
        stored.points.remove(point_index);
        let index = stored.index;
        let storage = stored.build_storage();
        self.push_checked(Command::ReplaceLane { index, storage });
        self.outstanding += 1;
        Ok(())
    }

    /// Re-time and re-value one point; its shape is preserved and the lane
    /// stays time-sorted.
    pub fn move_automation_point(
        &mut self,
        track: TrackId,
        param: ParamId,
        point_index: usize,
        time: f64,
        value: f64,
    ) -> EngineResult<()> {
        self.pump();
        if !time.is_finite() || !value.is_finite() {
            return Err(EngineError::Configuration(
                "automation point must be finite".to_string(),
            ));
        }
        self.tracks
            .get(track)
            .ok_or(EngineError::UnknownTrack(track))?;
        if self.outstanding + 1 > RECLAIM_CAPACITY || self.commands.slots() == 0 {
            return Err(EngineError::QueueFull);
        }
        let Some(stored) = self.automation.get_mut(track, param) else {
            return Err(EngineError::UnknownLane { track, param });
        };
        if point_index >= stored.points.len() {
            return Err(EngineError::Configuration(format!(
                "point index {point_index} out of range"
            )));
        }
        let mut point = stored.points.remove(point_index);
        point.time = time;
        point.value = value;
        insert_sorted(&mut stored.points, point);
        let index = stored.index;
        let storage = stored.build_storage();
        self.push_checked(Command::ReplaceLane { index, storage });
        self.outstanding += 1;
        Ok(())
    }

    /// Drop every point; the lane itself persists.
    pub fn clear_automation(&mut self, track: TrackId, param: ParamId) -> EngineResult<()> {
        self.pump();
        self.tracks
            .get(track)
            .ok_or(EngineError::UnknownTrack(track))?;
        if self.commands.slots() == 0 {
            return Err(EngineError::QueueFull);
        }
        let Some(stored) = self.automation.get_mut(track, param) else {
            return Err(EngineError::UnknownLane { track, param });
        };
        stored.points.clear();
        let index = stored.index;
        self.push_checked(Command::ClearLane { index });
        Ok(())
    }

    /// Install a whole lane in one command. Session load path; the lane
    /// for `(track, param)` must not exist yet.
    pub(crate) fn restore_lane(
        &mut self,
        track: TrackId,
        param: ParamId,
        mut points: Vec<AutomationPoint>,
    ) -> EngineResult<()> {
        self.pump();
        if points.is_empty() {
            return Ok(());
        }
        if self.automation.get(track, param).is_some() {
            return Err(EngineError::Configuration(format!(
                "lane for {track} {param:?} already exists"
            )));
        }
        let node = self
            .tracks
            .get(track)
            .ok_or(EngineError::UnknownTrack(track))?
            .node;
        points.sort_by(|a, b| a.time.total_cmp(&b.time));

        let (index, reuses_slot) = if let Some(&index) = self.free_lane_indices.last() {
            (index, true)
        } else if self.next_lane_index < MAX_LANES {
            (self.next_lane_index, false)
        } else {
            return Err(EngineError::Configuration(format!(
                "automation lane capacity {MAX_LANES} reached"
            )));
        };
        if reuses_slot && self.outstanding + 1 > RECLAIM_CAPACITY {
            return Err(EngineError::QueueFull);
        }

        let stored = StoredLane {
            index,
            node,
            capacity: INITIAL_LANE_CAPACITY.max(points.len()),
            points,
        };
        let storage = stored.build_storage();
        self.push_or_queue_full(Command::CreateLane {
            index,
            node,
            param,
            storage,
        })?;
        if reuses_slot {
            self.free_lane_indices.pop();
            self.outstanding += 1;
        } else {
            self.next_lane_index += 1;
        }
        self.automation.insert(track, param, stored);
        Ok(())
    }

    /// Current points of one lane, time-sorted.
    pub fn automation_points(&self, track: TrackId, param: ParamId) -> Option<&[AutomationPoint]> {
        self.automation
            .get(track, param)
            .map(|stored| stored.points.as_slice())
    }

    /// Derived Bezier presentation of one lane. Never consumed by the
    /// audio path.
    pub fn bezier_view(&self, track: TrackId, param: ParamId) -> Option<Vec<BezierSegment>> {
        self.automation
            .get(track, param)
            .map(|stored| bezier_segments(&stored.points))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // QUERIES
    // ═══════════════════════════════════════════════════════════════════════

    pub fn metrics(&self) -> EngineMetrics {
        EngineMetrics {
            latency_ms: self.config.latency_ms(),
            xruns: self.telemetry.xruns.load(Ordering::Relaxed),
            cpu_usage: self.telemetry.cpu_utilization.load(Ordering::Relaxed) as f64 / 10_000.0,
            unit_faults: self.telemetry.unit_faults.load(Ordering::Relaxed),
        }
    }

    /// Playhead position as last published by the audio context.
    pub fn position_seconds(&self) -> f64 {
        self.mirror.seconds()
    }

    pub fn transport_state(&self) -> TransportState {
        self.mirror.state()
    }

    pub fn is_playing(&self) -> bool {
        self.mirror.is_playing()
    }

    pub fn tempo_bpm(&self) -> f64 {
        self.tempo_bpm
    }

    pub fn loop_range_seconds(&self) -> Option<(f64, f64)> {
        self.loop_range
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn track(&self, track: TrackId) -> Option<&Track> {
        self.tracks.get(track)
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.iter()
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn connections(&self) -> &[Connection] {
        self.graph.connections()
    }

    pub fn automation(&self) -> &AutomationStore {
        &self.automation
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use wf_core::Sample;

    fn pair() -> (AudioEngine, AudioProcessor) {
        AudioEngine::new(EngineConfig::default()).unwrap()
    }

    fn drive(processor: &mut AudioProcessor, frames: usize) -> (Vec<f64>, Vec<f64>) {
        let mut left = vec![0.0; frames];
        let mut right = vec![0.0; frames];
        {
            let mut out: Vec<&mut [Sample]> = vec![&mut left, &mut right];
            processor.process_block(&mut out, frames);
        }
        (left, right)
    }

    #[test]
    fn test_new_engine_is_silent() {
        let (engine, mut processor) = pair();
        let (left, right) = drive(&mut processor, 256);
        assert!(left.iter().all(|s| *s == 0.0));
        assert!(right.iter().all(|s| *s == 0.0));
        assert_eq!(engine.track_count(), 0);
        assert_eq!(engine.position_seconds(), 0.0);
    }

    #[test]
    fn test_add_track_routes_to_master() {
        let (mut engine, mut processor) = pair();
        let id = engine.add_track(TrackConfig::named("Drums")).unwrap();
        assert_eq!(engine.track_count(), 1);
        assert_eq!(engine.connections().len(), 2);
        assert_eq!(engine.track(id).unwrap().name, "Drums");
        drive(&mut processor, 256);
    }

    #[test]
    fn test_hosted_unit_add_and_remove() {
        use crate::node::PassthroughUnit;
        use wf_core::GraphError;

        let (mut engine, mut processor) = pair();
        let track = engine.add_track(TrackConfig::named("Mix")).unwrap();
        let track_node = engine.track(track).unwrap().node;

        let node = engine.add_unit(Box::new(PassthroughUnit::new(2))).unwrap();
        engine.connect(node, 0, track_node, 0).unwrap();
        engine.connect(node, 1, track_node, 1).unwrap();
        assert_eq!(engine.connections().len(), 4);
        drive(&mut processor, 256);

        assert!(matches!(
            engine.remove_unit(track_node),
            Err(EngineError::Configuration(_))
        ));
        assert!(matches!(
            engine.remove_unit(NodeId::MASTER),
            Err(EngineError::Graph(GraphError::CannotRemoveMaster))
        ));

        engine.remove_unit(node).unwrap();
        assert_eq!(engine.connections().len(), 2);
        assert_eq!(engine.pending_removals.len(), 1);
        drive(&mut processor, 256);
        engine.pump();
        assert_eq!(engine.pending_removals.len(), 0);
    }

    #[test]
    fn test_add_track_queue_full_rolls_back() {
        let (mut engine, mut processor) =
            AudioEngine::new(EngineConfig {
                command_capacity: 8,
                ..EngineConfig::default()
            })
            .unwrap();
        // Fill the remaining seven slots without draining
        for _ in 0..7 {
            engine.play().unwrap();
        }
        let err = engine.add_track(TrackConfig::default()).unwrap_err();
        assert!(matches!(err, EngineError::QueueFull));
        assert_eq!(engine.track_count(), 0);

        drive(&mut processor, 64);
        engine.add_track(TrackConfig::default()).unwrap();
        assert_eq!(engine.track_count(), 1);
    }

    #[test]
    fn test_solo_fanout_and_release() {
        let (mut engine, _processor) = pair();
        let a = engine.add_track(TrackConfig::named("A")).unwrap();
        let b = engine.add_track(TrackConfig::named("B")).unwrap();

        engine.set_track_solo(a, true).unwrap();
        assert!(!engine.track(a).unwrap().effective_mute);
        assert!(engine.track(b).unwrap().effective_mute);

        engine.set_track_solo(a, false).unwrap();
        assert!(!engine.track(b).unwrap().effective_mute);
    }

    #[test]
    fn test_invalid_loop_rejected() {
        let (mut engine, _processor) = pair();
        let err = engine.set_loop(2.0, 1.0).unwrap_err();
        assert!(matches!(err, EngineError::InvalidLoop { .. }));
        assert_eq!(engine.loop_range_seconds(), None);

        engine.set_loop(1.0, 2.0).unwrap();
        assert_eq!(engine.loop_range_seconds(), Some((1.0, 2.0)));
        let _ = engine.set_loop(5.0, 4.0).unwrap_err();
        assert_eq!(engine.loop_range_seconds(), Some((1.0, 2.0)));
    }

    #[test]
    fn test_tempo_clamped_and_mirrored() {
        let (mut engine, _processor) = pair();
        engine.set_tempo(5000.0).unwrap();
        assert_eq!(engine.tempo_bpm(), 999.0);
        assert!(engine.set_tempo(f64::NAN).is_err());
        assert_eq!(engine.tempo_bpm(), 999.0);
    }

    #[test]
    fn test_remove_track_waits_for_adoption() {
        let (mut engine, mut processor) = pair();
        let a = engine.add_track(TrackConfig::named("A")).unwrap();
        engine.add_track(TrackConfig::named("B")).unwrap();
        drive(&mut processor, 256);

        engine.remove_track(a).unwrap();
        assert_eq!(engine.track_count(), 1);
        assert_eq!(engine.pending_removals.len(), 1);

        // Audio has not adopted the excluding schedule yet
        engine.pump();
        assert_eq!(engine.pending_removals.len(), 1);

        drive(&mut processor, 256);
        engine.pump();
        assert_eq!(engine.pending_removals.len(), 0);

        // The vacated unit comes back once the removal command lands
        drive(&mut processor, 256);
        engine.pump();
        assert_eq!(engine.outstanding, 0);
    }

    #[test]
    fn test_unknown_track_errors() {
        let (mut engine, _processor) = pair();
        let ghost = TrackId::new(99);
        assert!(matches!(
            engine.set_track_gain(ghost, 0.5),
            Err(EngineError::UnknownTrack(_))
        ));
        assert!(matches!(
            engine.remove_track(ghost),
            Err(EngineError::UnknownTrack(_))
        ));
    }

    #[test]
    fn test_automation_lane_growth() {
        let (mut engine, _processor) = pair();
        let id = engine.add_track(TrackConfig::default()).unwrap();

        for i in 0..(INITIAL_LANE_CAPACITY + 1) {
            engine
                .add_automation_point(
                    id,
                    ParamId::GAIN,
                    AutomationPoint::new(i as f64, 0.5),
                )
                .unwrap();
        }
        let stored = engine.automation.get(id, ParamId::GAIN).unwrap();
        assert_eq!(stored.points.len(), INITIAL_LANE_CAPACITY + 1);
        assert_eq!(stored.capacity, INITIAL_LANE_CAPACITY * 2);
        assert_eq!(engine.outstanding, 1);
    }

    #[test]
    fn test_automation_edit_round_trip() {
        let (mut engine, _processor) = pair();
        let id = engine.add_track(TrackConfig::default()).unwrap();
        engine
            .add_automation_point(id, ParamId::PAN, AutomationPoint::new(1.0, -0.5))
            .unwrap();
        engine
            .add_automation_point(id, ParamId::PAN, AutomationPoint::new(2.0, 0.5))
            .unwrap();

        engine
            .move_automation_point(id, ParamId::PAN, 0, 3.0, -1.0)
            .unwrap();
        let points = engine.automation_points(id, ParamId::PAN).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].time, 2.0);
        assert_eq!(points[1].time, 3.0);
        assert_eq!(points[1].value, -1.0);

        engine.remove_automation_point(id, ParamId::PAN, 0).unwrap();
        assert_eq!(engine.automation_points(id, ParamId::PAN).unwrap().len(), 1);

        engine.clear_automation(id, ParamId::PAN).unwrap();
        assert!(engine.automation_points(id, ParamId::PAN).unwrap().is_empty());

        assert!(matches!(
            engine.clear_automation(id, ParamId::GAIN),
            Err(EngineError::UnknownLane { .. })
        ));
    }

    #[test]
    fn test_metrics_report_block_latency() {
        let (engine, _processor) = pair();
        let metrics = engine.metrics();
        assert!((metrics.latency_ms - 5.333).abs() < 0.01);
        assert_eq!(metrics.xruns, 0);
    }
}
