//! Audio-context block processor
//!
//! One `AudioProcessor` lives on the device callback (or the offline render
//! worker) and owns everything the audio context touches: the unit table,
//! scratch pool, transport, metronome, and lane table. Per block it drains
//! the command ring, advances the transport, applies automation, executes
//! the active schedule, and mixes the click, all without locking,
//! allocating, or blocking. Everything it must hand back (displaced units, lane
//! storage) travels through the reclaim ring and is freed control-side.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use wf_core::{clear_channels, NodeId, Sample};

use crate::automation::{Lane, LaneTable};
use crate::click::Metronome;
use crate::commands::{Command, CommandReceiver, ReclaimSender, Retired};
use crate::schedule::{BufferPool, ScheduleConsumer, SlotEntry};
use crate::transport::{Transport, TransportMirror};
use crate::{MAX_LANES, MAX_NODES};

// ═══════════════════════════════════════════════════════════════════════════
// TELEMETRY
// ═══════════════════════════════════════════════════════════════════════════

/// Counters the audio context writes and the control context reads.
#[derive(Default)]
pub struct EngineTelemetry {
    /// Callback deadline overruns
    pub xruns: AtomicU64,
    /// Units silenced after a contained panic
    pub unit_faults: AtomicU64,
    /// Automation points rejected because a lane was at capacity
    pub dropped_points: AtomicU64,
    /// Reclaim pushes that found no free slot (bookkeeping fault)
    pub reclaim_faults: AtomicU64,
    /// Last block's processing time in microseconds
    pub last_block_us: AtomicU64,
    /// Last block's budget utilization, scaled by 10000
    pub cpu_utilization: AtomicU64,
}

impl EngineTelemetry {
    pub fn new() -> Self {
        Self::default()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// PROCESSOR
// ═══════════════════════════════════════════════════════════════════════════

pub struct AudioProcessor {
    slots: Vec<Option<SlotEntry>>,
    pool: BufferPool,
    transport: Transport,
    metronome: Metronome,
    lanes: LaneTable,
    commands: CommandReceiver,
    reclaim: ReclaimSender,
    schedule: ScheduleConsumer,
    mirror: Arc<TransportMirror>,
    telemetry: Arc<EngineTelemetry>,
    sample_rate: f64,
}

impl AudioProcessor {
    pub fn new(
        sample_rate: f64,
        block_size: usize,
        commands: CommandReceiver,
        reclaim: ReclaimSender,
        schedule: ScheduleConsumer,
        mirror: Arc<TransportMirror>,
        telemetry: Arc<EngineTelemetry>,
    ) -> Self {
        let mut slots = Vec::with_capacity(MAX_NODES);
        slots.resize_with(MAX_NODES, || None);
        Self {
            slots,
            pool: BufferPool::new(MAX_NODES, block_size),
            transport: Transport::new(sample_rate),
            metronome: Metronome::new(sample_rate),
            lanes: LaneTable::new(MAX_LANES),
            commands,
            reclaim,
            schedule,
            mirror,
            telemetry,
            sample_rate,
        }
    }

    /// Process one block into `output`.
    ///
    /// AUDIO THREAD SAFETY: no locks, no allocation, no I/O. Every slice
    /// written here was allocated at construction or shipped in whole by
    /// the control context.
    pub fn process_block(&mut self, output: &mut [&mut [Sample]], frames: usize) {
        let start = Instant::now();

        self.drain_commands();

        // Snapshot is taken once, at block start
        let snapshot = self.transport.advance_block(frames as u64);
        self.metronome.set_bpm(snapshot.tempo_bpm);
        self.apply_automation(snapshot.time_seconds());

        let faults = match self.schedule.acquire() {
            Some(schedule) => {
                schedule.execute(&mut self.slots, &mut self.pool, output, frames, &snapshot)
            }
            None => {
                clear_channels(output, frames);
                0
            }
        };
        if faults > 0 {
            self.telemetry
                .unit_faults
                .fetch_add(faults as u64, Ordering::Relaxed);
        }

        if snapshot.is_playing {
            self.metronome.process(output, frames);
        }

        self.publish_telemetry(start, frames);
    }

    fn drain_commands(&mut self) {
        while let Some(command) = self.commands.pop() {
            self.apply_command(command);
        }
    }

    fn apply_command(&mut self, command: Command) {
        match command {
            // Topology
            Command::AddNode { node, slot, unit } => {
                if slot >= self.slots.len() {
                    self.retire(Retired::Unit { slot, unit });
                    return;
                }
                if let Some(old) = self.slots[slot].replace(SlotEntry { node, unit }) {
                    self.retire(Retired::Unit { slot, unit: old.unit });
                }
            }
            Command::RemoveNode { node, slot } => {
                if let Some(cell) = self.slots.get_mut(slot) {
                    if cell.as_ref().is_some_and(|entry| entry.node == node) {
                        if let Some(entry) = cell.take() {
                            self.retire(Retired::Unit { slot, unit: entry.unit });
                        }
                    }
                }
            }
            Command::SetParameter { node, param, value } => {
                // The node may have been removed in the same drain; benign
                if let Some(entry) = find_slot(&mut self.slots, node) {
                    entry.unit.set_parameter(param, value);
                }
            }

            // Transport
            Command::Play => self.transport.play(),
            Command::Stop => self.transport.stop(),
            Command::SetRecording(recording) => self.transport.set_recording(recording),
            Command::SetPosition { seconds } => self.transport.set_position_seconds(seconds),
            Command::SetLoop {
                start_samples,
                end_samples,
            } => {
                // Control validated the range; the transport re-checks anyway
                let _ = self.transport.set_loop_samples(start_samples, end_samples);
            }
            Command::ClearLoop => self.transport.clear_loop(),
            Command::SetTempo { bpm } => self.transport.set_tempo(bpm),

            // Metronome
            Command::SetClickEnabled(enabled) => self.metronome.set_enabled(enabled),
            Command::SetClickLevel(level) => self.metronome.set_level(level),
            Command::SetClickRhythm {
                beats_per_bar,
                subdivision,
            } => self.metronome.set_rhythm(beats_per_bar, subdivision),

            // Automation
            Command::CreateLane {
                index,
                node,
                param,
                storage,
            } => {
                let lane = Lane {
                    node,
                    param,
                    points: storage,
                };
                if let Some(displaced) = self.lanes.install(index, lane) {
                    self.retire(Retired::LaneStorage {
                        points: displaced.points,
                    });
                }
            }
            Command::AddAutomationPoint { index, point } => {
                self.lanes.insert_point(index, point);
            }
            Command::ReplaceLane { index, storage } => {
                let returned = self.lanes.replace_storage(index, storage);
                self.retire(Retired::LaneStorage { points: returned });
            }
            Command::ClearLane { index } => self.lanes.clear_points(index),
        }
    }

    /// Hand an allocation back to the control context.
    ///
    /// Control caps outstanding retirements below the ring capacity, so a
    /// full ring means bookkeeping went wrong; the payload then frees here
    /// rather than leak.
    fn retire(&mut self, retired: Retired) {
        if let Err(payload) = self.reclaim.push(retired) {
            drop(payload);
            self.telemetry.reclaim_faults.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Evaluate every installed lane at the block-start time and write the
    /// result into the owning unit's parameter.
    fn apply_automation(&mut self, time_seconds: f64) {
        let slots = &mut self.slots;
        for lane in self.lanes.active() {
            let Some(value) = lane.value_at(time_seconds) else {
                continue;
            };
            if let Some(entry) = find_slot(slots, lane.node) {
                entry.unit.set_parameter(lane.param, value);
            }
        }
    }

    fn publish_telemetry(&self, start: Instant, frames: usize) {
        let snapshot = self.transport.snapshot();
        self.mirror
            .publish(snapshot.time_in_samples, snapshot.tempo_bpm, snapshot.state());

        let block_time_us = start.elapsed().as_micros() as u64;
        self.telemetry
            .last_block_us
            .store(block_time_us, Ordering::Relaxed);

        let budget_us = (frames as f64 / self.sample_rate * 1_000_000.0) as u64;
        if budget_us > 0 {
            let utilization = ((block_time_us as f64 / budget_us as f64) * 10_000.0) as u64;
            self.telemetry
                .cpu_utilization
                .store(utilization, Ordering::Relaxed);
            if block_time_us > budget_us {
                self.telemetry.xruns.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.telemetry
            .dropped_points
            .store(self.lanes.dropped_points(), Ordering::Relaxed);
    }
}

fn find_slot(slots: &mut [Option<SlotEntry>], node: NodeId) -> Option<&mut SlotEntry> {
    slots.iter_mut().flatten().find(|entry| entry.node == node)
}

// ═══════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════
