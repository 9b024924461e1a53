//! Execution schedule and its lock-free publication
//!
//! A `Schedule` is an immutable, topologically ordered plan over the node
//! graph. The control context builds one on every topology change and
//! publishes it through the `ScheduleCell` with a single atomic pointer
//! swap; the audio context acquires the current plan once per block and
//! records the generation it adopted. A superseded plan is freed only once
//! the adopted generation proves the audio context moved past it.
//!
//! Execution is allocation-free: scratch buffers come from a pre-allocated
//! pool indexed by step position, inputs are summed from upstream step
//! outputs, and every step index strictly precedes its consumers.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use parking_lot::Mutex;
use smallvec::SmallVec;

use wf_core::{clear_channels, NodeId, Sample};

use crate::node::{NodeBuffer, ProcessorUnit};
use crate::transport::TransportSnapshot;

// ═══════════════════════════════════════════════════════════════════════════
// SCHEDULE
// ═══════════════════════════════════════════════════════════════════════════

/// Where one summed input channel comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeRef {
    /// Upstream step index, strictly smaller than the owning step's
    pub src_step: usize,
    pub src_channel: usize,
    pub dst_channel: usize,
}

/// One node's turn in the execution order
#[derive(Debug, Clone)]
pub struct ScheduleStep {
    pub node: NodeId,
    /// Node slot in the processor's unit table
    pub slot: usize,
    /// Scratch channels the step touches: max(inputs, outputs)
    pub channels: usize,
    pub num_inputs: usize,
    pub num_outputs: usize,
    /// Inbound edges, pre-resolved to upstream step indices
    pub in_edges: SmallVec<[EdgeRef; 4]>,
}

/// Immutable topologically ordered execution plan
#[derive(Debug)]
pub struct Schedule {
    /// Monotonic publication counter, assigned at rebuild
    pub generation: u64,
    pub steps: Vec<ScheduleStep>,
    /// Step index of the master output node
    pub master_step: Option<usize>,
}

/// A node slot in the audio context's unit table
pub struct SlotEntry {
    pub node: NodeId,
    pub unit: Box<dyn ProcessorUnit>,
}

// ═══════════════════════════════════════════════════════════════════════════
// BUFFER POOL
// ═══════════════════════════════════════════════════════════════════════════

/// Pre-allocated scratch buffers, one per schedule step position.
pub struct BufferPool {
    buffers: Vec<NodeBuffer>,
}

impl BufferPool {
    pub fn new(capacity: usize, block_size: usize) -> Self {
        let buffers = (0..capacity).map(|_| NodeBuffer::new(block_size)).collect();
        Self { buffers }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buffers.len()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// EXECUTION
// ═══════════════════════════════════════════════════════════════════════════

impl Schedule {
    /// Run every step in order, then copy the master step's buffer to the
    /// device output (silence if the plan has no master step). Returns the
    /// number of contained unit faults.
    ///
    /// A step whose slot is empty or holds a different node is skipped and
    /// its scratch stays silent. A unit that panics is contained at the
    /// node boundary: its buffer degrades to silence for this block and
    /// the callback continues.
    pub fn execute(
        &self,
        slots: &mut [Option<SlotEntry>],
        pool: &mut BufferPool,
        output: &mut [&mut [Sample]],
        frames: usize,
        snapshot: &TransportSnapshot,
    ) -> u32 {
        debug_assert!(self.steps.len() <= pool.buffers.len());
        let mut faults = 0;

        for (i, step) in self.steps.iter().enumerate() {
            let (done, rest) = pool.buffers.split_at_mut(i);
            let buffer = &mut rest[0];

            let entry = match slots.get_mut(step.slot) {
                Some(Some(entry)) if entry.node == step.node => entry,
                _ => {
                    buffer.clear(step.channels, frames);
                    continue;
                }
            };

            buffer.clear(step.channels, frames);
            for edge in &step.in_edges {
                debug_assert!(edge.src_step < i);
                buffer.accumulate_from(edge.dst_channel, &done[edge.src_step], edge.src_channel, frames);
            }

            let outcome = catch_unwind(AssertUnwindSafe(|| {
                entry.unit.process(buffer, frames, snapshot);
            }));
            if outcome.is_err() {
                buffer.clear(step.channels, frames);
                faults += 1;
            }
        }

        match self.master_step {
            Some(master) => {
                let master_outputs = self.steps[master].num_outputs;
                let buffer = &pool.buffers[master];
                for (ch, out) in output.iter_mut().enumerate() {
                    if ch < master_outputs {
                        out[..frames].copy_from_slice(&buffer.channel(ch)[..frames]);
                    } else {
                        out[..frames].fill(0.0);
                    }
                }
            }
            None => clear_channels(output, frames),
        }

        faults
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// PUBLICATION CELL
// ═══════════════════════════════════════════════════════════════════════════

struct Retiree {
    /// Generation whose adoption proves this plan is unreferenced
    successor_gen: u64,
    ptr: *mut Schedule,
}

/// Shared state behind the publisher/consumer handle pair.
struct ScheduleCell {
    active: AtomicPtr<Schedule>,
    /// Generation last adopted by the audio context
    adopted_gen: AtomicU64,
    retired: Mutex<Vec<Retiree>>,
}

// SAFETY: The raw pointers are owned by the cell under the generation
// protocol: control frees a retiree only after the audio context adopted a
// newer plan, and the mutex guards the retiree list itself.
unsafe impl Send for ScheduleCell {}
unsafe impl Sync for ScheduleCell {}

impl Drop for ScheduleCell {
    fn drop(&mut self) {
        let active = self.active.swap(ptr::null_mut(), Ordering::AcqRel);
        if !active.is_null() {
            // SAFETY: both handles are gone, nothing references the plan.
            unsafe { drop(Box::from_raw(active)) };
        }
        for retiree in self.retired.get_mut().drain(..) {
            // SAFETY: same; retirees are owned solely by the cell.
            unsafe { drop(Box::from_raw(retiree.ptr)) };
        }
    }
}

/// Control-side handle: publishes plans and frees superseded ones.
pub struct SchedulePublisher {
    cell: Arc<ScheduleCell>,
}

/// Audio-side handle: acquires the current plan once per block.
pub struct ScheduleConsumer {
    cell: Arc<ScheduleCell>,
}

/// Create a connected publisher/consumer pair.
pub fn schedule_cell() -> (SchedulePublisher, ScheduleConsumer) {
    let cell = Arc::new(ScheduleCell {
        active: AtomicPtr::new(ptr::null_mut()),
        adopted_gen: AtomicU64::new(0),
        retired: Mutex::new(Vec::new()),
    });
    (
        SchedulePublisher { cell: cell.clone() },
        ScheduleConsumer { cell },
    )
}

impl SchedulePublisher {
    /// Swap in a new plan. The superseded plan joins the retiree list and
    /// is freed once the audio context adopts this generation or newer.
    pub fn publish(&self, schedule: Box<Schedule>) {
        let generation = schedule.generation;
        let ptr = Box::into_raw(schedule);
        let prev = self.cell.active.swap(ptr, Ordering::AcqRel);
        if !prev.is_null() {
            self.cell.retired.lock().push(Retiree {
                successor_gen: generation,
                ptr: prev,
            });
        }
        self.collect();
    }

    /// Free retirees the audio context has provably moved past.
    pub fn collect(&self) {
        let adopted = self.cell.adopted_gen.load(Ordering::Acquire);
        let mut retired = self.cell.retired.lock();
        retired.retain(|retiree| {
            if retiree.successor_gen <= adopted {
                // SAFETY: the audio context adopted a plan at least as new
                // as the successor, so it no longer references this one.
                unsafe { drop(Box::from_raw(retiree.ptr)) };
                false
            } else {
                true
            }
        });
    }

    /// Generation last adopted by the audio context.
    #[inline]
    pub fn adopted_generation(&self) -> u64 {
        self.cell.adopted_gen.load(Ordering::Acquire)
    }

    /// Superseded plans still awaiting adoption of their successor.
    pub fn outstanding(&self) -> usize {
        self.cell.retired.lock().len()
    }
}

impl ScheduleConsumer {
    /// Load the current plan and record its generation as adopted.
    ///
    /// The `&mut` receiver pins the borrow: the returned plan cannot
    /// outlive this handle's exclusive borrow, so a newer generation
    /// cannot be adopted (and the plan cannot be freed) while it is held.
    pub fn acquire(&mut self) -> Option<&Schedule> {
        let ptr = self.cell.active.load(Ordering::Acquire);
        if ptr.is_null() {
            return None;
        }
        // SAFETY: the pointer came from Box::into_raw in publish and is
        // freed only after a newer generation is adopted, which this
        // handle alone can do.
        let schedule = unsafe { &*ptr };
        self.cell.adopted_gen.store(schedule.generation, Ordering::Release);
        Some(schedule)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════
