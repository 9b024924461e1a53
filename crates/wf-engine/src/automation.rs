//! Automation engine
//!
//! Block-granular parameter automation:
//! - Per-(track, parameter) lanes of time-keyed points
//! - Shape-curved interpolation (linear, fast-start, slow-start)
//! - Fixed-capacity audio-side lane table fed by pre-allocated storage
//! - Control-side store with editing API and a Bezier presentation view
//!
//! Each lane is evaluated once per block at the block-start time and the
//! value lands in the owning unit's parameter before the schedule executes.
//! Automation is therefore block-granular, not sample-accurate.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use wf_core::{NodeId, ParamId, TrackId};

// ═══════════════════════════════════════════════════════════════════════════
// AUTOMATION POINT
// ═══════════════════════════════════════════════════════════════════════════

/// Single automation point
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AutomationPoint {
    /// Timeline position in seconds
    pub time: f64,
    /// Parameter value at this point
    pub value: f64,
    /// Curve shape into the next point: |shape| <= 0.0001 is linear,
    /// negative bends fast-start (sqrt), positive bends slow-start (squared)
    pub shape: f64,
}

impl AutomationPoint {
    pub fn new(time: f64, value: f64) -> Self {
        Self {
            time,
            value,
            shape: 0.0,
        }
    }

    pub fn with_shape(mut self, shape: f64) -> Self {
        self.shape = shape;
        self
    }
}

/// Insert keeping ascending time order; equal times go after existing ones
/// so duplicates keep insertion order.
pub fn insert_sorted(points: &mut Vec<AutomationPoint>, point: AutomationPoint) -> usize {
    let idx = points.partition_point(|p| p.time <= point.time);
    points.insert(idx, point);
    idx
}

/// Interpolate one segment; the left point's shape drives the curve.
fn interpolate(p1: &AutomationPoint, p2: &AutomationPoint, f: f64) -> f64 {
    let shaped = if p1.shape < -0.0001 {
        f.sqrt()
    } else if p1.shape > 0.0001 {
        f * f
    } else {
        f
    };
    p1.value + (p2.value - p1.value) * shaped
}

/// Evaluate a sorted point list at `time_seconds`.
///
/// Clamp-left before the first point, clamp-right past the last, exact
/// stored values at exact point times (first match on duplicate times).
/// `None` when the list is empty: an empty lane holds no opinion and the
/// parameter keeps its last value.
pub fn value_at(points: &[AutomationPoint], time_seconds: f64) -> Option<f64> {
    if points.is_empty() {
        return None;
    }
    let idx = points.partition_point(|p| p.time < time_seconds);
    if idx == 0 {
        return Some(points[0].value);
    }
    if idx == points.len() {
        return Some(points[idx - 1].value);
    }
    let p2 = points[idx];
    if p2.time == time_seconds {
        return Some(p2.value);
    }
    let p1 = points[idx - 1];
    let f = (time_seconds - p1.time) / (p2.time - p1.time).max(1e-9);
    Some(interpolate(&p1, &p2, f))
}

// ═══════════════════════════════════════════════════════════════════════════
// AUDIO-SIDE LANE TABLE
// ═══════════════════════════════════════════════════════════════════════════

/// One audio-side lane targeting a single (node, parameter) pair.
///
/// Point storage is allocated control-side and shipped whole; the audio
/// context only ever inserts into spare capacity.
pub struct Lane {
    pub node: NodeId,
    pub param: ParamId,
    pub points: Vec<AutomationPoint>,
}

impl Lane {
    #[inline]
    pub fn value_at(&self, time_seconds: f64) -> Option<f64> {
        value_at(&self.points, time_seconds)
    }
}

/// Fixed-size lane table owned by the audio context.
pub struct LaneTable {
    lanes: Vec<Option<Lane>>,
    dropped_points: u64,
}

impl LaneTable {
    pub fn new(max_lanes: usize) -> Self {
        let mut lanes = Vec::with_capacity(max_lanes);
        lanes.resize_with(max_lanes, || None);
        Self {
            lanes,
            dropped_points: 0,
        }
    }

    /// Install a lane at `index`. Returns a displaced lane so its storage
    /// can travel back through the reclaim ring (the control side never
    /// reuses an index, so this is normally `None`).
    pub fn install(&mut self, index: usize, lane: Lane) -> Option<Lane> {
        if index >= self.lanes.len() {
            return Some(lane);
        }
        self.lanes[index].replace(lane)
    }

    /// Swap in new point storage.
    ///
    /// Always returns a vector that must go back through the reclaim ring:
    /// the displaced storage, or the incoming one if the lane is missing.
    pub fn replace_storage(
        &mut self,
        index: usize,
        storage: Vec<AutomationPoint>,
    ) -> Vec<AutomationPoint> {
        match self.lanes.get_mut(index) {
            Some(Some(lane)) => std::mem::replace(&mut lane.points, storage),
            _ => storage,
        }
    }

    /// Insert into spare capacity. A full or missing lane drops the point
    /// and counts it; the control side avoids this by growing storage
    /// through `ReplaceLane` first.
    pub fn insert_point(&mut self, index: usize, point: AutomationPoint) {
        if let Some(Some(lane)) = self.lanes.get_mut(index) {
            if lane.points.len() < lane.points.capacity() {
                insert_sorted(&mut lane.points, point);
                return;
            }
        }
        self.dropped_points += 1;
    }

    /// Drop all points; the lane and its storage stay installed.
    pub fn clear_points(&mut self, index: usize) {
        if let Some(Some(lane)) = self.lanes.get_mut(index) {
            lane.points.clear();
        }
    }

    /// Installed lanes, in index order.
    pub fn active(&self) -> impl Iterator<Item = &Lane> {
        self.lanes.iter().flatten()
    }

    #[inline]
    pub fn dropped_points(&self) -> u64 {
        self.dropped_points
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// CONTROL-SIDE STORE
// ═══════════════════════════════════════════════════════════════════════════

/// Control-side mirror of one lane plus its audio-side slot.
pub struct StoredLane {
    /// Slot in the audio-side lane table
    pub index: usize,
    /// Node owning the automated parameter
    pub node: NodeId,
    /// Mirror of the audio-side points, kept identical
    pub points: Vec<AutomationPoint>,
    /// Capacity of the audio-side storage
    pub capacity: usize,
}

impl StoredLane {
    /// Fresh audio-side storage carrying the mirror's points.
    pub fn build_storage(&self) -> Vec<AutomationPoint> {
        let mut storage = Vec::with_capacity(self.capacity);
        storage.extend_from_slice(&self.points);
        storage
    }
}

/// All lanes keyed by (track, parameter). Lanes are created lazily on the
/// first point insertion and persist for the engine's lifetime.
#[derive(Default)]
pub struct AutomationStore {
    lanes: HashMap<(TrackId, ParamId), StoredLane>,
}

impl AutomationStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.lanes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.lanes.is_empty()
    }

    pub fn get(&self, track: TrackId, param: ParamId) -> Option<&StoredLane> {
        self.lanes.get(&(track, param))
    }

    pub fn get_mut(&mut self, track: TrackId, param: ParamId) -> Option<&mut StoredLane> {
        self.lanes.get_mut(&(track, param))
    }

    /// Drop every lane owned by a removed track.
    pub fn remove_track(&mut self, track: TrackId) {
        self.lanes.retain(|(owner, _), _| *owner != track);
    }

    pub fn insert(&mut self, track: TrackId, param: ParamId, lane: StoredLane) {
        self.lanes.insert((track, param), lane);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&(TrackId, ParamId), &StoredLane)> {
        self.lanes.iter()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// BEZIER VIEW
// ═══════════════════════════════════════════════════════════════════════════

/// Cubic segment of the presentation view, `(time, value)` control points
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BezierSegment {
    pub p0: (f64, f64),
    pub p1: (f64, f64),
    pub p2: (f64, f64),
    pub p3: (f64, f64),
}

/// Derived Bezier view of a lane: one cubic per adjacent point pair, inner
/// handles at 33% / 66% of the time span carrying the endpoint values.
/// Presentation output only; the audio path never consumes it.
pub fn bezier_segments(points: &[AutomationPoint]) -> Vec<BezierSegment> {
    if points.len() < 2 {
        return Vec::new();
    }
    points
        .windows(2)
        .map(|pair| {
            let (a, b) = (&pair[0], &pair[1]);
            let span = b.time - a.time;
            BezierSegment {
                p0: (a.time, a.value),
                p1: (a.time + span * 0.33, a.value),
                p2: (a.time + span * 0.66, b.value),
                p3: (b.time, b.value),
            }
        })
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════
