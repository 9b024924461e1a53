//! Track processing unit and the control-side track table
//!
//! A `TrackUnit` is the built-in stereo leaf node: mute, then pan, then
//! gain, in that fixed order. Solo is not a local effect; the control-side
//! `TrackTable` translates "at least one track is soloed" into per-unit
//! effective mutes before the next block.

use std::any::Any;

use wf_core::{ChannelCounts, NodeId, ParamId, TrackConfig, TrackId, MAX_GAIN, MIN_GAIN};

use crate::node::{NodeBuffer, ProcessorUnit};
use crate::transport::TransportSnapshot;

// ═══════════════════════════════════════════════════════════════════════════
// TRACK UNIT
// ═══════════════════════════════════════════════════════════════════════════

/// Stereo track leaf: gain, pan, effective mute.
///
/// When effectively muted the unit writes exact silence and returns without
/// touching pan or gain. Otherwise pan applies before gain; the order
/// affects the exact numeric output and is fixed.
pub struct TrackUnit {
    gain: f64,
    pan: f64,
    muted: bool,
}

impl TrackUnit {
    pub fn new(config: &TrackConfig) -> Self {
        let clean = config.sanitized();
        Self {
            gain: clean.gain,
            pan: clean.pan,
            muted: clean.muted,
        }
    }

    #[inline]
    pub fn gain(&self) -> f64 {
        self.gain
    }

    #[inline]
    pub fn pan(&self) -> f64 {
        self.pan
    }

    #[inline]
    pub fn is_muted(&self) -> bool {
        self.muted
    }
}

impl ProcessorUnit for TrackUnit {
    fn prepare(&mut self, _sample_rate: f64, _max_block_size: usize) {}

    fn process(&mut self, buffer: &mut NodeBuffer, frames: usize, _transport: &TransportSnapshot) {
        if self.muted {
            buffer.clear(2, frames);
            return;
        }

        // Balance law: positive pan attenuates left, negative attenuates right
        let left_mul = 1.0 - self.pan.max(0.0);
        let right_mul = 1.0 + self.pan.min(0.0);
        let (left, right) = buffer.pair_mut(0, 1);
        // Pan rounds before gain; fusing the multipliers would change the
        // low bits
        for s in &mut left[..frames] {
            *s = (*s * left_mul) * self.gain;
        }
        for s in &mut right[..frames] {
            *s = (*s * right_mul) * self.gain;
        }
    }

    fn channel_counts(&self) -> ChannelCounts {
        ChannelCounts::STEREO
    }

    fn set_parameter(&mut self, param: ParamId, value: f64) {
        match param {
            ParamId::GAIN => self.gain = value.clamp(MIN_GAIN, MAX_GAIN),
            ParamId::PAN => self.pan = value.clamp(-1.0, 1.0),
            ParamId::MUTE => self.muted = value >= 0.5,
            _ => {}
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// TRACK TABLE (control side)
// ═══════════════════════════════════════════════════════════════════════════

/// Control-side track row. The unit itself lives in an audio-side node
/// slot; this row mirrors the user-facing state.
pub struct Track {
    pub id: TrackId,
    pub node: NodeId,
    pub name: String,
    pub gain: f64,
    pub pan: f64,
    pub muted: bool,
    pub soloed: bool,
    /// Last effective mute applied to the unit
    pub effective_mute: bool,
}

/// Central track registry and the cross-track solo policy.
#[derive(Default)]
pub struct TrackTable {
    tracks: Vec<Track>,
    next_id: u64,
}

impl TrackTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate_id(&mut self) -> TrackId {
        let id = TrackId::new(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn push(&mut self, track: Track) {
        self.tracks.push(track);
    }

    pub fn get(&self, id: TrackId) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id == id)
    }

    pub fn get_mut(&mut self, id: TrackId) -> Option<&mut Track> {
        self.tracks.iter_mut().find(|t| t.id == id)
    }

    pub fn remove(&mut self, id: TrackId) -> Option<Track> {
        let idx = self.tracks.iter().position(|t| t.id == id)?;
        Some(self.tracks.remove(idx))
    }

    /// Tracks in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &Track> {
        self.tracks.iter()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    #[inline]
    pub fn any_solo(&self) -> bool {
        self.tracks.iter().any(|t| t.soloed)
    }

    /// Effective mute a track's unit must carry under the current solo set.
    pub fn effective_mute_for(&self, track: &Track) -> bool {
        track.muted || (self.any_solo() && !track.soloed)
    }

    /// Units whose effective mute diverges from the last applied value.
    ///
    /// Nothing is recorded here; the caller sends the batch (all or
    /// nothing against queue capacity) and then commits it.
    pub fn effective_mute_changes(&self) -> Vec<(NodeId, bool)> {
        let any_solo = self.any_solo();
        self.tracks
            .iter()
            .filter_map(|t| {
                let wanted = t.muted || (any_solo && !t.soloed);
                (wanted != t.effective_mute).then_some((t.node, wanted))
            })
            .collect()
    }

    /// Record a sent batch of effective mutes.
    pub fn commit_effective_mutes(&mut self, changes: &[(NodeId, bool)]) {
        for (node, value) in changes {
            if let Some(track) = self.tracks.iter_mut().find(|t| t.node == *node) {
                track.effective_mute = *value;
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn filled_buffer(value: f64, frames: usize) -> NodeBuffer {
        let mut buf = NodeBuffer::new(frames);
        buf.channel_mut(0)[..frames].fill(value);
        buf.channel_mut(1)[..frames].fill(value);
        buf
    }

    #[test]
    fn test_muted_outputs_exact_silence() {
        let mut unit = TrackUnit::new(&TrackConfig {
            gain: 1.7,
            pan: 0.9,
            ..TrackConfig::named("Bass")
        });
        unit.set_parameter(ParamId::MUTE, 1.0);
        let mut buf = filled_buffer(1.0, 32);
        unit.process(&mut buf, 32, &TransportSnapshot::default());
        assert!(buf.channel(0)[..32].iter().all(|s| *s == 0.0));
        assert!(buf.channel(1)[..32].iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_pan_applies_before_gain() {
        let mut unit = TrackUnit::new(&TrackConfig::default());
        unit.set_parameter(ParamId::PAN, 0.5);
        unit.set_parameter(ParamId::GAIN, 2.0);
        let mut buf = filled_buffer(1.0, 8);
        unit.process(&mut buf, 8, &TransportSnapshot::default());
        // Right-leaning pan halves the left channel, then gain doubles both
        assert_eq!(buf.channel(0)[0], 1.0);
        assert_eq!(buf.channel(1)[0], 2.0);
    }

    #[test]
    fn test_hard_left_silences_right() {
        let mut unit = TrackUnit::new(&TrackConfig::default());
        unit.set_parameter(ParamId::PAN, -1.0);
        let mut buf = filled_buffer(0.5, 8);
        unit.process(&mut buf, 8, &TransportSnapshot::default());
        assert_eq!(buf.channel(0)[0], 0.5);
        assert_eq!(buf.channel(1)[0], 0.0);
    }

    #[test]
    fn test_parameter_clamps() {
        let mut unit = TrackUnit::new(&TrackConfig::default());
        unit.set_parameter(ParamId::GAIN, 9.0);
        assert_eq!(unit.gain(), MAX_GAIN);
        unit.set_parameter(ParamId::PAN, -7.0);
        assert_eq!(unit.pan(), -1.0);
        unit.set_parameter(ParamId::MUTE, 0.4);
        assert!(!unit.is_muted());
        unit.set_parameter(ParamId::MUTE, 0.6);
        assert!(unit.is_muted());
    }

    fn table_with(names: &[&str]) -> TrackTable {
        let mut table = TrackTable::new();
        for (i, name) in names.iter().enumerate() {
            let id = table.allocate_id();
            table.push(Track {
                id,
                node: NodeId(i as u32 + 1),
                name: (*name).to_string(),
                gain: 1.0,
                pan: 0.0,
                muted: false,
                soloed: false,
                effective_mute: false,
            });
        }
        table
    }

    #[test]
    fn test_solo_mutes_everything_else() {
        let mut table = table_with(&["Kick", "Snare", "Hats"]);
        table.get_mut(TrackId::new(1)).unwrap().soloed = true;

        let mut changes = table.effective_mute_changes();
        changes.sort_by_key(|(node, _)| node.as_u32());
        assert_eq!(changes, vec![(NodeId(1), true), (NodeId(3), true)]);

        table.commit_effective_mutes(&changes);
        assert!(table.effective_mute_changes().is_empty());

        // Releasing the solo restores the others
        table.get_mut(TrackId::new(1)).unwrap().soloed = false;
        let mut restored = table.effective_mute_changes();
        restored.sort_by_key(|(node, _)| node.as_u32());
        assert_eq!(restored, vec![(NodeId(1), false), (NodeId(3), false)]);
    }

    #[test]
    fn test_plain_mute_survives_solo_release() {
        let mut table = table_with(&["A", "B"]);
        table.get_mut(TrackId::new(0)).unwrap().muted = true;
        let changes = table.effective_mute_changes();
        assert_eq!(changes, vec![(NodeId(1), true)]);
        table.commit_effective_mutes(&changes);

        // Soloing B leaves A muted and B audible: no unit changes state
        table.get_mut(TrackId::new(1)).unwrap().soloed = true;
        assert!(table.effective_mute_changes().is_empty());
    }
}
