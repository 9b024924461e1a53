//! Transport - playback clock, loop region, tempo
//!
//! The audio context owns the authoritative `Transport` and advances it once
//! per block; everything inside a block sees the block-start snapshot. The
//! control context observes position/state through the atomic
//! `TransportMirror`.
//!
//! The clock advances by exactly the block length regardless of tempo: tempo
//! drives beat phase and the metronome, not the sample position. That
//! fixed-tempo simplification is intentional and kept under product review.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

use wf_core::{AtomicParam, SamplePosition, Tempo, TimeSignature};

/// Transport state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransportState {
    Stopped = 0,
    Playing = 1,
    /// Playing with the record overlay engaged
    Recording = 2,
}

impl From<u8> for TransportState {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Playing,
            2 => Self::Recording,
            _ => Self::Stopped,
        }
    }
}

/// Immutable copy of transport state, taken once per block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransportSnapshot {
    /// Block-start position in samples
    pub time_in_samples: u64,
    pub sample_rate: f64,
    pub tempo_bpm: f64,
    pub time_signature: TimeSignature,
    /// Active loop region in samples, half-open `[start, end)`
    pub loop_range: Option<(u64, u64)>,
    pub is_playing: bool,
    pub is_recording: bool,
}

impl TransportSnapshot {
    #[inline]
    pub fn time_seconds(&self) -> f64 {
        self.time_in_samples as f64 / self.sample_rate
    }

    #[inline]
    pub fn state(&self) -> TransportState {
        if self.is_recording {
            TransportState::Recording
        } else if self.is_playing {
            TransportState::Playing
        } else {
            TransportState::Stopped
        }
    }
}

impl Default for TransportSnapshot {
    fn default() -> Self {
        Self {
            time_in_samples: 0,
            sample_rate: 48000.0,
            tempo_bpm: Tempo::DEFAULT.0,
            time_signature: TimeSignature::default(),
            loop_range: None,
            is_playing: false,
            is_recording: false,
        }
    }
}

/// Authoritative transport clock. Audio context only.
pub struct Transport {
    position: SamplePosition,
    sample_rate: f64,
    tempo: Tempo,
    time_signature: TimeSignature,
    loop_range: Option<(u64, u64)>,
    playing: bool,
    recording: bool,
}

impl Transport {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            position: SamplePosition::ZERO,
            sample_rate,
            tempo: Tempo::DEFAULT,
            time_signature: TimeSignature::default(),
            loop_range: None,
            playing: false,
            recording: false,
        }
    }

    /// Stopped -> Playing without resetting position.
    pub fn play(&mut self) {
        self.playing = true;
    }

    /// Halt advance. Position is preserved; the record overlay clears.
    pub fn stop(&mut self) {
        self.playing = false;
        self.recording = false;
    }

    /// Engage or release the record overlay. Engaging also starts playback.
    pub fn set_recording(&mut self, recording: bool) {
        if recording {
            self.playing = true;
        }
        self.recording = recording;
    }

    /// Seek to a position in seconds, clamped to >= 0. Legal in any state.
    pub fn set_position_seconds(&mut self, seconds: f64) {
        self.position = SamplePosition::from_seconds(seconds, self.sample_rate);
    }

    /// Install a loop region in samples. Returns false (state unchanged)
    /// for an empty or inverted range.
    pub fn set_loop_samples(&mut self, start: u64, end: u64) -> bool {
        if end <= start {
            return false;
        }
        self.loop_range = Some((start, end));
        true
    }

    pub fn clear_loop(&mut self) {
        self.loop_range = None;
    }

    pub fn set_tempo(&mut self, bpm: f64) {
        self.tempo = Tempo::clamped(bpm);
    }

    pub fn set_time_signature(&mut self, time_signature: TimeSignature) {
        self.time_signature = time_signature;
    }

    #[inline]
    pub fn position(&self) -> SamplePosition {
        self.position
    }

    #[inline]
    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn snapshot(&self) -> TransportSnapshot {
        TransportSnapshot {
            time_in_samples: self.position.0,
            sample_rate: self.sample_rate,
            tempo_bpm: self.tempo.0,
            time_signature: self.time_signature,
            loop_range: self.loop_range,
            is_playing: self.playing,
            is_recording: self.recording,
        }
    }

    /// Advance by one block and return the block-start snapshot.
    ///
    /// While playing, the position moves forward by exactly `frames`. An
    /// advance that crosses the loop end wraps to the loop start plus the
    /// overshoot remainder, so repeated cycles accumulate no drift. A
    /// position already at or past the loop end (explicit seek) does not
    /// wrap; only a crossing does.
    pub fn advance_block(&mut self, frames: u64) -> TransportSnapshot {
        let snapshot = self.snapshot();

        if self.playing {
            let current = self.position.0;
            let mut new_pos = current + frames;

            if let Some((loop_start, loop_end)) = self.loop_range {
                if current < loop_end && new_pos >= loop_end {
                    let loop_len = loop_end - loop_start;
                    new_pos = loop_start + ((new_pos - loop_start) % loop_len);
                }
            }

            self.position = SamplePosition(new_pos);
        }

        snapshot
    }
}

/// Atomic transport mirror for control-context reads.
pub struct TransportMirror {
    sample_position: AtomicU64,
    sample_rate: AtomicU64,
    tempo_bpm: AtomicParam,
    state: AtomicU8,
}

impl TransportMirror {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_position: AtomicU64::new(0),
            sample_rate: AtomicU64::new(sample_rate as u64),
            tempo_bpm: AtomicParam::new(Tempo::DEFAULT.0),
            state: AtomicU8::new(TransportState::Stopped as u8),
        }
    }

    /// Audio context: publish end-of-block state.
    pub fn publish(&self, position: u64, tempo_bpm: f64, state: TransportState) {
        self.sample_position.store(position, Ordering::Relaxed);
        self.tempo_bpm.set(tempo_bpm);
        self.state.store(state as u8, Ordering::Relaxed);
    }

    #[inline]
    pub fn samples(&self) -> u64 {
        self.sample_position.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn seconds(&self) -> f64 {
        let samples = self.samples();
        let rate = self.sample_rate.load(Ordering::Relaxed);
        samples as f64 / rate as f64
    }

    #[inline]
    pub fn tempo_bpm(&self) -> f64 {
        self.tempo_bpm.get()
    }

    #[inline]
    pub fn state(&self) -> TransportState {
        TransportState::from(self.state.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn is_playing(&self) -> bool {
        self.state() != TransportState::Stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_RATE: f64 = 48000.0;

    #[test]
    fn test_play_preserves_position() {
        let mut t = Transport::new(SAMPLE_RATE);
        t.set_position_seconds(1.0);
        t.play();
        assert_eq!(t.position().0, 48000);
        t.stop();
        assert_eq!(t.position().0, 48000);
        t.play();
        assert_eq!(t.position().0, 48000);
    }

    #[test]
    fn test_advance_only_while_playing() {
        let mut t = Transport::new(SAMPLE_RATE);
        t.advance_block(256);
        assert_eq!(t.position().0, 0);
        t.play();
        t.advance_block(256);
        assert_eq!(t.position().0, 256);
    }

    #[test]
    fn test_snapshot_is_block_start() {
        let mut t = Transport::new(SAMPLE_RATE);
        t.play();
        t.advance_block(256);
        let snap = t.advance_block(256);
        assert_eq!(snap.time_in_samples, 256);
        assert_eq!(t.position().0, 512);
    }

    #[test]
    fn test_set_position_clamps() {
        let mut t = Transport::new(SAMPLE_RATE);
        t.set_position_seconds(-5.0);
        assert_eq!(t.position().0, 0);
    }

    #[test]
    fn test_loop_rejects_inverted_range() {
        let mut t = Transport::new(SAMPLE_RATE);
        assert!(t.set_loop_samples(48000, 96000));
        assert!(!t.set_loop_samples(96000, 48000));
        assert!(!t.set_loop_samples(48000, 48000));
        // Prior loop retained
        assert_eq!(t.snapshot().loop_range, Some((48000, 96000)));
    }

    #[test]
    fn test_loop_wraps_with_overshoot() {
        let mut t = Transport::new(SAMPLE_RATE);
        t.set_loop_samples(48000, 96000);
        t.set_position_seconds(1.99);
        t.play();
        // 95520 + 1000 = 96520 crosses 96000; overshoot 520
        t.advance_block(1000);
        assert_eq!(t.position().0, 48520);
    }

    #[test]
    fn test_seek_past_loop_end_does_not_wrap() {
        let mut t = Transport::new(SAMPLE_RATE);
        t.set_loop_samples(48000, 96000);
        t.set_position_seconds(10.0);
        t.play();
        t.advance_block(256);
        assert_eq!(t.position().0, 480256);
    }

    #[test]
    fn test_record_overlay() {
        let mut t = Transport::new(SAMPLE_RATE);
        t.set_recording(true);
        let snap = t.snapshot();
        assert!(snap.is_playing);
        assert!(snap.is_recording);
        assert_eq!(snap.state(), TransportState::Recording);
        t.stop();
        assert_eq!(t.snapshot().state(), TransportState::Stopped);
    }

    #[test]
    fn test_tempo_clamped() {
        let mut t = Transport::new(SAMPLE_RATE);
        t.set_tempo(0.5);
        assert_eq!(t.snapshot().tempo_bpm, 20.0);
        t.set_tempo(140.0);
        assert_eq!(t.snapshot().tempo_bpm, 140.0);
    }

    #[test]
    fn test_mirror_round_trip() {
        let mirror = TransportMirror::new(48000);
        mirror.publish(24000, 128.0, TransportState::Playing);
        assert_eq!(mirror.samples(), 24000);
        assert_eq!(mirror.seconds(), 0.5);
        assert_eq!(mirror.tempo_bpm(), 128.0);
        assert_eq!(mirror.state(), TransportState::Playing);
    }
}
