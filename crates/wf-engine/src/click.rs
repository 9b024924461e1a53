//! Metronome click generator
//!
//! Fractional phase-accumulator click:
//! - `samples_per_subdivision = (60 / bpm / subdivision) · sample_rate`
//! - when `phase` reaches the interval, every channel gets a single-sample
//!   impulse of `level` and the interval is subtracted; `phase` then
//!   advances by one regardless
//! - `prepare`/`reset` prime `phase` to the interval so the first processed
//!   sample clicks, and the interval stays exact from there
//!
//! The impulse click is a deliberate simplification; a production build
//! would substitute a short rendered sample. BPM refreshes from the
//! transport snapshot at block start, so a mid-block tempo change never
//! moves a click that was already decided.

use serde::{Deserialize, Serialize};

use wf_core::{Sample, MAX_TEMPO, MIN_TEMPO};

/// Impulse metronome, owned by the audio context.
pub struct Metronome {
    enabled: bool,
    /// Impulse height, linear gain
    level: f64,
    bpm: f64,
    beats_per_bar: u32,
    subdivision: u32,
    sample_rate: f64,
    /// Fractional samples since the last click
    phase: f64,
}

impl Metronome {
    pub fn new(sample_rate: f64) -> Self {
        let mut metronome = Self {
            enabled: false,
            level: 0.1,
            bpm: 120.0,
            beats_per_bar: 4,
            subdivision: 4,
            sample_rate,
            phase: 0.0,
        };
        metronome.reset();
        metronome
    }

    pub fn prepare(&mut self, sample_rate: f64) {
        self.sample_rate = sample_rate;
        self.reset();
    }

    /// Prime the phase so the next processed sample clicks.
    pub fn reset(&mut self) {
        self.phase = self.samples_per_subdivision();
    }

    #[inline]
    fn samples_per_subdivision(&self) -> f64 {
        (60.0 / self.bpm / self.subdivision as f64) * self.sample_rate
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_level(&mut self, level: f64) {
        self.level = level.clamp(0.0, 2.0);
    }

    #[inline]
    pub fn level(&self) -> f64 {
        self.level
    }

    pub fn set_bpm(&mut self, bpm: f64) {
        self.bpm = bpm.clamp(MIN_TEMPO, MAX_TEMPO);
    }

    pub fn set_rhythm(&mut self, beats_per_bar: u32, subdivision: u32) {
        self.beats_per_bar = beats_per_bar.clamp(1, 16);
        self.subdivision = subdivision.clamp(1, 16);
    }

    #[inline]
    pub fn beats_per_bar(&self) -> u32 {
        self.beats_per_bar
    }

    #[inline]
    pub fn subdivision(&self) -> u32 {
        self.subdivision
    }

    /// Mix clicks into the output channels. The caller gates on transport
    /// state; this only checks the enable flag.
    pub fn process(&mut self, channels: &mut [&mut [Sample]], frames: usize) {
        if !self.enabled {
            return;
        }
        let samples_per_subdivision = self.samples_per_subdivision();
        for frame in 0..frames {
            if self.phase >= samples_per_subdivision {
                for ch in channels.iter_mut() {
                    ch[frame] += self.level;
                }
                self.phase -= samples_per_subdivision;
            }
            self.phase += 1.0;
        }
    }
}

/// Click settings mirrored control-side for the session document
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClickSettings {
    pub enabled: bool,
    pub level: f64,
    pub beats_per_bar: u32,
    pub subdivision: u32,
}

impl Default for ClickSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            level: 0.1,
            beats_per_bar: 4,
            subdivision: 4,
        }
    }
}
