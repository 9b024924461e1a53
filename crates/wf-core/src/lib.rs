//! wf-core: Shared types, traits, and utilities for WaveFrame
//!
//! This crate provides the foundational types used across all WaveFrame crates.

mod sample;
mod time;
mod params;
mod graph;
mod track;
mod error;

pub use sample::*;
pub use time::*;
pub use params::*;
pub use graph::*;
pub use track::*;
pub use error::*;

/// Standard sample rate options
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(u32)]
pub enum SampleRate {
    Hz44100 = 44100,
    Hz48000 = 48000,
    Hz88200 = 88200,
    Hz96000 = 96000,
    Hz176400 = 176400,
    Hz192000 = 192000,
}

impl SampleRate {
    #[inline]
    pub fn as_f64(self) -> f64 {
        self as u32 as f64
    }

    #[inline]
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Closest standard rate for a raw Hz value, if it matches exactly
    pub fn from_hz(hz: u32) -> Option<Self> {
        match hz {
            44100 => Some(Self::Hz44100),
            48000 => Some(Self::Hz48000),
            88200 => Some(Self::Hz88200),
            96000 => Some(Self::Hz96000),
            176400 => Some(Self::Hz176400),
            192000 => Some(Self::Hz192000),
            _ => None,
        }
    }
}

impl Default for SampleRate {
    fn default() -> Self {
        Self::Hz48000
    }
}
