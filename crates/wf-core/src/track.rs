//! Track model shared between the engine facade and session documents

use serde::{Deserialize, Serialize};

/// Track gain range (linear)
pub const MIN_GAIN: f64 = 0.0;
pub const MAX_GAIN: f64 = 2.0;

/// Unique track identifier (u64 for large project support)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TrackId(pub u64);

impl TrackId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "track{}", self.0)
    }
}

/// Initial settings for a new track
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackConfig {
    pub name: String,
    /// Linear gain, clamped to [0.0, 2.0]
    pub gain: f64,
    /// Stereo balance, clamped to [-1.0, 1.0]
    pub pan: f64,
    pub muted: bool,
    pub soloed: bool,
}

impl Default for TrackConfig {
    fn default() -> Self {
        Self {
            name: "Track".to_string(),
            gain: 1.0,
            pan: 0.0,
            muted: false,
            soloed: false,
        }
    }
}

impl TrackConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Copy with gain/pan forced into their legal ranges.
    pub fn sanitized(&self) -> Self {
        Self {
            name: self.name.clone(),
            gain: self.gain.clamp(MIN_GAIN, MAX_GAIN),
            pan: self.pan.clamp(-1.0, 1.0),
            muted: self.muted,
            soloed: self.soloed,
        }
    }
}
