//! Render range configuration

use serde::{Deserialize, Serialize};

use wf_core::{EngineError, EngineResult};

/// Time range an offline job renders, in seconds on the transport timeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RenderConfig {
    /// Range start in seconds.
    pub start_seconds: f64,
    /// Range end in seconds, exclusive.
    pub end_seconds: f64,
}

impl RenderConfig {
    /// Range `[start, end)` in seconds.
    pub fn new(start_seconds: f64, end_seconds: f64) -> Self {
        Self {
            start_seconds,
            end_seconds,
        }
    }

    /// Range from the timeline origin to `end_seconds`.
    pub fn from_start(end_seconds: f64) -> Self {
        Self::new(0.0, end_seconds)
    }

    pub fn duration_seconds(&self) -> f64 {
        self.end_seconds - self.start_seconds
    }

    /// Frames the range spans at `sample_rate`, rounded to the nearest frame.
    pub fn total_frames(&self, sample_rate: f64) -> u64 {
        (self.duration_seconds() * sample_rate).round() as u64
    }

    pub fn validate(&self) -> EngineResult<()> {
        if !self.start_seconds.is_finite() || !self.end_seconds.is_finite() {
            return Err(EngineError::Configuration(format!(
                "render range [{}, {}) is not finite",
                self.start_seconds, self.end_seconds
            )));
        }
        if self.start_seconds < 0.0 {
            return Err(EngineError::Configuration(format!(
                "render range starts before zero ({})",
                self.start_seconds
            )));
        }
        if self.end_seconds <= self.start_seconds {
            return Err(EngineError::Configuration(format!(
                "render range [{}, {}) is empty",
                self.start_seconds, self.end_seconds
            )));
        }
        Ok(())
    }
}
