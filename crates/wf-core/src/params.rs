//! Parameter types for audio processors

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Parameter ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParamId(pub u32);

impl ParamId {
    /// Track gain (linear, 0.0..=2.0)
    pub const GAIN: Self = Self(0);
    /// Track pan (-1.0..=1.0)
    pub const PAN: Self = Self(1);
    /// Effective mute flag (>= 0.5 mutes)
    pub const MUTE: Self = Self(2);
}

/// Atomic f64 cell for lock-free parameter mirrors
pub struct AtomicParam {
    bits: AtomicU64,
}

impl AtomicParam {
    pub fn new(value: f64) -> Self {
        Self {
            bits: AtomicU64::new(value.to_bits()),
        }
    }

    #[inline]
    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn set(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }
}

impl Default for AtomicParam {
    fn default() -> Self {
        Self::new(0.0)
    }
}

impl std::fmt::Debug for AtomicParam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("AtomicParam").field(&self.get()).finish()
    }
}
