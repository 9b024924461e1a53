//! Processing units and their per-node scratch buffers
//!
//! A `ProcessorUnit` is the capability every graph node implements: the
//! built-in track and mix bus units here, opaque externally hosted units
//! elsewhere. Units process in place on a `NodeBuffer` whose channel count
//! is the larger of the declared input/output counts, so a unit reads its
//! inputs and writes its outputs in the same storage.

use std::any::Any;

use wf_core::{ChannelCounts, ParamId, Sample, MAX_NODE_CHANNELS};

use crate::transport::TransportSnapshot;

/// Processing-unit capability implemented by every graph node.
///
/// `process` must be allocation-free and bounded: it runs inside the audio
/// callback. Inputs arrive pre-summed in the buffer's first `inputs`
/// channels; outputs are expected in the first `outputs` channels when the
/// call returns.
pub trait ProcessorUnit: Send + Sync {
    /// Called before processing starts and on device reconfiguration.
    fn prepare(&mut self, sample_rate: f64, max_block_size: usize);

    /// Process one block in place.
    fn process(&mut self, buffer: &mut NodeBuffer, frames: usize, transport: &TransportSnapshot);

    /// Channel counts declared at insertion; fixed for the unit's lifetime.
    fn channel_counts(&self) -> ChannelCounts;

    /// Apply a parameter change. Units ignore parameters they don't own.
    fn set_parameter(&mut self, _param: ParamId, _value: f64) {}

    /// Clear internal state (delay lines, phases).
    fn reset(&mut self) {}

    /// Downcast to concrete type
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Per-node scratch storage, owned by the buffer pool.
///
/// Channel storage is allocated once at the pool's construction and never
/// resized on the audio thread.
pub struct NodeBuffer {
    channels: Vec<Vec<Sample>>,
    block_size: usize,
}

impl NodeBuffer {
    pub fn new(block_size: usize) -> Self {
        let channels = (0..MAX_NODE_CHANNELS)
            .map(|_| vec![0.0; block_size])
            .collect();
        Self {
            channels,
            block_size,
        }
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[inline]
    pub fn channel(&self, index: usize) -> &[Sample] {
        &self.channels[index]
    }

    #[inline]
    pub fn channel_mut(&mut self, index: usize) -> &mut [Sample] {
        &mut self.channels[index]
    }

    /// Two distinct channels borrowed mutably at once (e.g. a stereo pair).
    ///
    /// Panics if `a == b` or either index is out of range.
    #[inline]
    pub fn pair_mut(&mut self, a: usize, b: usize) -> (&mut [Sample], &mut [Sample]) {
        assert!(a != b, "pair_mut requires distinct channels");
        if a < b {
            let (lo, hi) = self.channels.split_at_mut(b);
            (&mut lo[a], &mut hi[0])
        } else {
            let (lo, hi) = self.channels.split_at_mut(a);
            (&mut hi[0], &mut lo[b])
        }
    }

    /// Zero the first `frames` samples of channels `0..count`.
    #[inline]
    pub fn clear(&mut self, count: usize, frames: usize) {
        let count = count.min(self.channels.len());
        for ch in &mut self.channels[..count] {
            ch[..frames].fill(0.0);
        }
    }

    /// Sum `frames` samples of `src`'s channel `src_ch` into our `dst_ch`.
    #[inline]
    pub fn accumulate_from(
        &mut self,
        dst_ch: usize,
        src: &NodeBuffer,
        src_ch: usize,
        frames: usize,
    ) {
        wf_core::accumulate(&mut self.channels[dst_ch], &src.channels[src_ch], frames);
    }
}

/// Pass-through unit: inputs appear unchanged on the outputs.
pub struct PassthroughUnit {
    channels: usize,
}

impl PassthroughUnit {
    pub fn new(channels: usize) -> Self {
        Self { channels }
    }
}

impl ProcessorUnit for PassthroughUnit {
    fn prepare(&mut self, _sample_rate: f64, _max_block_size: usize) {}

    fn process(&mut self, _buffer: &mut NodeBuffer, _frames: usize, _transport: &TransportSnapshot) {
        // In-place model: inputs already occupy the output channels.
    }

    fn channel_counts(&self) -> ChannelCounts {
        ChannelCounts::new(self.channels, self.channels)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Summing bus with a master gain. The engine installs one as the master
/// output node.
pub struct MixBusUnit {
    gain: f64,
    channels: usize,
}

impl MixBusUnit {
    pub fn new(channels: usize) -> Self {
        Self {
            gain: 1.0,
            channels,
        }
    }

    pub fn gain(&self) -> f64 {
        self.gain
    }
}

impl ProcessorUnit for MixBusUnit {
    fn prepare(&mut self, _sample_rate: f64, _max_block_size: usize) {}

    fn process(&mut self, buffer: &mut NodeBuffer, frames: usize, _transport: &TransportSnapshot) {
        if self.gain == 1.0 {
            return;
        }
        for ch in 0..self.channels {
            let samples = buffer.channel_mut(ch);
            for s in &mut samples[..frames] {
                *s *= self.gain;
            }
        }
    }

    fn channel_counts(&self) -> ChannelCounts {
        ChannelCounts::new(self.channels, self.channels)
    }

    fn set_parameter(&mut self, param: ParamId, value: f64) {
        if param == ParamId::GAIN {
            self.gain = value.clamp(0.0, 2.0);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
