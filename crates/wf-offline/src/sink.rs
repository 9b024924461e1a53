//! Encoder sink interface
//!
//! Encoding and file I/O are supplied by the embedding application; the
//! render loop only ever sees this interface.

use wf_core::{EngineResult, Sample};

/// Destination for rendered audio.
///
/// `write` receives interleaved blocks in production order; `finalize`
/// runs exactly once after the last block of a completed render. A
/// cancelled render leaves the sink unfinalized with whatever partial
/// output it already received.
pub trait EncoderSink {
    /// Write one interleaved block holding `frames * channels` samples.
    fn write(&mut self, samples: &[Sample], frames: usize) -> EngineResult<()>;

    /// Flush and close the destination.
    fn finalize(&mut self) -> EngineResult<()>;
}

impl<S: EncoderSink + ?Sized> EncoderSink for &mut S {
    fn write(&mut self, samples: &[Sample], frames: usize) -> EngineResult<()> {
        (**self).write(samples, frames)
    }

    fn finalize(&mut self) -> EngineResult<()> {
        (**self).finalize()
    }
}

impl<S: EncoderSink + ?Sized> EncoderSink for Box<S> {
    fn write(&mut self, samples: &[Sample], frames: usize) -> EngineResult<()> {
        (**self).write(samples, frames)
    }

    fn finalize(&mut self) -> EngineResult<()> {
        (**self).finalize()
    }
}

/// Sink that keeps the rendered audio in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    samples: Vec<Sample>,
    frames: u64,
    finalized: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interleaved samples received so far.
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn into_samples(self) -> Vec<Sample> {
        self.samples
    }
}

impl EncoderSink for MemorySink {
    fn write(&mut self, samples: &[Sample], frames: usize) -> EngineResult<()> {
        self.samples.extend_from_slice(samples);
        self.frames += frames as u64;
        Ok(())
    }

    fn finalize(&mut self) -> EngineResult<()> {
        self.finalized = true;
        Ok(())
    }
}
