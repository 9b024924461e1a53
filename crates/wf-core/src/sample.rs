//! Sample type and channel-slice helpers

/// Type alias for audio samples (always f64 for maximum precision)
pub type Sample = f64;

/// Zero the first `frames` samples of every channel slice.
#[inline]
pub fn clear_channels(channels: &mut [&mut [Sample]], frames: usize) {
    for ch in channels.iter_mut() {
        let n = frames.min(ch.len());
        ch[..n].fill(0.0);
    }
}

/// Accumulate `src` into `dst` over the first `frames` samples.
#[inline]
pub fn accumulate(dst: &mut [Sample], src: &[Sample], frames: usize) {
    let n = frames.min(dst.len()).min(src.len());
    for i in 0..n {
        dst[i] += src[i];
    }
}
