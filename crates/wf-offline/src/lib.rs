//! wf-offline: Offline Render Pipeline
//!
//! Drives a [`wf_engine`] instance block-by-block across an explicit time
//! range with no live device callback involved:
//! - Master bounce through the master bus into an encoder sink
//! - Per-track stem export, soloing each track in turn
//! - Cross-thread progress observation and block-granular cancellation
//! - Worker-thread job variants with an event stream
//!
//! Encoding and file I/O stay outside the crate, behind [`EncoderSink`].

mod config;
mod render;
mod sink;

pub use config::RenderConfig;
pub use render::{
    OfflineRenderer, RenderEvent, RenderHandle, RenderJob, RenderProgress, RenderState,
};
pub use sink::{EncoderSink, MemorySink};
