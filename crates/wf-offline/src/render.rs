//! Offline render driver
//!
//! Owns a dedicated engine pair and drives it block-by-block across an
//! explicit time range, with no live device callback involved. Jobs block
//! the calling thread (or a worker via the spawn variants) and run strictly
//! sequentially; cancellation lands on the next block boundary.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::Sender;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use wf_core::{EngineError, EngineResult, Sample, TrackId};
use wf_engine::{AudioEngine, AudioProcessor, EngineConfig};

use crate::config::RenderConfig;
use crate::sink::EncoderSink;

// ═══════════════════════════════════════════════════════════════════════════
// RENDER STATE
// ═══════════════════════════════════════════════════════════════════════════

/// Renderer lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RenderState {
    Idle,
    Rendering,
    Done,
    Cancelled,
    Failed,
}

impl Default for RenderState {
    fn default() -> Self {
        Self::Idle
    }
}

/// Progress snapshot, observable from any thread.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderProgress {
    pub state: RenderState,
    /// Governing fraction in `0.0..=1.0`: frames over total for master
    /// jobs, completed stems over total stems for stem jobs.
    pub progress: f64,
    /// Frames rendered within the current pass over the range.
    pub frames_rendered: u64,
    pub total_frames: u64,
    pub completed_stems: usize,
    pub total_stems: usize,
}

/// Emitted over the event channel while a job runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RenderEvent {
    Progress(RenderProgress),
    Finished(RenderProgress),
}

/// Counters shared between the renderer and its handles.
#[derive(Debug, Default)]
struct Shared {
    state: RwLock<RenderState>,
    frames_rendered: AtomicU64,
    total_frames: AtomicU64,
    completed_stems: AtomicUsize,
    total_stems: AtomicUsize,
    cancelled: AtomicBool,
}

impl Shared {
    fn progress(&self) -> RenderProgress {
        let state = *self.state.read();
        let frames_rendered = self.frames_rendered.load(Ordering::Relaxed);
        let total_frames = self.total_frames.load(Ordering::Relaxed);
        let completed_stems = self.completed_stems.load(Ordering::Relaxed);
        let total_stems = self.total_stems.load(Ordering::Relaxed);

        let progress = if total_stems > 0 {
            completed_stems as f64 / total_stems as f64
        } else if total_frames > 0 {
            frames_rendered as f64 / total_frames as f64
        } else if state == RenderState::Done {
            1.0
        } else {
            0.0
        };

        RenderProgress {
            state,
            progress,
            frames_rendered,
            total_frames,
            completed_stems,
            total_stems,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// RENDER HANDLE
// ═══════════════════════════════════════════════════════════════════════════

/// Cloneable observer for a render job, usable from any thread.
#[derive(Debug, Clone)]
pub struct RenderHandle {
    shared: Arc<Shared>,
}

impl RenderHandle {
    /// Request cancellation; takes effect after the in-flight block.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> RenderState {
        *self.shared.state.read()
    }

    pub fn progress(&self) -> RenderProgress {
        self.shared.progress()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// OFFLINE RENDERER
// ═══════════════════════════════════════════════════════════════════════════

/// Sequential offline render driver.
///
/// Owns a dedicated engine pair; the pair must not also be attached to a
/// live device callback. Build the session through [`engine_mut`], then run
/// jobs. Every job disables looping and the metronome before driving the
/// range.
///
/// [`engine_mut`]: OfflineRenderer::engine_mut
pub struct OfflineRenderer {
    engine: AudioEngine,
    processor: AudioProcessor,
    /// Per-channel block buffers, reused across blocks
    block: Vec<Vec<Sample>>,
    /// Interleave scratch handed to the sink
    interleaved: Vec<Sample>,
    shared: Arc<Shared>,
    events: Option<Sender<RenderEvent>>,
}

impl OfflineRenderer {
    /// Take ownership of an engine pair for offline driving.
    pub fn new(engine: AudioEngine, processor: AudioProcessor) -> Self {
        let channels = engine.config().num_channels;
        let block_size = engine.config().block_size;
        Self {
            block: vec![vec![0.0; block_size]; channels],
            interleaved: vec![0.0; block_size * channels],
            engine,
            processor,
            shared: Arc::new(Shared::default()),
            events: None,
        }
    }

    /// Build a fresh engine pair from `config` and wrap it.
    pub fn from_config(config: EngineConfig) -> EngineResult<Self> {
        let (engine, processor) = AudioEngine::new(config)?;
        Ok(Self::new(engine, processor))
    }

    /// Stream progress events to `events` while jobs run. Emission is
    /// lossy under backpressure; the job result is the authoritative
    /// completion signal.
    pub fn with_events(mut self, events: Sender<RenderEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn engine(&self) -> &AudioEngine {
        &self.engine
    }

    /// Control handle for building the session to render.
    pub fn engine_mut(&mut self) -> &mut AudioEngine {
        &mut self.engine
    }

    /// Release the engine pair, e.g. to hand it back to live use.
    pub fn into_inner(self) -> (AudioEngine, AudioProcessor) {
        (self.engine, self.processor)
    }

    pub fn handle(&self) -> RenderHandle {
        RenderHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn state(&self) -> RenderState {
        *self.shared.state.read()
    }

    pub fn progress(&self) -> RenderProgress {
        self.shared.progress()
    }

    /// Request cancellation of the running job.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // JOBS
    // ═══════════════════════════════════════════════════════════════════════

    /// Render the range through the master bus into `sink`.
    ///
    /// Blocks until the range completes, the sink fails, or the job is
    /// cancelled. A completed render finalizes the sink; a cancelled one
    /// leaves it unfinalized with the partial output. Progress is frames
    /// rendered over total frames.
    pub fn render_master<S: EncoderSink>(
        &mut self,
        config: RenderConfig,
        sink: &mut S,
    ) -> EngineResult<()> {
        config.validate()?;
        let total = config.total_frames(self.sample_rate());
        self.begin_job(total, 0);
        log::info!(
            "master render started: {:.3}s..{:.3}s, {} frames",
            config.start_seconds,
            config.end_seconds,
            total
        );

        let result = self.run_range(config, total, sink);
        if result.is_ok() {
            self.park_stopped();
        }
        self.finish_job("master render", &result);
        result
    }

    /// Render one full-range stem per id in `track_ids`, soloing each in
    /// turn so every other track is muted, into the matching sink.
    ///
    /// Stems run strictly in order on the same timeline; solo flags are
    /// restored when the job ends. Cancellation lands after the in-flight
    /// block and reports `completed / total` stems; the interrupted stem's
    /// sink keeps its partial, unfinalized output.
    pub fn render_stems<S: EncoderSink>(
        &mut self,
        config: RenderConfig,
        track_ids: &[TrackId],
        sinks: &mut [S],
    ) -> EngineResult<()> {
        config.validate()?;
        if sinks.len() != track_ids.len() {
            return Err(EngineError::Configuration(format!(
                "{} track ids but {} sinks",
                track_ids.len(),
                sinks.len()
            )));
        }
        for &track in track_ids {
            if self.engine.track(track).is_none() {
                return Err(EngineError::UnknownTrack(track));
            }
        }
        if track_ids.is_empty() {
            self.begin_job(0, 0);
            self.finish_job("stem render", &Ok(()));
            return Ok(());
        }

        let total = config.total_frames(self.sample_rate());
        self.begin_job(total, track_ids.len());
        log::info!(
            "stem render started: {} stems, {} frames each",
            track_ids.len(),
            total
        );

        let saved: Vec<(TrackId, bool)> =
            self.engine.tracks().map(|t| (t.id, t.soloed)).collect();

        let result = self.run_stems(config, total, track_ids, sinks);

        for &(track, soloed) in &saved {
            if let Err(err) = self.engine.set_track_solo(track, soloed) {
                log::warn!("solo restore failed on {}: {}", track, err);
            }
        }
        if result.is_ok() {
            self.park_stopped();
        }
        self.finish_job("stem render", &result);
        result
    }

    // ═══════════════════════════════════════════════════════════════════════
    // DRIVE LOOP
    // ═══════════════════════════════════════════════════════════════════════

    fn run_stems<S: EncoderSink>(
        &mut self,
        config: RenderConfig,
        total_frames: u64,
        track_ids: &[TrackId],
        sinks: &mut [S],
    ) -> EngineResult<()> {
        for (index, (&track, sink)) in track_ids.iter().zip(sinks.iter_mut()).enumerate() {
            if self.shared.cancelled.load(Ordering::SeqCst) {
                return Err(EngineError::RenderCancelled);
            }
            log::debug!("stem {}/{}: {}", index + 1, track_ids.len(), track);
            self.solo_only(track)?;
            self.shared.frames_rendered.store(0, Ordering::Relaxed);
            self.run_range(config, total_frames, sink)?;
            self.shared.completed_stems.store(index + 1, Ordering::Relaxed);
            self.emit_progress();
            self.engine.pump();
        }
        Ok(())
    }

    /// Solo `track` and clear every other solo flag.
    fn solo_only(&mut self, track: TrackId) -> EngineResult<()> {
        let ids: Vec<TrackId> = self.engine.tracks().map(|t| t.id).collect();
        for id in ids {
            self.engine.set_track_solo(id, id == track)?;
        }
        Ok(())
    }

    /// Drive one full pass over the range, writing every block to `sink`
    /// and finalizing it after the last one.
    fn run_range<S: EncoderSink>(
        &mut self,
        config: RenderConfig,
        total_frames: u64,
        sink: &mut S,
    ) -> EngineResult<()> {
        self.engine.clear_loop()?;
        self.engine.set_click_enabled(false)?;
        self.engine.set_position(config.start_seconds)?;
        self.engine.play()?;

        let channels = self.block.len();
        let block_size = self.block[0].len();
        let mut rendered = 0u64;

        while rendered < total_frames {
            if self.shared.cancelled.load(Ordering::SeqCst) {
                return Err(EngineError::RenderCancelled);
            }
            let frames = ((total_frames - rendered) as usize).min(block_size);
            {
                let mut refs: Vec<&mut [Sample]> = self
                    .block
                    .iter_mut()
                    .map(|channel| &mut channel[..frames])
                    .collect();
                self.processor.process_block(&mut refs, frames);
            }

            let interleaved = &mut self.interleaved[..frames * channels];
            for frame in 0..frames {
                for (ch, channel) in self.block.iter().enumerate() {
                    interleaved[frame * channels + ch] = channel[frame];
                }
            }
            sink.write(interleaved, frames)?;

            rendered += frames as u64;
            self.shared.frames_rendered.store(rendered, Ordering::Relaxed);
            self.emit_progress();
        }

        sink.finalize()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // BOOKKEEPING
    // ═══════════════════════════════════════════════════════════════════════

    fn begin_job(&mut self, total_frames: u64, total_stems: usize) {
        self.shared.cancelled.store(false, Ordering::SeqCst);
        self.shared.frames_rendered.store(0, Ordering::Relaxed);
        self.shared.total_frames.store(total_frames, Ordering::Relaxed);
        self.shared.completed_stems.store(0, Ordering::Relaxed);
        self.shared.total_stems.store(total_stems, Ordering::Relaxed);
        *self.shared.state.write() = RenderState::Rendering;
    }

    fn finish_job(&mut self, job: &str, result: &EngineResult<()>) {
        let state = match result {
            Ok(()) => RenderState::Done,
            Err(EngineError::RenderCancelled) => RenderState::Cancelled,
            Err(_) => RenderState::Failed,
        };
        *self.shared.state.write() = state;

        match result {
            Ok(()) => log::info!("{} done", job),
            Err(EngineError::RenderCancelled) => {
                let progress = self.shared.progress().progress;
                log::warn!("{} cancelled at {:.1}%", job, progress * 100.0);
            }
            Err(err) => log::error!("{} failed: {}", job, err),
        }

        if let Some(events) = &self.events {
            let _ = events.try_send(RenderEvent::Finished(self.shared.progress()));
        }
    }

    /// Stop the transport and flush the stop (plus any pending flag
    /// restores) through one discarded block, leaving the pair parked at
    /// the end of the range.
    fn park_stopped(&mut self) {
        if let Err(err) = self.engine.stop() {
            log::warn!("could not stop after render: {}", err);
            return;
        }
        let frames = self.block[0].len();
        {
            let mut refs: Vec<&mut [Sample]> = self
                .block
                .iter_mut()
                .map(|channel| channel.as_mut_slice())
                .collect();
            self.processor.process_block(&mut refs, frames);
        }
        self.engine.pump();
    }

    fn emit_progress(&self) {
        if let Some(events) = &self.events {
            let _ = events.try_send(RenderEvent::Progress(self.shared.progress()));
        }
    }

    fn sample_rate(&self) -> f64 {
        self.engine.config().sample_rate.as_f64()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// WORKER JOBS
// ═══════════════════════════════════════════════════════════════════════════

/// A render running on its own worker thread.
///
/// Dropping the job detaches the worker and the render keeps going; hold
/// the [`RenderHandle`] (or the job itself) to observe or cancel it.
pub struct RenderJob<T> {
    handle: RenderHandle,
    worker: JoinHandle<(OfflineRenderer, T, EngineResult<()>)>,
}

impl<T> RenderJob<T> {
    pub fn handle(&self) -> RenderHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> RenderState {
        self.handle.state()
    }

    pub fn progress(&self) -> RenderProgress {
        self.handle.progress()
    }

    pub fn cancel(&self) {
        self.handle.cancel()
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Wait for the worker and recover the renderer, the sink payload,
    /// and the job result.
    pub fn join(self) -> (OfflineRenderer, T, EngineResult<()>) {
        match self.worker.join() {
            Ok(outcome) => outcome,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

impl OfflineRenderer {
    /// Run a master render on a worker thread.
    pub fn spawn_master<S>(mut self, config: RenderConfig, mut sink: S) -> RenderJob<S>
    where
        S: EncoderSink + Send + 'static,
    {
        let handle = self.handle();
        let worker = std::thread::spawn(move || {
            let result = self.render_master(config, &mut sink);
            (self, sink, result)
        });
        RenderJob { handle, worker }
    }

    /// Run a stem render on a worker thread.
    pub fn spawn_stems<S>(
        mut self,
        config: RenderConfig,
        track_ids: Vec<TrackId>,
        mut sinks: Vec<S>,
    ) -> RenderJob<Vec<S>>
    where
        S: EncoderSink + Send + 'static,
    {
        let handle = self.handle();
        let worker = std::thread::spawn(move || {
            let result = self.render_stems(config, &track_ids, &mut sinks);
            (self, sinks, result)
        });
        RenderJob { handle, worker }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;

    fn renderer() -> OfflineRenderer {
        OfflineRenderer::from_config(EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_starts_idle() {
        let renderer = renderer();
        assert_eq!(renderer.state(), RenderState::Idle);
        assert_eq!(renderer.progress().progress, 0.0);
        assert!(!renderer.is_cancelled());
    }

    #[test]
    fn test_handle_cancels_renderer() {
        let renderer = renderer();
        let handle = renderer.handle();
        assert!(!handle.is_cancelled());

        handle.clone().cancel();
        assert!(renderer.is_cancelled());
        assert!(handle.is_cancelled());
    }

    #[test]
    fn test_empty_stem_job_completes() {
        let mut renderer = renderer();
        let config = RenderConfig::from_start(1.0);
        renderer.render_stems(config, &[], &mut Vec::<MemorySink>::new()).unwrap();
        assert_eq!(renderer.state(), RenderState::Done);
        assert_eq!(renderer.progress().progress, 1.0);
    }

    #[test]
    fn test_mismatched_sinks_rejected() {
        let mut renderer = renderer();
        let track = renderer
            .engine_mut()
            .add_track(wf_core::TrackConfig::named("A"))
            .unwrap();
        let config = RenderConfig::from_start(1.0);

        let err = renderer.render_stems(config, &[track], &mut Vec::<MemorySink>::new());
        assert!(matches!(err, Err(EngineError::Configuration(_))));
        assert_eq!(renderer.state(), RenderState::Idle);
    }

    #[test]
    fn test_unknown_stem_track_rejected() {
        let mut renderer = renderer();
        let config = RenderConfig::from_start(1.0);
        let mut sinks = vec![MemorySink::new()];

        let err = renderer.render_stems(config, &[TrackId::new(99)], &mut sinks);
        assert!(matches!(err, Err(EngineError::UnknownTrack(_))));
        assert_eq!(renderer.state(), RenderState::Idle);
    }

    #[test]
    fn test_invalid_range_rejected() {
        let mut renderer = renderer();
        let mut sink = MemorySink::new();
        let err = renderer.render_master(RenderConfig::new(2.0, 1.0), &mut sink);
        assert!(matches!(err, Err(EngineError::Configuration(_))));
        assert_eq!(renderer.state(), RenderState::Idle);
        assert_eq!(sink.frames(), 0);
    }
}
