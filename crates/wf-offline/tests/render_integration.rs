//! Offline Render Integration Tests
//!
//! Drives full render jobs against a populated engine:
//! - Master bounces, including short tail blocks and block-granular automation
//! - Stem isolation with solo restore
//! - Cancellation at block and stem granularity
//! - Sink failure handling and worker-thread jobs

use approx::assert_relative_eq;

use wf_core::{ChannelCounts, EngineError, EngineResult, ParamId, Sample, TrackConfig, TrackId};
use wf_engine::{
    value_at, AutomationPoint, EngineConfig, NodeBuffer, ProcessorUnit, TransportSnapshot,
    TransportState,
};
use wf_offline::{
    EncoderSink, MemorySink, OfflineRenderer, RenderConfig, RenderEvent, RenderHandle, RenderState,
};

const SAMPLE_RATE: f64 = 48000.0;
const BLOCK_SIZE: usize = 256;

// ═══════════════════════════════════════════════════════════════════════════════
// HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

/// Stereo test source emitting a constant level.
struct ConstSource {
    value: f64,
}

impl ProcessorUnit for ConstSource {
    fn prepare(&mut self, _sample_rate: f64, _max_block_size: usize) {}

    fn process(&mut self, buffer: &mut NodeBuffer, frames: usize, _transport: &TransportSnapshot) {
        buffer.channel_mut(0)[..frames].fill(self.value);
        buffer.channel_mut(1)[..frames].fill(self.value);
    }

    fn channel_counts(&self) -> ChannelCounts {
        ChannelCounts::new(0, 2)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// Three tracks fed by constant sources at distinct, exactly representable
/// levels, all routed to the master bus.
fn session() -> (OfflineRenderer, Vec<TrackId>) {
    let mut renderer = OfflineRenderer::from_config(EngineConfig::default()).unwrap();
    let engine = renderer.engine_mut();

    let mut ids = Vec::new();
    for (name, level) in [("Drums", 0.25), ("Bass", 0.5), ("Keys", 0.125)] {
        let track = engine.add_track(TrackConfig::named(name)).unwrap();
        let track_node = engine.track(track).unwrap().node;
        let source = engine
            .add_unit(Box::new(ConstSource { value: level }))
            .unwrap();
        engine.connect(source, 0, track_node, 0).unwrap();
        engine.connect(source, 1, track_node, 1).unwrap();
        ids.push(track);
    }
    (renderer, ids)
}

/// Sink that requests cancellation partway through a job.
struct CancellingSink {
    inner: MemorySink,
    handle: RenderHandle,
    cancel_after_writes: Option<usize>,
    cancel_on_finalize: bool,
    writes: usize,
}

impl CancellingSink {
    fn passive(handle: RenderHandle) -> Self {
        Self {
            inner: MemorySink::new(),
            handle,
            cancel_after_writes: None,
            cancel_on_finalize: false,
            writes: 0,
        }
    }

    fn after_writes(handle: RenderHandle, count: usize) -> Self {
        Self {
            cancel_after_writes: Some(count),
            ..Self::passive(handle)
        }
    }

    fn on_finalize(handle: RenderHandle) -> Self {
        Self {
            cancel_on_finalize: true,
            ..Self::passive(handle)
        }
    }
}

impl EncoderSink for CancellingSink {
    fn write(&mut self, samples: &[Sample], frames: usize) -> EngineResult<()> {
        self.inner.write(samples, frames)?;
        self.writes += 1;
        if self.cancel_after_writes == Some(self.writes) {
            self.handle.cancel();
        }
        Ok(())
    }

    fn finalize(&mut self) -> EngineResult<()> {
        self.inner.finalize()?;
        if self.cancel_on_finalize {
            self.handle.cancel();
        }
        Ok(())
    }
}

/// Sink whose destination rejects writes past a point.
struct FailingSink {
    accepted: usize,
    writes: usize,
}

impl EncoderSink for FailingSink {
    fn write(&mut self, _samples: &[Sample], _frames: usize) -> EngineResult<()> {
        if self.writes == self.accepted {
            return Err(EngineError::Io(std::io::Error::other("disk full")));
        }
        self.writes += 1;
        Ok(())
    }

    fn finalize(&mut self) -> EngineResult<()> {
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MASTER RENDERS
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_master_render_matches_session_mix() {
    let (mut renderer, _ids) = session();
    // 24480 frames: 95 full blocks plus a 160 frame tail
    let config = RenderConfig::from_start(0.51);
    let mut sink = MemorySink::new();

    renderer.render_master(config, &mut sink).unwrap();

    assert_eq!(sink.frames(), 24480);
    assert_eq!(sink.samples().len(), 24480 * 2);
    assert!(sink.is_finalized());
    assert!(sink.samples().iter().all(|s| *s == 0.25 + 0.5 + 0.125));

    assert_eq!(renderer.state(), RenderState::Done);
    let progress = renderer.progress();
    assert_eq!(progress.progress, 1.0);
    assert_eq!(progress.frames_rendered, 24480);
    assert_eq!(progress.total_frames, 24480);

    // The pair parks stopped at the end of the range
    assert_eq!(renderer.engine().transport_state(), TransportState::Stopped);
    assert_eq!(renderer.engine().position_seconds(), 24480.0 / SAMPLE_RATE);
}

#[test]
fn test_master_render_applies_automation_per_block() {
    let (mut renderer, ids) = session();
    let points = [
        AutomationPoint::new(0.0, 1.0),
        AutomationPoint::new(0.5, 0.5),
    ];
    {
        let engine = renderer.engine_mut();
        for point in points {
            engine
                .add_automation_point(ids[1], ParamId::GAIN, point)
                .unwrap();
        }
        // Solo the automated track so the master carries only its signal
        engine.set_track_solo(ids[1], true).unwrap();
    }

    let config = RenderConfig::from_start(0.5);
    let mut sink = MemorySink::new();
    renderer.render_master(config, &mut sink).unwrap();
    assert_eq!(sink.frames(), 24000);

    let samples = sink.samples();
    for (i, chunk) in samples.chunks(BLOCK_SIZE * 2).enumerate() {
        let block_start = (i * BLOCK_SIZE) as f64 / SAMPLE_RATE;
        let expected = 0.5 * value_at(&points, block_start).unwrap();
        for &sample in chunk {
            assert_relative_eq!(sample, expected, epsilon = 1e-15);
        }
    }
}

#[test]
fn test_master_cancel_after_inflight_block() {
    let (mut renderer, _ids) = session();
    let config = RenderConfig::from_start(1.0);
    let mut sink = CancellingSink::after_writes(renderer.handle(), 10);

    let result = renderer.render_master(config, &mut sink);
    assert!(matches!(result, Err(EngineError::RenderCancelled)));

    // The block in flight at cancel time still reached the sink; no more
    assert_eq!(sink.inner.frames(), 10 * BLOCK_SIZE as u64);
    assert!(!sink.inner.is_finalized());

    assert_eq!(renderer.state(), RenderState::Cancelled);
    let progress = renderer.progress();
    assert_eq!(progress.frames_rendered, 10 * BLOCK_SIZE as u64);
    assert_eq!(progress.progress, 2560.0 / 48000.0);
}

#[test]
fn test_master_sink_failure_reports_failed() {
    let (mut renderer, _ids) = session();
    let config = RenderConfig::from_start(1.0);
    let mut sink = FailingSink {
        accepted: 3,
        writes: 0,
    };

    let result = renderer.render_master(config, &mut sink);
    assert!(matches!(result, Err(EngineError::Io(_))));
    assert_eq!(renderer.state(), RenderState::Failed);
    assert!(renderer.progress().progress < 1.0);
}

#[test]
fn test_renderer_recovers_after_cancelled_job() {
    let (mut renderer, _ids) = session();
    let config = RenderConfig::from_start(0.1);

    let mut cancelled = CancellingSink::after_writes(renderer.handle(), 1);
    assert!(renderer.render_master(config, &mut cancelled).is_err());
    assert_eq!(renderer.state(), RenderState::Cancelled);

    // A fresh job resets the cancel flag and runs to completion
    let mut sink = MemorySink::new();
    renderer.render_master(config, &mut sink).unwrap();
    assert_eq!(renderer.state(), RenderState::Done);
    assert_eq!(sink.frames(), 4800);
    assert!(sink.is_finalized());
}

// ═══════════════════════════════════════════════════════════════════════════════
// STEM RENDERS
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_stem_renders_isolate_each_track() {
    let (mut renderer, ids) = session();
    // Pre-job solo state must come back after the job
    renderer.engine_mut().set_track_solo(ids[1], true).unwrap();

    let config = RenderConfig::from_start(0.25);
    let mut sinks: Vec<MemorySink> = (0..3).map(|_| MemorySink::new()).collect();

    renderer.render_stems(config, &ids, &mut sinks).unwrap();

    let levels = [0.25, 0.5, 0.125];
    for (sink, level) in sinks.iter().zip(levels) {
        assert_eq!(sink.frames(), 12000);
        assert!(sink.is_finalized());
        assert!(sink.samples().iter().all(|s| *s == level));
    }

    assert_eq!(renderer.state(), RenderState::Done);
    let progress = renderer.progress();
    assert_eq!(progress.progress, 1.0);
    assert_eq!(progress.completed_stems, 3);
    assert_eq!(progress.total_stems, 3);

    let engine = renderer.engine();
    assert!(engine.track(ids[1]).unwrap().soloed);
    assert!(!engine.track(ids[0]).unwrap().soloed);
    assert!(!engine.track(ids[2]).unwrap().soloed);
}

#[test]
fn test_stem_cancel_reports_completed_fraction() {
    let (mut renderer, ids) = session();
    let config = RenderConfig::from_start(0.25);
    let handle = renderer.handle();
    let mut sinks = vec![
        CancellingSink::on_finalize(handle.clone()),
        CancellingSink::passive(handle.clone()),
        CancellingSink::passive(handle),
    ];

    let result = renderer.render_stems(config, &ids, &mut sinks);
    assert!(matches!(result, Err(EngineError::RenderCancelled)));

    // Stem one completed; stems two and three never started
    assert_eq!(sinks[0].inner.frames(), 12000);
    assert!(sinks[0].inner.is_finalized());
    assert_eq!(sinks[1].inner.frames(), 0);
    assert_eq!(sinks[2].inner.frames(), 0);

    assert_eq!(renderer.state(), RenderState::Cancelled);
    let progress = renderer.progress();
    assert_eq!(progress.completed_stems, 1);
    assert_eq!(progress.total_stems, 3);
    assert_eq!(progress.progress, 1.0 / 3.0);
}

// ═══════════════════════════════════════════════════════════════════════════════
// WORKER JOBS
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_worker_job_streams_events() {
    let (renderer, _ids) = session();
    let (tx, rx) = crossbeam_channel::unbounded();
    let renderer = renderer.with_events(tx);

    let job = renderer.spawn_master(RenderConfig::from_start(0.5), MemorySink::new());
    let (renderer, sink, result) = job.join();

    result.unwrap();
    assert_eq!(renderer.state(), RenderState::Done);
    assert_eq!(sink.frames(), 24000);
    assert!(sink.is_finalized());

    let events: Vec<RenderEvent> = rx.try_iter().collect();
    assert!(events
        .iter()
        .any(|event| matches!(event, RenderEvent::Progress(_))));
    match events.last() {
        Some(RenderEvent::Finished(progress)) => {
            assert_eq!(progress.state, RenderState::Done);
            assert_eq!(progress.progress, 1.0);
        }
        other => panic!("expected a finished event, got {:?}", other),
    }
}

#[test]
fn test_worker_stem_job_round_trip() {
    let (renderer, ids) = session();
    let sinks: Vec<MemorySink> = (0..3).map(|_| MemorySink::new()).collect();

    let job = renderer.spawn_stems(RenderConfig::from_start(0.125), ids.clone(), sinks);
    let (renderer, sinks, result) = job.join();

    result.unwrap();
    assert_eq!(renderer.state(), RenderState::Done);
    for (sink, level) in sinks.iter().zip([0.25, 0.5, 0.125]) {
        assert_eq!(sink.frames(), 6000);
        assert!(sink.samples().iter().all(|s| *s == level));
    }
}
