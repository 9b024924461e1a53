//! Engine block-loop benchmarks

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use wf_core::{ChannelCounts, ParamId, Sample, TrackConfig};
use wf_engine::{AudioEngine, AudioProcessor, AutomationPoint, EngineConfig, GraphModel};

const BLOCK_SIZE: usize = 256;

fn run_block(processor: &mut AudioProcessor, left: &mut [f64], right: &mut [f64]) {
    let mut output: Vec<&mut [Sample]> = vec![left, right];
    processor.process_block(&mut output, BLOCK_SIZE);
}

fn bench_block_idle(c: &mut Criterion) {
    let (mut engine, mut processor) = AudioEngine::new(EngineConfig::default()).unwrap();
    engine.play().unwrap();

    let mut left = vec![0.0f64; BLOCK_SIZE];
    let mut right = vec![0.0f64; BLOCK_SIZE];

    c.bench_function("block_idle_256", |b| {
        b.iter(|| {
            run_block(&mut processor, black_box(&mut left), black_box(&mut right));
        })
    });
}

fn bench_block_16_tracks(c: &mut Criterion) {
    let (mut engine, mut processor) = AudioEngine::new(EngineConfig::default()).unwrap();
    for i in 0..16 {
        let id = engine
            .add_track(TrackConfig::named(format!("Track {i}")))
            .unwrap();
        engine
            .add_automation_point(id, ParamId::GAIN, AutomationPoint::new(0.0, 1.0))
            .unwrap();
        engine
            .add_automation_point(id, ParamId::GAIN, AutomationPoint::new(60.0, 0.5))
            .unwrap();
    }
    engine.set_click_enabled(true).unwrap();
    engine.play().unwrap();

    let mut left = vec![0.0f64; BLOCK_SIZE];
    let mut right = vec![0.0f64; BLOCK_SIZE];
    // Settle command drains outside the measured loop
    run_block(&mut processor, &mut left, &mut right);

    c.bench_function("block_16_tracks_256", |b| {
        b.iter(|| {
            run_block(&mut processor, black_box(&mut left), black_box(&mut right));
        })
    });
}

fn bench_schedule_rebuild(c: &mut Criterion) {
    let mut graph = GraphModel::new(64, ChannelCounts::STEREO);
    let mut previous = None;
    for _ in 0..32 {
        let (node, _) = graph.add_node(ChannelCounts::STEREO).unwrap();
        let dst = previous.unwrap_or(wf_core::NodeId::MASTER);
        graph
            .connect(wf_core::Connection::new(node, 0, dst, 0))
            .unwrap();
        graph
            .connect(wf_core::Connection::new(node, 1, dst, 1))
            .unwrap();
        previous = Some(node);
    }

    c.bench_function("schedule_rebuild_32_nodes", |b| {
        b.iter(|| {
            black_box(graph.rebuild());
        })
    });
}

criterion_group!(
    benches,
    bench_block_idle,
    bench_block_16_tracks,
    bench_schedule_rebuild
);
criterion_main!(benches);
