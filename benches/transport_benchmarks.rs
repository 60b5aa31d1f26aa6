//! Transport core benchmarks
//!
//! Benchmarks ring hand-off, pool acquire/release, producer submission and
//! message analysis.
//!
//! Run with: `cargo bench --bench transport_benchmarks`

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use std::sync::Arc;

use nrflow_core::{
    ArenaGeometry, Enqueue, OwnerState, PipelineConfig, RingConsumer, RingProducer,
    SegmentBacking, SharedArena,
};
use nrflow_runtime::Producer;
use nrflow_traffic::{TrafficGenerator, TrafficMix, classify};

fn arena(block_size: u32, block_count: u32, ring_capacity: u32) -> Arc<SharedArena> {
    Arc::new(
        SharedArena::create(
            ArenaGeometry {
                block_size,
                block_count,
                ring_count: 1,
                ring_capacity,
            },
            SegmentBacking::Anonymous,
        )
        .unwrap(),
    )
}

/// Benchmark a single enqueue/dequeue pair on one ring
fn bench_ring_handoff(c: &mut Criterion) {
    let arena = arena(64, 64, 64);
    let pool = arena.pool();
    let mut producer = RingProducer::claim(arena.clone(), 0).unwrap();
    let mut consumer = RingConsumer::claim(arena.clone(), 0).unwrap();
    let mut block = pool.acquire();

    c.bench_function("ring_handoff", |b| {
        b.iter(|| {
            let handle = block.take().unwrap();
            match producer.try_enqueue(handle).unwrap() {
                Enqueue::Published(seq) => {
                    black_box(seq);
                }
                Enqueue::Full(_) => unreachable!("one block in flight"),
            }
            block = consumer.try_dequeue().unwrap();
        });
    });
}

/// Benchmark pool acquire/release with a tagged transition
fn bench_pool_cycle(c: &mut Criterion) {
    let arena = arena(64, 1024, 16);
    let pool = arena.pool();

    c.bench_function("pool_acquire_release", |b| {
        b.iter(|| {
            let block = pool.acquire().unwrap();
            pool.transition(&block, OwnerState::Filling, OwnerState::Held(0))
                .unwrap();
            pool.release(black_box(block)).unwrap();
        });
    });
}

/// Benchmark producer submission for different message sizes
fn bench_submit(c: &mut Criterion) {
    let mut group = c.benchmark_group("producer_submit");

    for size in [64usize, 512, 1400] {
        let message = vec![0xAB; size];
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::from_parameter(size), &message, |b, message| {
            let arena = arena(2048, 256, 128);
            let mut producer = Producer::new(arena.clone(), &PipelineConfig::default()).unwrap();
            let mut consumer = RingConsumer::claim(arena.clone(), 0).unwrap();

            b.iter(|| {
                let outcome = producer.submit(black_box(message)).unwrap();
                black_box(outcome);
                consumer.drain_into_pool().unwrap();
            });
        });
    }

    group.finish();
}

/// Benchmark classification of generated traffic
fn bench_classify(c: &mut Criterion) {
    let mut generator = TrafficGenerator::new(TrafficMix {
        seed: Some(1),
        malformed_ratio: 0.01,
        ..Default::default()
    })
    .unwrap();
    let messages: Vec<Vec<u8>> = (0..1024).map(|_| generator.next_message().0).collect();
    let bytes: usize = messages.iter().map(Vec::len).sum();

    let mut group = c.benchmark_group("classify");
    group.throughput(Throughput::Bytes(bytes as u64));
    group.bench_function("generated_mix", |b| {
        b.iter(|| {
            for message in &messages {
                let _ = black_box(classify(message));
            }
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_ring_handoff,
    bench_pool_cycle,
    bench_submit,
    bench_classify
);
criterion_main!(benches);
