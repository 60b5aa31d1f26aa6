//! Fuzz target for ring and pool operation sequences
//!
//! Replays arbitrary acquire / enqueue / dequeue / release sequences on a
//! single ring and checks that every block is accounted for at the end.

#![no_main]

use std::sync::Arc;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use nrflow_core::{
    ArenaGeometry, BlockHandle, Enqueue, OwnerState, RingConsumer, RingProducer, SegmentBacking,
    SharedArena,
};

#[derive(Debug, Arbitrary)]
enum Op {
    Acquire,
    Enqueue,
    Dequeue,
    Release,
}

fuzz_target!(|ops: Vec<Op>| {
    let geometry = ArenaGeometry {
        block_size: 64,
        block_count: 16,
        ring_count: 1,
        ring_capacity: 8,
    };
    let arena = Arc::new(SharedArena::create(geometry, SegmentBacking::Anonymous).unwrap());
    let pool = arena.pool();
    let mut producer = RingProducer::claim(arena.clone(), 0).unwrap();
    let mut consumer = RingConsumer::claim(arena.clone(), 0).unwrap();

    let mut filling: Vec<BlockHandle> = Vec::new();
    let mut held: Vec<BlockHandle> = Vec::new();

    for op in ops {
        match op {
            Op::Acquire => {
                if let Some(block) = pool.acquire() {
                    filling.push(block);
                }
            }
            Op::Enqueue => {
                if let Some(block) = filling.pop() {
                    pool.transition(&block, OwnerState::Filling, OwnerState::InFlight)
                        .unwrap();
                    if let Enqueue::Full(block) = producer.try_enqueue(block).unwrap() {
                        pool.release(block).unwrap();
                    }
                }
            }
            Op::Dequeue => {
                if let Some(block) = consumer.try_dequeue().unwrap() {
                    pool.transition(&block, OwnerState::InFlight, OwnerState::Held(0))
                        .unwrap();
                    held.push(block);
                }
            }
            Op::Release => {
                if let Some(block) = held.pop() {
                    pool.release(block).unwrap();
                }
            }
        }
    }

    consumer.drain_into_pool().unwrap();
    for block in filling.into_iter().chain(held) {
        pool.release(block).unwrap();
    }
    assert!(pool.census().is_quiescent());
    assert_eq!(arena.violations(), 0);
});
