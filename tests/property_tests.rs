//! Property-based tests for the nrflow transport core
//!
//! Uses proptest to check ring, pool and analyzer invariants across
//! arbitrary operation sequences and inputs.

use proptest::prelude::*;

// ============================================================================
// Ring Properties
// ============================================================================

mod ring_properties {
    use super::*;
    use nrflow_core::{Enqueue, OwnerState, RingConsumer, RingProducer};
    use nrflow_integration_tests::test_helpers::single_ring_arena;
    use std::collections::VecDeque;

    proptest! {
        /// Any interleaving of enqueues and dequeues preserves FIFO order
        /// and never exceeds the ring capacity.
        #[test]
        fn ring_is_fifo(ops in prop::collection::vec(any::<bool>(), 1..400)) {
            let arena = single_ring_arena(32, 8);
            let pool = arena.pool();
            let mut producer = RingProducer::claim(arena.clone(), 0).unwrap();
            let mut consumer = RingConsumer::claim(arena.clone(), 0).unwrap();
            let mut model: VecDeque<u32> = VecDeque::new();

            for enqueue in ops {
                if enqueue {
                    let Some(block) = pool.acquire() else {
                        prop_assert!(model.len() == 8 || pool.free_count() == 0);
                        continue;
                    };
                    let index = block.index();
                    pool.transition(&block, OwnerState::Filling, OwnerState::InFlight).unwrap();
                    match producer.try_enqueue(block).unwrap() {
                        Enqueue::Published(_) => model.push_back(index),
                        Enqueue::Full(block) => {
                            prop_assert_eq!(model.len(), 8);
                            pool.release(block).unwrap();
                        }
                    }
                } else {
                    match consumer.try_dequeue().unwrap() {
                        Some(block) => {
                            prop_assert_eq!(Some(block.index()), model.pop_front());
                            pool.release(block).unwrap();
                        }
                        None => prop_assert!(model.is_empty()),
                    }
                }
                prop_assert_eq!(consumer.len(), model.len() as u64);
            }

            consumer.drain_into_pool().unwrap();
            prop_assert!(pool.census().is_quiescent());
        }
    }
}

// ============================================================================
// Pool Properties
// ============================================================================

mod pool_properties {
    use super::*;
    use nrflow_core::BlockHandle;
    use nrflow_integration_tests::test_helpers::single_ring_arena;

    #[derive(Debug, Clone)]
    enum Op {
        Acquire,
        Release(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Acquire),
            any::<usize>().prop_map(Op::Release),
        ]
    }

    proptest! {
        /// The census always accounts for every block, and no block is
        /// handed out twice while held.
        #[test]
        fn census_tracks_owners(ops in prop::collection::vec(op(), 1..300)) {
            let arena = single_ring_arena(16, 4);
            let pool = arena.pool();
            let mut held: Vec<BlockHandle> = Vec::new();

            for op in ops {
                match op {
                    Op::Acquire => match pool.acquire() {
                        Some(block) => {
                            prop_assert!(held.iter().all(|h| h.index() != block.index()));
                            held.push(block);
                        }
                        None => prop_assert_eq!(held.len(), 16),
                    },
                    Op::Release(pick) if !held.is_empty() => {
                        let block = held.swap_remove(pick % held.len());
                        pool.release(block).unwrap();
                    }
                    Op::Release(_) => {}
                }

                let census = pool.census();
                prop_assert_eq!(census.filling as usize, held.len());
                prop_assert_eq!(census.free as usize, 16 - held.len());
                prop_assert_eq!(pool.free_count() as usize, 16 - held.len());
                prop_assert_eq!(census.unknown, 0);
            }

            for block in held {
                pool.release(block).unwrap();
            }
            prop_assert!(pool.census().is_quiescent());
            prop_assert_eq!(arena.violations(), 0);
        }
    }
}

// ============================================================================
// Analyzer Properties
// ============================================================================

mod analyzer_properties {
    use super::*;
    use nrflow_traffic::{FiveTuple, TrafficGenerator, TrafficMix, classify};

    proptest! {
        /// Arbitrary bytes are classified or rejected, never a panic
        #[test]
        fn classify_never_panics(
            kind in prop_oneof![Just(1u8), Just(4u8), Just(6u8), any::<u8>()],
            body in prop::collection::vec(any::<u8>(), 0..256),
        ) {
            let mut message = vec![kind];
            message.extend_from_slice(&body);
            let _ = classify(&message);
            let _ = FiveTuple::parse(&message);
        }

        /// Generated messages fit the configured bound and are rejected
        /// exactly when generated malformed
        #[test]
        fn generated_messages_match_flags(seed in any::<u64>(), max_message in 96usize..1500) {
            let mut generator = TrafficGenerator::new(TrafficMix {
                seed: Some(seed),
                max_message,
                malformed_ratio: 0.25,
                ..Default::default()
            })
            .unwrap();

            for _ in 0..64 {
                let (message, generated) = generator.next_message();
                prop_assert!(message.len() <= max_message);
                prop_assert_eq!(message[0], generated.kind);
                prop_assert_eq!(classify(&message).is_err(), generated.malformed);
                if !generated.malformed && generated.flow_key.is_some() {
                    let tuple = FiveTuple::parse(&message).unwrap();
                    prop_assert_eq!(Some(tuple.flow_key()), generated.flow_key);
                }
            }
        }
    }
}
