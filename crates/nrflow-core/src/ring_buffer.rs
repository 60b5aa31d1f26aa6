//! Per-worker SPSC rings of block indices in shared memory.
//!
//! Each ring has exactly one producer (the parent) and one consumer (its
//! worker). The two cursors are monotonic `u64` sequence numbers in separate
//! cache lines; the slot for sequence `s` is `s & (capacity - 1)`. Because
//! the cursors never wrap, `tail - head` is the exact occupancy and the full
//! capacity is usable.
//!
//! # Design
//!
//! - **Claims**: `RingProducer` / `RingConsumer` claim their endpoint in the
//!   shared ring metadata, so a second producer or consumer for the same ring
//!   is refused even across processes.
//! - **Cached cursors**: each side caches the other side's cursor and only
//!   reloads it when the cached value says full/empty.
//! - **Corruption**: `head > tail` or `tail - head > capacity` is reported as
//!   `RingError::Corrupted` instead of being silently "fixed".
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use nrflow_core::arena::{SegmentBacking, SharedArena};
//! use nrflow_core::layout::ArenaGeometry;
//! use nrflow_core::ring_buffer::{Enqueue, RingConsumer, RingProducer};
//!
//! let geometry = ArenaGeometry { block_size: 64, block_count: 4, ring_count: 1, ring_capacity: 2 };
//! let arena = Arc::new(SharedArena::create(geometry, SegmentBacking::Anonymous).unwrap());
//!
//! let mut producer = RingProducer::claim(arena.clone(), 0).unwrap();
//! let mut consumer = RingConsumer::claim(arena.clone(), 0).unwrap();
//!
//! let block = arena.pool().acquire().unwrap();
//! assert!(matches!(producer.try_enqueue(block).unwrap(), Enqueue::Published(0)));
//! let block = consumer.try_dequeue().unwrap().unwrap();
//! arena.pool().release(block).unwrap();
//! ```

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::arena::SharedArena;
use crate::error::RingError;
use crate::layout::{RingCounters, RingMeta};
use crate::pool::BlockHandle;

/// Result of a non-blocking enqueue
#[derive(Debug)]
pub enum Enqueue {
    /// Published at the given ring sequence
    Published(u64),
    /// Ring full; the block is handed back
    Full(BlockHandle),
}

fn check_cursors(ring: u32, head: u64, tail: u64, capacity: u64) -> Result<u64, RingError> {
    match tail.checked_sub(head) {
        Some(len) if len <= capacity => Ok(len),
        _ => Err(RingError::Corrupted { ring, head, tail }),
    }
}

/// Producer endpoint of one ring
pub struct RingProducer {
    arena: Arc<SharedArena>,
    ring: u32,
    capacity: u64,
    mask: u64,
    cached_head: u64,
}

impl RingProducer {
    /// Claim the producer endpoint of ring `ring`
    ///
    /// # Errors
    ///
    /// Returns `RingError::NoSuchRing` or `RingError::AlreadyClaimed`.
    pub fn claim(arena: Arc<SharedArena>, ring: u32) -> Result<Self, RingError> {
        let meta = arena.ring(ring)?;
        meta.endpoints
            .producer_claimed
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| RingError::AlreadyClaimed {
                ring,
                endpoint: "producer",
            })?;
        let capacity = u64::from(arena.geometry().ring_capacity);
        let cached_head = meta.head.load(Ordering::Acquire);
        Ok(Self {
            arena,
            ring,
            capacity,
            mask: capacity - 1,
            cached_head,
        })
    }

    fn meta(&self) -> &RingMeta {
        self.arena.ring_meta(self.ring)
    }

    /// Ring id
    pub fn ring(&self) -> u32 {
        self.ring
    }

    /// Ring capacity
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Publish a block index
    ///
    /// # Errors
    ///
    /// Returns `RingError::Corrupted` if the cursors are inconsistent.
    pub fn try_enqueue(&mut self, block: BlockHandle) -> Result<Enqueue, RingError> {
        let meta = self.arena.ring_meta(self.ring);
        let tail = meta.tail.load(Ordering::Relaxed);

        let stale = match tail.checked_sub(self.cached_head) {
            Some(len) => len >= self.capacity,
            None => true,
        };
        if stale {
            self.cached_head = meta.head.load(Ordering::Acquire);
            let len = check_cursors(self.ring, self.cached_head, tail, self.capacity)?;
            if len == self.capacity {
                return Ok(Enqueue::Full(block));
            }
        }

        let slots = self.arena.ring_slots(self.ring);
        slots[(tail & self.mask) as usize].store(block.index(), Ordering::Relaxed);
        meta.tail.store(tail + 1, Ordering::Release);
        Ok(Enqueue::Published(tail))
    }

    /// Occupancy as seen by the producer
    pub fn len(&self) -> u64 {
        let meta = self.meta();
        meta.tail
            .load(Ordering::Relaxed)
            .saturating_sub(meta.head.load(Ordering::Acquire))
    }

    /// Whether the ring is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Producer-owned counters of this ring
    pub fn counters(&self) -> &RingCounters {
        &self.meta().counters
    }

    /// Whether the consumer currently accepts new messages
    pub fn is_accepting(&self) -> bool {
        self.meta().endpoints.accepting.load(Ordering::Acquire) != 0
    }

    /// Wake the consumer if it is parked
    #[inline]
    pub fn wake_consumer(&self) {
        self.meta().data_available.notify_if_waiting();
    }

    /// Park until the ring has room or `timeout` elapses
    pub fn wait_for_space(&mut self, timeout: Duration) -> bool {
        let meta = self.arena.ring_meta(self.ring);
        let capacity = self.capacity;
        meta.space_available.wait_until(timeout, || {
            meta.tail
                .load(Ordering::Relaxed)
                .saturating_sub(meta.head.load(Ordering::Acquire))
                < capacity
        })
    }
}

impl Drop for RingProducer {
    fn drop(&mut self) {
        self.meta()
            .endpoints
            .producer_claimed
            .store(0, Ordering::Release);
    }
}

/// Consumer endpoint of one ring
pub struct RingConsumer {
    arena: Arc<SharedArena>,
    ring: u32,
    capacity: u64,
    mask: u64,
    cached_tail: u64,
}

impl RingConsumer {
    /// Claim the consumer endpoint of ring `ring`
    ///
    /// # Errors
    ///
    /// Returns `RingError::NoSuchRing` or `RingError::AlreadyClaimed`.
    pub fn claim(arena: Arc<SharedArena>, ring: u32) -> Result<Self, RingError> {
        let meta = arena.ring(ring)?;
        meta.endpoints
            .consumer_claimed
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| RingError::AlreadyClaimed {
                ring,
                endpoint: "consumer",
            })?;
        Ok(Self::new_unchecked(arena, ring))
    }

    /// Take over the consumer endpoint regardless of its claim flag
    ///
    /// Used by the supervisor to reclaim a ring's backlog after its worker
    /// died without releasing the claim.
    ///
    /// # Safety
    ///
    /// The previous consumer must be gone (reaped process or joined thread)
    /// and no other consumer may be created for this ring while the returned
    /// one exists.
    pub unsafe fn force_claim(arena: Arc<SharedArena>, ring: u32) -> Result<Self, RingError> {
        let meta = arena.ring(ring)?;
        meta.endpoints.accepting.store(0, Ordering::Release);
        meta.endpoints.consumer_claimed.store(1, Ordering::Release);
        Ok(Self::new_unchecked(arena, ring))
    }

    fn new_unchecked(arena: Arc<SharedArena>, ring: u32) -> Self {
        let capacity = u64::from(arena.geometry().ring_capacity);
        let cached_tail = arena.ring_meta(ring).tail.load(Ordering::Acquire);
        Self {
            arena,
            ring,
            capacity,
            mask: capacity - 1,
            cached_tail,
        }
    }

    fn meta(&self) -> &RingMeta {
        self.arena.ring_meta(self.ring)
    }

    /// Ring id
    pub fn ring(&self) -> u32 {
        self.ring
    }

    /// Arena this ring lives in
    pub fn arena(&self) -> &Arc<SharedArena> {
        &self.arena
    }

    /// Take the oldest block index
    ///
    /// # Errors
    ///
    /// Returns `RingError::Corrupted` if the cursors are inconsistent and
    /// `RingError::InvalidHandle` if the slot did not hold a block index (the
    /// slot is consumed in that case).
    pub fn try_dequeue(&mut self) -> Result<Option<BlockHandle>, RingError> {
        let meta = self.arena.ring_meta(self.ring);
        let head = meta.head.load(Ordering::Relaxed);

        if head >= self.cached_tail {
            self.cached_tail = meta.tail.load(Ordering::Acquire);
            if self.cached_tail == head {
                return Ok(None);
            }
        }
        check_cursors(self.ring, head, self.cached_tail, self.capacity)?;

        let slots = self.arena.ring_slots(self.ring);
        let index = slots[(head & self.mask) as usize].load(Ordering::Relaxed);
        meta.head.store(head + 1, Ordering::Release);

        if index >= self.arena.block_count() {
            self.arena.record_violation();
            return Err(RingError::InvalidHandle {
                ring: self.ring,
                index,
            });
        }
        Ok(Some(BlockHandle::from_index(index)))
    }

    /// Dequeue up to `max` blocks into `out`; returns how many were taken
    ///
    /// # Errors
    ///
    /// Same as `try_dequeue`; blocks taken before the error stay in `out`.
    pub fn dequeue_batch(
        &mut self,
        out: &mut Vec<BlockHandle>,
        max: usize,
    ) -> Result<usize, RingError> {
        let mut taken = 0;
        while taken < max {
            match self.try_dequeue()? {
                Some(block) => {
                    out.push(block);
                    taken += 1;
                }
                None => break,
            }
        }
        Ok(taken)
    }

    /// Occupancy as seen by the consumer
    pub fn len(&self) -> u64 {
        let meta = self.meta();
        meta.tail
            .load(Ordering::Acquire)
            .saturating_sub(meta.head.load(Ordering::Relaxed))
    }

    /// Whether the ring is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Advertise whether the producer should route new messages here
    pub fn set_accepting(&self, accepting: bool) {
        self.meta()
            .endpoints
            .accepting
            .store(u32::from(accepting), Ordering::Release);
    }

    /// Wake the producer if it is waiting for space
    #[inline]
    pub fn wake_producer(&self) {
        self.meta().space_available.notify_if_waiting();
    }

    /// Park until data arrives, `interrupt()` holds, or `timeout` elapses
    ///
    /// Returns `true` if woken for data or by the interrupt predicate.
    pub fn wait_for_data<F>(&self, timeout: Duration, interrupt: F) -> bool
    where
        F: Fn() -> bool,
    {
        let meta = self.meta();
        meta.data_available.wait_until(timeout, || {
            meta.tail.load(Ordering::Acquire) != meta.head.load(Ordering::Relaxed) || interrupt()
        })
    }

    /// Dequeue everything left and return it to the pool
    ///
    /// Returns the number of blocks reclaimed.
    ///
    /// # Errors
    ///
    /// Stops at the first ring error.
    pub fn drain_into_pool(&mut self) -> Result<u32, RingError> {
        let mut reclaimed = 0;
        while let Some(block) = self.try_dequeue()? {
            if self.arena.pool().release(block).is_ok() {
                reclaimed += 1;
            }
        }
        self.wake_producer();
        Ok(reclaimed)
    }
}

impl Drop for RingConsumer {
    fn drop(&mut self) {
        let endpoints = &self.meta().endpoints;
        endpoints.accepting.store(0, Ordering::Release);
        endpoints.consumer_claimed.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::SegmentBacking;
    use crate::layout::ArenaGeometry;
    use std::thread;

    fn arena(capacity: u32, blocks: u32) -> Arc<SharedArena> {
        Arc::new(
            SharedArena::create(
                ArenaGeometry {
                    block_size: 64,
                    block_count: blocks,
                    ring_count: 2,
                    ring_capacity: capacity,
                },
                SegmentBacking::Anonymous,
            )
            .unwrap(),
        )
    }

    fn publish(producer: &mut RingProducer, block: BlockHandle) -> u64 {
        match producer.try_enqueue(block).unwrap() {
            Enqueue::Published(seq) => seq,
            Enqueue::Full(_) => panic!("ring unexpectedly full"),
        }
    }

    #[test]
    fn test_ring_fifo() {
        let arena = arena(8, 16);
        let mut producer = RingProducer::claim(arena.clone(), 0).unwrap();
        let mut consumer = RingConsumer::claim(arena.clone(), 0).unwrap();

        for i in 0..5 {
            assert_eq!(publish(&mut producer, BlockHandle::from_index(i)), u64::from(i));
        }
        assert_eq!(consumer.len(), 5);
        for i in 0..5 {
            assert_eq!(consumer.try_dequeue().unwrap().unwrap().index(), i);
        }
        assert!(consumer.try_dequeue().unwrap().is_none());
    }

    #[test]
    fn test_ring_full_uses_whole_capacity() {
        let arena = arena(4, 16);
        let mut producer = RingProducer::claim(arena.clone(), 0).unwrap();
        let mut consumer = RingConsumer::claim(arena.clone(), 0).unwrap();

        for i in 0..4 {
            publish(&mut producer, BlockHandle::from_index(i));
        }
        match producer.try_enqueue(BlockHandle::from_index(9)).unwrap() {
            Enqueue::Full(block) => assert_eq!(block.index(), 9),
            Enqueue::Published(_) => panic!("enqueue into full ring"),
        }

        assert_eq!(consumer.try_dequeue().unwrap().unwrap().index(), 0);
        assert_eq!(publish(&mut producer, BlockHandle::from_index(9)), 4);
    }

    #[test]
    fn test_ring_wraparound() {
        let arena = arena(4, 16);
        let mut producer = RingProducer::claim(arena.clone(), 0).unwrap();
        let mut consumer = RingConsumer::claim(arena.clone(), 0).unwrap();

        for round in 0..10u32 {
            for i in 0..3 {
                publish(&mut producer, BlockHandle::from_index((round + i) % 16));
            }
            for i in 0..3 {
                let block = consumer.try_dequeue().unwrap().unwrap();
                assert_eq!(block.index(), (round + i) % 16);
            }
        }
        assert_eq!(arena.ring_meta(0).head.load(Ordering::Relaxed), 30);
    }

    #[test]
    fn test_ring_batch() {
        let arena = arena(8, 16);
        let mut producer = RingProducer::claim(arena.clone(), 0).unwrap();
        let mut consumer = RingConsumer::claim(arena.clone(), 0).unwrap();

        for i in 0..6 {
            publish(&mut producer, BlockHandle::from_index(i));
        }
        let mut out = Vec::new();
        assert_eq!(consumer.dequeue_batch(&mut out, 4).unwrap(), 4);
        assert_eq!(consumer.dequeue_batch(&mut out, 4).unwrap(), 2);
        let indices: Vec<u32> = out.iter().map(BlockHandle::index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_endpoint_claims_are_exclusive() {
        let arena = arena(4, 8);
        let producer = RingProducer::claim(arena.clone(), 0).unwrap();
        assert!(matches!(
            RingProducer::claim(arena.clone(), 0),
            Err(RingError::AlreadyClaimed { ring: 0, endpoint: "producer" })
        ));
        // Other ring is independent
        let _other = RingProducer::claim(arena.clone(), 1).unwrap();
        drop(producer);
        assert!(RingProducer::claim(arena.clone(), 0).is_ok());

        let _consumer = RingConsumer::claim(arena.clone(), 0).unwrap();
        assert!(RingConsumer::claim(arena.clone(), 0).is_err());
        assert!(matches!(
            RingConsumer::claim(arena, 5),
            Err(RingError::NoSuchRing { ring: 5, count: 2 })
        ));
    }

    #[test]
    fn test_corruption_detected() {
        let arena = arena(4, 8);

        // head ahead of tail
        arena.ring_meta(0).head.store(3, Ordering::Relaxed);
        arena.ring_meta(0).tail.store(1, Ordering::Relaxed);
        let mut producer = RingProducer::claim(arena.clone(), 0).unwrap();
        let mut consumer = RingConsumer::claim(arena.clone(), 0).unwrap();
        assert!(matches!(
            consumer.try_dequeue(),
            Err(RingError::Corrupted { ring: 0, head: 3, tail: 1 })
        ));
        assert!(matches!(
            producer.try_enqueue(BlockHandle::from_index(0)),
            Err(RingError::Corrupted { .. })
        ));
        drop(consumer);

        // more entries than slots
        arena.ring_meta(0).head.store(0, Ordering::Relaxed);
        arena.ring_meta(0).tail.store(9, Ordering::Relaxed);
        let mut consumer = RingConsumer::claim(arena.clone(), 0).unwrap();
        assert!(matches!(
            consumer.try_dequeue(),
            Err(RingError::Corrupted { ring: 0, head: 0, tail: 9 })
        ));
    }

    #[test]
    fn test_invalid_slot_reported() {
        let arena = arena(4, 8);
        let mut producer = RingProducer::claim(arena.clone(), 0).unwrap();
        let mut consumer = RingConsumer::claim(arena.clone(), 0).unwrap();

        publish(&mut producer, BlockHandle::from_index(1000));
        assert!(matches!(
            consumer.try_dequeue(),
            Err(RingError::InvalidHandle { ring: 0, index: 1000 })
        ));
        assert_eq!(arena.violations(), 1);
        assert!(consumer.try_dequeue().unwrap().is_none());
    }

    #[test]
    fn test_drain_into_pool() {
        let arena = arena(8, 8);
        let pool = arena.pool();
        let mut producer = RingProducer::claim(arena.clone(), 0).unwrap();

        for _ in 0..5 {
            let block = pool.acquire().unwrap();
            publish(&mut producer, block);
        }
        assert_eq!(pool.free_count(), 3);

        {
            // Simulate a consumer that died holding the claim
            let dead = RingConsumer::claim(arena.clone(), 0).unwrap();
            std::mem::forget(dead);
        }
        assert!(RingConsumer::claim(arena.clone(), 0).is_err());

        // SAFETY: the previous consumer was leaked and is never used again.
        let mut reclaimer = unsafe { RingConsumer::force_claim(arena.clone(), 0) }.unwrap();
        assert_eq!(reclaimer.drain_into_pool().unwrap(), 5);
        assert!(pool.census().is_quiescent());
    }

    #[test]
    fn test_accepting_flag() {
        let arena = arena(4, 8);
        let producer = RingProducer::claim(arena.clone(), 0).unwrap();
        assert!(!producer.is_accepting());

        let consumer = RingConsumer::claim(arena.clone(), 0).unwrap();
        consumer.set_accepting(true);
        assert!(producer.is_accepting());
        drop(consumer);
        assert!(!producer.is_accepting());
    }

    #[test]
    fn test_wait_for_data_wakes() {
        let arena = arena(4, 8);
        let consumer = RingConsumer::claim(arena.clone(), 0).unwrap();

        let producer_arena = arena.clone();
        let handle = thread::spawn(move || {
            let mut producer = RingProducer::claim(producer_arena, 0).unwrap();
            thread::sleep(Duration::from_millis(20));
            publish(&mut producer, BlockHandle::from_index(2));
            producer.wake_consumer();
        });

        assert!(consumer.wait_for_data(Duration::from_secs(5), || false));
        handle.join().unwrap();
    }

    #[test]
    fn test_ring_concurrent_preserves_order() {
        const COUNT: u32 = 100_000;
        let arena = arena(64, 8);

        let producer_arena = arena.clone();
        let producer = thread::spawn(move || {
            let mut producer = RingProducer::claim(producer_arena, 0).unwrap();
            let mut next = 0u32;
            while next < COUNT {
                match producer
                    .try_enqueue(BlockHandle::from_index(next % 8))
                    .unwrap()
                {
                    Enqueue::Published(seq) => {
                        assert_eq!(seq, u64::from(next));
                        next += 1;
                    }
                    Enqueue::Full(_) => thread::yield_now(),
                }
            }
        });

        let mut consumer = RingConsumer::claim(arena.clone(), 0).unwrap();
        let mut expected = 0u32;
        while expected < COUNT {
            match consumer.try_dequeue().unwrap() {
                Some(block) => {
                    assert_eq!(block.index(), expected % 8);
                    expected += 1;
                }
                None => thread::yield_now(),
            }
        }
        producer.join().unwrap();
        assert!(consumer.is_empty());
    }
}
