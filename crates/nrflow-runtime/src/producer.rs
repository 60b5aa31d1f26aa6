//! Producer side of the pipeline: pool acquire, fill, route, enqueue.
//!
//! `submit` never blocks unless the backpressure policy asks it to wait for
//! ring space, and even then only for a bounded time. Every drop is counted;
//! drops are outcomes, not errors.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use nrflow_core::clock::monotonic_nanos;
use nrflow_core::config::{BackpressurePolicy, DequeueMode, PipelineConfig, RingSelection};
use nrflow_core::control::WorkerState;
use nrflow_core::pool::{BlockHandle, OwnerState};
use nrflow_core::ring_buffer::{Enqueue, RingProducer};
use nrflow_core::SharedArena;
use serde::Serialize;
use tracing::debug;

use crate::error::Result;

/// Why a message was not enqueued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// No free block in the pool
    PoolExhausted,
    /// Chosen ring was full
    RingFull,
    /// No ring currently accepts messages
    RingClosed,
    /// Message larger than a block
    Oversized,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DropReason::PoolExhausted => "pool exhausted",
            DropReason::RingFull => "ring full",
            DropReason::RingClosed => "ring closed",
            DropReason::Oversized => "oversized",
        };
        f.write_str(s)
    }
}

/// Result of one `submit`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Enqueued on `ring` with per-ring offer sequence `seq`
    Enqueued {
        /// Ring id
        ring: u32,
        /// Offer sequence (1-based, per ring)
        seq: u64,
    },
    /// Dropped
    Dropped(DropReason),
}

impl SubmitOutcome {
    /// Whether the message made it onto a ring
    #[must_use]
    pub fn is_enqueued(&self) -> bool {
        matches!(self, SubmitOutcome::Enqueued { .. })
    }
}

/// Drops that have no per-ring counter in shared memory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProducerDrops {
    /// No ring accepted the message
    pub ring_closed: u64,
    /// Message exceeded the block size
    pub oversized: u64,
}

/// The single producer of an arena
pub struct Producer {
    arena: Arc<SharedArena>,
    rings: Vec<RingProducer>,
    selection: RingSelection,
    backpressure: BackpressurePolicy,
    wake: bool,
    next: usize,
    drops: ProducerDrops,
}

impl Producer {
    /// Claim the producer endpoint of every ring
    ///
    /// Rings whose worker is idle, spawning or running are opened for
    /// routing. A paused worker opened its ring when it attached; a draining
    /// or exited one stays closed.
    ///
    /// # Errors
    ///
    /// Fails if any ring's producer endpoint is already claimed.
    pub fn new(arena: Arc<SharedArena>, config: &PipelineConfig) -> Result<Self> {
        let mut rings = Vec::with_capacity(arena.ring_count() as usize);
        for ring in 0..arena.ring_count() {
            let producer = RingProducer::claim(arena.clone(), ring)?;
            let meta = arena.ring_meta(ring);
            if matches!(
                meta.control.state().get(),
                WorkerState::Idle | WorkerState::Spawning | WorkerState::Running
            ) {
                meta.endpoints.accepting.store(1, Ordering::Release);
            }
            rings.push(producer);
        }

        debug!(
            "Producer attached to {} rings ({:?}, {:?})",
            rings.len(),
            config.ring_selection,
            config.backpressure
        );

        Ok(Self {
            arena,
            rings,
            selection: config.ring_selection,
            backpressure: config.backpressure,
            wake: config.dequeue_mode == DequeueMode::Blocking,
            next: 0,
            drops: ProducerDrops::default(),
        })
    }

    /// Submit a message, routing by the configured policy
    ///
    /// # Errors
    ///
    /// Only invariant violations (ring corruption, owner-tag mismatch) are
    /// errors; backpressure is reported as `SubmitOutcome::Dropped`.
    pub fn submit(&mut self, bytes: &[u8]) -> Result<SubmitOutcome> {
        self.submit_inner(bytes, None)
    }

    /// Submit a message with a flow key
    ///
    /// Under `RingSelection::FlowHash` every message of a flow lands on the
    /// same ring while that ring accepts messages, preserving per-flow order.
    ///
    /// # Errors
    ///
    /// Same as `submit`.
    pub fn submit_keyed(&mut self, bytes: &[u8], flow_key: u64) -> Result<SubmitOutcome> {
        self.submit_inner(bytes, Some(flow_key))
    }

    fn submit_inner(&mut self, bytes: &[u8], flow_key: Option<u64>) -> Result<SubmitOutcome> {
        if bytes.len() > self.arena.block_size() {
            self.drops.oversized += 1;
            return Ok(SubmitOutcome::Dropped(DropReason::Oversized));
        }

        let Some(slot) = self.choose_ring(flow_key) else {
            self.drops.ring_closed += 1;
            return Ok(SubmitOutcome::Dropped(DropReason::RingClosed));
        };

        let arena = &self.arena;
        let pool = arena.pool();
        let ring = &mut self.rings[slot];
        let ring_id = ring.ring();
        let counters = ring.counters();
        let seq = counters.offered.fetch_add(1, Ordering::Relaxed) + 1;

        let Some(mut block) = pool.acquire() else {
            counters
                .dropped_pool_exhausted
                .fetch_add(1, Ordering::Relaxed);
            return Ok(SubmitOutcome::Dropped(DropReason::PoolExhausted));
        };

        {
            let mut data = pool.block_mut(&mut block);
            data.fill(bytes)?;
            data.set_meta(ring_id, seq, monotonic_nanos());
        }
        pool.transition(&block, OwnerState::Filling, OwnerState::InFlight)?;

        let block = match ring.try_enqueue(block)? {
            Enqueue::Published(_) => return Ok(self.published(slot, seq)),
            Enqueue::Full(block) => block,
        };

        let block = match self.backpressure {
            BackpressurePolicy::Wait { timeout_us } => {
                let ring = &mut self.rings[slot];
                if ring.wait_for_space(Duration::from_micros(timeout_us)) {
                    match ring.try_enqueue(block)? {
                        Enqueue::Published(_) => return Ok(self.published(slot, seq)),
                        Enqueue::Full(block) => block,
                    }
                } else {
                    block
                }
            }
            BackpressurePolicy::Drop => block,
        };

        self.drop_full(slot, block)
    }

    fn published(&self, slot: usize, seq: u64) -> SubmitOutcome {
        let ring = &self.rings[slot];
        ring.counters().enqueued.fetch_add(1, Ordering::Relaxed);
        if self.wake {
            ring.wake_consumer();
        }
        SubmitOutcome::Enqueued {
            ring: ring.ring(),
            seq,
        }
    }

    fn drop_full(&self, slot: usize, block: BlockHandle) -> Result<SubmitOutcome> {
        self.arena.pool().release(block)?;
        self.rings[slot]
            .counters()
            .dropped_ring_full
            .fetch_add(1, Ordering::Relaxed);
        Ok(SubmitOutcome::Dropped(DropReason::RingFull))
    }

    /// Flow keys hash over every ring, open or not, so closing one ring only
    /// moves the flows homed on it (to the next open ring).
    fn choose_ring(&mut self, flow_key: Option<u64>) -> Option<usize> {
        let count = self.rings.len();
        let start = match (self.selection, flow_key) {
            (RingSelection::FlowHash, Some(key)) => (key % count as u64) as usize,
            _ => self.next,
        };

        let slot = (0..count)
            .map(|offset| (start + offset) % count)
            .find(|&slot| self.rings[slot].is_accepting())?;

        if flow_key.is_none() || self.selection == RingSelection::RoundRobin {
            self.next = (slot + 1) % count;
        }
        Some(slot)
    }

    /// Number of rings
    #[must_use]
    pub fn ring_count(&self) -> usize {
        self.rings.len()
    }

    /// Rings currently accepting messages
    #[must_use]
    pub fn open_rings(&self) -> usize {
        self.rings.iter().filter(|r| r.is_accepting()).count()
    }

    /// Drops not attributable to a single ring
    #[must_use]
    pub fn drops(&self) -> ProducerDrops {
        self.drops
    }

    /// Arena this producer writes into
    #[must_use]
    pub fn arena(&self) -> &Arc<SharedArena> {
        &self.arena
    }
}
