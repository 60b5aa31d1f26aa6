//! Per-worker counters and the statistics aggregator.
//!
//! Each worker writes only its own `WorkerStatsBlock` (relaxed increments);
//! each ring's producer writes only that ring's `RingCounters`. The
//! aggregator reads everything without synchronization and sums at read time,
//! so a snapshot may be slightly behind in-progress updates but never blocks
//! the hot path.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

use crate::arena::SharedArena;
use crate::control::WorkerState;
use crate::pool::PoolCensus;

/// Protocol classes an analyzer may report
pub const CLASS_COUNT: usize = 8;

/// Log2 latency buckets (bucket `b` holds samples below `2^b` ns)
pub const LATENCY_BUCKETS: usize = 32;

/// Counters owned by one worker
#[repr(C, align(64))]
pub struct WorkerStatsBlock {
    /// Blocks dequeued and analyzed
    pub consumed: AtomicU64,
    /// Payload bytes analyzed
    pub bytes: AtomicU64,
    /// Analyzer-reported errors
    pub analyze_errors: AtomicU64,
    /// Blocks released back to the pool
    pub released: AtomicU64,
    /// Producer drops inferred from sequence gaps
    pub drops_observed: AtomicU64,
    /// Last sequence seen on this ring
    pub last_seq: AtomicU64,
    /// Nanoseconds spent inside the analyzer
    pub busy_ns: AtomicU64,
    /// Invariant violations seen by this worker
    pub violations: AtomicU64,
    /// Per-class message counts
    pub classes: [AtomicU64; CLASS_COUNT],
    /// End-to-end latency histogram
    pub latency: [AtomicU64; LATENCY_BUCKETS],
}

/// Histogram bucket for a latency sample
#[must_use]
pub fn latency_bucket(nanos: u64) -> usize {
    let bits = (u64::BITS - nanos.leading_zeros()) as usize;
    bits.min(LATENCY_BUCKETS - 1)
}

impl WorkerStatsBlock {
    /// Record one analyzed block
    #[inline]
    pub fn record(&self, bytes: usize, class: Option<u8>, busy_ns: u64, latency_ns: u64) {
        self.consumed.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.busy_ns.fetch_add(busy_ns, Ordering::Relaxed);
        match class {
            Some(class) => {
                let idx = (class as usize).min(CLASS_COUNT - 1);
                self.classes[idx].fetch_add(1, Ordering::Relaxed);
            }
            None => {
                self.analyze_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.latency[latency_bucket(latency_ns)].fetch_add(1, Ordering::Relaxed);
    }

    /// Track the ring's offer sequence; gaps are producer drops
    #[inline]
    pub fn observe_seq(&self, seq: u64) {
        let last = self.last_seq.load(Ordering::Relaxed);
        if seq > last + 1 {
            self.drops_observed
                .fetch_add(seq - last - 1, Ordering::Relaxed);
        }
        if seq > last {
            self.last_seq.store(seq, Ordering::Relaxed);
        }
    }

    /// Copy the counters out
    pub fn snapshot(&self) -> WorkerCounters {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        WorkerCounters {
            consumed: load(&self.consumed),
            bytes: load(&self.bytes),
            analyze_errors: load(&self.analyze_errors),
            released: load(&self.released),
            drops_observed: load(&self.drops_observed),
            busy_ns: load(&self.busy_ns),
            violations: load(&self.violations),
            classes: std::array::from_fn(|i| load(&self.classes[i])),
            latency: std::array::from_fn(|i| load(&self.latency[i])),
        }
    }
}

/// Plain copy of a worker's counters
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct WorkerCounters {
    /// Blocks analyzed
    pub consumed: u64,
    /// Bytes analyzed
    pub bytes: u64,
    /// Analyzer errors
    pub analyze_errors: u64,
    /// Blocks released
    pub released: u64,
    /// Drops inferred from sequence gaps
    pub drops_observed: u64,
    /// Analyzer time, nanoseconds
    pub busy_ns: u64,
    /// Invariant violations
    pub violations: u64,
    /// Per-class counts
    pub classes: [u64; CLASS_COUNT],
    /// Latency histogram
    #[serde(skip)]
    pub latency: [u64; LATENCY_BUCKETS],
}

impl WorkerCounters {
    fn add(&mut self, other: &WorkerCounters) {
        self.consumed += other.consumed;
        self.bytes += other.bytes;
        self.analyze_errors += other.analyze_errors;
        self.released += other.released;
        self.drops_observed += other.drops_observed;
        self.busy_ns += other.busy_ns;
        self.violations += other.violations;
        for (a, b) in self.classes.iter_mut().zip(other.classes.iter()) {
            *a += b;
        }
        for (a, b) in self.latency.iter_mut().zip(other.latency.iter()) {
            *a += b;
        }
    }

    /// Upper bound (ns) of the bucket holding quantile `q` of the samples
    #[must_use]
    pub fn latency_quantile(&self, q: f64) -> Option<u64> {
        let total: u64 = self.latency.iter().sum();
        if total == 0 {
            return None;
        }
        let rank = ((total as f64) * q.clamp(0.0, 1.0)).ceil().max(1.0) as u64;
        let mut seen = 0;
        for (bucket, count) in self.latency.iter().enumerate() {
            seen += count;
            if seen >= rank {
                return Some(1u64 << bucket);
            }
        }
        Some(1u64 << (LATENCY_BUCKETS - 1))
    }
}

/// Producer counters of one ring, copied
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct RingCounterSnapshot {
    /// Messages routed to the ring
    pub offered: u64,
    /// Messages enqueued
    pub enqueued: u64,
    /// Ring-full drops
    pub dropped_ring_full: u64,
    /// Pool-exhausted drops
    pub dropped_pool_exhausted: u64,
}

impl RingCounterSnapshot {
    fn add(&mut self, other: &RingCounterSnapshot) {
        self.offered += other.offered;
        self.enqueued += other.enqueued;
        self.dropped_ring_full += other.dropped_ring_full;
        self.dropped_pool_exhausted += other.dropped_pool_exhausted;
    }

    /// Total drops
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped_ring_full + self.dropped_pool_exhausted
    }
}

/// One worker's view in a snapshot
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    /// Worker / ring id
    pub worker: u32,
    /// Lifecycle state
    pub state: WorkerState,
    /// Last exit was forced
    pub forced: bool,
    /// Ring occupancy
    pub ring_len: u64,
    /// Worker counters
    pub counters: WorkerCounters,
    /// Producer counters of the worker's ring
    pub ring: RingCounterSnapshot,
}

/// Aggregated statistics
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    /// Monotonic timestamp of the snapshot
    pub taken_at_ns: u64,
    /// Per-worker details
    pub workers: Vec<WorkerSnapshot>,
    /// Sum of worker counters
    pub totals: WorkerCounters,
    /// Sum of ring counters
    pub rings: RingCounterSnapshot,
    /// Blocks consumed per second since the previous snapshot
    pub throughput_per_sec: f64,
    /// Max / mean consumed across live workers (1.0 = balanced)
    pub imbalance: f64,
    /// Median latency bucket bound, ns
    pub latency_p50_ns: Option<u64>,
    /// 99th percentile latency bucket bound, ns
    pub latency_p99_ns: Option<u64>,
    /// Highest occupied latency bucket bound, ns
    pub latency_max_ns: Option<u64>,
    /// Pool census at snapshot time
    pub pool: PoolCensus,
    /// Arena-wide invariant violations
    pub violations: u64,
}

impl StatsSnapshot {
    /// Blocks held by workers at snapshot time
    #[must_use]
    pub fn held_blocks(&self) -> u32 {
        self.pool.held
    }
}

/// Sums worker and ring counters on demand
pub struct StatsAggregator {
    arena: Arc<SharedArena>,
    last: Option<(Instant, u64)>,
}

impl StatsAggregator {
    /// Create an aggregator over an arena
    #[must_use]
    pub fn new(arena: Arc<SharedArena>) -> Self {
        Self { arena, last: None }
    }

    /// Take a snapshot
    pub fn snapshot(&mut self) -> StatsSnapshot {
        let rings = self.arena.ring_count();
        let mut workers = Vec::with_capacity(rings as usize);
        let mut totals = WorkerCounters::default();
        let mut ring_totals = RingCounterSnapshot::default();

        for ring in 0..rings {
            let meta = self.arena.ring_meta(ring);
            let counters = meta.stats.snapshot();
            let ring_counters = RingCounterSnapshot {
                offered: meta.counters.offered.load(Ordering::Relaxed),
                enqueued: meta.counters.enqueued.load(Ordering::Relaxed),
                dropped_ring_full: meta.counters.dropped_ring_full.load(Ordering::Relaxed),
                dropped_pool_exhausted: meta
                    .counters
                    .dropped_pool_exhausted
                    .load(Ordering::Relaxed),
            };
            let head = meta.head.load(Ordering::Relaxed);
            let tail = meta.tail.load(Ordering::Relaxed);

            totals.add(&counters);
            ring_totals.add(&ring_counters);
            workers.push(WorkerSnapshot {
                worker: ring,
                state: meta.control.state().get(),
                forced: meta.control.state().forced(),
                ring_len: tail.saturating_sub(head),
                counters,
                ring: ring_counters,
            });
        }

        let now = Instant::now();
        let throughput_per_sec = match self.last {
            Some((at, consumed)) => {
                let elapsed = now.duration_since(at).as_secs_f64();
                if elapsed > 0.0 {
                    totals.consumed.saturating_sub(consumed) as f64 / elapsed
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        self.last = Some((now, totals.consumed));

        let live: Vec<u64> = workers
            .iter()
            .filter(|w| w.state.is_live())
            .map(|w| w.counters.consumed)
            .collect();
        let imbalance = if live.is_empty() {
            1.0
        } else {
            let mean = live.iter().sum::<u64>() as f64 / live.len() as f64;
            let max = live.iter().copied().max().unwrap_or(0) as f64;
            if mean > 0.0 { max / mean } else { 1.0 }
        };

        StatsSnapshot {
            taken_at_ns: crate::clock::monotonic_nanos(),
            latency_p50_ns: totals.latency_quantile(0.50),
            latency_p99_ns: totals.latency_quantile(0.99),
            latency_max_ns: totals.latency_quantile(1.0),
            workers,
            totals,
            rings: ring_totals,
            throughput_per_sec,
            imbalance,
            pool: self.arena.pool().census(),
            violations: self.arena.violations(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block() -> Box<WorkerStatsBlock> {
        // SAFETY: WorkerStatsBlock is all atomics; zero is a valid state.
        unsafe { Box::new(std::mem::zeroed()) }
    }

    #[test]
    fn test_latency_bucket() {
        assert_eq!(latency_bucket(0), 0);
        assert_eq!(latency_bucket(1), 1);
        assert_eq!(latency_bucket(1023), 10);
        assert_eq!(latency_bucket(1024), 11);
        assert_eq!(latency_bucket(u64::MAX), LATENCY_BUCKETS - 1);
    }

    #[test]
    fn test_record_counts() {
        let stats = block();
        stats.record(100, Some(2), 50, 1000);
        stats.record(200, None, 50, 1000);

        let snap = stats.snapshot();
        assert_eq!(snap.consumed, 2);
        assert_eq!(snap.bytes, 300);
        assert_eq!(snap.analyze_errors, 1);
        assert_eq!(snap.classes[2], 1);
        assert_eq!(snap.busy_ns, 100);
        assert_eq!(snap.latency[latency_bucket(1000)], 2);
    }

    #[test]
    fn test_out_of_range_class_is_clamped() {
        let stats = block();
        stats.record(1, Some(200), 0, 0);
        assert_eq!(stats.snapshot().classes[CLASS_COUNT - 1], 1);
    }

    #[test]
    fn test_sequence_gaps_count_drops() {
        let stats = block();
        stats.observe_seq(1);
        stats.observe_seq(2);
        stats.observe_seq(5);
        stats.observe_seq(6);
        assert_eq!(stats.snapshot().drops_observed, 2);
    }

    #[test]
    fn test_latency_quantile() {
        let mut counters = WorkerCounters::default();
        assert_eq!(counters.latency_quantile(0.5), None);

        counters.latency[latency_bucket(1_000)] = 99;
        counters.latency[latency_bucket(1_000_000)] = 1;
        assert_eq!(counters.latency_quantile(0.5), Some(1 << latency_bucket(1_000)));
        assert_eq!(
            counters.latency_quantile(1.0),
            Some(1 << latency_bucket(1_000_000))
        );
    }

    #[test]
    fn test_counter_sum() {
        let mut a = WorkerCounters {
            consumed: 3,
            ..Default::default()
        };
        let b = WorkerCounters {
            consumed: 4,
            released: 4,
            ..Default::default()
        };
        a.add(&b);
        assert_eq!(a.consumed, 7);
        assert_eq!(a.released, 4);
    }
}
