//! Worker consume loop.
//!
//! A worker owns the consumer end of one ring. Each iteration it first drains
//! its control mailbox (acknowledging every message), then, depending on its
//! lifecycle state, dequeues and analyzes one block, parks, or exits.
//!
//! The loop never panics on the hot path: ring corruption stops the worker
//! with a violation exit code, owner-tag mismatches are counted and skipped.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use nrflow_core::analyzer::Analyzer;
use nrflow_core::clock::monotonic_nanos;
use nrflow_core::config::{DequeueMode, PipelineConfig};
use nrflow_core::control::{Command, ControlMessage, WorkerState};
use nrflow_core::layout::RingMeta;
use nrflow_core::pool::{BlockHandle, OwnerState};
use nrflow_core::ring_buffer::RingConsumer;
use nrflow_core::SharedArena;
use tracing::{debug, error, info, warn};

use crate::affinity;
use crate::error::WorkerError;

/// Worker exit codes (process exit status / thread return value)
pub mod exit_code {
    /// Drained on request
    pub const OK: i32 = 0;
    /// Left on SHUTDOWN or a forced exit from the parent
    pub const SHUTDOWN: i32 = 1;
    /// Stopped on an invariant violation
    pub const VIOLATION: i32 = 70;
    /// Could not attach to the arena or ring
    pub const ATTACH: i32 = 71;
    /// Panicked
    pub const PANIC: i32 = 101;
}

/// Heartbeat every this many processed blocks
const HEARTBEAT_EVERY: u64 = 1024;

/// Everything a worker needs, passed by value at spawn
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    /// Worker id, also its ring id
    pub id: u32,
    /// Empty-ring strategy
    pub dequeue_mode: DequeueMode,
    /// Empty polls before yielding or parking
    pub spin_limit: u32,
    /// Upper bound on one park
    pub park_timeout: Duration,
    /// Finish the ring backlog when draining
    pub drain_backlog: bool,
    /// Enter `Paused` instead of `Running`
    pub start_paused: bool,
    /// Core to pin to, if any
    pub pin_core: Option<usize>,
}

impl WorkerSpec {
    /// Build the spec of worker `id` from the pipeline configuration
    #[must_use]
    pub fn from_config(id: u32, config: &PipelineConfig) -> Self {
        Self {
            id,
            dequeue_mode: config.dequeue_mode,
            spin_limit: config.spin_limit,
            park_timeout: config.park_timeout(),
            drain_backlog: config.drain_backlog,
            start_paused: config.start_paused,
            pin_core: config
                .pin_workers
                .then(|| affinity::core_for_worker(id)),
        }
    }
}

/// How a worker left its loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// DRAIN completed
    Drained,
    /// SHUTDOWN (or a forced exit from the parent)
    Forced,
}

impl WorkerExit {
    /// Exit code reported to the parent
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            WorkerExit::Drained => exit_code::OK,
            WorkerExit::Forced => exit_code::SHUTDOWN,
        }
    }
}

/// One attached worker
pub struct Worker {
    spec: WorkerSpec,
    arena: Arc<SharedArena>,
    consumer: RingConsumer,
    analyzer: Box<dyn Analyzer>,
    processed: u64,
}

impl Worker {
    /// Validate the arena, claim the ring consumer and enter the first state
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::Attach` if the arena header is not valid for
    /// this build, the ring is already consumed, or the state machine refuses
    /// the start transition.
    pub fn attach(
        spec: WorkerSpec,
        arena: Arc<SharedArena>,
        analyzer: Box<dyn Analyzer>,
    ) -> Result<Self, WorkerError> {
        let attach_err = |reason: String| WorkerError::Attach {
            worker: spec.id,
            reason,
        };

        arena.validate().map_err(|e| attach_err(e.to_string()))?;
        let consumer =
            RingConsumer::claim(arena.clone(), spec.id).map_err(|e| attach_err(e.to_string()))?;

        let state = arena.ring_meta(spec.id).control.state();
        state.set_pid(std::process::id() as i32);
        state.beat(monotonic_nanos());

        let initial = if spec.start_paused {
            WorkerState::Paused
        } else {
            WorkerState::Running
        };
        state
            .transition(initial)
            .map_err(|e| attach_err(e.to_string()))?;
        consumer.set_accepting(true);

        debug!("Worker {} attached ({})", spec.id, initial);

        Ok(Self {
            spec,
            arena,
            consumer,
            analyzer,
            processed: 0,
        })
    }

    fn meta(&self) -> &RingMeta {
        self.arena.ring_meta(self.spec.id)
    }

    /// Worker id
    pub fn id(&self) -> u32 {
        self.spec.id
    }

    /// Run until drained or shut down
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::Violation` on ring corruption or an impossible
    /// lifecycle state.
    pub fn run(mut self) -> Result<WorkerExit, WorkerError> {
        let id = self.spec.id;
        let mut idle_polls: u32 = 0;

        let exit = loop {
            if let Some(exit) = self.poll_control() {
                break exit;
            }

            match self.meta().control.state().get() {
                WorkerState::Running => {
                    if self.consume_one()? {
                        idle_polls = 0;
                    } else {
                        idle_polls = idle_polls.saturating_add(1);
                        if self.idle(idle_polls) {
                            idle_polls = 0;
                        }
                    }
                }
                WorkerState::Paused => self.park_paused(),
                WorkerState::Draining => {
                    if self.spec.drain_backlog {
                        while self.consume_one()? {}
                    }
                    self.meta()
                        .control
                        .state()
                        .transition(WorkerState::Exited)
                        .map_err(|e| self.violation(e.to_string()))?;
                    break WorkerExit::Drained;
                }
                WorkerState::Exited => break WorkerExit::Forced,
                other => return Err(self.violation(format!("running in state {other}"))),
            }
        };

        let counters = self.meta().stats.snapshot();
        info!(
            "Worker {} exiting ({:?}): consumed {}, bytes {}, analyzer errors {}, drops observed {}",
            id,
            exit,
            counters.consumed,
            counters.bytes,
            counters.analyze_errors,
            counters.drops_observed
        );
        Ok(exit)
    }

    fn poll_control(&mut self) -> Option<WorkerExit> {
        loop {
            let message = match self.meta().control.poll() {
                Ok(Some(message)) => message,
                Ok(None) => return None,
                Err(e) => {
                    self.count_violation(&e.to_string());
                    continue;
                }
            };
            let exit = self.apply(&message);
            self.meta().control.ack(message.seq);
            if exit.is_some() {
                return exit;
            }
        }
    }

    fn apply(&self, message: &ControlMessage) -> Option<WorkerExit> {
        let id = self.spec.id;
        let state = self.meta().control.state();
        debug!("Worker {} received {} (seq {})", id, message.command, message.seq);

        let result = match message.command {
            Command::Start => state.transition(WorkerState::Running),
            Command::Pause => state.transition(WorkerState::Paused),
            Command::Drain => {
                self.consumer.set_accepting(false);
                state.transition(WorkerState::Draining)
            }
            Command::Shutdown => {
                self.consumer.set_accepting(false);
                if let Err(e) = state.force_exit() {
                    debug!("Worker {} forced exit from final state: {}", id, e);
                }
                return Some(WorkerExit::Forced);
            }
            Command::StatsRequest => {
                state.beat(monotonic_nanos());
                return None;
            }
        };

        if let Err(e) = result {
            self.count_violation(&e.to_string());
        }
        None
    }

    /// Dequeue and analyze one block; `false` when the ring is empty
    fn consume_one(&mut self) -> Result<bool, WorkerError> {
        match self.consumer.try_dequeue() {
            Ok(Some(block)) => {
                self.process(block);
                if self.spec.dequeue_mode == DequeueMode::Blocking {
                    self.consumer.wake_producer();
                }
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(e) => {
                self.meta().stats.violations.fetch_add(1, Ordering::Relaxed);
                Err(self.violation(e.to_string()))
            }
        }
    }

    fn process(&mut self, block: BlockHandle) {
        let id = self.spec.id;
        let arena = &*self.arena;
        let pool = arena.pool();
        let stats = &arena.ring_meta(id).stats;

        if let Err(e) = pool.transition(&block, OwnerState::InFlight, OwnerState::Held(id)) {
            stats.violations.fetch_add(1, Ordering::Relaxed);
            error!(
                "Worker {} dequeued block {} it cannot own: {} (t={}ns)",
                id,
                block.index(),
                e,
                monotonic_nanos()
            );
            // A block held by another worker is that worker's to release
            if !matches!(pool.owner(&block), Some(OwnerState::Held(other)) if other != id) {
                let seq = pool.view(&block).seq;
                if let Err(e) = pool.release(block) {
                    debug!("Worker {} could not return unowned block: {}", id, e);
                }
                stats.observe_seq(seq);
                stats.drops_observed.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }

        let view = pool.view(&block);
        let started = monotonic_nanos();
        let result = self.analyzer.analyze(view);
        let busy = monotonic_nanos().saturating_sub(started);

        let class = match result {
            Ok(class) => Some(class.0),
            Err(e) => {
                debug!("Worker {} analyzer error on block {}: {}", id, view.index, e);
                None
            }
        };
        let len = view.len();
        let seq = view.seq;
        let enqueued_at = view.enqueued_at_ns;

        match pool.release(block) {
            Ok(()) => {
                stats.released.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                stats.violations.fetch_add(1, Ordering::Relaxed);
                error!("Worker {} failed to release block: {}", id, e);
            }
        }

        let latency = monotonic_nanos().saturating_sub(enqueued_at);
        stats.observe_seq(seq);
        stats.record(len, class, busy, latency);

        self.processed += 1;
        if self.processed % HEARTBEAT_EVERY == 0 {
            arena
                .ring_meta(id)
                .control
                .state()
                .beat(monotonic_nanos());
        }
    }

    /// Back off on an empty ring; returns `true` after a park or yield
    fn idle(&self, idle_polls: u32) -> bool {
        if idle_polls < self.spec.spin_limit {
            std::hint::spin_loop();
            return false;
        }
        match self.spec.dequeue_mode {
            DequeueMode::Spin => std::thread::yield_now(),
            DequeueMode::Blocking => {
                let control = &self.meta().control;
                self.consumer
                    .wait_for_data(self.spec.park_timeout, || control.has_pending());
                control.state().beat(monotonic_nanos());
            }
        }
        true
    }

    fn park_paused(&self) {
        let meta = self.meta();
        meta.data_available
            .wait_until(self.spec.park_timeout, || meta.control.has_pending());
        meta.control.state().beat(monotonic_nanos());
    }

    fn count_violation(&self, detail: &str) {
        self.meta().stats.violations.fetch_add(1, Ordering::Relaxed);
        self.arena.record_violation();
        warn!(
            "Worker {} invariant violation: {} (t={}ns)",
            self.spec.id,
            detail,
            monotonic_nanos()
        );
    }

    fn violation(&self, detail: String) -> WorkerError {
        self.arena.record_violation();
        error!(
            "Worker {} stopping on invariant violation: {} (t={}ns)",
            self.spec.id,
            detail,
            monotonic_nanos()
        );
        WorkerError::Violation {
            worker: self.spec.id,
            detail,
        }
    }
}

/// Attach and run a worker; returns its exit code
///
/// This is the body of every worker process or thread.
pub fn run_worker<F>(spec: WorkerSpec, arena: Arc<SharedArena>, factory: F) -> i32
where
    F: FnOnce(u32) -> Box<dyn Analyzer>,
{
    let id = spec.id;
    if let Some(core) = spec.pin_core {
        match affinity::pin_to_cpu(core) {
            Ok(()) => debug!("Worker {} pinned to CPU {}", id, core),
            Err(e) => warn!("Failed to pin worker {} to CPU {}: {}", id, core, e),
        }
    }

    let analyzer = factory(id);
    let worker = match Worker::attach(spec, arena, analyzer) {
        Ok(worker) => worker,
        Err(e) => {
            error!("{}", e);
            return exit_code::ATTACH;
        }
    };

    match worker.run() {
        Ok(exit) => exit.code(),
        Err(_) => exit_code::VIOLATION,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nrflow_core::analyzer::{AnalysisError, AnalysisResult, Classification};
    use nrflow_core::arena::SegmentBacking;
    use nrflow_core::layout::ArenaGeometry;
    use nrflow_core::pool::BlockView;
    use std::thread;
    use std::time::Instant;

    use crate::producer::Producer;

    fn arena() -> Arc<SharedArena> {
        Arc::new(
            SharedArena::create(
                ArenaGeometry {
                    block_size: 64,
                    block_count: 32,
                    ring_count: 1,
                    ring_capacity: 16,
                },
                SegmentBacking::Anonymous,
            )
            .unwrap(),
        )
    }

    fn spec(mode: DequeueMode) -> WorkerSpec {
        WorkerSpec {
            id: 0,
            dequeue_mode: mode,
            spin_limit: 8,
            park_timeout: Duration::from_millis(5),
            drain_backlog: false,
            start_paused: false,
            pin_core: None,
        }
    }

    fn by_first_byte(block: BlockView<'_>) -> AnalysisResult {
        match block.data.first() {
            Some(&b) if b < 8 => Ok(Classification(b)),
            Some(_) => Err(AnalysisError::Malformed("class out of range")),
            None => Err(AnalysisError::Malformed("empty")),
        }
    }

    fn spawning(arena: &SharedArena) {
        arena
            .ring_meta(0)
            .control
            .state()
            .transition(WorkerState::Spawning)
            .unwrap();
    }

    fn wait_for<F: Fn() -> bool>(what: &str, f: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !f() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn post(arena: &SharedArena, command: Command) -> u64 {
        let meta = arena.ring_meta(0);
        let seq = meta.control.post(0, command, 0, 0).unwrap();
        meta.data_available.notify_if_waiting();
        seq
    }

    #[test]
    fn test_worker_consumes_and_drains() {
        for mode in [DequeueMode::Spin, DequeueMode::Blocking] {
            let arena = arena();
            spawning(&arena);
            let config = PipelineConfig {
                dequeue_mode: mode,
                ..Default::default()
            };
            let mut producer = Producer::new(arena.clone(), &config).unwrap();

            let worker_arena = arena.clone();
            let handle = thread::spawn(move || {
                run_worker(spec(mode), worker_arena, |_| Box::new(by_first_byte))
            });

            for i in 0..10u8 {
                assert!(producer.submit(&[i % 3, 0xAA]).unwrap().is_enqueued());
            }
            producer.submit(&[200]).unwrap();

            let stats = &arena.ring_meta(0).stats;
            wait_for("consumption", || stats.consumed.load(Ordering::Relaxed) == 11);

            let seq = post(&arena, Command::Drain);
            assert_eq!(handle.join().unwrap(), exit_code::OK);
            assert!(arena.ring_meta(0).control.acked() >= seq);

            let counters = stats.snapshot();
            assert_eq!(counters.released, 11);
            assert_eq!(counters.analyze_errors, 1);
            assert_eq!(counters.classes[0], 4);
            assert_eq!(counters.classes[1], 3);
            assert_eq!(counters.classes[2], 3);
            assert_eq!(counters.bytes, 21);
            assert_eq!(
                arena.ring_meta(0).control.state().get(),
                WorkerState::Exited
            );
            assert!(arena.pool().census().is_quiescent());
        }
    }

    #[test]
    fn test_pause_holds_blocks_in_ring() {
        let arena = arena();
        spawning(&arena);
        let config = PipelineConfig::default();
        let mut producer = Producer::new(arena.clone(), &config).unwrap();

        let mut worker_spec = spec(DequeueMode::Blocking);
        worker_spec.start_paused = true;
        let worker_arena = arena.clone();
        let handle =
            thread::spawn(move || run_worker(worker_spec, worker_arena, |_| Box::new(by_first_byte)));

        let state = arena.ring_meta(0).control.state();
        wait_for("paused", || state.get() == WorkerState::Paused);
        for _ in 0..5 {
            producer.submit(&[1]).unwrap();
        }
        thread::sleep(Duration::from_millis(30));
        assert_eq!(arena.ring_meta(0).stats.consumed.load(Ordering::Relaxed), 0);

        post(&arena, Command::Start);
        wait_for("consumption", || {
            arena.ring_meta(0).stats.consumed.load(Ordering::Relaxed) == 5
        });

        post(&arena, Command::Shutdown);
        assert_eq!(handle.join().unwrap(), exit_code::SHUTDOWN);
        assert!(state.forced());
        assert_eq!(state.get(), WorkerState::Exited);
    }

    #[test]
    fn test_drain_with_backlog() {
        let arena = arena();
        spawning(&arena);
        let config = PipelineConfig::default();
        let mut producer = Producer::new(arena.clone(), &config).unwrap();

        let mut worker_spec = spec(DequeueMode::Blocking);
        worker_spec.start_paused = true;
        worker_spec.drain_backlog = true;
        let worker_arena = arena.clone();
        let handle =
            thread::spawn(move || run_worker(worker_spec, worker_arena, |_| Box::new(by_first_byte)));

        let state = arena.ring_meta(0).control.state();
        wait_for("paused", || state.get() == WorkerState::Paused);
        for _ in 0..7 {
            producer.submit(&[2]).unwrap();
        }
        // Paused -> Draining is allowed; the backlog is finished first
        post(&arena, Command::Drain);
        assert_eq!(handle.join().unwrap(), exit_code::OK);
        assert_eq!(arena.ring_meta(0).stats.consumed.load(Ordering::Relaxed), 7);
        assert!(arena.pool().census().is_quiescent());
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        assert_eq!(WorkerExit::Drained.code(), exit_code::OK);
        assert_eq!(WorkerExit::Forced.code(), exit_code::SHUTDOWN);
        let codes = [
            exit_code::OK,
            exit_code::SHUTDOWN,
            exit_code::VIOLATION,
            exit_code::ATTACH,
            exit_code::PANIC,
        ];
        for (i, a) in codes.iter().enumerate() {
            assert!(codes[i + 1..].iter().all(|b| b != a));
        }
    }

    #[test]
    fn test_unowned_block_is_returned_and_counted() {
        let arena = arena();
        spawning(&arena);
        let pool = arena.pool();

        // Published without the Filling -> InFlight hand-off
        let mut raw = nrflow_core::ring_buffer::RingProducer::claim(arena.clone(), 0).unwrap();
        let mut block = pool.acquire().unwrap();
        {
            let mut data = pool.block_mut(&mut block);
            data.fill(&[1]).unwrap();
            data.set_meta(0, 1, monotonic_nanos());
        }
        assert!(matches!(
            raw.try_enqueue(block).unwrap(),
            nrflow_core::ring_buffer::Enqueue::Published(0)
        ));

        let worker_arena = arena.clone();
        let handle = thread::spawn(move || {
            run_worker(spec(DequeueMode::Spin), worker_arena, |_| Box::new(by_first_byte))
        });

        let stats = &arena.ring_meta(0).stats;
        wait_for("drop", || stats.drops_observed.load(Ordering::Relaxed) == 1);
        post(&arena, Command::Drain);
        assert_eq!(handle.join().unwrap(), exit_code::OK);

        let counters = stats.snapshot();
        assert_eq!(counters.consumed, 0);
        assert_eq!(counters.violations, 1);
        assert!(pool.census().is_quiescent());
    }

    #[test]
    fn test_attach_requires_free_consumer() {
        let arena = arena();
        spawning(&arena);
        let _taken = RingConsumer::claim(arena.clone(), 0).unwrap();
        let code = run_worker(spec(DequeueMode::Spin), arena, |_| {
            Box::new(nrflow_core::analyzer::NullAnalyzer)
        });
        assert_eq!(code, exit_code::ATTACH);
    }

    #[test]
    fn test_attach_rejects_torn_down_arena() {
        let arena = arena();
        spawning(&arena);
        arena.unlink().unwrap();
        assert!(matches!(
            Worker::attach(
                spec(DequeueMode::Spin),
                arena,
                Box::new(nrflow_core::analyzer::NullAnalyzer)
            ),
            Err(WorkerError::Attach { worker: 0, .. })
        ));
    }

    #[test]
    fn test_repeated_commands_are_idempotent() {
        let arena = arena();
        spawning(&arena);
        let worker_arena = arena.clone();
        let handle = thread::spawn(move || {
            run_worker(spec(DequeueMode::Blocking), worker_arena, |_| {
                Box::new(nrflow_core::analyzer::NullAnalyzer)
            })
        });

        let state = arena.ring_meta(0).control.state();
        wait_for("running", || state.get() == WorkerState::Running);
        post(&arena, Command::Start);
        post(&arena, Command::Pause);
        post(&arena, Command::Pause);
        let seq = post(&arena, Command::StatsRequest);
        wait_for("ack", || arena.ring_meta(0).control.acked() >= seq);
        assert_eq!(state.get(), WorkerState::Paused);

        post(&arena, Command::Drain);
        assert_eq!(handle.join().unwrap(), exit_code::OK);
        assert_eq!(arena.ring_meta(0).stats.violations.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_invalid_transition_counted_not_fatal() {
        let arena = arena();
        spawning(&arena);
        // Queued before the worker exists, so both are read in one pass
        post(&arena, Command::Drain);
        post(&arena, Command::Pause);

        let worker_arena = arena.clone();
        let code = thread::spawn(move || {
            run_worker(spec(DequeueMode::Spin), worker_arena, |_| {
                Box::new(nrflow_core::analyzer::NullAnalyzer)
            })
        })
        .join()
        .unwrap();

        assert_eq!(code, exit_code::OK);
        let meta = arena.ring_meta(0);
        assert_eq!(meta.stats.violations.load(Ordering::Relaxed), 1);
        assert_eq!(arena.violations(), 1);
        assert_eq!(meta.control.state().get(), WorkerState::Exited);
        assert!(!meta.control.state().forced());
    }
}
