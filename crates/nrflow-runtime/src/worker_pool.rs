//! Worker pool and supervisor.
//!
//! The pool creates the arena, spawns one worker per ring (forked process or
//! thread), routes control commands through the per-worker mailboxes, reaps
//! exited workers, reclaims what they left behind and runs the shutdown
//! protocol:
//!
//! 1. broadcast `DRAIN`, wait up to `drain_timeout` for every worker to exit
//! 2. broadcast `SHUTDOWN` to the rest, wait a grace period
//! 3. kill remaining processes (threads are marked exited and abandoned)
//! 4. reap, reclaim, snapshot, unlink the segment
//!
//! `shutdown` is idempotent: later calls return the first report.

use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nrflow_core::analyzer::Analyzer;
use nrflow_core::arena::{SegmentBacking, SharedArena};
use nrflow_core::clock::monotonic_nanos;
use nrflow_core::config::{FailurePolicy, PipelineConfig, SpawnMode};
use nrflow_core::control::{BROADCAST, Command, WorkerState};
use nrflow_core::error::ControlError;
use nrflow_core::ring_buffer::RingConsumer;
use nrflow_core::stats::{StatsAggregator, StatsSnapshot};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::cleanup;
use crate::control_server::{ControlRequest, ControlResponse};
use crate::error::{Result, RuntimeError};
use crate::producer::Producer;
use crate::worker::{WorkerSpec, exit_code, run_worker};

/// Builds the analyzer of worker `id`, inside the worker
pub type AnalyzerFactory = Arc<dyn Fn(u32) -> Box<dyn Analyzer> + Send + Sync>;

/// Respawns allowed per worker when restarts are enabled
pub const MAX_RESTARTS: u32 = 3;

/// Interval between reap attempts while waiting
const REAP_INTERVAL: Duration = Duration::from_millis(2);

/// Interval between acknowledgment checks
const ACK_INTERVAL: Duration = Duration::from_micros(200);

/// OS handle of a spawned worker
#[derive(Debug)]
pub enum WorkerHandle {
    /// Forked child process
    Process {
        /// Child pid
        pid: i32,
    },
    /// Thread in the parent process
    Thread(JoinHandle<i32>),
}

/// How a worker ended, as seen by the parent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Exited with a status code
    Code(i32),
    /// Terminated by a signal
    Signaled(i32),
    /// Thread panicked
    Panicked,
    /// Could not be waited for (not our child any more)
    Lost,
}

impl WorkerStatus {
    /// Whether this is the status of a clean exit
    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(
            self,
            WorkerStatus::Code(exit_code::OK | exit_code::SHUTDOWN)
        )
    }

    fn from_wait_status(status: libc::c_int) -> Self {
        if libc::WIFEXITED(status) {
            WorkerStatus::Code(libc::WEXITSTATUS(status))
        } else if libc::WIFSIGNALED(status) {
            WorkerStatus::Signaled(libc::WTERMSIG(status))
        } else {
            WorkerStatus::Lost
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerStatus::Code(code) => write!(f, "exit code {code}"),
            WorkerStatus::Signaled(signal) => write!(f, "killed by signal {signal}"),
            WorkerStatus::Panicked => f.write_str("panicked"),
            WorkerStatus::Lost => f.write_str("lost"),
        }
    }
}

/// An unexpected worker exit
#[derive(Debug, Clone, Serialize)]
pub struct WorkerFailure {
    /// Worker id
    pub worker: u32,
    /// How it ended
    pub status: WorkerStatus,
    /// Lifecycle state it was in when reaped
    pub state: WorkerState,
    /// Ring backlog returned to the pool
    pub reclaimed_ring: u32,
    /// Held blocks returned to the pool
    pub reclaimed_held: u32,
    /// Monotonic time of detection
    pub at_ns: u64,
}

/// Result of sending a command to several workers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastOutcome {
    /// Workers that acknowledged in time
    pub acked: Vec<u32>,
    /// Workers that did not (or could not be reached)
    pub missing: Vec<u32>,
}

impl BroadcastOutcome {
    /// Whether every addressed worker acknowledged
    #[must_use]
    pub fn all_acked(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Summary of a shutdown
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    /// Workers that completed DRAIN
    pub drained: u32,
    /// Workers that exited on SHUTDOWN
    pub forced: u32,
    /// Worker processes killed after the grace period
    pub killed: u32,
    /// Worker threads abandoned after the grace period
    pub leaked: u32,
    /// Blocks returned to the pool from rings and dead workers
    pub reclaimed_blocks: u32,
    /// Blocks held at forced termination or still unaccounted for
    pub leaked_blocks: u32,
    /// Unexpected exits over the whole run
    pub failures: Vec<WorkerFailure>,
    /// Statistics after the last worker was reaped
    pub final_stats: StatsSnapshot,
    /// Duration of the shutdown
    pub elapsed_ms: u64,
}

struct WorkerSlot {
    id: u32,
    handle: Option<WorkerHandle>,
    status: Option<WorkerStatus>,
    killed: bool,
    leaked: bool,
    restarts: u32,
}

/// Supervised pool of workers over one arena
pub struct WorkerPool {
    config: PipelineConfig,
    arena: Arc<SharedArena>,
    factory: AnalyzerFactory,
    slots: Vec<WorkerSlot>,
    aggregator: StatsAggregator,
    failures: Vec<WorkerFailure>,
    reclaimed_blocks: u32,
    leaked_blocks: u32,
    shutting_down: bool,
    report: Option<ShutdownReport>,
}

impl WorkerPool {
    /// Create the arena and spawn every worker
    ///
    /// In process mode this forks; call it before the process starts other
    /// threads.
    ///
    /// # Errors
    ///
    /// Returns a config error for invalid values, an arena error if the
    /// segment cannot be created, or `RuntimeError::Spawn` if a worker
    /// cannot be created (workers already started are shut down).
    pub fn start(
        config: PipelineConfig,
        backing: SegmentBacking,
        factory: AnalyzerFactory,
    ) -> Result<Self> {
        config.validate()?;
        let geometry = config.geometry();
        let arena = Arc::new(SharedArena::create(geometry, backing)?);
        cleanup::register_segment(arena.backing());
        cleanup::register_arena(&arena);

        info!(
            "Starting {} {:?} workers: {} blocks of {} bytes, ring capacity {}, segment {}",
            geometry.ring_count,
            config.spawn_mode,
            geometry.block_count,
            geometry.block_size,
            geometry.ring_capacity,
            arena.segment_name().as_deref().unwrap_or("anonymous"),
        );

        let slots = (0..geometry.ring_count)
            .map(|id| WorkerSlot {
                id,
                handle: None,
                status: None,
                killed: false,
                leaked: false,
                restarts: 0,
            })
            .collect();

        let mut pool = Self {
            aggregator: StatsAggregator::new(arena.clone()),
            config,
            arena,
            factory,
            slots,
            failures: Vec::new(),
            reclaimed_blocks: 0,
            leaked_blocks: 0,
            shutting_down: false,
            report: None,
        };

        for id in 0..geometry.ring_count {
            pool.spawn(id)?;
        }
        Ok(pool)
    }

    /// Configuration the pool runs with
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// The shared arena
    pub fn arena(&self) -> &Arc<SharedArena> {
        &self.arena
    }

    /// Number of workers (and rings)
    pub fn worker_count(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Workers not yet reaped
    pub fn live_workers(&self) -> u32 {
        self.slots.iter().filter(|s| s.handle.is_some()).count() as u32
    }

    /// Whether `shutdown` has completed
    pub fn is_shut_down(&self) -> bool {
        self.report.is_some()
    }

    /// Claim the producer side of every ring
    ///
    /// # Errors
    ///
    /// Fails if another producer exists.
    pub fn producer(&self) -> Result<Producer> {
        Producer::new(self.arena.clone(), &self.config)
    }

    fn spawn(&mut self, id: u32) -> Result<()> {
        let state = self.arena.ring_meta(id).control.state();
        state.transition(WorkerState::Spawning)?;
        let spec = WorkerSpec::from_config(id, &self.config);

        let spawned = match self.config.spawn_mode {
            SpawnMode::Process => self.spawn_process(spec),
            SpawnMode::Thread => self.spawn_thread(spec),
        };

        match spawned {
            Ok(handle) => {
                debug!("Spawned worker {} ({:?})", id, handle);
                let slot = &mut self.slots[id as usize];
                slot.handle = Some(handle);
                slot.status = None;
                Ok(())
            }
            Err(source) => {
                let _ = state.force_exit();
                error!("Failed to spawn worker {}: {}", id, source);
                Err(RuntimeError::Spawn { worker: id, source })
            }
        }
    }

    fn spawn_thread(&self, spec: WorkerSpec) -> io::Result<WorkerHandle> {
        let arena = self.arena.clone();
        let factory = self.factory.clone();
        let handle = thread::Builder::new()
            .name(format!("nrflow-worker-{}", spec.id))
            .spawn(move || run_worker(spec, arena, |id| factory(id)))?;
        Ok(WorkerHandle::Thread(handle))
    }

    fn spawn_process(&self, spec: WorkerSpec) -> io::Result<WorkerHandle> {
        let id = spec.id;
        // SAFETY: the child only runs the worker loop over memory it
        // inherited and leaves through _exit, never returning into the
        // caller's stack.
        let pid = unsafe { libc::fork() };
        match pid {
            -1 => Err(io::Error::last_os_error()),
            0 => {
                cleanup::detach_child();
                let arena = self.arena.clone();
                let factory = self.factory.clone();
                let code = panic::catch_unwind(AssertUnwindSafe(move || {
                    run_worker(spec, arena, |id| factory(id))
                }))
                .unwrap_or(exit_code::PANIC);
                // SAFETY: skip destructors; the parent owns the segment.
                unsafe { libc::_exit(code) }
            }
            pid => {
                cleanup::register_pid(id, pid);
                Ok(WorkerHandle::Process { pid })
            }
        }
    }

    /// Send `command` to one worker and wait for its acknowledgment
    ///
    /// # Errors
    ///
    /// Returns `ControlError::NoSuchWorker` for an unknown id and
    /// `RuntimeError::ShutDown` after shutdown.
    pub fn send_to(&self, worker: u32, command: Command) -> Result<BroadcastOutcome> {
        if self.report.is_some() {
            return Err(RuntimeError::ShutDown);
        }
        if worker >= self.worker_count() {
            return Err(ControlError::NoSuchWorker(worker).into());
        }
        Ok(self.dispatch(&[worker], command, worker))
    }

    /// Send `command` to every worker and wait for acknowledgments
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::ShutDown` after shutdown.
    pub fn broadcast(&self, command: Command) -> Result<BroadcastOutcome> {
        if self.report.is_some() {
            return Err(RuntimeError::ShutDown);
        }
        let all: Vec<u32> = (0..self.worker_count()).collect();
        Ok(self.dispatch(&all, command, BROADCAST))
    }

    fn dispatch(&self, workers: &[u32], command: Command, target: u32) -> BroadcastOutcome {
        let mut outcome = BroadcastOutcome::default();
        let mut pending = Vec::with_capacity(workers.len());

        for &id in workers {
            let meta = self.arena.ring_meta(id);
            if !meta.control.state().get().is_live() {
                outcome.missing.push(id);
                continue;
            }
            match meta.control.post(id, command, target, 0) {
                Ok(seq) => {
                    meta.data_available.notify_if_waiting();
                    pending.push((id, seq));
                }
                Err(e) => {
                    warn!("Cannot deliver {} to worker {}: {}", command, id, e);
                    outcome.missing.push(id);
                }
            }
        }

        let deadline = Instant::now() + self.config.ack_timeout();
        loop {
            pending.retain(|&(id, seq)| {
                let acked = self.arena.ring_meta(id).control.acked() >= seq;
                if acked {
                    outcome.acked.push(id);
                }
                !acked
            });
            if pending.is_empty() || Instant::now() >= deadline {
                break;
            }
            thread::sleep(ACK_INTERVAL);
        }

        outcome.missing.extend(pending.iter().map(|&(id, _)| id));
        outcome.acked.sort_unstable();
        outcome.missing.sort_unstable();
        if !outcome.missing.is_empty() {
            debug!("{} not acknowledged by workers {:?}", command, outcome.missing);
        }
        outcome
    }

    /// Aggregated statistics
    pub fn stats(&mut self) -> StatsSnapshot {
        self.aggregator.snapshot()
    }

    /// Ping live workers with `STATS_REQUEST`, then aggregate
    pub fn stats_request(&mut self) -> (BroadcastOutcome, StatsSnapshot) {
        let outcome = if self.report.is_some() {
            BroadcastOutcome::default()
        } else {
            let live: Vec<u32> = self.live_ids();
            self.dispatch(&live, Command::StatsRequest, BROADCAST)
        };
        (outcome, self.aggregator.snapshot())
    }

    /// Serve one control-socket request
    pub fn handle_request(&mut self, request: &ControlRequest) -> ControlResponse {
        if request.command == Command::StatsRequest {
            let (outcome, snapshot) = self.stats_request();
            return ControlResponse::with_stats(outcome, &snapshot);
        }
        let result = match request.worker {
            Some(worker) => self.send_to(worker, request.command),
            None => self.broadcast(request.command),
        };
        match result {
            Ok(outcome) => ControlResponse::from_outcome(outcome),
            Err(e) => ControlResponse::error(e.to_string()),
        }
    }

    fn live_ids(&self) -> Vec<u32> {
        self.slots
            .iter()
            .filter(|s| s.handle.is_some())
            .map(|s| s.id)
            .collect()
    }

    /// Reap exited workers and apply the failure policy
    ///
    /// Returns the failures detected by this call.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::WorkerFailed` on the first failure when the
    /// policy is fail-fast.
    pub fn poll(&mut self) -> Result<Vec<WorkerFailure>> {
        let failures = self.reap_exited();

        for failure in &failures {
            if self.config.failure_policy == FailurePolicy::FailFast {
                return Err(RuntimeError::WorkerFailed {
                    worker: failure.worker,
                    status: failure.status,
                });
            }
            if self.config.restart_failed_workers && !self.shutting_down {
                self.restart(failure.worker);
            }
        }
        Ok(failures)
    }

    fn restart(&mut self, id: u32) {
        let slot = &mut self.slots[id as usize];
        if slot.restarts >= MAX_RESTARTS {
            warn!(
                "Worker {} failed {} times; leaving its ring closed",
                id, slot.restarts
            );
            return;
        }
        slot.restarts += 1;
        let attempt = slot.restarts;

        self.arena.ring_meta(id).control.reset_for_respawn();
        match self.spawn(id) {
            Ok(()) => info!("Restarted worker {} (attempt {})", id, attempt),
            Err(e) => error!("Restart of worker {} failed: {}", id, e),
        }
    }

    fn reap_exited(&mut self) -> Vec<WorkerFailure> {
        let mut failures = Vec::new();
        for index in 0..self.slots.len() {
            if let Some(status) = self.try_reap(index) {
                if let Some(failure) = self.on_exit(index, status) {
                    failures.push(failure);
                }
            }
        }
        failures
    }

    /// Non-blocking reap; takes the handle when the worker is gone
    fn try_reap(&mut self, index: usize) -> Option<WorkerStatus> {
        let slot = &mut self.slots[index];
        let waited = match slot.handle.as_ref()? {
            WorkerHandle::Process { pid } => {
                let mut raw: libc::c_int = 0;
                // SAFETY: pid is a child of this process; raw is a valid out
                // pointer.
                let ret = unsafe { libc::waitpid(*pid, &mut raw, libc::WNOHANG) };
                match ret {
                    0 => return None,
                    -1 => Some(WorkerStatus::Lost),
                    _ => Some(WorkerStatus::from_wait_status(raw)),
                }
            }
            WorkerHandle::Thread(handle) if handle.is_finished() => None,
            WorkerHandle::Thread(_) => return None,
        };

        let status = match (waited, slot.handle.take()) {
            (Some(status), _) => status,
            (None, Some(WorkerHandle::Thread(handle))) => match handle.join() {
                Ok(code) => WorkerStatus::Code(code),
                Err(_) => WorkerStatus::Panicked,
            },
            (None, _) => WorkerStatus::Lost,
        };
        Some(status)
    }

    /// Account for a reaped worker; returns a failure for unexpected exits
    fn on_exit(&mut self, index: usize, status: WorkerStatus) -> Option<WorkerFailure> {
        let id = self.slots[index].id;
        let state = self.arena.ring_meta(id).control.state().get();
        let clean = status.is_success() && state == WorkerState::Exited;
        let (reclaimed_ring, reclaimed_held) = self.settle(index, status, false);

        if clean {
            debug!(
                "Worker {} exited ({}), {} ring blocks reclaimed",
                id, status, reclaimed_ring
            );
            return None;
        }

        let failure = WorkerFailure {
            worker: id,
            status,
            state,
            reclaimed_ring,
            reclaimed_held,
            at_ns: monotonic_nanos(),
        };
        let counters = self.arena.ring_meta(id).stats.snapshot();
        error!(
            "Worker {} failed ({}) in state {} at t={}ns: consumed {}, released {}, violations {}; reclaimed {} ring + {} held blocks",
            id,
            status,
            state,
            failure.at_ns,
            counters.consumed,
            counters.released,
            counters.violations,
            reclaimed_ring,
            reclaimed_held
        );
        self.failures.push(failure.clone());
        Some(failure)
    }

    /// Mark the worker gone and return its ring backlog and held blocks
    ///
    /// Held blocks count as leaked instead of reclaimed when `held_leaked`.
    fn settle(&mut self, index: usize, status: WorkerStatus, held_leaked: bool) -> (u32, u32) {
        let id = self.slots[index].id;
        self.slots[index].status = Some(status);
        cleanup::unregister_pid(id);

        let state = self.arena.ring_meta(id).control.state();
        if state.get().is_live() {
            let _ = state.force_exit();
        }

        let arena = self.arena.clone();
        let consumer = RingConsumer::claim(arena.clone(), id).or_else(|_| {
            // SAFETY: the worker was reaped, so its consumer is gone and the
            // pool is the only party touching this ring's consumer side.
            unsafe { RingConsumer::force_claim(arena.clone(), id) }
        });
        let reclaimed_ring = match consumer {
            Ok(mut consumer) => match consumer.drain_into_pool() {
                Ok(n) => n,
                Err(e) => {
                    arena.record_violation();
                    error!("Cannot reclaim ring {}: {}", id, e);
                    0
                }
            },
            Err(e) => {
                error!("Cannot claim ring {} for reclamation: {}", id, e);
                0
            }
        };
        let reclaimed_held = arena.pool().reclaim_held_by(id);

        if held_leaked {
            self.reclaimed_blocks += reclaimed_ring;
            self.leaked_blocks += reclaimed_held;
        } else {
            self.reclaimed_blocks += reclaimed_ring + reclaimed_held;
        }
        (reclaimed_ring, reclaimed_held)
    }

    /// Reap until every worker is gone or `timeout` passes
    fn reap_for(&mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            self.reap_exited();
            if self.live_workers() == 0 || Instant::now() >= deadline {
                return;
            }
            thread::sleep(REAP_INTERVAL);
        }
    }

    /// Run the shutdown protocol (idempotent)
    pub fn shutdown(&mut self) -> ShutdownReport {
        if let Some(report) = &self.report {
            return report.clone();
        }
        let started = Instant::now();
        self.shutting_down = true;
        info!("Shutting down {} live workers", self.live_workers());

        let live = self.live_ids();
        if !live.is_empty() {
            let outcome = self.dispatch(&live, Command::Drain, BROADCAST);
            debug!("DRAIN acknowledged by {:?}", outcome.acked);
            self.reap_for(self.config.drain_timeout());
        }

        let remaining = self.live_ids();
        if !remaining.is_empty() {
            warn!(
                "Workers {:?} did not drain within {:?}; sending SHUTDOWN",
                remaining,
                self.config.drain_timeout()
            );
            self.dispatch(&remaining, Command::Shutdown, BROADCAST);
            self.reap_for(self.config.ack_timeout());
        }

        self.kill_remaining();

        let final_stats = self.aggregator.snapshot();
        let census = final_stats.pool;
        self.leaked_blocks += census.total.saturating_sub(census.free);
        if !census.is_quiescent() {
            warn!(
                "Pool not quiescent at shutdown: {} free of {}, {} in flight, {} held",
                census.free, census.total, census.in_flight, census.held
            );
        }

        match self.arena.unlink() {
            Ok(_) => {}
            Err(e) => warn!("Failed to unlink segment: {}", e),
        }
        cleanup::disarm();

        let report = self.build_report(final_stats, started.elapsed());
        info!(
            "Shutdown complete in {} ms: {} drained, {} forced, {} killed, {} leaked; {} blocks reclaimed, {} leaked",
            report.elapsed_ms,
            report.drained,
            report.forced,
            report.killed,
            report.leaked,
            report.reclaimed_blocks,
            report.leaked_blocks
        );
        self.report = Some(report.clone());
        report
    }

    fn kill_remaining(&mut self) {
        for index in 0..self.slots.len() {
            if let Some(status) = self.try_reap(index) {
                self.on_exit(index, status);
                continue;
            }
            let id = self.slots[index].id;
            match self.slots[index].handle.take() {
                None => {}
                Some(WorkerHandle::Process { pid }) => {
                    warn!("Killing worker {} (pid {})", id, pid);
                    let mut raw: libc::c_int = 0;
                    // SAFETY: pid is our unreaped child; waiting blocks only
                    // until the SIGKILL is delivered.
                    let status = unsafe {
                        libc::kill(pid, libc::SIGKILL);
                        if libc::waitpid(pid, &mut raw, 0) == pid {
                            WorkerStatus::from_wait_status(raw)
                        } else {
                            WorkerStatus::Lost
                        }
                    };
                    self.slots[index].killed = true;
                    self.settle(index, status, true);
                }
                Some(WorkerHandle::Thread(_detached)) => {
                    // Still inside the analyzer; it sees EXITED when it
                    // returns and keeps its arena mapping alive until then.
                    warn!("Abandoning worker thread {}", id);
                    let _ = self.arena.ring_meta(id).control.state().force_exit();
                    self.slots[index].leaked = true;
                }
            }
        }
    }

    fn build_report(&self, final_stats: StatsSnapshot, elapsed: Duration) -> ShutdownReport {
        let mut report = ShutdownReport {
            drained: 0,
            forced: 0,
            killed: 0,
            leaked: 0,
            reclaimed_blocks: self.reclaimed_blocks,
            leaked_blocks: self.leaked_blocks,
            failures: self.failures.clone(),
            final_stats,
            elapsed_ms: elapsed.as_millis() as u64,
        };

        for slot in &self.slots {
            if slot.leaked {
                report.leaked += 1;
            } else if slot.killed {
                report.killed += 1;
            } else {
                match slot.status {
                    Some(WorkerStatus::Code(exit_code::SHUTDOWN)) => report.forced += 1,
                    Some(WorkerStatus::Code(exit_code::OK)) => report.drained += 1,
                    _ => {}
                }
            }
        }
        report
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.report.is_none() {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nrflow_core::analyzer::{AnalysisResult, Classification, NullAnalyzer};
    use nrflow_core::config::DequeueMode;
    use nrflow_core::pool::BlockView;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn config(workers: u32) -> PipelineConfig {
        PipelineConfig {
            workers,
            ring_capacity: 16,
            block_size: 64,
            block_count: 64,
            spawn_mode: SpawnMode::Thread,
            dequeue_mode: DequeueMode::Blocking,
            park_timeout_ms: 5,
            drain_timeout_ms: 1000,
            ack_timeout_ms: 1000,
            ..Default::default()
        }
    }

    fn null_factory() -> AnalyzerFactory {
        Arc::new(|_: u32| Box::new(NullAnalyzer) as Box<dyn Analyzer>)
    }

    fn wait_for<F: FnMut() -> bool>(what: &str, mut f: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !f() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_start_submit_shutdown() {
        let mut pool = WorkerPool::start(config(2), SegmentBacking::Anonymous, null_factory())
            .unwrap();
        let mut producer = pool.producer().unwrap();
        for i in 0..20u8 {
            assert!(producer.submit(&[i]).unwrap().is_enqueued());
        }
        wait_for("consumption", || pool.stats().totals.consumed == 20);
        drop(producer);

        let report = pool.shutdown();
        assert_eq!(report.drained, 2);
        assert_eq!(report.forced + report.killed + report.leaked, 0);
        assert!(report.failures.is_empty());
        assert_eq!(report.leaked_blocks, 0);
        assert_eq!(report.final_stats.totals.consumed, 20);
        assert!(report.final_stats.pool.is_quiescent());
        assert_eq!(pool.live_workers(), 0);
    }

    #[test]
    fn test_shutdown_twice_returns_first_report() {
        let mut pool = WorkerPool::start(config(2), SegmentBacking::Anonymous, null_factory())
            .unwrap();
        let first = pool.shutdown();
        let second = pool.shutdown();
        assert_eq!(first.drained, second.drained);
        assert_eq!(first.elapsed_ms, second.elapsed_ms);
        assert!(pool.is_shut_down());
        assert!(matches!(
            pool.broadcast(Command::Pause),
            Err(RuntimeError::ShutDown)
        ));
    }

    #[test]
    fn test_shutdown_exit_is_forced_not_failed() {
        assert!(WorkerStatus::Code(exit_code::OK).is_success());
        assert!(WorkerStatus::Code(exit_code::SHUTDOWN).is_success());
        assert!(!WorkerStatus::Code(exit_code::VIOLATION).is_success());

        let mut pool = WorkerPool::start(config(2), SegmentBacking::Anonymous, null_factory())
            .unwrap();
        let outcome = pool.send_to(1, Command::Shutdown).unwrap();
        assert_eq!(outcome.acked, vec![1]);
        wait_for("exit", || {
            assert!(pool.poll().unwrap().is_empty());
            pool.live_workers() == 1
        });

        let report = pool.shutdown();
        assert_eq!(report.forced, 1);
        assert_eq!(report.drained, 1);
        assert!(report.failures.is_empty());
        assert_eq!(report.leaked_blocks, 0);
    }

    #[test]
    fn test_broadcast_pause_and_start() {
        let pool = WorkerPool::start(config(3), SegmentBacking::Anonymous, null_factory())
            .unwrap();
        let outcome = pool.broadcast(Command::Pause).unwrap();
        assert_eq!(outcome.acked, vec![0, 1, 2]);
        assert!(outcome.all_acked());
        for id in 0..3 {
            assert_eq!(
                pool.arena().ring_meta(id).control.state().get(),
                WorkerState::Paused
            );
        }
        let outcome = pool.send_to(1, Command::Start).unwrap();
        assert_eq!(outcome.acked, vec![1]);
        assert!(matches!(
            pool.send_to(9, Command::Start),
            Err(RuntimeError::Control(ControlError::NoSuchWorker(9)))
        ));
    }

    #[test]
    fn test_panicking_worker_is_reclaimed() {
        let explode = Arc::new(AtomicBool::new(false));
        let trigger = explode.clone();
        let factory: AnalyzerFactory = Arc::new(move |_: u32| {
            let trigger = trigger.clone();
            Box::new(move |block: BlockView<'_>| -> AnalysisResult {
                if trigger.load(Ordering::Relaxed) && block.data.first() == Some(&0xFF) {
                    panic!("analyzer exploded");
                }
                Ok(Classification(0))
            }) as Box<dyn Analyzer>
        });

        let mut pool =
            WorkerPool::start(config(1), SegmentBacking::Anonymous, factory).unwrap();
        let mut producer = pool.producer().unwrap();
        explode.store(true, Ordering::Relaxed);
        producer.submit(&[0xFF]).unwrap();

        let mut failures = Vec::new();
        wait_for("failure", || {
            failures.extend(pool.poll().unwrap());
            !failures.is_empty()
        });
        assert_eq!(failures[0].worker, 0);
        assert_eq!(failures[0].status, WorkerStatus::Panicked);
        assert_eq!(failures[0].reclaimed_held, 1);
        assert!(pool.arena().pool().census().is_quiescent());
        assert_eq!(producer.open_rings(), 0);

        let report = pool.shutdown();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.drained, 0);
    }

    #[test]
    fn test_fail_fast_policy() {
        let factory: AnalyzerFactory = Arc::new(|_: u32| {
            Box::new(|_: BlockView<'_>| -> AnalysisResult { panic!("boom") }) as Box<dyn Analyzer>
        });
        let mut cfg = config(1);
        cfg.failure_policy = FailurePolicy::FailFast;
        let mut pool = WorkerPool::start(cfg, SegmentBacking::Anonymous, factory).unwrap();
        let mut producer = pool.producer().unwrap();
        producer.submit(&[1]).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let err = loop {
            match pool.poll() {
                Err(e) => break e,
                Ok(_) => {
                    assert!(Instant::now() < deadline, "no failure reported");
                    thread::sleep(Duration::from_millis(1));
                }
            }
        };
        assert!(matches!(
            err,
            RuntimeError::WorkerFailed {
                worker: 0,
                status: WorkerStatus::Panicked
            }
        ));
    }

    #[test]
    fn test_restart_failed_worker() {
        let explode = Arc::new(AtomicBool::new(true));
        let trigger = explode.clone();
        let factory: AnalyzerFactory = Arc::new(move |_: u32| {
            let trigger = trigger.clone();
            Box::new(move |_: BlockView<'_>| -> AnalysisResult {
                if trigger.swap(false, Ordering::Relaxed) {
                    panic!("first block kills the worker");
                }
                Ok(Classification(1))
            }) as Box<dyn Analyzer>
        });
        let mut cfg = config(1);
        cfg.restart_failed_workers = true;
        let mut pool = WorkerPool::start(cfg, SegmentBacking::Anonymous, factory).unwrap();
        let mut producer = pool.producer().unwrap();
        producer.submit(&[1]).unwrap();

        let mut failures = Vec::new();
        wait_for("failure", || {
            failures.extend(pool.poll().unwrap());
            !failures.is_empty()
        });
        let state = pool.arena().ring_meta(0).control.state();
        wait_for("restart", || state.get() == WorkerState::Running);
        assert!(!state.forced());

        assert!(producer.submit(&[2]).unwrap().is_enqueued());
        wait_for("consumption", || pool.stats().totals.classes[1] == 1);

        let report = pool.shutdown();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.drained, 1);
    }

    #[test]
    fn test_stats_request_through_control_request() {
        let mut pool = WorkerPool::start(config(2), SegmentBacking::Anonymous, null_factory())
            .unwrap();
        let response = pool.handle_request(&ControlRequest {
            command: Command::StatsRequest,
            worker: None,
        });
        assert!(response.ok);
        assert_eq!(response.acked, vec![0, 1]);
        assert!(response.stats.is_some());

        let response = pool.handle_request(&ControlRequest {
            command: Command::Pause,
            worker: Some(7),
        });
        assert!(!response.ok);
        assert!(response.error.is_some());
    }
}
