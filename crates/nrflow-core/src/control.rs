//! Control messages, worker lifecycle states and the per-worker mailbox.
//!
//! The mailbox is a small SPSC queue in the worker's ring metadata: the
//! parent is the only producer, the worker the only consumer. The worker
//! acknowledges each message by publishing its sequence number, which is what
//! `broadcast` waits on.
//!
//! Lifecycle:
//!
//! ```text
//! Idle → Spawning → Running ⇄ Paused
//!                      │         │
//!                      └─► Draining ─► Exited
//! any live state ─(forced)────────────► Exited
//! Exited ─(supervisor restart)─► Spawning
//! ```

use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::ControlError;
use crate::layout::CachePadded;

/// Slots in each control mailbox
pub const CONTROL_QUEUE_CAPACITY: usize = 16;

/// Target value meaning "every worker"
pub const BROADCAST: u32 = u32::MAX;

/// Control commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// Leave `Paused`
    Start,
    /// Suspend consumption
    Pause,
    /// Graceful stop
    Drain,
    /// Immediate stop
    Shutdown,
    /// Acknowledge so the parent can publish statistics
    StatsRequest,
}

impl Command {
    /// Wire code
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Command::Start => 1,
            Command::Pause => 2,
            Command::Drain => 3,
            Command::Shutdown => 4,
            Command::StatsRequest => 5,
        }
    }

    /// Decode a wire code
    ///
    /// # Errors
    ///
    /// Returns `ControlError::UnknownCommand` for unknown codes.
    pub fn from_code(code: u32) -> Result<Self, ControlError> {
        match code {
            1 => Ok(Command::Start),
            2 => Ok(Command::Pause),
            3 => Ok(Command::Drain),
            4 => Ok(Command::Shutdown),
            5 => Ok(Command::StatsRequest),
            other => Err(ControlError::UnknownCommand(other)),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::Start => "START",
            Command::Pause => "PAUSE",
            Command::Drain => "DRAIN",
            Command::Shutdown => "SHUTDOWN",
            Command::StatsRequest => "STATS_REQUEST",
        };
        f.write_str(name)
    }
}

/// Decoded control message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlMessage {
    /// Command
    pub command: Command,
    /// Worker id or `BROADCAST`
    pub target: u32,
    /// Command-specific payload
    pub payload: u64,
    /// Mailbox sequence number, acknowledged by the worker
    pub seq: u64,
}

/// Worker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// No worker attached to this ring
    Idle,
    /// Process/thread created, attaching
    Spawning,
    /// Consuming
    Running,
    /// Consumption suspended
    Paused,
    /// Finishing current work before exit
    Draining,
    /// Gone
    Exited,
}

impl WorkerState {
    const fn code(self) -> u32 {
        match self {
            WorkerState::Idle => 0,
            WorkerState::Spawning => 1,
            WorkerState::Running => 2,
            WorkerState::Paused => 3,
            WorkerState::Draining => 4,
            WorkerState::Exited => 5,
        }
    }

    fn from_code(code: u32) -> Self {
        match code {
            1 => WorkerState::Spawning,
            2 => WorkerState::Running,
            3 => WorkerState::Paused,
            4 => WorkerState::Draining,
            5 => WorkerState::Exited,
            _ => WorkerState::Idle,
        }
    }

    /// Short name for logs and errors
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            WorkerState::Idle => "IDLE",
            WorkerState::Spawning => "SPAWNING",
            WorkerState::Running => "RUNNING",
            WorkerState::Paused => "PAUSED",
            WorkerState::Draining => "DRAINING",
            WorkerState::Exited => "EXITED",
        }
    }

    /// Whether a worker process/thread is attached in this state
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(
            self,
            WorkerState::Spawning
                | WorkerState::Running
                | WorkerState::Paused
                | WorkerState::Draining
        )
    }

    /// Whether the state machine allows `self -> to`
    #[must_use]
    pub const fn can_transition(self, to: WorkerState, forced: bool) -> bool {
        use WorkerState::*;
        match (self, to) {
            (Idle | Exited, Spawning) => true,
            (Spawning, Running | Paused) => true,
            (Running, Paused) | (Paused, Running) => true,
            (Running | Paused, Draining) => true,
            (Draining, Exited) => true,
            (Spawning | Running | Paused, Exited) => forced,
            _ => false,
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Shared lifecycle cell of one worker
#[repr(C)]
#[derive(Debug, Default)]
pub struct WorkerStateCell {
    state: AtomicU32,
    forced: AtomicU32,
    pid: AtomicI32,
    _reserved: u32,
    heartbeat_ns: AtomicU64,
}

impl WorkerStateCell {
    /// Current state
    pub fn get(&self) -> WorkerState {
        WorkerState::from_code(self.state.load(Ordering::Acquire))
    }

    /// Whether the last exit was forced
    pub fn forced(&self) -> bool {
        self.forced.load(Ordering::Acquire) != 0
    }

    /// OS process id recorded at attach (0 in thread mode)
    pub fn pid(&self) -> i32 {
        self.pid.load(Ordering::Relaxed)
    }

    /// Record the attaching process
    pub fn set_pid(&self, pid: i32) {
        self.pid.store(pid, Ordering::Relaxed);
    }

    /// Last heartbeat, monotonic nanoseconds
    pub fn heartbeat_ns(&self) -> u64 {
        self.heartbeat_ns.load(Ordering::Relaxed)
    }

    /// Record a heartbeat
    pub fn beat(&self, now_ns: u64) {
        self.heartbeat_ns.store(now_ns, Ordering::Relaxed);
    }

    /// Move to `to`, validating against the state machine
    ///
    /// Returns the previous state.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::InvalidTransition` if the move is not allowed.
    pub fn transition(&self, to: WorkerState) -> Result<WorkerState, ControlError> {
        self.transition_inner(to, false)
    }

    /// Move to `Exited` from any live state, marking the exit forced
    ///
    /// Allocation-free and lock-free. Returns the previous state; already
    /// `Exited` is a no-op that leaves the forced flag untouched.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::InvalidTransition` from `Idle`.
    pub fn force_exit(&self) -> Result<WorkerState, ControlError> {
        let from = self.transition_inner(WorkerState::Exited, true)?;
        if from != WorkerState::Exited {
            self.forced.store(1, Ordering::Release);
        }
        Ok(from)
    }

    fn transition_inner(&self, to: WorkerState, forced: bool) -> Result<WorkerState, ControlError> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let from = WorkerState::from_code(current);
            if from == to && to != WorkerState::Spawning {
                return Ok(from);
            }
            if !from.can_transition(to, forced) {
                return Err(ControlError::InvalidTransition {
                    from: from.name(),
                    to: to.name(),
                });
            }
            match self.state.compare_exchange(
                current,
                to.code(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if to == WorkerState::Spawning {
                        self.forced.store(0, Ordering::Release);
                    }
                    return Ok(from);
                }
                Err(actual) => current = actual,
            }
        }
    }
}

#[repr(C)]
#[derive(Debug, Default)]
struct ControlSlot {
    command: AtomicU32,
    target: AtomicU32,
    payload: AtomicU64,
    seq: AtomicU64,
}

/// Parent → worker control queue plus acknowledgment and lifecycle cells
#[repr(C, align(64))]
pub struct ControlMailbox {
    tail: CachePadded<AtomicU64>,
    head: CachePadded<AtomicU64>,
    acked: CachePadded<AtomicU64>,
    state: CachePadded<WorkerStateCell>,
    slots: [ControlSlot; CONTROL_QUEUE_CAPACITY],
}

impl ControlMailbox {
    /// Lifecycle cell of the worker behind this mailbox
    pub fn state(&self) -> &WorkerStateCell {
        &self.state
    }

    /// Enqueue a command (parent side); returns its sequence number
    ///
    /// # Errors
    ///
    /// Returns `ControlError::MailboxFull` when the worker has not consumed
    /// `CONTROL_QUEUE_CAPACITY` earlier messages.
    pub fn post(
        &self,
        worker: u32,
        command: Command,
        target: u32,
        payload: u64,
    ) -> Result<u64, ControlError> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) >= CONTROL_QUEUE_CAPACITY as u64 {
            return Err(ControlError::MailboxFull { worker });
        }

        let seq = tail + 1;
        let slot = &self.slots[(tail as usize) % CONTROL_QUEUE_CAPACITY];
        slot.command.store(command.code(), Ordering::Relaxed);
        slot.target.store(target, Ordering::Relaxed);
        slot.payload.store(payload, Ordering::Relaxed);
        slot.seq.store(seq, Ordering::Relaxed);
        self.tail.store(seq, Ordering::Release);
        Ok(seq)
    }

    /// Whether messages are waiting (either side)
    pub fn has_pending(&self) -> bool {
        self.tail.load(Ordering::Acquire) != self.head.load(Ordering::Acquire)
    }

    /// Dequeue the next command (worker side)
    ///
    /// # Errors
    ///
    /// Returns `ControlError::UnknownCommand` if the slot holds a code this
    /// build does not know; the slot is consumed either way.
    pub fn poll(&self) -> Result<Option<ControlMessage>, ControlError> {
        let head = self.head.load(Ordering::Relaxed);
        if head == self.tail.load(Ordering::Acquire) {
            return Ok(None);
        }

        let slot = &self.slots[(head as usize) % CONTROL_QUEUE_CAPACITY];
        let code = slot.command.load(Ordering::Relaxed);
        let target = slot.target.load(Ordering::Relaxed);
        let payload = slot.payload.load(Ordering::Relaxed);
        let seq = slot.seq.load(Ordering::Relaxed);
        self.head.store(head + 1, Ordering::Release);

        let command = Command::from_code(code)?;
        Ok(Some(ControlMessage {
            command,
            target,
            payload,
            seq,
        }))
    }

    /// Acknowledge a processed message (worker side)
    pub fn ack(&self, seq: u64) {
        self.acked.fetch_max(seq, Ordering::AcqRel);
    }

    /// Highest acknowledged sequence number
    pub fn acked(&self) -> u64 {
        self.acked.load(Ordering::Acquire)
    }

    /// Discard unconsumed messages and align the acknowledgment cursor
    ///
    /// Only valid while no worker is attached (used before a respawn).
    pub fn reset_for_respawn(&self) {
        let tail = self.tail.load(Ordering::Acquire);
        self.head.store(tail, Ordering::Release);
        self.acked.store(tail, Ordering::Release);
    }
}
