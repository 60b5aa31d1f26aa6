//! # nrflow Core
//!
//! Shared-memory transport for a multi-process network-traffic analysis
//! pipeline. One producer process generates messages into fixed-size blocks;
//! N worker processes analyze them. Payload bytes never cross a process
//! boundary: only 32-bit block indices travel through the rings.
//!
//! This crate provides:
//! - The shared-memory arena (create, attach, validate, teardown)
//! - A lock-free fixed-block memory pool with ABA-safe free list
//! - Per-worker SPSC rings of block indices
//! - Futex-backed wakeups for blocking dequeue
//! - Control mailboxes and the worker lifecycle state machine
//! - Per-worker statistics and the aggregator
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  acquire/fill   ┌──────────────────────────────┐
//! │   Producer   │ ───────────────►│  MemoryPool (free list)      │
//! │   (parent)   │                 └──────────────▲───────────────┘
//! └──────┬───────┘                                │ release
//!        │ enqueue(index)                         │
//!        ▼                                        │
//! ┌──────────────┐ ┌──────────────┐        ┌──────┴───────┐
//! │   Ring 0     │ │   Ring 1     │  ...   │   Worker k   │
//! └──────┬───────┘ └──────┬───────┘        │  (analyzer)  │
//!        ▼                ▼                └──────────────┘
//!    Worker 0         Worker 1
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod analyzer;
pub mod arena;
pub mod clock;
pub mod config;
pub mod control;
pub mod error;
pub mod layout;
pub mod pool;
pub mod ring_buffer;
pub mod semaphore;
pub mod stats;

pub use analyzer::{AnalysisError, AnalysisResult, Analyzer, Classification, NullAnalyzer};
pub use arena::{SegmentBacking, SharedArena};
pub use config::{
    BackpressurePolicy, DequeueMode, FailurePolicy, PipelineConfig, RingSelection, SpawnMode,
};
pub use control::{BROADCAST, Command, ControlMailbox, ControlMessage, WorkerState};
pub use error::{ArenaError, ControlError, Error, PoolError, RingError};
pub use layout::{ArenaGeometry, LAYOUT_VERSION};
pub use pool::{BlockHandle, BlockMut, BlockView, MemoryPool, OwnerState, PoolCensus};
pub use ring_buffer::{Enqueue, RingConsumer, RingProducer};
pub use stats::{StatsAggregator, StatsSnapshot, WorkerCounters};

/// Default block size in bytes
pub const DEFAULT_BLOCK_SIZE: u32 = 2048;

/// Default ring capacity (slots per worker)
pub const DEFAULT_RING_CAPACITY: u32 = 4096;
