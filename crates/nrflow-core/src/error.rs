//! Error types for the nrflow transport core.
//!
//! Backpressure (pool exhausted, ring full) is never an error here: those
//! paths return `None` or `Enqueue::Full` and are counted. Everything below is either a
//! startup failure or an invariant violation that must be surfaced.

use std::io;

use thiserror::Error;

/// Core errors
#[derive(Debug, Error)]
pub enum Error {
    /// Shared-memory arena error
    #[error("arena error: {0}")]
    Arena(#[from] ArenaError),

    /// Memory pool error
    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    /// Ring buffer error
    #[error("ring error: {0}")]
    Ring(#[from] RingError),

    /// Configuration error
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Control plane error
    #[error("control error: {0}")]
    Control(#[from] ControlError),
}

/// Arena creation, mapping and attach errors
#[derive(Debug, Error)]
pub enum ArenaError {
    /// Geometry cannot be laid out
    #[error("invalid arena geometry: {0}")]
    InvalidGeometry(String),

    /// Creating or mapping the segment failed
    #[error("failed to map shared segment {segment}: {source}")]
    Map {
        /// Segment description
        segment: String,
        /// Underlying OS error
        source: io::Error,
    },

    /// Segment does not start with the nrflow magic
    #[error("segment magic mismatch")]
    BadMagic,

    /// Segment was written by an incompatible layout version
    #[error("layout version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Version this build understands
        expected: u32,
        /// Version found in the segment
        found: u32,
    },

    /// Header geometry disagrees with the mapping
    #[error("layout mismatch: {0}")]
    LayoutMismatch(String),

    /// Segment exists but its creator has not finished initializing it
    #[error("segment is not ready (state {0})")]
    NotReady(u32),

    /// Backing not supported on this platform or for this operation
    #[error("unsupported segment backing: {0}")]
    Unsupported(&'static str),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Memory pool invariant violations
#[derive(Debug, Error)]
pub enum PoolError {
    /// Block released while already on the free list
    #[error("double release of block {index}")]
    DoubleRelease {
        /// Block index
        index: u32,
    },

    /// Handle does not name a block of this arena
    #[error("invalid block handle {index} (pool has {count} blocks)")]
    InvalidHandle {
        /// Block index
        index: u32,
        /// Number of blocks in the pool
        count: u32,
    },

    /// Block was not in the owner state the caller expected
    #[error("block {index} owner tag 0x{found:08X}, expected 0x{expected:08X}")]
    InvalidOwner {
        /// Block index
        index: u32,
        /// Expected owner tag
        expected: u32,
        /// Owner tag found
        found: u32,
    },

    /// Payload larger than the block capacity
    #[error("payload of {len} bytes exceeds block size {capacity}")]
    Oversized {
        /// Payload length
        len: usize,
        /// Block capacity
        capacity: usize,
    },
}

/// Ring buffer errors
#[derive(Debug, Error)]
pub enum RingError {
    /// Head/tail relationship broken
    #[error("ring {ring} corrupted: head={head} tail={tail}")]
    Corrupted {
        /// Ring id
        ring: u32,
        /// Consumer sequence
        head: u64,
        /// Producer sequence
        tail: u64,
    },

    /// Endpoint already claimed by another party
    #[error("ring {ring} {endpoint} endpoint already claimed")]
    AlreadyClaimed {
        /// Ring id
        ring: u32,
        /// "producer" or "consumer"
        endpoint: &'static str,
    },

    /// Ring id out of range
    #[error("no ring {ring} (arena has {count})")]
    NoSuchRing {
        /// Ring id
        ring: u32,
        /// Ring count
        count: u32,
    },

    /// Slot held a value that is not a block index
    #[error("ring {ring} slot held invalid block index {index}")]
    InvalidHandle {
        /// Ring id
        ring: u32,
        /// Index read from the slot
        index: u32,
    },
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A value is out of range
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Control plane errors
#[derive(Debug, Error)]
pub enum ControlError {
    /// Worker mailbox has no free slot
    #[error("control mailbox of worker {worker} is full")]
    MailboxFull {
        /// Worker id
        worker: u32,
    },

    /// Command code not understood
    #[error("unknown control command code {0}")]
    UnknownCommand(u32),

    /// Lifecycle transition not allowed by the state machine
    #[error("invalid worker state transition {from} -> {to}")]
    InvalidTransition {
        /// Current state name
        from: &'static str,
        /// Requested state name
        to: &'static str,
    },

    /// Worker id out of range
    #[error("no worker {0}")]
    NoSuchWorker(u32),
}

/// Result alias for core operations
pub type Result<T> = std::result::Result<T, Error>;
