//! Runtime error types.

use std::io;

use nrflow_core::error::{ArenaError, ConfigError, ControlError, PoolError, RingError};
use thiserror::Error;

use crate::worker_pool::WorkerStatus;

/// Errors raised inside a worker
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Arena validation or ring claim failed at attach
    #[error("worker {worker} failed to attach: {reason}")]
    Attach {
        /// Worker id
        worker: u32,
        /// What went wrong
        reason: String,
    },

    /// Invariant violation that stops the worker
    #[error("worker {worker} invariant violation: {detail}")]
    Violation {
        /// Worker id
        worker: u32,
        /// What went wrong
        detail: String,
    },
}

/// Runtime errors
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Arena error
    #[error("arena error: {0}")]
    Arena(#[from] ArenaError),

    /// Pool error
    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    /// Ring error
    #[error("ring error: {0}")]
    Ring(#[from] RingError),

    /// Control error
    #[error("control error: {0}")]
    Control(#[from] ControlError),

    /// Configuration error
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Worker error
    #[error(transparent)]
    Worker(#[from] WorkerError),

    /// Creating a worker failed
    #[error("failed to spawn worker {worker}: {source}")]
    Spawn {
        /// Worker id
        worker: u32,
        /// OS error
        source: io::Error,
    },

    /// A worker failed and the failure policy is fail-fast
    #[error("worker {worker} failed ({status}); aborting run")]
    WorkerFailed {
        /// Worker id
        worker: u32,
        /// How it ended
        status: WorkerStatus,
    },

    /// Pool already shut down
    #[error("worker pool is shut down")]
    ShutDown,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result alias for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;
