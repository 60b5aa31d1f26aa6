//! # nrflow Runtime
//!
//! Process-level machinery on top of the `nrflow-core` shared structures:
//!
//! - [`Producer`]: the single writer that fills pool blocks and routes them
//!   to worker rings
//! - [`Worker`]: the consume loop run by every worker process or thread
//! - [`WorkerPool`]: spawning, control, reaping, reclamation and the
//!   shutdown protocol
//! - [`cleanup`]: the signal-safe force path for a second Ctrl-C
//! - [`ControlServer`]: the Unix-domain control socket
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use nrflow_core::{Analyzer, NullAnalyzer, PipelineConfig, SegmentBacking, SpawnMode};
//! use nrflow_runtime::WorkerPool;
//!
//! let config = PipelineConfig {
//!     workers: 2,
//!     spawn_mode: SpawnMode::Thread,
//!     ..Default::default()
//! };
//! let mut pool = WorkerPool::start(
//!     config,
//!     SegmentBacking::Anonymous,
//!     Arc::new(|_: u32| Box::new(NullAnalyzer) as Box<dyn Analyzer>),
//! )?;
//! let mut producer = pool.producer()?;
//! producer.submit(b"\x04payload")?;
//! drop(producer);
//! let report = pool.shutdown();
//! println!("{} blocks reclaimed", report.reclaimed_blocks);
//! # Ok::<(), nrflow_runtime::RuntimeError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod affinity;
pub mod cleanup;
pub mod control_server;
pub mod error;
pub mod producer;
pub mod worker;
pub mod worker_pool;

pub use control_server::{ControlEnvelope, ControlRequest, ControlResponse, ControlServer};
pub use error::{Result, RuntimeError, WorkerError};
pub use producer::{DropReason, Producer, ProducerDrops, SubmitOutcome};
pub use worker::{Worker, WorkerExit, WorkerSpec, exit_code, run_worker};
pub use worker_pool::{
    AnalyzerFactory, BroadcastOutcome, ShutdownReport, WorkerFailure, WorkerHandle, WorkerPool,
    WorkerStatus,
};
