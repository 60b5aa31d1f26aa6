//! Pipeline configuration values.
//!
//! Loading is the caller's business (the CLI reads TOML); this module only
//! defines the values the core consumes, their defaults and their validation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::layout::{ArenaGeometry, MAX_RINGS};

/// How a worker waits when its ring is empty
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DequeueMode {
    /// Spin, then yield the CPU
    Spin,
    /// Spin, then park on the ring's data-available semaphore
    Blocking,
}

/// How workers are created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnMode {
    /// One forked OS process per worker
    Process,
    /// One OS thread per worker
    Thread,
}

/// How the producer picks a ring for each message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RingSelection {
    /// Rotate over live rings
    RoundRobin,
    /// Hash the caller's flow key, keeping a flow on one ring
    FlowHash,
}

/// What the producer does when the chosen ring is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum BackpressurePolicy {
    /// Drop the message immediately
    Drop,
    /// Wait on the space-available semaphore, then drop
    Wait {
        /// Upper bound on the wait
        timeout_us: u64,
    },
}

/// What the supervisor does when a worker fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Report, reclaim, keep running with fewer workers
    Degrade,
    /// Report and abort the run
    FailFast,
}

/// Transport core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Slots per ring (power of two)
    pub ring_capacity: u32,
    /// Usable bytes per pool block
    pub block_size: u32,
    /// Number of pool blocks
    pub block_count: u32,
    /// Number of workers (one ring each, 0 = one per CPU)
    pub workers: u32,
    /// Empty-ring wait strategy
    pub dequeue_mode: DequeueMode,
    /// Empty polls before a worker yields or parks
    pub spin_limit: u32,
    /// Upper bound on one semaphore park, in milliseconds
    pub park_timeout_ms: u64,
    /// Bound on the graceful drain, in milliseconds
    pub drain_timeout_ms: u64,
    /// Bound on waiting for control acknowledgments, in milliseconds
    pub ack_timeout_ms: u64,
    /// Whether draining workers finish their ring backlog before exiting
    pub drain_backlog: bool,
    /// Worker creation mode
    pub spawn_mode: SpawnMode,
    /// Pin worker `i` to core `i % cpus`
    pub pin_workers: bool,
    /// Start workers paused until START
    pub start_paused: bool,
    /// Ring selection policy
    pub ring_selection: RingSelection,
    /// Full-ring policy
    pub backpressure: BackpressurePolicy,
    /// Worker failure policy
    pub failure_policy: FailurePolicy,
    /// Respawn failed workers onto their reclaimed ring (thread mode only)
    pub restart_failed_workers: bool,
    /// Statistics reporting interval, in milliseconds
    pub stats_interval_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 4096,
            block_size: 2048,
            block_count: 16384,
            workers: 4,
            dequeue_mode: DequeueMode::Blocking,
            spin_limit: 256,
            park_timeout_ms: 50,
            drain_timeout_ms: 2000,
            ack_timeout_ms: 500,
            drain_backlog: false,
            spawn_mode: SpawnMode::Process,
            pin_workers: false,
            start_paused: false,
            ring_selection: RingSelection::RoundRobin,
            backpressure: BackpressurePolicy::Drop,
            failure_policy: FailurePolicy::Degrade,
            restart_failed_workers: false,
            stats_interval_ms: 1000,
        }
    }
}

impl PipelineConfig {
    /// Worker count with `0` resolved to the CPU count
    #[must_use]
    pub fn resolved_workers(&self) -> u32 {
        if self.workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1)
        } else {
            self.workers
        }
    }

    /// Arena geometry implied by this configuration
    #[must_use]
    pub fn geometry(&self) -> ArenaGeometry {
        ArenaGeometry {
            block_size: self.block_size,
            block_count: self.block_count,
            ring_count: self.resolved_workers(),
            ring_capacity: self.ring_capacity,
        }
    }

    /// Drain timeout as a `Duration`
    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Acknowledgment timeout as a `Duration`
    #[must_use]
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Park timeout as a `Duration`
    #[must_use]
    pub fn park_timeout(&self) -> Duration {
        Duration::from_millis(self.park_timeout_ms.max(1))
    }

    /// Statistics interval as a `Duration`
    #[must_use]
    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms.max(10))
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ring_capacity == 0 || !self.ring_capacity.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "ring_capacity must be a non-zero power of two, got {}",
                self.ring_capacity
            )));
        }

        if self.block_size == 0 {
            return Err(ConfigError::Invalid("block_size must be non-zero".into()));
        }

        if self.block_count == 0 || self.block_count == u32::MAX {
            return Err(ConfigError::Invalid(format!(
                "block_count must be between 1 and {}",
                u32::MAX - 1
            )));
        }

        let workers = self.resolved_workers();
        if workers as usize > MAX_RINGS {
            return Err(ConfigError::Invalid(format!(
                "workers must be at most {MAX_RINGS}, got {workers}"
            )));
        }

        // A restart forks from a parent whose other threads may hold the
        // allocator or subscriber locks
        if self.restart_failed_workers && self.spawn_mode == SpawnMode::Process {
            return Err(ConfigError::Invalid(
                "restart_failed_workers requires spawn_mode = \"thread\"".into(),
            ));
        }

        if self.drain_timeout_ms == 0 {
            return Err(ConfigError::Invalid("drain_timeout_ms must be non-zero".into()));
        }

        if let BackpressurePolicy::Wait { timeout_us } = self.backpressure {
            if timeout_us == 0 {
                return Err(ConfigError::Invalid(
                    "backpressure wait timeout must be non-zero".into(),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ring_capacity, 4096);
        assert_eq!(config.dequeue_mode, DequeueMode::Blocking);
    }

    #[test]
    fn test_ring_capacity_must_be_power_of_two() {
        let config = PipelineConfig {
            ring_capacity: 1000,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = PipelineConfig {
            ring_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_worker_limit() {
        let config = PipelineConfig {
            workers: MAX_RINGS as u32 + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_workers_resolves_to_cpus() {
        let config = PipelineConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(config.resolved_workers() >= 1);
        assert_eq!(config.geometry().ring_count, config.resolved_workers());
    }

    #[test]
    fn test_backpressure_wait_timeout() {
        let config = PipelineConfig {
            backpressure: BackpressurePolicy::Wait { timeout_us: 0 },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_restart_only_in_thread_mode() {
        let config = PipelineConfig {
            restart_failed_workers: true,
            spawn_mode: SpawnMode::Process,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("restart_failed_workers"));

        let config = PipelineConfig {
            restart_failed_workers: true,
            spawn_mode: SpawnMode::Thread,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"ring_capacity": 8, "spawn_mode": "thread"}"#).unwrap();
        assert_eq!(config.ring_capacity, 8);
        assert_eq!(config.spawn_mode, SpawnMode::Thread);
        assert_eq!(config.block_size, 2048);
    }
}
