//! Configuration system for the nrflow CLI.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use nrflow_core::{PipelineConfig, SegmentBacking};
use nrflow_traffic::{TrafficGenerator, TrafficMix};

/// nrflow configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Transport core configuration
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Generated traffic shape
    #[serde(default)]
    pub traffic: TrafficMix,
    /// Shared segment backing
    #[serde(default = "default_segment")]
    pub segment: SegmentBacking,
    /// Control socket configuration
    #[serde(default)]
    pub control: ControlConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Control socket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Serve the control socket during `run`
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Socket path
    #[serde(default = "default_socket_path")]
    pub socket: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_segment() -> SegmentBacking {
    SegmentBacking::Anonymous
}

fn default_true() -> bool {
    true
}

fn default_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("nrflow.sock")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            traffic: TrafficMix::default(),
            segment: default_segment(),
            control: ControlConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            socket: default_socket_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("nrflow/config.toml")
    }

    /// Load config from default path, or create default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();

        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.pipeline.validate()?;
        TrafficGenerator::new(self.traffic.clone())?;

        if self.traffic.max_message > self.pipeline.block_size as usize {
            tracing::warn!(
                "traffic.max_message ({}) exceeds pipeline.block_size ({}); long messages will be dropped as oversized",
                self.traffic.max_message,
                self.pipeline.block_size
            );
        }

        match &self.segment {
            SegmentBacking::Anonymous => {}
            SegmentBacking::Named(name) => {
                if !name.starts_with('/') || name[1..].contains('/') || name.len() < 2 {
                    anyhow::bail!(
                        "Shared memory name '{}' must be '/' followed by a name without further slashes",
                        name
                    );
                }
            }
            SegmentBacking::File(path) => {
                if path.as_os_str().is_empty() {
                    anyhow::bail!("Segment file path is empty");
                }
            }
        }

        if self.control.enabled && self.control.socket.as_os_str().is_empty() {
            anyhow::bail!("Control socket enabled but no path specified");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nrflow_core::{RingSelection, SpawnMode};

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.pipeline.ring_capacity, 4096);
        assert_eq!(config.segment, SegmentBacking::Anonymous);
        assert!(config.control.enabled);
        assert!(config.control.socket.ends_with("nrflow.sock"));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.pipeline.ring_capacity = 1000;
        assert!(config.validate().is_err());

        config.pipeline.ring_capacity = 1024;
        config.segment = SegmentBacking::Named("nrflow".into());
        assert!(config.validate().is_err());

        config.segment = SegmentBacking::Named("/nrflow".into());
        assert!(config.validate().is_ok());

        config.logging.level = "loud".into();
        assert!(config.validate().is_err());

        config.logging.level = "debug".into();
        config.traffic.malformed_ratio = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(
            config.pipeline.block_count,
            deserialized.pipeline.block_count
        );
        assert_eq!(config.segment, deserialized.segment);
        assert_eq!(config.control.socket, deserialized.control.socket);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [pipeline]
            workers = 2
            spawn_mode = "thread"
            ring_selection = "flow_hash"

            [traffic]
            seed = 7
            "#,
        )
        .unwrap();

        assert_eq!(config.pipeline.workers, 2);
        assert_eq!(config.pipeline.spawn_mode, SpawnMode::Thread);
        assert_eq!(config.pipeline.ring_selection, RingSelection::FlowHash);
        assert_eq!(config.pipeline.block_size, 2048);
        assert_eq!(config.traffic.seed, Some(7));
        assert_eq!(config.segment, SegmentBacking::Anonymous);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");

        let mut config = Config::default();
        config.pipeline.workers = 3;
        config.segment = SegmentBacking::File(dir.path().join("arena"));
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.pipeline.workers, 3);
        assert_eq!(loaded.segment, config.segment);
    }
}
