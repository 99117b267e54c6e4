use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Streaming configuration: per-tick read budgets, loader granularity and pager cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Maximum number of bytes read across all read-sets in one tick.
    pub read_budget_bytes: u64,
    /// Maximum number of voxels served in one tick.
    pub max_voxels_per_read: usize,
    /// Bytes transferred between two cancellation checkpoints of a voxel load.
    pub chunk_size: usize,
    /// Number of points in the coarse preview loaded by `load_sample`.
    pub sample_points: u64,
    /// Interval between two background pager ticks, in milliseconds.
    pub pager_interval_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            read_budget_bytes: 4 * 1024 * 1024,
            max_voxels_per_read: 64,
            chunk_size: 64 * 1024,
            sample_points: 256,
            pager_interval_ms: 16,
        }
    }
}

impl StreamConfig {
    /// Load a config file. `.json` files are parsed as JSON, anything else as YAML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: StreamConfig = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&text)?
        } else {
            serde_yaml::from_str(&text)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: StreamConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.read_budget_bytes == 0 {
            return Err(ConfigError::Invalid("read_budget_bytes must be positive".into()));
        }
        if self.max_voxels_per_read == 0 {
            return Err(ConfigError::Invalid("max_voxels_per_read must be positive".into()));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be positive".into()));
        }
        Ok(())
    }

    /// The per-tick read budget described by this config.
    pub fn budget(&self) -> ReadBudget {
        ReadBudget {
            max_bytes: self.read_budget_bytes,
            max_voxels: self.max_voxels_per_read,
        }
    }

    pub fn pager_interval(&self) -> Duration {
        Duration::from_millis(self.pager_interval_ms)
    }
}

/// Limits applied when building read-sets for one scheduling tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadBudget {
    pub max_bytes: u64,
    pub max_voxels: usize,
}

impl ReadBudget {
    pub fn new(max_bytes: u64, max_voxels: usize) -> Self {
        Self {
            max_bytes,
            max_voxels,
        }
    }

    /// A budget limited only by voxel count.
    pub fn voxels(max_voxels: usize) -> Self {
        Self::new(u64::MAX, max_voxels)
    }

    /// A budget limited only by byte size.
    pub fn bytes(max_bytes: u64) -> Self {
        Self::new(max_bytes, usize::MAX)
    }

    pub fn is_exhausted(&self) -> bool {
        self.max_bytes == 0 || self.max_voxels == 0
    }

    /// Charge `bytes` and one voxel against the budget.
    pub(crate) fn consume(&mut self, bytes: u64) {
        self.max_bytes = self.max_bytes.saturating_sub(bytes);
        self.max_voxels = self.max_voxels.saturating_sub(1);
    }
}

impl Default for ReadBudget {
    fn default() -> Self {
        StreamConfig::default().budget()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_config_defaults() {
        let config = StreamConfig::default();
        assert_eq!(config.read_budget_bytes, 4 * 1024 * 1024);
        assert_eq!(config.max_voxels_per_read, 64);
        assert_eq!(config.chunk_size, 64 * 1024);
        assert_eq!(config.sample_points, 256);
        assert_eq!(config.pager_interval(), Duration::from_millis(16));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn yaml_overrides_and_defaults() {
        let config = StreamConfig::from_yaml_str("read_budget_bytes: 1024\nchunk_size: 128\n").unwrap();
        assert_eq!(config.read_budget_bytes, 1024);
        assert_eq!(config.chunk_size, 128);
        assert_eq!(config.max_voxels_per_read, 64);
    }

    #[test]
    fn zero_budget_rejected() {
        let result = StreamConfig::from_yaml_str("read_budget_bytes: 0\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn load_json_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("stream.json");
        std::fs::write(&path, r#"{ "max_voxels_per_read": 3 }"#).unwrap();
        let config = StreamConfig::load(&path).unwrap();
        assert_eq!(config.max_voxels_per_read, 3);
        assert_eq!(config.budget(), ReadBudget::new(4 * 1024 * 1024, 3));
    }

    #[test]
    fn load_yaml_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("stream.yaml");
        std::fs::write(&path, "pager_interval_ms: 5\n").unwrap();
        let config = StreamConfig::load(&path).unwrap();
        assert_eq!(config.pager_interval(), Duration::from_millis(5));
    }

    #[test]
    fn budget_consumption_saturates() {
        let mut budget = ReadBudget::new(100, 2);
        budget.consume(60);
        assert_eq!(budget, ReadBudget::new(40, 1));
        budget.consume(60);
        assert!(budget.is_exhausted());
    }
}
