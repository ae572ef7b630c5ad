//! World configuration

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::error::Error;
use crate::core::types::Result;
use crate::math::morton::MAX_DEPTH;
use crate::voxel::chunk::MAX_RESIDENT_BUFFERS;

/// Tunables for one streamed world.
///
/// Every field has a default, so a JSON file only needs the values it
/// overrides.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    /// World seed handed to every generator stage
    pub seed: u64,
    /// Edge length of one chunk in world units
    pub chunk_world_size: f32,
    /// Chunks per buffer edge; a buffer holds `buffer_side³` chunks
    pub buffer_side: u32,
    /// Maximum number of chunk buffers resident at once
    pub max_buffers: usize,
    /// Octree nodes allocated together as one group
    pub octree_group_size: u32,
    /// Depth of the master octree at startup (leaves are chunks)
    pub initial_depth: u8,
    /// Allocation level above which background eviction starts (bytes)
    pub memory_preferred: u64,
    /// Hard allocation ceiling (bytes)
    pub memory_max: u64,
    /// Concurrent chunk load/generate tasks
    pub max_concurrent_loads: usize,
    /// Minimum marker displacement (world units) that triggers a reload
    pub move_threshold: f32,
    /// Worker threads when the world owns its runtime
    pub worker_threads: usize,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            seed: 12345,
            chunk_world_size: 16.0,
            buffer_side: 4,
            max_buffers: 64,
            octree_group_size: 256,
            initial_depth: 4,
            memory_preferred: 256 * 1024 * 1024, // 256 MB
            memory_max: 512 * 1024 * 1024,       // 512 MB
            max_concurrent_loads: 8,
            move_threshold: 4.0,
            worker_threads: 4,
        }
    }
}

impl WorldConfig {
    /// Chunks held by one buffer.
    pub fn buffer_capacity(&self) -> usize {
        (self.buffer_side as usize).pow(3)
    }

    /// Load configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        let config: WorldConfig = serde_json::from_str(&json)?;
        config.validate()?;
        log::debug!("Loaded world config from {}", path.as_ref().display());
        Ok(config)
    }

    /// Write configuration as pretty JSON.
    pub fn to_json_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Reject values the storages cannot work with.
    pub fn validate(&self) -> Result<()> {
        if !(self.chunk_world_size > 0.0) {
            return Err(Error::InvalidConfig("chunk_world_size must be positive".into()));
        }
        if !self.buffer_side.is_power_of_two() || self.buffer_side > 16 {
            return Err(Error::InvalidConfig(format!(
                "buffer_side must be a power of two no larger than 16, got {}",
                self.buffer_side
            )));
        }
        if self.max_buffers == 0 || self.max_buffers > MAX_RESIDENT_BUFFERS {
            return Err(Error::InvalidConfig(format!(
                "max_buffers must be in 1..={}, got {}",
                MAX_RESIDENT_BUFFERS,
                self.max_buffers
            )));
        }
        if self.octree_group_size < 8 {
            return Err(Error::InvalidConfig("octree_group_size must be at least 8".into()));
        }
        if self.initial_depth == 0 || self.initial_depth > MAX_DEPTH {
            return Err(Error::InvalidConfig(format!(
                "initial_depth must be in 1..={}, got {}",
                MAX_DEPTH, self.initial_depth
            )));
        }
        if self.memory_preferred > self.memory_max {
            return Err(Error::InvalidConfig(format!(
                "memory_preferred ({}) exceeds memory_max ({})",
                self.memory_preferred, self.memory_max
            )));
        }
        if self.max_concurrent_loads == 0 || self.worker_threads == 0 {
            return Err(Error::InvalidConfig("load and worker counts must be non-zero".into()));
        }
        if self.move_threshold < 0.0 {
            return Err(Error::InvalidConfig("move_threshold must not be negative".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_is_valid() {
        let config = WorldConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.buffer_capacity(), 64);
    }

    #[test]
    fn test_rejects_inverted_budget() {
        let config = WorldConfig {
            memory_preferred: 10,
            memory_max: 5,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_odd_buffer_side() {
        let config = WorldConfig {
            buffer_side: 3,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: WorldConfig = serde_json::from_str(r#"{ "seed": 7, "max_buffers": 3 }"#).unwrap();
        assert_eq!(config.seed, 7);
        assert_eq!(config.max_buffers, 3);
        assert_eq!(config.chunk_world_size, 16.0);
    }

    #[test]
    fn test_json_file_roundtrip() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let path = temp_dir.path().join("world.json");

        let config = WorldConfig {
            seed: 99,
            initial_depth: 6,
            ..Default::default()
        };
        config.to_json_file(&path).unwrap();

        let loaded = WorldConfig::from_json_file(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
