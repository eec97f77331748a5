//! Pool configuration
//!
//! Size classes run from `min_block_size` to `max_block_size` in powers of
//! two. Settings can be built in code or read from TOML:
//!
//! ```toml
//! min_block_size = 4096
//! max_block_size = 65536
//! growth_increment = 262144
//! ```

use crate::core::block_file::DEFAULT_GROWTH_INCREMENT;
use crate::core::error::{BlockFileError, Result};
use crate::core::header::INDEX_SIZE;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Smallest default size class
pub const MIN_BLOCK_SIZE: u32 = 4096;

/// Largest default size class
pub const MAX_BLOCK_SIZE: u32 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Block size of size class 0
    pub min_block_size: u32,

    /// Block size of the last size class
    pub max_block_size: u32,

    /// Bytes each size-class file grows by when full
    pub growth_increment: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            min_block_size: MIN_BLOCK_SIZE,
            max_block_size: MAX_BLOCK_SIZE,
            growth_increment: DEFAULT_GROWTH_INCREMENT,
        }
    }
}

impl PoolConfig {
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::new()
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: PoolConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a TOML config file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.min_block_size.is_power_of_two() || (self.min_block_size as usize) < INDEX_SIZE {
            return Err(BlockFileError::Config(format!(
                "min_block_size must be a power of two of at least {} bytes, got {}",
                INDEX_SIZE, self.min_block_size
            )));
        }

        if !self.max_block_size.is_power_of_two() {
            return Err(BlockFileError::Config(format!(
                "max_block_size must be a power of two, got {}",
                self.max_block_size
            )));
        }

        if self.min_block_size > self.max_block_size {
            return Err(BlockFileError::Config(format!(
                "min_block_size {} exceeds max_block_size {}",
                self.min_block_size, self.max_block_size
            )));
        }

        Ok(())
    }

    /// Number of size classes between min and max inclusive
    pub fn size_classes(&self) -> usize {
        (self.max_block_size / self.min_block_size).trailing_zeros() as usize + 1
    }

    /// Size class `i` such that `min_block_size << i == block_size`
    pub fn class_index(&self, block_size: u32) -> Option<usize> {
        if block_size < self.min_block_size
            || block_size > self.max_block_size
            || block_size % self.min_block_size != 0
        {
            return None;
        }

        let ratio = block_size / self.min_block_size;
        if ratio.is_power_of_two() {
            Some(ratio.trailing_zeros() as usize)
        } else {
            None
        }
    }

    pub fn class_block_size(&self, class: usize) -> u32 {
        self.min_block_size << class
    }
}

/// Fluent construction of a [`PoolConfig`]
#[derive(Debug, Clone, Default)]
pub struct PoolConfigBuilder {
    config: PoolConfig,
}

impl PoolConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn min_block_size(mut self, size: u32) -> Self {
        self.config.min_block_size = size;
        self
    }

    pub fn max_block_size(mut self, size: u32) -> Self {
        self.config.max_block_size = size;
        self
    }

    pub fn growth_increment(mut self, bytes: u64) -> Self {
        self.config.growth_increment = bytes;
        self
    }

    pub fn build(self) -> Result<PoolConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_classes() {
        let config = PoolConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.size_classes(), 9);
        assert_eq!(config.class_block_size(0), 4096);
        assert_eq!(config.class_block_size(8), 1024 * 1024);
    }

    #[test]
    fn test_class_index() {
        let config = PoolConfig::default();
        assert_eq!(config.class_index(4096), Some(0));
        assert_eq!(config.class_index(8192), Some(1));
        assert_eq!(config.class_index(1024 * 1024), Some(8));

        assert_eq!(config.class_index(2048), None);
        assert_eq!(config.class_index(12288), None);
        assert_eq!(config.class_index(2 * 1024 * 1024), None);
        assert_eq!(config.class_index(5000), None);
    }

    #[test]
    fn test_from_toml_partial() {
        let config = PoolConfig::from_toml_str("max_block_size = 65536\n").unwrap();
        assert_eq!(config.min_block_size, MIN_BLOCK_SIZE);
        assert_eq!(config.max_block_size, 65536);
        assert_eq!(config.growth_increment, DEFAULT_GROWTH_INCREMENT);
        assert_eq!(config.size_classes(), 5);
    }

    #[test]
    fn test_from_toml_rejects_bad_values() {
        assert!(matches!(
            PoolConfig::from_toml_str("min_block_size = 3000"),
            Err(BlockFileError::Config(_))
        ));
        assert!(matches!(
            PoolConfig::from_toml_str("min_block_size = \"big\""),
            Err(BlockFileError::ConfigParse(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("pool.toml");
        std::fs::write(&path, "min_block_size = 8192\ngrowth_increment = 65536\n").unwrap();

        let config = PoolConfig::load(&path).unwrap();
        assert_eq!(config.min_block_size, 8192);
        assert_eq!(config.growth_increment, 65536);
    }

    #[test]
    fn test_builder() {
        let config = PoolConfig::builder()
            .min_block_size(512)
            .max_block_size(4096)
            .growth_increment(8192)
            .build()
            .unwrap();
        assert_eq!(config.size_classes(), 4);

        assert!(PoolConfig::builder()
            .min_block_size(8192)
            .max_block_size(4096)
            .build()
            .is_err());
    }
}
