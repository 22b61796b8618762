//! Configuration loading and defaults.

use anyhow::Result;
use serde::Deserialize;
use std::path::Path;

/// Runtime configuration for RadixDB. The page size is a compile-time
/// parameter of the storage types, not part of this struct.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Buffer pool capacity (number of page frames). Default 1024.
    pub buffer_pool_size: usize,

    /// Whether the radix-tree cache sits in front of the B+-tree. Default true.
    pub cache: bool,

    /// Byte budget for radix-tree cache nodes and frames. Inserts that
    /// would exceed it are silently dropped. Default 1 MiB.
    pub cache_budget_bytes: usize,

    /// Directory holding the data file. Default "./db".
    pub data_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            buffer_pool_size: 1024,
            cache: true,
            cache_budget_bytes: 1 << 20,
            data_dir: "./db".to_string(),
        }
    }
}

impl Config {
    /// Load config from a TOML file. Defaults to `Config::default()`.
    /// Empty file returns default config.
    pub fn from_path(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)?;
        if s.trim().is_empty() {
            return Ok(Self::default());
        }
        let c: Config = toml::from_str(&s)?;
        c.validate()?;
        Ok(c)
    }

    /// Use default config. Convenience for tests and minimal setups.
    pub fn default_config() -> Self {
        Self::default()
    }

    fn validate(&self) -> Result<()> {
        if self.buffer_pool_size == 0 {
            anyhow::bail!("buffer_pool_size must be positive");
        }
        Ok(())
    }
}
