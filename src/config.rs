//! Layered configuration for the engine.
//!
//! Configuration is read from TOML files in priority order (lowest first):
//!
//! 1. System: `/etc/hpcflow/config.toml`
//! 2. User: `<config_dir>/hpcflow/config.toml`
//! 3. Local: `hpcflow.toml` in the current directory
//!
//! Later files override individual keys of earlier ones; missing keys fall back to defaults.

pub mod client;
pub mod hpc;

pub use client::{ClientConfig, ClientRunConfig};
pub use hpc::{HpcConfig, SchedulerConfig};

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::{EngineError, Result};

/// Locations searched for configuration files
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub system: PathBuf,
    pub user: Option<PathBuf>,
    pub local: PathBuf,
}

impl ConfigPaths {
    pub fn new() -> Self {
        Self {
            system: PathBuf::from("/etc/hpcflow/config.toml"),
            user: dirs::config_dir().map(|d| d.join("hpcflow").join("config.toml")),
            local: PathBuf::from("hpcflow.toml"),
        }
    }

    /// Paths that exist on disk, in priority order
    pub fn existing_paths(&self) -> Vec<PathBuf> {
        let mut paths = vec![self.system.clone()];
        if let Some(ref user) = self.user {
            paths.push(user.clone());
        }
        paths.push(self.local.clone());
        paths.into_iter().filter(|p| p.exists()).collect()
    }

    pub fn user_config_dir(&self) -> Option<&Path> {
        self.user.as_ref().and_then(|p| p.parent())
    }
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub client: ClientConfig,
    pub hpc: HpcConfig,
}

impl EngineConfig {
    /// Load configuration from the standard locations.
    pub fn load() -> Result<Self> {
        Self::load_with_paths(&ConfigPaths::new())
    }

    pub fn load_with_paths(paths: &ConfigPaths) -> Result<Self> {
        Self::load_from_files(&paths.existing_paths())
    }

    /// Load and merge the given files; later files take precedence.
    pub fn load_from_files(files: &[PathBuf]) -> Result<Self> {
        let mut merged = toml::Value::Table(toml::map::Map::new());
        for file in files {
            let content = fs::read_to_string(file).map_err(|e| {
                EngineError::Config(format!("failed to read {}: {}", file.display(), e))
            })?;
            let value: toml::Value = toml::from_str(&content).map_err(|e| {
                EngineError::Config(format!("failed to parse {}: {}", file.display(), e))
            })?;
            merge_values(&mut merged, value);
        }
        merged
            .try_into()
            .map_err(|e: toml::de::Error| EngineError::Config(e.to_string()))
    }

    /// Check value ranges. Returns every problem found, not just the first.
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();
        self.client.validate(&mut errors);
        self.hpc.validate(&mut errors);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Default configuration rendered as TOML, suitable for `hpcflow.toml`
    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&EngineConfig::default()).unwrap_or_default()
    }
}

fn merge_values(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_table.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}
