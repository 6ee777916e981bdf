//! Batch scheduler adapters
//!
//! This module provides the `HpcInterface` abstraction the job runner uses to submit, poll and
//! cancel allocations, plus concrete implementations for Slurm, PBS and a local fake scheduler.
//! The adapter for a job is selected by name from the `[hpc.schedulers]` configuration table.

pub mod common;
pub mod fake_interface;
pub mod hpc_interface;
pub mod pbs_interface;
pub mod slurm_interface;

pub use common::{HpcJobSpec, HpcJobStatus, HpcType};
pub use fake_interface::FakeInterface;
pub use hpc_interface::HpcInterface;
pub use pbs_interface::PbsInterface;
pub use slurm_interface::SlurmInterface;

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{HpcConfig, SchedulerConfig};
use crate::errors::{EngineError, Result};

/// Adapters keyed by scheduler name.
pub type HpcAdapters = HashMap<String, Arc<dyn HpcInterface>>;

/// Factory function to create an HPC interface based on the type
pub fn create_hpc_interface(
    hpc_type: HpcType,
    config: &SchedulerConfig,
) -> Result<Box<dyn HpcInterface>> {
    let interface: Box<dyn HpcInterface> = match hpc_type {
        HpcType::Slurm => Box::new(SlurmInterface::new(config).map_err(EngineError::from)?),
        HpcType::Pbs => Box::new(PbsInterface::new(config).map_err(EngineError::from)?),
        HpcType::Fake => Box::new(FakeInterface::new()),
    };
    Ok(interface)
}

/// Build one adapter per configured scheduler.
pub fn create_adapters(config: &HpcConfig) -> Result<HpcAdapters> {
    let mut adapters = HpcAdapters::new();
    for (name, scheduler) in &config.schedulers {
        let interface = create_hpc_interface(scheduler.scheduler_type, scheduler)
            .map_err(|e| EngineError::Config(format!("scheduler '{}': {}", name, e)))?;
        adapters.insert(name.clone(), Arc::from(interface));
    }
    Ok(adapters)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_fake_adapter() {
        let mut config = HpcConfig::default();
        config
            .schedulers
            .insert("local".to_string(), SchedulerConfig::fake());
        let adapters = create_adapters(&config).unwrap();
        assert_eq!(adapters.len(), 1);
        assert!(adapters["local"].get_statuses().unwrap().is_empty());
    }
}
