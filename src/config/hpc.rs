//! Batch scheduler adapters available to workers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::client::hpc::HpcType;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HpcConfig {
    /// Seconds between scheduler status queries for submitted jobs
    pub poll_interval: f64,

    /// Keep generated submission scripts after the job finishes
    pub keep_submission_scripts: bool,

    /// Named scheduler adapters; jobs refer to them by name
    pub schedulers: BTreeMap<String, SchedulerConfig>,
}

impl Default for HpcConfig {
    fn default() -> Self {
        Self {
            poll_interval: 30.0,
            keep_submission_scripts: false,
            schedulers: BTreeMap::new(),
        }
    }
}

impl HpcConfig {
    pub(crate) fn validate(&self, errors: &mut Vec<String>) {
        if self.poll_interval <= 0.0 {
            errors.push(format!(
                "hpc.poll_interval must be positive, got {}",
                self.poll_interval
            ));
        }
        for (name, scheduler) in &self.schedulers {
            if scheduler.scheduler_type != HpcType::Fake && scheduler.account.is_none() {
                errors.push(format!("hpc.schedulers.{}: account is required", name));
            }
        }
    }
}

/// One batch scheduler adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(rename = "type")]
    pub scheduler_type: HpcType,
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub partition: Option<String>,
    #[serde(default)]
    pub qos: Option<String>,
    /// Extra directive text appended verbatim, e.g. "--constraint=lbw"
    #[serde(default)]
    pub extra: Option<String>,
}

impl SchedulerConfig {
    pub fn fake() -> Self {
        Self {
            scheduler_type: HpcType::Fake,
            account: None,
            partition: None,
            qos: None,
            extra: None,
        }
    }
}
