//! Client-side settings: store URL, logging, and worker run behavior.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::time_utils::duration_string_to_seconds;

const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the graph store API
    pub api_url: String,

    /// Log level (error, warn, info, debug, trace)
    pub log_level: String,

    pub run: ClientRunConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8080/hpcflow/v1".to_string(),
            log_level: "info".to_string(),
            run: ClientRunConfig::default(),
        }
    }
}

impl ClientConfig {
    pub(crate) fn validate(&self, errors: &mut Vec<String>) {
        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            errors.push(format!(
                "client.log_level must be one of {:?}, got '{}'",
                LOG_LEVELS, self.log_level
            ));
        }
        if !self.api_url.starts_with("http://") && !self.api_url.starts_with("https://") {
            errors.push(format!(
                "client.api_url must be an http(s) URL, got '{}'",
                self.api_url
            ));
        }
        self.run.validate(errors);
    }
}

/// Settings for `run_worker`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientRunConfig {
    /// Seconds between polls for ready jobs and between completion checks
    pub poll_interval: f64,

    pub output_dir: PathBuf,

    /// Wall-time budget of the worker, e.g. "PT4H" or "04:00:00"
    pub time_limit: Option<String>,

    /// Seconds a job is given after SIGTERM before it is killed
    pub grace_period_seconds: f64,

    /// Resources offered by this worker. Detected from the host when unset.
    pub num_cpus: Option<i64>,
    pub memory_gb: Option<f64>,
    pub num_gpus: Option<i64>,

    /// Exit after this many seconds without claiming a job (0 disables)
    pub wait_for_new_jobs_seconds: u64,

    /// Stop claiming new jobs when less than this much time remains
    pub min_time_for_new_jobs_seconds: u64,

    /// Stop this many seconds before the end of the time budget
    pub expiration_buffer_seconds: u64,

    /// Keep retrying store calls for this long before giving up
    pub wait_for_healthy_store_minutes: f64,
}

impl Default for ClientRunConfig {
    fn default() -> Self {
        Self {
            poll_interval: 5.0,
            output_dir: PathBuf::from("output"),
            time_limit: None,
            grace_period_seconds: 30.0,
            num_cpus: None,
            memory_gb: None,
            num_gpus: None,
            wait_for_new_jobs_seconds: 0,
            min_time_for_new_jobs_seconds: 300,
            expiration_buffer_seconds: 60,
            wait_for_healthy_store_minutes: 20.0,
        }
    }
}

impl ClientRunConfig {
    pub(crate) fn validate(&self, errors: &mut Vec<String>) {
        if self.poll_interval <= 0.0 {
            errors.push(format!(
                "client.run.poll_interval must be positive, got {}",
                self.poll_interval
            ));
        }
        if self.grace_period_seconds < 0.0 {
            errors.push(format!(
                "client.run.grace_period_seconds must not be negative, got {}",
                self.grace_period_seconds
            ));
        }
        if let Some(ref limit) = self.time_limit
            && let Err(e) = duration_string_to_seconds(limit)
        {
            errors.push(format!("client.run.time_limit: {}", e));
        }
        if matches!(self.num_cpus, Some(n) if n <= 0) {
            errors.push("client.run.num_cpus must be positive".to_string());
        }
        if matches!(self.memory_gb, Some(m) if m <= 0.0) {
            errors.push("client.run.memory_gb must be positive".to_string());
        }
        if self.wait_for_healthy_store_minutes < 0.0 {
            errors.push("client.run.wait_for_healthy_store_minutes must not be negative".to_string());
        }
    }

    pub fn time_limit_seconds(&self) -> Option<u64> {
        self.time_limit
            .as_deref()
            .and_then(|t| duration_string_to_seconds(t).ok())
    }
}
