//! Data model shared by the engine and the graph store.
//!
//! Every record is keyed by a workflow-scoped string key so that the same types can travel
//! between the in-process store and a remote document store unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::memory_utils::memory_string_to_gb;
use crate::time_utils::duration_string_to_seconds;

/// Lifecycle status of a job.
///
/// The variants are declared in lifecycle order; `Done`, `Terminated`, `Canceled` and
/// `Disabled` are terminal.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum JobStatus {
    #[serde(rename = "uninitialized")]
    #[default]
    Uninitialized,
    #[serde(rename = "blocked")]
    Blocked,
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "scheduled")]
    Scheduled,
    #[serde(rename = "submitted")]
    Submitted,
    #[serde(rename = "submitted_pending")]
    SubmittedPending,
    #[serde(rename = "done")]
    Done,
    #[serde(rename = "terminated")]
    Terminated,
    #[serde(rename = "canceled")]
    Canceled,
    #[serde(rename = "disabled")]
    Disabled,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            JobStatus::Uninitialized => write!(f, "uninitialized"),
            JobStatus::Blocked => write!(f, "blocked"),
            JobStatus::Ready => write!(f, "ready"),
            JobStatus::Scheduled => write!(f, "scheduled"),
            JobStatus::Submitted => write!(f, "submitted"),
            JobStatus::SubmittedPending => write!(f, "submitted_pending"),
            JobStatus::Done => write!(f, "done"),
            JobStatus::Terminated => write!(f, "terminated"),
            JobStatus::Canceled => write!(f, "canceled"),
            JobStatus::Disabled => write!(f, "disabled"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "uninitialized" => Ok(JobStatus::Uninitialized),
            "blocked" => Ok(JobStatus::Blocked),
            "ready" => Ok(JobStatus::Ready),
            "scheduled" => Ok(JobStatus::Scheduled),
            "submitted" => Ok(JobStatus::Submitted),
            "submitted_pending" => Ok(JobStatus::SubmittedPending),
            "done" => Ok(JobStatus::Done),
            "terminated" => Ok(JobStatus::Terminated),
            "canceled" => Ok(JobStatus::Canceled),
            "disabled" => Ok(JobStatus::Disabled),
            _ => Err(format!("Value not valid: {}", s)),
        }
    }
}

impl JobStatus {
    pub const ALL: [JobStatus; 10] = [
        JobStatus::Uninitialized,
        JobStatus::Blocked,
        JobStatus::Ready,
        JobStatus::Scheduled,
        JobStatus::Submitted,
        JobStatus::SubmittedPending,
        JobStatus::Done,
        JobStatus::Terminated,
        JobStatus::Canceled,
        JobStatus::Disabled,
    ];

    /// Convert JobStatus enum to integer for compact storage
    pub fn to_int(&self) -> i32 {
        match *self {
            JobStatus::Uninitialized => 0,
            JobStatus::Blocked => 1,
            JobStatus::Ready => 2,
            JobStatus::Scheduled => 3,
            JobStatus::Submitted => 4,
            JobStatus::SubmittedPending => 5,
            JobStatus::Done => 6,
            JobStatus::Terminated => 7,
            JobStatus::Canceled => 8,
            JobStatus::Disabled => 9,
        }
    }

    /// Convert integer from storage to JobStatus enum
    pub fn from_int(value: i32) -> std::result::Result<Self, String> {
        JobStatus::ALL
            .iter()
            .copied()
            .find(|s| s.to_int() == value)
            .ok_or_else(|| format!("Invalid JobStatus integer value: {}", value))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Done | JobStatus::Terminated | JobStatus::Canceled | JobStatus::Disabled
        )
    }

    /// Claimed by a worker and not yet finished.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            JobStatus::Scheduled | JobStatus::Submitted | JobStatus::SubmittedPending
        )
    }

    /// Not yet claimed by any worker.
    pub fn is_unstarted(&self) -> bool {
        matches!(
            self,
            JobStatus::Uninitialized | JobStatus::Blocked | JobStatus::Ready
        )
    }
}

/// Where a job is executed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerAssignment {
    /// Any worker may run the job as a local subprocess.
    #[default]
    None,
    /// Runs as a local subprocess; named explicitly in the workflow.
    Local,
    /// Submitted to the named batch scheduler adapter by the claiming worker.
    Hpc { name: String },
}

impl SchedulerAssignment {
    pub fn hpc_name(&self) -> Option<&str> {
        match self {
            SchedulerAssignment::Hpc { name } => Some(name),
            _ => None,
        }
    }
}

/// Declared resource requirements of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceRequirements {
    pub num_cpus: i64,
    pub num_gpus: i64,
    /// Memory as a size string, e.g. `"512m"` or `"2g"`
    pub memory: String,
    /// Wall-time budget as a duration string, e.g. `"PT30M"` or `"01:00:00"`
    pub runtime: String,
}

impl Default for ResourceRequirements {
    fn default() -> Self {
        Self {
            num_cpus: 1,
            num_gpus: 0,
            memory: "1m".to_string(),
            runtime: "PT1H".to_string(),
        }
    }
}

impl ResourceRequirements {
    pub fn memory_gb(&self) -> f64 {
        memory_string_to_gb(&self.memory)
    }

    pub fn runtime_seconds(&self) -> u64 {
        duration_string_to_seconds(&self.runtime).unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobModel {
    /// Workflow-scoped key; assigned by the store when empty
    #[serde(default)]
    pub key: String,

    pub workflow_key: String,

    /// Name of the job; unique within a workflow
    pub name: String,

    /// Command line executed through the shell. `${user_data.NAME}` placeholders are
    /// replaced with the consumed item's value at dispatch time.
    pub command: String,

    #[serde(default)]
    pub status: JobStatus,

    #[serde(default)]
    pub resource_requirements: ResourceRequirements,

    /// Keys of jobs that block this job
    #[serde(default)]
    pub depends_on: BTreeSet<String>,

    /// Names of user-data items this job reads
    #[serde(default)]
    pub input_user_data: BTreeSet<String>,

    /// Names of user-data items this job must write before completing
    #[serde(default)]
    pub output_user_data: BTreeSet<String>,

    #[serde(default)]
    pub scheduler: SchedulerAssignment,

    /// The job handles SIGTERM and may be given a grace period
    #[serde(default)]
    pub supports_termination: bool,

    /// Cancel this job if a blocking job ends unsuccessfully
    #[serde(default = "default_true")]
    pub cancel_on_blocking_job_failure: bool,

    /// Attempt number of the current or next execution, starting at 1
    #[serde(default = "default_attempt_id")]
    pub attempt_id: i64,

    /// Id of the worker that claimed the job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_attempt_id() -> i64 {
    1
}

impl JobModel {
    pub fn new(workflow_key: &str, name: &str, command: &str) -> Self {
        JobModel {
            key: String::new(),
            workflow_key: workflow_key.to_string(),
            name: name.to_string(),
            command: command.to_string(),
            status: JobStatus::Uninitialized,
            resource_requirements: ResourceRequirements::default(),
            depends_on: BTreeSet::new(),
            input_user_data: BTreeSet::new(),
            output_user_data: BTreeSet::new(),
            scheduler: SchedulerAssignment::None,
            supports_termination: false,
            cancel_on_blocking_job_failure: true,
            attempt_id: 1,
            claimed_by: None,
        }
    }
}

/// One execution attempt of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultModel {
    #[serde(default)]
    pub key: String,
    pub workflow_key: String,
    pub job_key: String,
    pub attempt_id: i64,
    /// Worker that ran the attempt
    pub worker_id: String,
    /// Code returned by the job. Zero is success; negative values are signal numbers.
    pub return_code: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub exec_time_minutes: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peak_cpu_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_cpu_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peak_memory_gb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_memory_gb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peak_num_processes: Option<u64>,
    pub status: JobStatus,
}

/// Named JSON payload scoped to a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserDataItem {
    #[serde(default)]
    pub key: String,
    pub workflow_key: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl UserDataItem {
    pub fn new(workflow_key: &str, name: &str, data: Option<serde_json::Value>) -> Self {
        Self {
            key: String::new(),
            workflow_key: workflow_key.to_string(),
            name: name.to_string(),
            data,
        }
    }

    pub fn has_data(&self) -> bool {
        matches!(self.data, Some(ref v) if !v.is_null())
    }
}

/// Normalized status of a batch-scheduler job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HpcJobStatus {
    #[default]
    Unknown,
    None,
    Queued,
    Running,
    Complete,
}

impl std::fmt::Display for HpcJobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HpcJobStatus::Unknown => "unknown",
            HpcJobStatus::None => "none",
            HpcJobStatus::Queued => "queued",
            HpcJobStatus::Running => "running",
            HpcJobStatus::Complete => "complete",
        };
        write!(f, "{}", s)
    }
}

/// Links an internal job attempt to an external batch-scheduler job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HpcJobRecord {
    pub workflow_key: String,
    pub job_key: String,
    pub attempt_id: i64,
    pub scheduler_name: String,
    pub hpc_job_id: String,
    pub status: HpcJobStatus,
    pub submitted_at: DateTime<Utc>,
}

/// Resource monitoring settings for a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceMonitorConfig {
    pub enabled: bool,
    pub sample_interval_seconds: f64,
    /// Write every sample to a JSON-lines file next to the job's stdio files
    pub generate_time_series: bool,
}

impl Default for ResourceMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_interval_seconds: 5.0,
            generate_time_series: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowModel {
    #[serde(default)]
    pub key: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub is_canceled: bool,
    /// Treat disabled upstream jobs as satisfied dependencies
    #[serde(default)]
    pub ignore_disabled_upstreams: bool,
    #[serde(default)]
    pub resource_monitor: ResourceMonitorConfig,
    pub created_at: DateTime<Utc>,
}

impl WorkflowModel {
    pub fn new(name: &str) -> Self {
        Self {
            key: String::new(),
            name: name.to_string(),
            description: None,
            is_canceled: false,
            ignore_disabled_upstreams: false,
            resource_monitor: ResourceMonitorConfig::default(),
            created_at: Utc::now(),
        }
    }
}

/// Resources a worker offers to the jobs it claims.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResources {
    pub num_cpus: i64,
    pub num_gpus: i64,
    pub memory_gb: f64,
    /// Names of the HPC scheduler adapters this worker can submit to
    #[serde(default)]
    pub hpc_schedulers: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_string_roundtrip() {
        for status in JobStatus::ALL {
            let parsed: JobStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("pending".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_job_status_int_conversion() {
        assert_eq!(JobStatus::Uninitialized.to_int(), 0);
        assert_eq!(JobStatus::Disabled.to_int(), 9);
        assert_eq!(JobStatus::from_int(5).unwrap(), JobStatus::SubmittedPending);
        assert!(JobStatus::from_int(42).is_err());
    }

    #[test]
    fn test_job_status_serde_names() {
        let json = serde_json::to_string(&JobStatus::SubmittedPending).unwrap();
        assert_eq!(json, "\"submitted_pending\"");
    }

    #[test]
    fn test_terminal_statuses() {
        let terminal: Vec<JobStatus> = JobStatus::ALL
            .into_iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(
            terminal,
            vec![
                JobStatus::Done,
                JobStatus::Terminated,
                JobStatus::Canceled,
                JobStatus::Disabled
            ]
        );
    }

    #[test]
    fn test_job_model_deserialize_defaults() {
        let job: JobModel = serde_json::from_value(serde_json::json!({
            "workflow_key": "wf1",
            "name": "a",
            "command": "echo a",
        }))
        .unwrap();
        assert_eq!(job.status, JobStatus::Uninitialized);
        assert!(job.cancel_on_blocking_job_failure);
        assert_eq!(job.attempt_id, 1);
        assert_eq!(job.scheduler, SchedulerAssignment::None);
        assert_eq!(job.resource_requirements.num_cpus, 1);
    }

    #[test]
    fn test_scheduler_assignment_serde() {
        let hpc = SchedulerAssignment::Hpc {
            name: "kestrel".to_string(),
        };
        let value = serde_json::to_value(&hpc).unwrap();
        assert_eq!(value, serde_json::json!({"type": "hpc", "name": "kestrel"}));
        assert_eq!(hpc.hpc_name(), Some("kestrel"));
        assert_eq!(SchedulerAssignment::Local.hpc_name(), None);
    }

    #[test]
    fn test_user_data_has_data() {
        assert!(!UserDataItem::new("wf", "x", None).has_data());
        assert!(!UserDataItem::new("wf", "x", Some(serde_json::Value::Null)).has_data());
        assert!(UserDataItem::new("wf", "x", Some(serde_json::json!(0))).has_data());
    }
}
