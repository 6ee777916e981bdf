//! hpcflow: job lifecycle state machine and execution engine for HPC workflows.
//!
//! The engine tracks a directed graph of jobs, decides which jobs are eligible to run,
//! dispatches them to workers (local subprocesses or batch-scheduler allocations), monitors
//! resource usage and completion, and propagates cancellation.

pub mod client;
pub mod config;
pub mod errors;
pub mod logging;
pub mod memory_utils;
pub mod models;
pub mod time_utils;

pub use errors::{EngineError, Result};
pub use models::{
    HpcJobRecord, HpcJobStatus, JobModel, JobStatus, ResultModel, SchedulerAssignment,
    UserDataItem, WorkerResources, WorkflowModel,
};
