//! Client-side engine for hpcflow workflows
//!
//! This module contains the graph store boundary, the job lifecycle state machine, workflow
//! construction and recovery, cancellation, batch scheduler adapters and the job runner.

pub mod async_cli_command;
pub mod cancellation;
pub mod hpc;
pub mod job_runner;
pub mod log_paths;
pub mod resource_monitor;
pub mod state_machine;
pub mod store;
pub mod user_data;
pub mod utils;
pub mod workflow_graph;
pub mod workflow_manager;
pub mod workflow_spec;

// Re-exports for convenience
pub use cancellation::{CancelSummary, CancellationController};
pub use hpc::{
    FakeInterface, HpcAdapters, HpcInterface, HpcJobSpec, HpcJobStatus, HpcType, PbsInterface,
    SlurmInterface, create_adapters, create_hpc_interface,
};
pub use job_runner::{ExitReason, JobRunner, WorkerResult, WorkerRules};
pub use state_machine::{DependencyPolicy, JobEvent};
pub use store::{GraphStore, InMemoryStore, JobFilter, ReadyJobs, RemoteStore};
pub use user_data::UserDataClient;
pub use utils::{RetryPolicy, send_with_retries};
pub use workflow_graph::WorkflowGraph;
pub use workflow_manager::{RecoverySummary, WorkflowManager};
pub use workflow_spec::{JobSpec, ResourceRequirementsSpec, UserDataSpec, WorkflowSpec};
