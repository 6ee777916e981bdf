#![allow(dead_code)]

use hpcflow::client::hpc::HpcAdapters;
use hpcflow::client::job_runner::{JobRunner, WorkerRules};
use hpcflow::client::store::{GraphStore, InMemoryStore, JobFilter};
use hpcflow::client::utils::RetryPolicy;
use hpcflow::client::workflow_manager::WorkflowManager;
use hpcflow::client::workflow_spec::WorkflowSpec;
use hpcflow::models::{JobModel, JobStatus, WorkerResources, WorkflowModel};
use rstest::fixture;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

#[fixture]
pub fn store() -> Arc<InMemoryStore> {
    Arc::new(InMemoryStore::new())
}

#[fixture]
pub fn output_dir() -> TempDir {
    TempDir::new().expect("Failed to create temp dir")
}

/// Short intervals so tests finish quickly.
pub fn fast_rules() -> WorkerRules {
    WorkerRules {
        poll_interval: Duration::from_millis(50),
        grace_period: Duration::from_millis(500),
        expiration_buffer_seconds: 0,
        wait_for_new_jobs_seconds: 0,
        min_time_for_new_jobs_seconds: 0,
        wait_for_healthy_store_minutes: 0.0,
        hpc_poll_interval: Duration::from_millis(100),
        keep_submission_scripts: false,
    }
}

pub fn test_resources() -> WorkerResources {
    WorkerResources {
        num_cpus: 4,
        num_gpus: 0,
        memory_gb: 8.0,
        hpc_schedulers: Vec::new(),
    }
}

/// Import and initialize a workflow.
pub fn create_workflow(store: &InMemoryStore, spec: &WorkflowSpec) -> WorkflowModel {
    let workflow = WorkflowManager::create_workflow_from_spec(store, spec)
        .expect("Failed to create workflow");
    WorkflowManager::new(store, &workflow)
        .initialize()
        .expect("Failed to initialize workflow");
    workflow
}

pub fn create_runner(
    store: &Arc<InMemoryStore>,
    workflow: &WorkflowModel,
    worker_id: &str,
    output_dir: &TempDir,
) -> JobRunner {
    let store: Arc<dyn GraphStore> = store.clone();
    JobRunner::new(
        store,
        workflow.clone(),
        worker_id,
        output_dir.path().to_path_buf(),
        test_resources(),
        fast_rules(),
    )
    .with_retry_policy(RetryPolicy::no_retries())
}

pub fn create_hpc_runner(
    store: &Arc<InMemoryStore>,
    workflow: &WorkflowModel,
    output_dir: &TempDir,
    adapters: HpcAdapters,
) -> JobRunner {
    create_runner(store, workflow, "hpc-worker", output_dir).with_adapters(adapters)
}

pub fn job_by_name(store: &InMemoryStore, workflow_key: &str, name: &str) -> JobModel {
    store
        .list_all_jobs(workflow_key, &JobFilter::default())
        .expect("Failed to list jobs")
        .into_iter()
        .find(|j| j.name == name)
        .unwrap_or_else(|| panic!("job {} not found", name))
}

/// Poll until the named job reaches `status`. Panics after `timeout`.
pub fn wait_for_status(
    store: &InMemoryStore,
    workflow_key: &str,
    name: &str,
    status: JobStatus,
    timeout: Duration,
) {
    let start = Instant::now();
    loop {
        if job_by_name(store, workflow_key, name).status == status {
            return;
        }
        assert!(
            start.elapsed() < timeout,
            "job {} did not reach {} within {:?}",
            name,
            status,
            timeout
        );
        thread::sleep(Duration::from_millis(20));
    }
}
