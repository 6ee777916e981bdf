mod common;

use common::{create_hpc_runner, create_workflow, job_by_name, output_dir, store, wait_for_status};
use hpcflow::client::cancellation::CancellationController;
use hpcflow::client::hpc::{FakeInterface, HpcAdapters, HpcInterface, HpcJobSpec, HpcJobStatus};
use hpcflow::client::job_runner::ExitReason;
use hpcflow::client::log_paths::{get_hpc_script_path, get_hpc_stdout_path};
use hpcflow::client::store::{GraphStore, InMemoryStore};
use hpcflow::client::utils::RetryPolicy;
use hpcflow::client::workflow_spec::{JobSpec, WorkflowSpec};
use hpcflow::errors::{EngineError, Result};
use hpcflow::models::{HpcJobRecord, JobStatus};
use rstest::rstest;
use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn fake_adapters() -> (Arc<FakeInterface>, HpcAdapters) {
    let fake = Arc::new(FakeInterface::new());
    let mut adapters = HpcAdapters::new();
    adapters.insert("fake".to_string(), fake.clone() as Arc<dyn HpcInterface>);
    (fake, adapters)
}

/// A scheduler that rejects every submission.
struct FullQueue;

impl HpcInterface for FullQueue {
    fn submit(&self, _spec: &HpcJobSpec) -> Result<HpcJobRecord> {
        Err(EngineError::Submission("queue full".to_string()))
    }

    fn cancel(&self, _record: &HpcJobRecord) -> Result<()> {
        Ok(())
    }

    fn get_statuses(&self) -> Result<HashMap<String, HpcJobStatus>> {
        Ok(HashMap::new())
    }
}

fn batch_job(name: &str, command: &str) -> JobSpec {
    let mut job = JobSpec::new(name, command);
    job.scheduler = Some("fake".to_string());
    job
}

#[rstest]
fn test_batch_job_runs_through_adapter(store: Arc<InMemoryStore>, output_dir: TempDir) {
    let workflow = create_workflow(
        &store,
        &WorkflowSpec::new("batch", vec![batch_job("remote", "echo from-batch")]),
    );
    let (_, adapters) = fake_adapters();

    let mut runner = create_hpc_runner(&store, &workflow, &output_dir, adapters);
    let result = runner.run_worker().unwrap();

    assert_eq!(result.jobs_run, 1);
    assert!(!result.had_failures);
    let job = job_by_name(&store, &workflow.key, "remote");
    assert_eq!(job.status, JobStatus::Done);
    let results = store.list_results(&workflow.key, Some(&job.key)).unwrap();
    assert_eq!(results[0].return_code, 0);

    let stdout = get_hpc_stdout_path(output_dir.path(), &job.key, job.attempt_id);
    assert_eq!(fs::read_to_string(stdout).unwrap().trim(), "from-batch");
    assert!(!get_hpc_script_path(output_dir.path(), &job.key, job.attempt_id).exists());
    assert!(store.list_hpc_jobs(&workflow.key).unwrap().is_empty());
}

#[rstest]
fn test_batch_job_failure_reads_return_code(store: Arc<InMemoryStore>, output_dir: TempDir) {
    let workflow = create_workflow(
        &store,
        &WorkflowSpec::new("batch", vec![batch_job("remote", "exit 5")]),
    );
    let (_, adapters) = fake_adapters();

    let mut runner = create_hpc_runner(&store, &workflow, &output_dir, adapters);
    let result = runner.run_worker().unwrap();

    assert!(result.had_failures);
    let job = job_by_name(&store, &workflow.key, "remote");
    assert_eq!(job.status, JobStatus::Terminated);
    let results = store.list_results(&workflow.key, Some(&job.key)).unwrap();
    assert_eq!(results[0].return_code, 5);
}

#[rstest]
fn test_rejected_submission_returns_job_to_pool(store: Arc<InMemoryStore>, output_dir: TempDir) {
    let workflow = create_workflow(
        &store,
        &WorkflowSpec::new("batch", vec![batch_job("remote", "true")]),
    );
    let mut adapters = HpcAdapters::new();
    adapters.insert("fake".to_string(), Arc::new(FullQueue) as Arc<dyn HpcInterface>);
    let runner = create_hpc_runner(&store, &workflow, &output_dir, adapters);

    let job = job_by_name(&store, &workflow.key, "remote");
    assert!(runner.claim(&job).unwrap());
    let claimed = job_by_name(&store, &workflow.key, "remote");
    let err = runner.execute(claimed).unwrap_err();
    assert!(matches!(err, EngineError::Submission(ref msg) if msg.contains("queue full")));

    let job = job_by_name(&store, &workflow.key, "remote");
    assert_eq!(job.status, JobStatus::Ready);
    assert_eq!(job.claimed_by, None);
    assert_eq!(job.attempt_id, 2);
    assert!(store.list_results(&workflow.key, None).unwrap().is_empty());
    assert!(store.list_hpc_jobs(&workflow.key).unwrap().is_empty());
}

#[rstest]
fn test_worker_without_adapter_skips_batch_jobs(store: Arc<InMemoryStore>, output_dir: TempDir) {
    let workflow = create_workflow(
        &store,
        &WorkflowSpec::new(
            "mixed",
            vec![batch_job("remote", "true"), JobSpec::new("local", "true")],
        ),
    );

    let mut runner = common::create_runner(&store, &workflow, "local-only", &output_dir);
    let handle = thread::spawn(move || runner.run_worker().unwrap());
    wait_for_status(
        &store,
        &workflow.key,
        "local",
        JobStatus::Done,
        Duration::from_secs(10),
    );
    assert_eq!(job_by_name(&store, &workflow.key, "remote").status, JobStatus::Ready);

    // A batch-capable worker finishes the workflow and the first worker exits with it.
    let (_, adapters) = fake_adapters();
    let mut hpc_runner = create_hpc_runner(&store, &workflow, &output_dir, adapters);
    hpc_runner.run_worker().unwrap();
    assert_eq!(handle.join().unwrap().exit_reason, ExitReason::WorkflowComplete);
    assert_eq!(job_by_name(&store, &workflow.key, "remote").status, JobStatus::Done);
}

#[rstest]
fn test_unknown_job_id_polls_complete() {
    let fake = FakeInterface::new();
    let record = HpcJobRecord {
        workflow_key: "1".to_string(),
        job_key: "2".to_string(),
        attempt_id: 1,
        scheduler_name: "fake".to_string(),
        hpc_job_id: "fake-999".to_string(),
        status: HpcJobStatus::Running,
        submitted_at: chrono::Utc::now(),
    };
    assert_eq!(fake.poll(&record).unwrap(), HpcJobStatus::Complete);
    assert!(fake.cancel(&record).is_ok());
}

#[rstest]
fn test_cancel_workflow_cancels_allocation(store: Arc<InMemoryStore>, output_dir: TempDir) {
    let workflow = create_workflow(
        &store,
        &WorkflowSpec::new("batch", vec![batch_job("long", "sleep 30")]),
    );
    let (fake, adapters) = fake_adapters();

    let mut runner = create_hpc_runner(&store, &workflow, &output_dir, adapters);
    let handle = thread::spawn(move || runner.run_worker().unwrap());
    wait_for_status(
        &store,
        &workflow.key,
        "long",
        JobStatus::Submitted,
        Duration::from_secs(10),
    );
    assert_eq!(store.list_hpc_jobs(&workflow.key).unwrap().len(), 1);

    let mut cancel_adapters = HpcAdapters::new();
    cancel_adapters.insert("fake".to_string(), fake as Arc<dyn HpcInterface>);
    let summary = CancellationController::new(store.as_ref(), cancel_adapters)
        .with_retry_policy(RetryPolicy::no_retries())
        .cancel_workflow(&workflow.key)
        .unwrap();
    assert_eq!(summary.hpc_jobs_canceled.len(), 1);
    assert!(summary.hpc_cancel_failures.is_empty());

    let result = handle.join().unwrap();
    assert_eq!(result.exit_reason, ExitReason::WorkflowCanceled);
    let job = job_by_name(&store, &workflow.key, "long");
    assert_eq!(job.status, JobStatus::Canceled);
    let results = store.list_results(&workflow.key, Some(&job.key)).unwrap();
    assert_ne!(results[0].return_code, 0);
    assert!(store.list_hpc_jobs(&workflow.key).unwrap().is_empty());
}
