mod common;

use common::{create_runner, create_workflow, job_by_name, output_dir, store, wait_for_status};
use hpcflow::client::cancellation::CancellationController;
use hpcflow::client::hpc::HpcAdapters;
use hpcflow::client::job_runner::ExitReason;
use hpcflow::client::store::{GraphStore, InMemoryStore};
use hpcflow::client::utils::RetryPolicy;
use hpcflow::client::workflow_spec::{JobSpec, WorkflowSpec};
use hpcflow::models::JobStatus;
use rstest::rstest;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn controller(store: &InMemoryStore) -> CancellationController<'_> {
    CancellationController::new(store, HpcAdapters::new())
        .with_retry_policy(RetryPolicy::no_retries())
}

fn chain_spec() -> WorkflowSpec {
    let a = JobSpec::new("a", "true");
    let mut b = JobSpec::new("b", "true");
    b.depends_on = Some(vec!["a".to_string()]);
    let mut c = JobSpec::new("c", "true");
    c.depends_on = Some(vec!["b".to_string()]);
    WorkflowSpec::new("chain", vec![a, b, c])
}

#[rstest]
fn test_cancel_workflow_cancels_unstarted_jobs(store: Arc<InMemoryStore>) {
    let workflow = create_workflow(&store, &chain_spec());

    let summary = controller(&store).cancel_workflow(&workflow.key).unwrap();

    assert!(summary.flag_changed);
    assert_eq!(summary.canceled_jobs.len(), 3);
    assert_eq!(summary.in_flight_jobs, 0);
    for name in ["a", "b", "c"] {
        assert_eq!(job_by_name(&store, &workflow.key, name).status, JobStatus::Canceled);
    }
    assert!(store.is_workflow_canceled(&workflow.key).unwrap());
    assert!(store.is_workflow_complete(&workflow.key).unwrap());
}

#[rstest]
fn test_cancel_workflow_is_idempotent(store: Arc<InMemoryStore>) {
    let workflow = create_workflow(&store, &chain_spec());
    let cancel = controller(&store);

    let first = cancel.cancel_workflow(&workflow.key).unwrap();
    let second = cancel.cancel_workflow(&workflow.key).unwrap();

    assert!(first.flag_changed);
    assert!(!second.flag_changed);
    assert!(second.canceled_jobs.is_empty());
    assert!(second.hpc_jobs_canceled.is_empty());
    assert!(store.is_workflow_canceled(&workflow.key).unwrap());
}

#[rstest]
fn test_cancel_leaves_finished_jobs_alone(store: Arc<InMemoryStore>, output_dir: TempDir) {
    let mut spec = chain_spec();
    spec.jobs.push(JobSpec::new("solo", "true"));
    let workflow = create_workflow(&store, &spec);

    let mut runner = create_runner(&store, &workflow, "worker-1", &output_dir);
    runner.run_worker().unwrap();

    let summary = controller(&store).cancel_workflow(&workflow.key).unwrap();
    assert!(summary.canceled_jobs.is_empty());
    for name in ["a", "b", "c", "solo"] {
        assert_eq!(job_by_name(&store, &workflow.key, name).status, JobStatus::Done);
    }
}

#[rstest]
fn test_cancel_job_cascades_to_dependents(store: Arc<InMemoryStore>) {
    let mut spec = chain_spec();
    spec.jobs.push(JobSpec::new("other", "true"));
    let workflow = create_workflow(&store, &spec);
    let a = job_by_name(&store, &workflow.key, "a");

    let cancel = controller(&store);
    assert!(cancel.cancel_job(&workflow.key, &a.key).unwrap());
    assert!(!cancel.cancel_job(&workflow.key, &a.key).unwrap());

    for name in ["a", "b", "c"] {
        assert_eq!(job_by_name(&store, &workflow.key, name).status, JobStatus::Canceled);
    }
    assert_eq!(job_by_name(&store, &workflow.key, "other").status, JobStatus::Ready);
    assert!(!store.is_workflow_canceled(&workflow.key).unwrap());
}

#[rstest]
fn test_cancel_stops_running_job_that_ignores_sigterm(
    store: Arc<InMemoryStore>,
    output_dir: TempDir,
) {
    let mut stubborn = JobSpec::new("stubborn", "trap '' TERM; sleep 30");
    stubborn.supports_termination = Some(true);
    let mut after = JobSpec::new("after", "true");
    after.depends_on = Some(vec!["stubborn".to_string()]);
    let workflow = create_workflow(&store, &WorkflowSpec::new("stubborn", vec![stubborn, after]));

    let mut runner = create_runner(&store, &workflow, "worker-1", &output_dir);
    let handle = thread::spawn(move || runner.run_worker().unwrap());
    wait_for_status(
        &store,
        &workflow.key,
        "stubborn",
        JobStatus::Submitted,
        Duration::from_secs(10),
    );

    let start = Instant::now();
    let summary = controller(&store).cancel_workflow(&workflow.key).unwrap();
    assert_eq!(summary.in_flight_jobs, 1);
    assert_eq!(summary.canceled_jobs.len(), 1);

    let result = handle.join().unwrap();
    // Grace period is 500 ms; the job must not run to its natural end.
    assert!(start.elapsed() < Duration::from_secs(20));
    assert_eq!(result.exit_reason, ExitReason::WorkflowCanceled);
    assert!(result.had_cancellations);

    let stubborn = job_by_name(&store, &workflow.key, "stubborn");
    assert_eq!(stubborn.status, JobStatus::Canceled);
    let results = store.list_results(&workflow.key, Some(&stubborn.key)).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, JobStatus::Canceled);
    assert_ne!(results[0].return_code, 0);
    assert_eq!(job_by_name(&store, &workflow.key, "after").status, JobStatus::Canceled);
}

#[rstest]
fn test_cancel_of_job_exiting_cleanly_on_sigterm(store: Arc<InMemoryStore>, output_dir: TempDir) {
    let mut graceful = JobSpec::new("graceful", "trap 'exit 0' TERM; sleep 30 & wait");
    graceful.supports_termination = Some(true);
    let workflow = create_workflow(&store, &WorkflowSpec::new("graceful", vec![graceful]));

    let mut runner = create_runner(&store, &workflow, "worker-1", &output_dir);
    let handle = thread::spawn(move || runner.run_worker().unwrap());
    wait_for_status(
        &store,
        &workflow.key,
        "graceful",
        JobStatus::Submitted,
        Duration::from_secs(10),
    );
    // Give bash time to install the trap.
    thread::sleep(Duration::from_millis(200));

    let start = Instant::now();
    controller(&store).cancel_workflow(&workflow.key).unwrap();
    let result = handle.join().unwrap();
    assert!(start.elapsed() < Duration::from_secs(20));
    assert_eq!(result.exit_reason, ExitReason::WorkflowCanceled);
    assert!(result.had_cancellations);
    assert!(!result.had_failures);

    let job = job_by_name(&store, &workflow.key, "graceful");
    assert_eq!(job.status, JobStatus::Canceled);
    let results = store.list_results(&workflow.key, Some(&job.key)).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, JobStatus::Canceled);
    assert_ne!(results[0].return_code, 0);
}

#[rstest]
fn test_worker_exits_when_workflow_canceled_before_start(
    store: Arc<InMemoryStore>,
    output_dir: TempDir,
) {
    let workflow = create_workflow(&store, &chain_spec());
    controller(&store).cancel_workflow(&workflow.key).unwrap();

    let mut runner = create_runner(&store, &workflow, "worker-1", &output_dir);
    let result = runner.run_worker().unwrap();

    assert_eq!(result.exit_reason, ExitReason::WorkflowCanceled);
    assert_eq!(result.jobs_run, 0);
    assert!(store.list_results(&workflow.key, None).unwrap().is_empty());
}
