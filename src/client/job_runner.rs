//! Job Runner - the worker loop that claims and executes workflow jobs.
//!
//! This module provides the [`JobRunner`] struct, which polls the graph store for READY jobs
//! that fit this worker, claims one at a time through an atomic compare-and-swap, runs it as a
//! local subprocess or through a batch scheduler adapter, and writes the result and the new
//! status back to the store before re-evaluating the job's dependents.
//!
//! # Signal Handling (SIGTERM)
//!
//! When a batch scheduler is about to reach walltime it sends SIGTERM to the worker. External
//! code (the `hpcflow-job-runner` binary) registers a handler that sets the flag returned by
//! [`JobRunner::get_termination_flag()`]. The runner notices the flag within one tick, stops
//! the running job and exits its loop:
//!
//! - Jobs with `supports_termination = true` receive SIGTERM and the configured grace period
//! - Jobs with `supports_termination = false` are killed immediately with SIGKILL
//! - Batch allocations are canceled through their adapter
//! - The job ends in `JobStatus::Terminated`
//!
//! ```ignore
//! use signal_hook::consts::SIGTERM;
//! use signal_hook::flag;
//!
//! let mut job_runner = JobRunner::new(/* ... */);
//! flag::register(SIGTERM, job_runner.get_termination_flag())?;
//! job_runner.run_worker()?;
//! ```
//!
//! # Cancellation
//!
//! While a job runs, the runner re-reads the workflow's cancel flag every poll interval. When
//! it is set, the job is stopped the same way and ends in `JobStatus::Canceled` with a
//! non-zero return code.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use sysinfo::{System, SystemExt};

use crate::client::async_cli_command::{AsyncCliCommand, UNKNOWN_RETURN_CODE};
use crate::client::hpc::common::read_return_code;
use crate::client::hpc::{HpcAdapters, HpcInterface, HpcJobSpec, HpcJobStatus};
use crate::client::log_paths::{
    get_hpc_return_code_path, get_hpc_script_path, get_hpc_stderr_path, get_hpc_stdout_path,
    get_job_stderr_path, get_job_stdout_path, get_job_time_series_path, get_user_data_output_dir,
};
use crate::client::resource_monitor::ProcessStats;
use crate::client::state_machine::{DependencyPolicy, JobEvent, next_status};
use crate::client::store::{DEFAULT_PAGE_SIZE, GraphStore, ReadyJobs};
use crate::client::user_data::{UserDataClient, substitute};
use crate::client::utils::{self, RetryPolicy, sleep_sliced};
use crate::client::workflow_manager::WorkflowManager;
use crate::config::{ClientRunConfig, HpcConfig};
use crate::errors::{EngineError, Result};
use crate::memory_utils::bytes_to_gb;
use crate::models::{
    HpcJobRecord, JobModel, JobStatus, ResultModel, SchedulerAssignment, WorkerResources,
    WorkflowModel,
};

/// Return code recorded when a job could not be started or its allocation ended without
/// reporting one.
pub const FAILED_RETURN_CODE: i64 = 1;

/// Return code recorded for a stopped job whose process still exited with 0 (-SIGTERM).
pub const STOPPED_RETURN_CODE: i64 = -15;

const TICK: Duration = Duration::from_millis(100);

/// Why `run_worker` returned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExitReason {
    #[default]
    WorkflowComplete,
    WorkflowCanceled,
    TerminationRequested,
    /// Less than `min_time_for_new_jobs_seconds` of the time budget was left
    TimeLimit,
    /// No job was claimed for `wait_for_new_jobs_seconds`
    Idle,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitReason::WorkflowComplete => "workflow_complete",
            ExitReason::WorkflowCanceled => "workflow_canceled",
            ExitReason::TerminationRequested => "termination_requested",
            ExitReason::TimeLimit => "time_limit",
            ExitReason::Idle => "idle",
        };
        write!(f, "{}", s)
    }
}

/// Result of running the job worker.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct WorkerResult {
    pub jobs_run: usize,
    /// True if any job exited unsuccessfully or could not be executed
    pub had_failures: bool,
    /// True if any job was stopped because of SIGTERM or the time limit
    pub had_terminations: bool,
    pub had_cancellations: bool,
    pub exit_reason: ExitReason,
}

impl WorkerResult {
    fn record(&mut self, result: &ResultModel, stop: StopKind) {
        self.jobs_run += 1;
        match (result.status, stop) {
            (JobStatus::Done, _) => {}
            (JobStatus::Canceled, _) => self.had_cancellations = true,
            (_, StopKind::TimeLimit) => self.had_terminations = true,
            _ => self.had_failures = true,
        }
    }
}

/// Timing and shutdown rules of a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerRules {
    /// Interval between polls for ready jobs and between cancel-flag checks
    pub poll_interval: Duration,
    /// Time a job that handles SIGTERM is given before it is killed
    pub grace_period: Duration,
    /// Stop this many seconds before the end of the time budget
    pub expiration_buffer_seconds: u64,
    /// Exit after this many seconds without claiming a job. 0 waits until the workflow is
    /// complete.
    pub wait_for_new_jobs_seconds: u64,
    /// Stop claiming new jobs when less than this much time remains
    pub min_time_for_new_jobs_seconds: u64,
    pub wait_for_healthy_store_minutes: f64,
    /// Interval between batch scheduler status queries
    pub hpc_poll_interval: Duration,
    pub keep_submission_scripts: bool,
}

impl WorkerRules {
    pub fn from_config(run: &ClientRunConfig, hpc: &HpcConfig) -> Self {
        WorkerRules {
            poll_interval: Duration::from_secs_f64(run.poll_interval.max(0.0)),
            grace_period: Duration::from_secs_f64(run.grace_period_seconds.max(0.0)),
            expiration_buffer_seconds: run.expiration_buffer_seconds,
            wait_for_new_jobs_seconds: run.wait_for_new_jobs_seconds,
            min_time_for_new_jobs_seconds: run.min_time_for_new_jobs_seconds,
            wait_for_healthy_store_minutes: run.wait_for_healthy_store_minutes,
            hpc_poll_interval: Duration::from_secs_f64(hpc.poll_interval.max(0.0)),
            keep_submission_scripts: hpc.keep_submission_scripts,
        }
    }
}

impl Default for WorkerRules {
    fn default() -> Self {
        Self::from_config(&ClientRunConfig::default(), &HpcConfig::default())
    }
}

/// Resources offered by this host, with configured values taking precedence.
pub fn detect_worker_resources(run: &ClientRunConfig) -> WorkerResources {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.refresh_cpu();
    WorkerResources {
        num_cpus: run.num_cpus.unwrap_or(sys.cpus().len().max(1) as i64),
        num_gpus: run.num_gpus.unwrap_or(0),
        memory_gb: run
            .memory_gb
            .unwrap_or_else(|| bytes_to_gb(sys.total_memory())),
        hpc_schedulers: Vec::new(),
    }
}

/// A worker id unique across hosts and restarts: `<hostname>-<pid>-<random>`.
pub fn default_worker_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", host, std::process::id(), &suffix[..8])
}

/// True if this worker can run `job`.
///
/// Batch jobs only need an adapter for their scheduler. Local jobs must fit the worker's CPUs,
/// GPUs and memory, and their runtime must fit in `remaining_seconds` when a time budget is set.
pub fn job_fits(job: &JobModel, resources: &WorkerResources, remaining_seconds: Option<i64>) -> bool {
    if let Some(name) = job.scheduler.hpc_name() {
        return resources.hpc_schedulers.iter().any(|s| s == name);
    }
    let rr = &job.resource_requirements;
    if rr.num_cpus > resources.num_cpus || rr.num_gpus > resources.num_gpus {
        return false;
    }
    if rr.memory_gb() > resources.memory_gb + 1e-9 {
        return false;
    }
    match remaining_seconds {
        Some(remaining) => (rr.runtime_seconds() as i64) <= remaining,
        None => true,
    }
}

/// How a job's execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopKind {
    Exited,
    Canceled,
    /// Stopped because of SIGTERM to the worker or the end of its time budget
    TimeLimit,
}

struct Execution {
    return_code: i64,
    stop: StopKind,
    start_time: DateTime<Utc>,
    exec_time_minutes: f64,
    stats: Option<ProcessStats>,
}

enum Launch {
    Started(Execution),
    Failed(String),
}

/// Canceled and stopped jobs never report success.
fn stopped_return_code(return_code: i64) -> i64 {
    if return_code == 0 {
        STOPPED_RETURN_CODE
    } else {
        return_code
    }
}

pub struct JobRunner {
    store: Arc<dyn GraphStore>,
    workflow: WorkflowModel,
    pub workflow_key: String,
    pub worker_id: String,
    output_dir: PathBuf,
    resources: WorkerResources,
    rules: WorkerRules,
    policy: DependencyPolicy,
    retry: RetryPolicy,
    end_time: Option<DateTime<Utc>>,
    adapters: HpcAdapters,
    /// Flag set when SIGTERM is received. Shared with signal handler.
    termination_requested: Arc<AtomicBool>,
    /// Monotonic timestamp of when a job was last claimed. Used for idle timeout.
    last_job_claimed_time: Option<Instant>,
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn GraphStore>,
        workflow: WorkflowModel,
        worker_id: &str,
        output_dir: PathBuf,
        resources: WorkerResources,
        rules: WorkerRules,
    ) -> Self {
        JobRunner {
            store,
            workflow_key: workflow.key.clone(),
            policy: DependencyPolicy::from_workflow(&workflow),
            workflow,
            worker_id: worker_id.to_string(),
            output_dir,
            resources,
            retry: RetryPolicy::from_minutes(rules.wait_for_healthy_store_minutes),
            rules,
            end_time: None,
            adapters: HpcAdapters::new(),
            termination_requested: Arc::new(AtomicBool::new(false)),
            last_job_claimed_time: None,
        }
    }

    /// Batch scheduler adapters this worker submits to, keyed by scheduler name.
    pub fn with_adapters(mut self, adapters: HpcAdapters) -> Self {
        let mut names: Vec<String> = adapters.keys().cloned().collect();
        names.sort();
        self.resources.hpc_schedulers = names;
        self.adapters = adapters;
        self
    }

    /// End of the worker's time budget. Unset means unlimited.
    pub fn with_end_time(mut self, end_time: Option<DateTime<Utc>>) -> Self {
        self.end_time = end_time;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn resources(&self) -> &WorkerResources {
        &self.resources
    }

    /// Execute a store call with automatic retries for connectivity errors.
    fn send_with_retries<T, F>(&self, api_call: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        utils::send_with_retries(api_call, &self.retry)
    }

    /// Returns a clone of the termination flag for use with signal handlers.
    pub fn get_termination_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.termination_requested)
    }

    pub fn is_termination_requested(&self) -> bool {
        self.termination_requested.load(Ordering::SeqCst)
    }

    /// Requests termination programmatically, as if SIGTERM had been received.
    pub fn request_termination(&self) {
        self.termination_requested.store(true, Ordering::SeqCst);
    }

    /// Seconds left in the time budget after the expiration buffer, if there is a budget.
    fn remaining_seconds(&self) -> Option<i64> {
        self.end_time.map(|end| {
            (end - Utc::now()).num_seconds() - self.rules.expiration_buffer_seconds as i64
        })
    }

    fn deadline_passed(&self) -> bool {
        self.remaining_seconds().is_some_and(|r| r <= 0)
    }

    /// Cancel-flag check used while a job runs. Store errors are logged and do not stop the job.
    fn check_canceled(&self) -> bool {
        match self.store.is_workflow_canceled(&self.workflow_key) {
            Ok(canceled) => canceled,
            Err(e) => {
                warn!(
                    "Failed to check cancel flag workflow_key={} error={}",
                    self.workflow_key, e
                );
                false
            }
        }
    }

    /// Lazily iterate the READY jobs that fit this worker.
    pub fn poll_ready_jobs(&self) -> ReadyJobs<'_> {
        let resources = self.resources.clone();
        let remaining = self.remaining_seconds();
        ReadyJobs::new(self.store.as_ref(), &self.workflow_key, DEFAULT_PAGE_SIZE)
            .with_predicate(move |job| job_fits(job, &resources, remaining))
    }

    /// Atomically claim a READY job. Returns false if another worker won.
    pub fn claim(&self, job: &JobModel) -> Result<bool> {
        let mut attempts = 0;
        let claimed = self.send_with_retries(|| {
            attempts += 1;
            self.store
                .claim_job(&self.workflow_key, &job.key, &self.worker_id)
        })?;
        if claimed || attempts == 1 {
            return Ok(claimed);
        }

        // An earlier attempt may have been applied before its reply was lost.
        let current = self.send_with_retries(|| self.store.get_job(&self.workflow_key, &job.key))?;
        let ours = current.status == JobStatus::Scheduled
            && current.claimed_by.as_deref() == Some(self.worker_id.as_str());
        if ours {
            info!(
                "Claim applied by an earlier attempt workflow_key={} job_key={} worker_id={}",
                self.workflow_key, job.key, self.worker_id
            );
        }
        Ok(ours)
    }

    fn claim_next_job(&self) -> Result<Option<JobModel>> {
        let mut ready = self.poll_ready_jobs();
        while let Some(job) = ready.next() {
            let mut job = job?;
            if self.claim(&job)? {
                job.status = JobStatus::Scheduled;
                job.claimed_by = Some(self.worker_id.clone());
                debug!(
                    "Claimed job workflow_key={} job_key={} worker_id={}",
                    self.workflow_key, job.key, self.worker_id
                );
                return Ok(Some(job));
            }
            debug!(
                "Lost claim workflow_key={} job_key={}",
                self.workflow_key, job.key
            );
            ready.restart();
        }
        Ok(None)
    }

    /// Apply `event` to `job` in the store. On a lost race `job.status` is refreshed from the
    /// store and false is returned.
    fn transition(&self, job: &mut JobModel, event: JobEvent) -> Result<bool> {
        let to = next_status(job, &HashMap::new(), event, self.policy)?;
        if to == job.status {
            return Ok(true);
        }
        let swapped = self.send_with_retries(|| {
            self.store
                .compare_and_set_status(&self.workflow_key, &job.key, job.status, to)
        })?;
        if swapped {
            job.status = to;
        } else {
            let current = self.send_with_retries(|| self.store.get_job(&self.workflow_key, &job.key))?;
            warn!(
                "Job status changed by another party workflow_key={} job_key={} expected={} actual={}",
                self.workflow_key, job.key, job.status, current.status
            );
            job.status = current.status;
        }
        Ok(swapped)
    }

    fn prepare_output_dir(&self) -> Result<PathBuf> {
        if !self.output_dir.exists() {
            fs::create_dir_all(&self.output_dir)?;
            info!("Created output directory: {}", self.output_dir.display());
        }
        Ok(fs::canonicalize(&self.output_dir)?)
    }

    fn job_env(&self, job: &JobModel, output_dir: &Path, user_data_dir: &Path) -> Vec<(String, String)> {
        vec![
            ("HPCFLOW_WORKFLOW_KEY".to_string(), self.workflow_key.clone()),
            ("HPCFLOW_JOB_KEY".to_string(), job.key.clone()),
            ("HPCFLOW_JOB_NAME".to_string(), job.name.clone()),
            ("HPCFLOW_ATTEMPT_ID".to_string(), job.attempt_id.to_string()),
            ("HPCFLOW_WORKER_ID".to_string(), self.worker_id.clone()),
            (
                "HPCFLOW_OUTPUT_DIR".to_string(),
                output_dir.to_string_lossy().into_owned(),
            ),
            (
                "HPCFLOW_USER_DATA_OUTPUT_DIR".to_string(),
                user_data_dir.to_string_lossy().into_owned(),
            ),
        ]
    }

    /// Run a claimed job to completion and persist its result and final status.
    ///
    /// A rejected batch submission puts the job back to READY and returns
    /// `EngineError::Submission`.
    pub fn execute(&self, job: JobModel) -> Result<ResultModel> {
        self.execute_job(job).map(|(result, _)| result)
    }

    fn execute_job(&self, mut job: JobModel) -> Result<(ResultModel, StopKind)> {
        let output_dir = self.prepare_output_dir()?;
        let user_data_dir = get_user_data_output_dir(&output_dir, &job.key, job.attempt_id);
        fs::create_dir_all(&user_data_dir)?;
        let user_data = UserDataClient::new(self.store.as_ref(), self.retry);

        let command = match user_data.get_consumed(&self.workflow_key, &job) {
            Ok(items) => substitute(&job.command, &items),
            Err(e @ EngineError::MissingUserData { .. }) => {
                return self.finish_launch_failure(job, &e.to_string());
            }
            Err(e) => return Err(e),
        };
        let envs = self.job_env(&job, &output_dir, &user_data_dir);

        let launch = match job.scheduler.clone() {
            SchedulerAssignment::Hpc { name } => {
                self.execute_hpc(&mut job, &name, &command, &envs, &output_dir)?
            }
            SchedulerAssignment::None | SchedulerAssignment::Local => {
                self.execute_local(&mut job, &command, &envs, &output_dir)?
            }
        };
        let mut execution = match launch {
            Launch::Started(execution) => execution,
            Launch::Failed(msg) => return self.finish_launch_failure(job, &msg),
        };

        let mut missing = Vec::new();
        if execution.stop == StopKind::Exited {
            user_data.ingest_output_dir(&self.workflow_key, &job, &user_data_dir)?;
            missing = user_data.missing_produced(&self.workflow_key, &job)?;
            if self.check_canceled() {
                info!(
                    "Workflow canceled while job was finishing workflow_key={} job_key={}",
                    self.workflow_key, job.key
                );
                execution.stop = StopKind::Canceled;
            }
        }

        let event = match execution.stop {
            StopKind::Exited => {
                let outputs_present = missing.is_empty();
                if execution.return_code == 0 && !outputs_present {
                    error!(
                        "Job did not produce its outputs workflow_key={} job_key={} missing={}",
                        self.workflow_key,
                        job.key,
                        missing.join(",")
                    );
                    execution.return_code = FAILED_RETURN_CODE;
                }
                JobEvent::Exited {
                    return_code: execution.return_code,
                    outputs_present,
                }
            }
            StopKind::Canceled => {
                execution.return_code = stopped_return_code(execution.return_code);
                JobEvent::CancelRequested
            }
            StopKind::TimeLimit => {
                execution.return_code = stopped_return_code(execution.return_code);
                JobEvent::TimeLimitReached
            }
        };

        self.transition(&mut job, event)?;
        let result = self.record_result(&job, &execution)?;
        info!(
            "Job completed workflow_key={} job_key={} attempt_id={} status={} return_code={} exec_time_minutes={:.3}",
            self.workflow_key,
            job.key,
            job.attempt_id,
            job.status,
            execution.return_code,
            execution.exec_time_minutes
        );
        self.update_dependents(&job.key)?;
        Ok((result, execution.stop))
    }

    /// The job never ran: SCHEDULED -> TERMINATED with a result carrying return code 1.
    fn finish_launch_failure(&self, mut job: JobModel, msg: &str) -> Result<(ResultModel, StopKind)> {
        error!(
            "Job failed to start workflow_key={} job_key={} error={}",
            self.workflow_key, job.key, msg
        );
        self.transition(&mut job, JobEvent::LaunchFailed)?;
        let execution = Execution {
            return_code: FAILED_RETURN_CODE,
            stop: StopKind::Exited,
            start_time: Utc::now(),
            exec_time_minutes: 0.0,
            stats: None,
        };
        let result = self.record_result(&job, &execution)?;
        self.update_dependents(&job.key)?;
        Ok((result, StopKind::Exited))
    }

    fn record_result(&self, job: &JobModel, execution: &Execution) -> Result<ResultModel> {
        let stats = execution.stats.as_ref().filter(|s| s.num_samples > 0);
        let result = ResultModel {
            key: String::new(),
            workflow_key: self.workflow_key.clone(),
            job_key: job.key.clone(),
            attempt_id: job.attempt_id,
            worker_id: self.worker_id.clone(),
            return_code: execution.return_code,
            start_time: execution.start_time,
            end_time: Utc::now(),
            exec_time_minutes: execution.exec_time_minutes,
            peak_cpu_percent: stats.map(|s| s.max_cpu_percent),
            avg_cpu_percent: stats.map(|s| s.avg_cpu_percent),
            peak_memory_gb: stats.map(|s| s.max_memory_gb),
            avg_memory_gb: stats.map(|s| s.avg_memory_gb),
            peak_num_processes: stats.map(|s| s.peak_num_processes),
            status: job.status,
        };
        self.send_with_retries(|| self.store.add_result(result.clone()))
    }

    fn update_dependents(&self, job_key: &str) -> Result<Vec<(String, JobStatus)>> {
        WorkflowManager::new(self.store.as_ref(), &self.workflow)
            .with_retry_policy(self.retry)
            .update_dependents(job_key)
    }

    fn execute_local(
        &self,
        job: &mut JobModel,
        command: &str,
        envs: &[(String, String)],
        output_dir: &Path,
    ) -> Result<Launch> {
        let stdout_path = get_job_stdout_path(output_dir, &self.workflow_key, &job.key, job.attempt_id);
        let stderr_path = get_job_stderr_path(output_dir, &self.workflow_key, &job.key, job.attempt_id);
        let mut cmd = AsyncCliCommand::new(job.clone());
        if let Err(e) = cmd.start(command, &stdout_path, &stderr_path, envs) {
            return Ok(Launch::Failed(format!("failed to start command: {}", e)));
        }

        if !self.transition(job, JobEvent::Started)? {
            cmd.cancel()?;
            cmd.wait_for_completion()?;
            return Err(EngineError::Store(format!(
                "job {} was taken away from worker {} before it started",
                job.key, self.worker_id
            )));
        }

        let monitor = &self.workflow.resource_monitor;
        let time_series = monitor.generate_time_series.then(|| {
            get_job_time_series_path(output_dir, &self.workflow_key, &job.key, job.attempt_id)
        });
        cmd.attach_monitor(monitor, time_series);
        info!(
            "Job started workflow_key={} job_key={} attempt_id={} pid={}",
            self.workflow_key,
            job.key,
            job.attempt_id,
            cmd.pid.unwrap_or_default()
        );

        let stop = self.wait_for_local_job(&mut cmd)?;
        Ok(Launch::Started(Execution {
            return_code: cmd.return_code.unwrap_or(UNKNOWN_RETURN_CODE),
            stop,
            start_time: cmd.start_time,
            exec_time_minutes: cmd.exec_time_minutes(),
            stats: cmd.take_stats(),
        }))
    }

    fn wait_for_local_job(&self, cmd: &mut AsyncCliCommand) -> Result<StopKind> {
        let mut last_cancel_check = Instant::now();
        loop {
            cmd.check_status()?;
            if cmd.is_complete {
                return Ok(StopKind::Exited);
            }

            if self.is_termination_requested() || self.deadline_passed() {
                info!(
                    "Stopping job workflow_key={} job_key={} reason={}",
                    self.workflow_key,
                    cmd.job.key,
                    if self.is_termination_requested() { "sigterm" } else { "time_limit" }
                );
                cmd.terminate_with_grace(self.rules.grace_period)?;
                return Ok(StopKind::TimeLimit);
            }

            if last_cancel_check.elapsed() >= self.rules.poll_interval {
                last_cancel_check = Instant::now();
                if self.check_canceled() {
                    info!(
                        "Job canceled workflow_key={} job_key={}",
                        self.workflow_key, cmd.job.key
                    );
                    cmd.terminate_with_grace(self.rules.grace_period)?;
                    return Ok(StopKind::Canceled);
                }
            }

            thread::sleep(TICK.min(self.rules.poll_interval));
        }
    }

    fn execute_hpc(
        &self,
        job: &mut JobModel,
        scheduler_name: &str,
        command: &str,
        envs: &[(String, String)],
        output_dir: &Path,
    ) -> Result<Launch> {
        let Some(adapter) = self.adapters.get(scheduler_name).cloned() else {
            return Ok(Launch::Failed(format!(
                "no adapter configured for scheduler '{}'",
                scheduler_name
            )));
        };

        let spec = HpcJobSpec {
            workflow_key: self.workflow_key.clone(),
            job_key: job.key.clone(),
            attempt_id: job.attempt_id,
            job_name: format!("hpcflow_{}_{}", self.workflow_key, job.name),
            scheduler_name: scheduler_name.to_string(),
            command: command.to_string(),
            resource_requirements: job.resource_requirements.clone(),
            working_dir: std::env::current_dir()?,
            script_path: get_hpc_script_path(output_dir, &job.key, job.attempt_id),
            stdout_path: get_hpc_stdout_path(output_dir, &job.key, job.attempt_id),
            stderr_path: get_hpc_stderr_path(output_dir, &job.key, job.attempt_id),
            return_code_path: get_hpc_return_code_path(output_dir, &job.key, job.attempt_id),
            env: envs.to_vec(),
        };
        if spec.return_code_path.exists() {
            fs::remove_file(&spec.return_code_path)?;
        }

        let mut record = match adapter.submit(&spec) {
            Ok(record) => record,
            Err(e) => {
                error!(
                    "Job submission failed workflow_key={} job_key={} scheduler={} error={}",
                    self.workflow_key, job.key, scheduler_name, e
                );
                self.transition(job, JobEvent::SubmissionFailed)?;
                return Err(match e {
                    EngineError::Submission(_) => e,
                    other => EngineError::Submission(other.to_string()),
                });
            }
        };
        let start_time = Utc::now();
        let start_instant = Instant::now();
        self.send_with_retries(|| self.store.add_hpc_job(record.clone()))?;

        if !self.transition(job, JobEvent::Started)? {
            adapter.cancel(&record)?;
            return Err(EngineError::Store(format!(
                "job {} was taken away from worker {} before it started",
                job.key, self.worker_id
            )));
        }
        info!(
            "Job submitted workflow_key={} job_key={} attempt_id={} scheduler={} hpc_job_id={}",
            self.workflow_key, job.key, job.attempt_id, scheduler_name, record.hpc_job_id
        );

        let stop = self.wait_for_hpc_job(job, adapter.as_ref(), &mut record)?;
        let return_code = match read_return_code(&spec.return_code_path) {
            Some(rc) => rc,
            None => {
                if stop == StopKind::Exited {
                    warn!(
                        "Allocation ended without a return code workflow_key={} job_key={} hpc_job_id={}",
                        self.workflow_key, job.key, record.hpc_job_id
                    );
                }
                FAILED_RETURN_CODE
            }
        };

        if let Err(e) =
            self.send_with_retries(|| self.store.remove_hpc_job(&self.workflow_key, &job.key))
        {
            warn!(
                "Failed to remove hpc job record workflow_key={} job_key={} error={}",
                self.workflow_key, job.key, e
            );
        }
        if !self.rules.keep_submission_scripts && spec.script_path.exists() {
            fs::remove_file(&spec.script_path)?;
        }

        Ok(Launch::Started(Execution {
            return_code,
            stop,
            start_time,
            exec_time_minutes: start_instant.elapsed().as_secs_f64() / 60.0,
            stats: None,
        }))
    }

    fn wait_for_hpc_job(
        &self,
        job: &mut JobModel,
        adapter: &dyn HpcInterface,
        record: &mut HpcJobRecord,
    ) -> Result<StopKind> {
        let mut requested: Option<StopKind> = None;
        let mut stop_deadline: Option<Instant> = None;
        let mut last_poll: Option<Instant> = None;
        let mut last_cancel_check = Instant::now();

        loop {
            let poll_interval = if requested.is_some() {
                self.rules.hpc_poll_interval.min(Duration::from_secs(1))
            } else {
                self.rules.hpc_poll_interval
            };
            if last_poll.is_none_or(|t| t.elapsed() >= poll_interval) {
                last_poll = Some(Instant::now());
                match adapter.poll(record) {
                    Ok(status) => {
                        if status != record.status {
                            debug!(
                                "HPC job status changed hpc_job_id={} {} -> {}",
                                record.hpc_job_id, record.status, status
                            );
                            record.status = status;
                            if let Err(e) = self.store.update_hpc_job(record) {
                                warn!(
                                    "Failed to update hpc job record hpc_job_id={} error={}",
                                    record.hpc_job_id, e
                                );
                            }
                        }
                        match status {
                            HpcJobStatus::Complete => {
                                return Ok(requested.unwrap_or(StopKind::Exited));
                            }
                            HpcJobStatus::Queued if job.status == JobStatus::Submitted => {
                                self.transition(job, JobEvent::Queued)?;
                            }
                            _ => {}
                        }
                    }
                    Err(e) => warn!(
                        "Failed to poll hpc_job_id={} error={}",
                        record.hpc_job_id, e
                    ),
                }
            }

            match stop_deadline {
                Some(deadline) if Instant::now() >= deadline => {
                    warn!(
                        "Allocation still listed after cancel hpc_job_id={}; not waiting any longer",
                        record.hpc_job_id
                    );
                    return Ok(requested.unwrap_or(StopKind::Canceled));
                }
                Some(_) => {}
                None => {
                    let stop = if self.is_termination_requested() || self.deadline_passed() {
                        Some(StopKind::TimeLimit)
                    } else if last_cancel_check.elapsed() >= self.rules.poll_interval {
                        last_cancel_check = Instant::now();
                        self.check_canceled().then_some(StopKind::Canceled)
                    } else {
                        None
                    };
                    if let Some(stop) = stop {
                        info!(
                            "Canceling allocation workflow_key={} job_key={} hpc_job_id={} reason={:?}",
                            self.workflow_key, job.key, record.hpc_job_id, stop
                        );
                        if let Err(e) = adapter.cancel(record) {
                            error!(
                                "Failed to cancel hpc_job_id={} error={}",
                                record.hpc_job_id, e
                            );
                        }
                        requested = Some(stop);
                        stop_deadline = Some(Instant::now() + self.rules.grace_period);
                        last_poll = None;
                    }
                }
            }

            thread::sleep(TICK);
        }
    }

    /// Claim and run jobs until the workflow is complete or canceled, SIGTERM is received, the
    /// time budget runs out, or no job was claimed for `wait_for_new_jobs_seconds`.
    pub fn run_worker(&mut self) -> Result<WorkerResult> {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        let output_dir = self.prepare_output_dir()?;

        info!(
            "Starting hpcflow job runner version={} workflow_key={} worker_id={} hostname={} output_dir={} resources={:?} rules={:?} end_time={:?}",
            env!("CARGO_PKG_VERSION"),
            self.workflow_key,
            self.worker_id,
            hostname,
            output_dir.display(),
            self.resources,
            self.rules,
            self.end_time
        );

        let mut result = WorkerResult::default();
        self.last_job_claimed_time = Some(Instant::now());

        let exit_reason = loop {
            if self.is_termination_requested() {
                info!("Termination requested (SIGTERM received). Stopping job runner.");
                break ExitReason::TerminationRequested;
            }
            let canceled =
                self.send_with_retries(|| self.store.is_workflow_canceled(&self.workflow_key))?;
            if canceled {
                info!("Workflow canceled workflow_key={}", self.workflow_key);
                break ExitReason::WorkflowCanceled;
            }
            let complete =
                self.send_with_retries(|| self.store.is_workflow_complete(&self.workflow_key))?;
            if complete {
                info!("Workflow complete workflow_key={}", self.workflow_key);
                break ExitReason::WorkflowComplete;
            }
            if let Some(remaining) = self.remaining_seconds()
                && remaining < self.rules.min_time_for_new_jobs_seconds as i64
            {
                info!(
                    "Remaining time {}s is less than min_time_for_new_jobs_seconds={}. Stopping job runner.",
                    remaining.max(0),
                    self.rules.min_time_for_new_jobs_seconds
                );
                break ExitReason::TimeLimit;
            }

            if let Some(job) = self.claim_next_job()? {
                self.last_job_claimed_time = Some(Instant::now());
                let job_key = job.key.clone();
                match self.execute_job(job) {
                    Ok((job_result, stop)) => {
                        result.record(&job_result, stop);
                        continue;
                    }
                    Err(e) if e.is_connectivity() => return Err(e),
                    Err(EngineError::Submission(msg)) => {
                        warn!(
                            "Job returned to the pool after failed submission workflow_key={} job_key={} error={}",
                            self.workflow_key, job_key, msg
                        );
                    }
                    Err(e) => {
                        error!(
                            "Job execution failed workflow_key={} job_key={} error={}",
                            self.workflow_key, job_key, e
                        );
                        result.had_failures = true;
                    }
                }
            } else {
                debug!("No ready jobs workflow_key={}", self.workflow_key);
            }

            if self.rules.wait_for_new_jobs_seconds > 0 {
                let idle_seconds = self
                    .last_job_claimed_time
                    .map(|last_time| last_time.elapsed().as_secs())
                    .unwrap_or(0);
                if idle_seconds >= self.rules.wait_for_new_jobs_seconds {
                    info!(
                        "No jobs claimed for {} seconds (limit: {} seconds). Exiting job runner.",
                        idle_seconds, self.rules.wait_for_new_jobs_seconds
                    );
                    break ExitReason::Idle;
                }
            }

            let flag = Arc::clone(&self.termination_requested);
            sleep_sliced(self.rules.poll_interval, TICK, || flag.load(Ordering::SeqCst));
        };

        result.exit_reason = exit_reason;
        info!(
            "Job runner completed workflow_key={} worker_id={} jobs_run={} had_failures={} had_terminations={} had_cancellations={} exit_reason={}",
            self.workflow_key,
            self.worker_id,
            result.jobs_run,
            result.had_failures,
            result.had_terminations,
            result.had_cancellations,
            result.exit_reason
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::store::{InMemoryStore, JobFilter};
    use crate::models::{ResourceRequirements, UserDataItem};
    use rstest::rstest;

    fn resources() -> WorkerResources {
        WorkerResources {
            num_cpus: 4,
            num_gpus: 0,
            memory_gb: 8.0,
            hpc_schedulers: vec!["kestrel".to_string()],
        }
    }

    fn job(num_cpus: i64, memory: &str, runtime: &str) -> JobModel {
        let mut job = JobModel::new("1", "j", "true");
        job.resource_requirements = ResourceRequirements {
            num_cpus,
            num_gpus: 0,
            memory: memory.to_string(),
            runtime: runtime.to_string(),
        };
        job
    }

    #[rstest]
    #[case(job(4, "8g", "PT1H"), None, true)]
    #[case(job(5, "1g", "PT1H"), None, false)]
    #[case(job(1, "9g", "PT1H"), None, false)]
    #[case(job(1, "1g", "PT1H"), Some(3600), true)]
    #[case(job(1, "1g", "PT1H"), Some(3599), false)]
    fn test_job_fits(#[case] job: JobModel, #[case] remaining: Option<i64>, #[case] expected: bool) {
        assert_eq!(job_fits(&job, &resources(), remaining), expected);
    }

    #[test]
    fn test_hpc_job_needs_adapter() {
        let mut j = job(64, "500g", "P1D");
        j.scheduler = SchedulerAssignment::Hpc {
            name: "kestrel".to_string(),
        };
        assert!(job_fits(&j, &resources(), Some(10)));
        j.scheduler = SchedulerAssignment::Hpc {
            name: "other".to_string(),
        };
        assert!(!job_fits(&j, &resources(), None));
    }

    #[test]
    fn test_stopped_return_code() {
        assert_eq!(stopped_return_code(0), STOPPED_RETURN_CODE);
        assert_eq!(stopped_return_code(-9), -9);
        assert_eq!(stopped_return_code(3), 3);
    }

    #[test]
    fn test_worker_result_record() {
        let now = Utc::now();
        let mut result = ResultModel {
            key: String::new(),
            workflow_key: "1".to_string(),
            job_key: "2".to_string(),
            attempt_id: 1,
            worker_id: "w".to_string(),
            return_code: 0,
            start_time: now,
            end_time: now,
            exec_time_minutes: 0.0,
            peak_cpu_percent: None,
            avg_cpu_percent: None,
            peak_memory_gb: None,
            avg_memory_gb: None,
            peak_num_processes: None,
            status: JobStatus::Done,
        };
        let mut worker = WorkerResult::default();
        worker.record(&result, StopKind::Exited);
        result.status = JobStatus::Terminated;
        worker.record(&result, StopKind::TimeLimit);
        result.status = JobStatus::Canceled;
        worker.record(&result, StopKind::Canceled);
        assert_eq!(worker.jobs_run, 3);
        assert!(!worker.had_failures);
        assert!(worker.had_terminations);
        assert!(worker.had_cancellations);
    }

    #[test]
    fn test_rules_from_config() {
        let mut run = ClientRunConfig::default();
        run.poll_interval = 0.5;
        run.grace_period_seconds = 2.0;
        let rules = WorkerRules::from_config(&run, &HpcConfig::default());
        assert_eq!(rules.poll_interval, Duration::from_millis(500));
        assert_eq!(rules.grace_period, Duration::from_secs(2));
        assert_eq!(rules.hpc_poll_interval, Duration::from_secs(30));
        assert_eq!(rules.min_time_for_new_jobs_seconds, 300);
    }

    fn runner_with_job(command: &str) -> (JobRunner, JobModel, tempfile::TempDir) {
        let store = Arc::new(InMemoryStore::new());
        let workflow = store.create_workflow(WorkflowModel::new("wf")).unwrap();
        let mut job = JobModel::new(&workflow.key, "single", command);
        job.status = JobStatus::Ready;
        let job = store.add_job(job).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut rules = WorkerRules::default();
        rules.poll_interval = Duration::from_millis(50);
        let runner = JobRunner::new(
            store,
            workflow,
            "unit-worker",
            dir.path().to_path_buf(),
            resources(),
            rules,
        )
        .with_retry_policy(RetryPolicy::no_retries());
        (runner, job, dir)
    }

    #[test]
    fn test_claim_and_execute() {
        let (runner, job, _dir) = runner_with_job("exit 7");
        assert!(runner.claim(&job).unwrap());
        assert!(!runner.claim(&job).unwrap());

        let claimed = runner.store.get_job(&runner.workflow_key, &job.key).unwrap();
        assert_eq!(claimed.status, JobStatus::Scheduled);
        let result = runner.execute(claimed).unwrap();
        assert_eq!(result.return_code, 7);
        assert_eq!(result.status, JobStatus::Terminated);
        assert_eq!(result.worker_id, "unit-worker");
        let stored = runner.store.get_job(&runner.workflow_key, &job.key).unwrap();
        assert_eq!(stored.status, JobStatus::Terminated);
    }

    /// Applies the first claim but reports the store as unreachable, as when the reply of a
    /// committed request is lost.
    struct LostClaimReplyStore {
        inner: InMemoryStore,
        reply_lost: AtomicBool,
    }

    impl GraphStore for LostClaimReplyStore {
        fn create_workflow(&self, workflow: WorkflowModel) -> Result<WorkflowModel> {
            self.inner.create_workflow(workflow)
        }

        fn get_workflow(&self, workflow_key: &str) -> Result<WorkflowModel> {
            self.inner.get_workflow(workflow_key)
        }

        fn add_job(&self, job: JobModel) -> Result<JobModel> {
            self.inner.add_job(job)
        }

        fn get_job(&self, workflow_key: &str, job_key: &str) -> Result<JobModel> {
            self.inner.get_job(workflow_key, job_key)
        }

        fn list_jobs(
            &self,
            workflow_key: &str,
            filter: &JobFilter,
            offset: usize,
            limit: usize,
        ) -> Result<Vec<JobModel>> {
            self.inner.list_jobs(workflow_key, filter, offset, limit)
        }

        fn compare_and_set_status(
            &self,
            workflow_key: &str,
            job_key: &str,
            expected: JobStatus,
            status: JobStatus,
        ) -> Result<bool> {
            self.inner
                .compare_and_set_status(workflow_key, job_key, expected, status)
        }

        fn claim_job(&self, workflow_key: &str, job_key: &str, worker_id: &str) -> Result<bool> {
            let claimed = self.inner.claim_job(workflow_key, job_key, worker_id)?;
            if claimed && !self.reply_lost.swap(true, Ordering::SeqCst) {
                return Err(EngineError::StoreUnavailable("read timed out".to_string()));
            }
            Ok(claimed)
        }

        fn add_result(&self, result: ResultModel) -> Result<ResultModel> {
            self.inner.add_result(result)
        }

        fn list_results(
            &self,
            workflow_key: &str,
            job_key: Option<&str>,
        ) -> Result<Vec<ResultModel>> {
            self.inner.list_results(workflow_key, job_key)
        }

        fn add_user_data(&self, item: UserDataItem) -> Result<UserDataItem> {
            self.inner.add_user_data(item)
        }

        fn get_user_data(&self, workflow_key: &str, name: &str) -> Result<UserDataItem> {
            self.inner.get_user_data(workflow_key, name)
        }

        fn put_user_data(
            &self,
            workflow_key: &str,
            name: &str,
            data: serde_json::Value,
        ) -> Result<UserDataItem> {
            self.inner.put_user_data(workflow_key, name, data)
        }

        fn list_user_data(&self, workflow_key: &str) -> Result<Vec<UserDataItem>> {
            self.inner.list_user_data(workflow_key)
        }

        fn add_hpc_job(&self, record: HpcJobRecord) -> Result<()> {
            self.inner.add_hpc_job(record)
        }

        fn update_hpc_job(&self, record: &HpcJobRecord) -> Result<()> {
            self.inner.update_hpc_job(record)
        }

        fn list_hpc_jobs(&self, workflow_key: &str) -> Result<Vec<HpcJobRecord>> {
            self.inner.list_hpc_jobs(workflow_key)
        }

        fn remove_hpc_job(&self, workflow_key: &str, job_key: &str) -> Result<()> {
            self.inner.remove_hpc_job(workflow_key, job_key)
        }

        fn set_workflow_canceled(&self, workflow_key: &str) -> Result<bool> {
            self.inner.set_workflow_canceled(workflow_key)
        }

        fn is_workflow_canceled(&self, workflow_key: &str) -> Result<bool> {
            self.inner.is_workflow_canceled(workflow_key)
        }

        fn is_workflow_complete(&self, workflow_key: &str) -> Result<bool> {
            self.inner.is_workflow_complete(workflow_key)
        }
    }

    #[test]
    fn test_claim_survives_lost_reply() {
        let store = Arc::new(LostClaimReplyStore {
            inner: InMemoryStore::new(),
            reply_lost: AtomicBool::new(false),
        });
        let workflow = store.create_workflow(WorkflowModel::new("wf")).unwrap();
        let mut job = JobModel::new(&workflow.key, "single", "true");
        job.status = JobStatus::Ready;
        let job = store.add_job(job).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut rules = WorkerRules::default();
        rules.poll_interval = Duration::from_millis(50);
        let mut runner = JobRunner::new(
            store.clone(),
            workflow,
            "unit-worker",
            dir.path().to_path_buf(),
            resources(),
            rules,
        )
        .with_retry_policy(RetryPolicy {
            max_wait: Duration::from_secs(5),
            retry_interval: Duration::from_millis(10),
        });

        let result = runner.run_worker().unwrap();
        assert_eq!(result.jobs_run, 1);
        assert_eq!(result.exit_reason, ExitReason::WorkflowComplete);
        let stored = store.get_job(&runner.workflow_key, &job.key).unwrap();
        assert_eq!(stored.status, JobStatus::Done);
        assert_eq!(store.list_results(&runner.workflow_key, None).unwrap().len(), 1);
    }

    #[test]
    fn test_poll_ready_jobs_skips_jobs_that_do_not_fit() {
        let (runner, job, _dir) = runner_with_job("true");
        let ready: Vec<_> = runner.poll_ready_jobs().map(|j| j.unwrap().key).collect();
        assert_eq!(ready, vec![job.key.clone()]);

        let mut big = JobModel::new(&runner.workflow_key, "big", "true");
        big.status = JobStatus::Ready;
        big.resource_requirements.num_cpus = 128;
        runner.store.add_job(big).unwrap();
        assert_eq!(runner.poll_ready_jobs().count(), 1);
    }

    #[test]
    fn test_request_termination_stops_worker() {
        let (mut runner, job, _dir) = runner_with_job("true");
        runner.request_termination();
        assert!(runner.is_termination_requested());
        let result = runner.run_worker().unwrap();
        assert_eq!(result.exit_reason, ExitReason::TerminationRequested);
        assert_eq!(result.jobs_run, 0);
        let stored = runner.store.get_job(&runner.workflow_key, &job.key).unwrap();
        assert_eq!(stored.status, JobStatus::Ready);
    }

    #[test]
    fn test_default_worker_id_is_unique() {
        assert_ne!(default_worker_id(), default_worker_id());
    }
}
