//! Workflow import, initialization and dependency propagation.

use chrono::Utc;
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;

use crate::client::state_machine::{DependencyPolicy, JobEvent, next_status};
use crate::client::store::{GraphStore, JobFilter};
use crate::client::user_data::UserDataClient;
use crate::client::utils::{RetryPolicy, send_with_retries};
use crate::client::workflow_graph::WorkflowGraph;
use crate::client::workflow_spec::WorkflowSpec;
use crate::errors::{EngineError, Result};
use crate::models::{
    HpcJobRecord, JobModel, JobStatus, ResourceRequirements, ResultModel, UserDataItem,
    WorkflowModel,
};

/// Return code recorded for jobs whose worker disappeared while they ran.
pub const ORPHANED_JOB_RETURN_CODE: i64 = -1;

/// What `recover_worker` changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoverySummary {
    /// Jobs put back to READY
    pub reset_jobs: Vec<String>,
    /// Jobs marked TERMINATED
    pub terminated_jobs: Vec<String>,
    /// Batch allocations the lost worker had submitted. They may still be running.
    pub orphaned_hpc_jobs: Vec<HpcJobRecord>,
}

pub struct WorkflowManager<'a> {
    store: &'a dyn GraphStore,
    pub workflow_key: String,
    policy: DependencyPolicy,
    retry: RetryPolicy,
}

impl<'a> WorkflowManager<'a> {
    pub fn new(store: &'a dyn GraphStore, workflow: &WorkflowModel) -> Self {
        WorkflowManager {
            store,
            workflow_key: workflow.key.clone(),
            policy: DependencyPolicy::from_workflow(workflow),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Create a workflow and all of its jobs and user data from a specification file.
    pub fn create_workflow_from_spec_file<P: AsRef<Path>>(
        store: &dyn GraphStore,
        path: P,
    ) -> Result<WorkflowModel> {
        let spec = WorkflowSpec::from_spec_file(path)?;
        Self::create_workflow_from_spec(store, &spec)
    }

    /// Create a workflow and all of its jobs and user data from a specification.
    ///
    /// The specification is validated and checked for dependency cycles before anything is
    /// written to the store. Jobs are created in UNINITIALIZED; call `initialize` afterwards.
    pub fn create_workflow_from_spec(
        store: &dyn GraphStore,
        spec: &WorkflowSpec,
    ) -> Result<WorkflowModel> {
        let mut spec = spec.clone();
        spec.substitute_variables();
        spec.validate()
            .map_err(|errors| EngineError::InvalidSpec(errors.join("; ")))?;

        let mut graph = WorkflowGraph::from_spec(&spec)?;
        let levels = graph.topological_levels()?.clone();

        let mut workflow = WorkflowModel::new(&spec.name);
        workflow.description = spec.description.clone();
        workflow.ignore_disabled_upstreams = spec.ignore_disabled_upstreams.unwrap_or(false);
        if let Some(ref monitor) = spec.resource_monitor {
            workflow.resource_monitor = monitor.clone();
        }
        let workflow = store.create_workflow(workflow)?;
        let workflow_key = workflow.key.clone();

        let initial_data: HashMap<&str, &serde_json::Value> = spec
            .user_data
            .iter()
            .flatten()
            .filter_map(|u| u.data.as_ref().map(|d| (u.name.as_str(), d)))
            .collect();
        for name in spec.user_data_names() {
            let data = initial_data.get(name.as_str()).map(|v| (*v).clone());
            store.add_user_data(UserDataItem::new(&workflow_key, &name, data))?;
        }

        let requirements: HashMap<&str, ResourceRequirements> = spec
            .resource_requirements
            .iter()
            .flatten()
            .map(|rr| (rr.name.as_str(), rr.to_model()))
            .collect();
        let job_specs: HashMap<&str, _> = spec.jobs.iter().map(|j| (j.name.as_str(), j)).collect();

        // Creating jobs level by level guarantees that every blocker already has a key.
        let mut name_to_key: HashMap<String, String> = HashMap::new();
        for level in &levels {
            for name in level {
                let Some(job_spec) = job_specs.get(name.as_str()) else {
                    continue;
                };
                let mut job = JobModel::new(&workflow_key, name, &job_spec.command);
                if let Some(ref rr) = job_spec.resource_requirements
                    && let Some(model) = requirements.get(rr.as_str())
                {
                    job.resource_requirements = model.clone();
                }
                job.depends_on = graph
                    .dependencies_of(name)
                    .into_iter()
                    .flatten()
                    .filter_map(|dep| name_to_key.get(dep).cloned())
                    .collect();
                job.input_user_data = job_spec.input_user_data.iter().flatten().cloned().collect();
                job.output_user_data = job_spec.output_user_data.iter().flatten().cloned().collect();
                job.scheduler = job_spec.scheduler_assignment();
                job.supports_termination = job_spec.supports_termination.unwrap_or(false);
                job.cancel_on_blocking_job_failure =
                    job_spec.cancel_on_blocking_job_failure.unwrap_or(true);

                let created = store.add_job(job)?;
                name_to_key.insert(name.clone(), created.key);
            }
        }

        info!(
            "Created workflow workflow_key={} name={} num_jobs={}",
            workflow_key,
            workflow.name,
            name_to_key.len()
        );
        Ok(workflow)
    }

    fn user_data(&self) -> UserDataClient<'a> {
        UserDataClient::new(self.store, self.retry)
    }

    fn jobs_matching(&self, filter: &JobFilter) -> Result<Vec<JobModel>> {
        send_with_retries(
            || self.store.list_all_jobs(&self.workflow_key, filter),
            &self.retry,
        )
    }

    fn set_status(&self, job: &JobModel, status: JobStatus) -> Result<bool> {
        send_with_retries(
            || {
                self.store
                    .compare_and_set_status(&self.workflow_key, &job.key, job.status, status)
            },
            &self.retry,
        )
    }

    /// Move every UNINITIALIZED job to BLOCKED or READY. Returns the number of jobs moved.
    pub fn initialize(&self) -> Result<usize> {
        let jobs = self.jobs_matching(&JobFilter::with_status(JobStatus::Uninitialized))?;
        let user_data = self.user_data();
        let mut count = 0;
        let mut canceled = Vec::new();
        for job in &jobs {
            let deps = self.store.dependency_statuses(&self.workflow_key, job)?;
            let inputs_ready = user_data.inputs_ready(&self.workflow_key, job)?;
            let status = next_status(job, &deps, JobEvent::Initialize { inputs_ready }, self.policy)?;
            if self.set_status(job, status)? {
                count += 1;
                if status == JobStatus::Canceled {
                    canceled.push(job.key.clone());
                }
            }
        }
        for key in canceled {
            self.update_dependents(&key)?;
        }
        info!(
            "Initialized workflow workflow_key={} num_jobs={}",
            self.workflow_key, count
        );
        Ok(count)
    }

    /// Re-evaluate the BLOCKED jobs downstream of a job that reached a terminal status.
    ///
    /// Jobs whose blockers are all acceptable and whose inputs hold data become READY. Jobs
    /// with a blocker that ended unacceptably become CANCELED, and their own dependents are
    /// evaluated in turn. Returns the jobs that changed, in the order they changed.
    pub fn update_dependents(&self, job_key: &str) -> Result<Vec<(String, JobStatus)>> {
        let user_data = self.user_data();
        let mut changed = Vec::new();
        let mut queue = VecDeque::from([job_key.to_string()]);

        while let Some(upstream) = queue.pop_front() {
            let filter = JobFilter {
                status: Some(JobStatus::Blocked),
                depends_on: Some(upstream.clone()),
                ..Default::default()
            };
            for job in self.jobs_matching(&filter)? {
                let deps = self.store.dependency_statuses(&self.workflow_key, &job)?;
                let inputs_ready = user_data.inputs_ready(&self.workflow_key, &job)?;
                let status = next_status(
                    &job,
                    &deps,
                    JobEvent::DependenciesChanged { inputs_ready },
                    self.policy,
                )?;
                if status == JobStatus::Blocked {
                    continue;
                }
                if !self.set_status(&job, status)? {
                    debug!(
                        "Dependent changed concurrently workflow_key={} job_key={}",
                        self.workflow_key, job.key
                    );
                    continue;
                }
                match status {
                    JobStatus::Ready => info!(
                        "Job unblocked workflow_key={} job_key={}",
                        self.workflow_key, job.key
                    ),
                    _ => {
                        info!(
                            "Job canceled because a blocking job failed workflow_key={} job_key={} blocker={}",
                            self.workflow_key, job.key, upstream
                        );
                        queue.push_back(job.key.clone());
                    }
                }
                changed.push((job.key, status));
            }
        }

        Ok(changed)
    }

    /// Disable a job that has not finished. Returns false if it was already terminal.
    pub fn disable_job(&self, job_key: &str) -> Result<bool> {
        loop {
            let job = self.store.get_job(&self.workflow_key, job_key)?;
            if job.status.is_terminal() {
                return Ok(false);
            }
            let status = next_status(&job, &HashMap::new(), JobEvent::DisableRequested, self.policy)?;
            if self.set_status(&job, status)? {
                info!(
                    "Disabled job workflow_key={} job_key={}",
                    self.workflow_key, job_key
                );
                self.update_dependents(job_key)?;
                return Ok(true);
            }
        }
    }

    /// Release the jobs of a worker that died.
    ///
    /// SCHEDULED jobs go back to READY. Jobs that had started are marked TERMINATED with a
    /// result carrying return code -1, and their dependents are re-evaluated.
    pub fn recover_worker(&self, worker_id: &str) -> Result<RecoverySummary> {
        let filter = JobFilter {
            claimed_by: Some(worker_id.to_string()),
            ..Default::default()
        };
        let mut summary = RecoverySummary::default();
        for job in self.jobs_matching(&filter)? {
            match job.status {
                JobStatus::Scheduled => {
                    let status = next_status(
                        &job,
                        &HashMap::new(),
                        JobEvent::SubmissionFailed,
                        self.policy,
                    )?;
                    if self.set_status(&job, status)? {
                        summary.reset_jobs.push(job.key.clone());
                    }
                }
                JobStatus::Submitted | JobStatus::SubmittedPending => {
                    let status = next_status(
                        &job,
                        &HashMap::new(),
                        JobEvent::Exited {
                            return_code: ORPHANED_JOB_RETURN_CODE,
                            outputs_present: false,
                        },
                        self.policy,
                    )?;
                    if !self.set_status(&job, status)? {
                        continue;
                    }
                    let now = Utc::now();
                    self.store.add_result(ResultModel {
                        key: String::new(),
                        workflow_key: self.workflow_key.clone(),
                        job_key: job.key.clone(),
                        attempt_id: job.attempt_id,
                        worker_id: worker_id.to_string(),
                        return_code: ORPHANED_JOB_RETURN_CODE,
                        start_time: now,
                        end_time: now,
                        exec_time_minutes: 0.0,
                        peak_cpu_percent: None,
                        avg_cpu_percent: None,
                        peak_memory_gb: None,
                        avg_memory_gb: None,
                        peak_num_processes: None,
                        status,
                    })?;
                    summary.terminated_jobs.push(job.key.clone());
                    self.update_dependents(&job.key)?;
                }
                _ => {}
            }
        }

        let hpc_jobs = self.store.list_hpc_jobs(&self.workflow_key)?;
        summary.orphaned_hpc_jobs = hpc_jobs
            .into_iter()
            .filter(|r| summary.terminated_jobs.contains(&r.job_key))
            .collect();
        if !summary.orphaned_hpc_jobs.is_empty() {
            warn!(
                "Worker {} left {} batch allocations behind in workflow {}",
                worker_id,
                summary.orphaned_hpc_jobs.len(),
                self.workflow_key
            );
        }
        info!(
            "Recovered worker worker_id={} workflow_key={} reset={} terminated={}",
            worker_id,
            self.workflow_key,
            summary.reset_jobs.len(),
            summary.terminated_jobs.len()
        );
        Ok(summary)
    }

    /// Number of jobs in each status. Statuses with no jobs are omitted.
    pub fn status_counts(&self) -> Result<BTreeMap<JobStatus, usize>> {
        let mut counts = BTreeMap::new();
        for job in self.jobs_matching(&JobFilter::default())? {
            *counts.entry(job.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::store::InMemoryStore;
    use crate::client::workflow_spec::JobSpec;

    fn linear_spec() -> WorkflowSpec {
        let a = JobSpec::new("a", "true");
        let mut b = JobSpec::new("b", "true");
        b.depends_on = Some(vec!["a".to_string()]);
        let mut c = JobSpec::new("c", "true");
        c.depends_on = Some(vec!["b".to_string()]);
        WorkflowSpec::new("linear", vec![c, b, a])
    }

    fn job_by_name(store: &InMemoryStore, wf: &str, name: &str) -> JobModel {
        store
            .list_all_jobs(wf, &JobFilter::default())
            .unwrap()
            .into_iter()
            .find(|j| j.name == name)
            .unwrap()
    }

    #[test]
    fn test_create_and_initialize() {
        let store = InMemoryStore::new();
        let workflow = WorkflowManager::create_workflow_from_spec(&store, &linear_spec()).unwrap();
        let manager = WorkflowManager::new(&store, &workflow);

        let b = job_by_name(&store, &workflow.key, "b");
        let a = job_by_name(&store, &workflow.key, "a");
        assert!(b.depends_on.contains(&a.key));

        assert_eq!(manager.initialize().unwrap(), 3);
        let counts = manager.status_counts().unwrap();
        assert_eq!(counts[&JobStatus::Ready], 1);
        assert_eq!(counts[&JobStatus::Blocked], 2);
        assert_eq!(job_by_name(&store, &workflow.key, "a").status, JobStatus::Ready);
    }

    #[test]
    fn test_cycle_aborts_import() {
        let store = InMemoryStore::new();
        let mut spec = linear_spec();
        spec.jobs[2].depends_on = Some(vec!["c".to_string()]);
        let result = WorkflowManager::create_workflow_from_spec(&store, &spec);
        assert!(matches!(result, Err(EngineError::DependencyCycle(_))));
    }

    #[test]
    fn test_failed_blocker_cancels_downstream_chain() {
        let store = InMemoryStore::new();
        let workflow = WorkflowManager::create_workflow_from_spec(&store, &linear_spec()).unwrap();
        let manager = WorkflowManager::new(&store, &workflow);
        manager.initialize().unwrap();

        let a = job_by_name(&store, &workflow.key, "a");
        assert!(store.claim_job(&workflow.key, &a.key, "w1").unwrap());
        for (from, to) in [
            (JobStatus::Scheduled, JobStatus::Submitted),
            (JobStatus::Submitted, JobStatus::Terminated),
        ] {
            assert!(store.compare_and_set_status(&workflow.key, &a.key, from, to).unwrap());
        }

        let changed = manager.update_dependents(&a.key).unwrap();
        assert_eq!(changed.len(), 2);
        assert!(changed.iter().all(|(_, s)| *s == JobStatus::Canceled));
        assert!(store.is_workflow_complete(&workflow.key).unwrap());
    }

    #[test]
    fn test_disable_with_ignore_policy_unblocks() {
        let store = InMemoryStore::new();
        let mut spec = linear_spec();
        spec.ignore_disabled_upstreams = Some(true);
        let workflow = WorkflowManager::create_workflow_from_spec(&store, &spec).unwrap();
        let manager = WorkflowManager::new(&store, &workflow);
        manager.initialize().unwrap();

        let a = job_by_name(&store, &workflow.key, "a");
        assert!(manager.disable_job(&a.key).unwrap());
        assert!(!manager.disable_job(&a.key).unwrap());
        assert_eq!(job_by_name(&store, &workflow.key, "b").status, JobStatus::Ready);
        assert_eq!(job_by_name(&store, &workflow.key, "c").status, JobStatus::Blocked);
    }

    #[test]
    fn test_missing_input_keeps_job_blocked() {
        let store = InMemoryStore::new();
        let mut job = JobSpec::new("consumer", "echo ${user_data.input.config}");
        job.scheduler = Some("local".to_string());
        let spec = WorkflowSpec::new("wf", vec![job]);
        let workflow = WorkflowManager::create_workflow_from_spec(&store, &spec).unwrap();
        let manager = WorkflowManager::new(&store, &workflow);
        manager.initialize().unwrap();

        let consumer = job_by_name(&store, &workflow.key, "consumer");
        assert_eq!(consumer.status, JobStatus::Blocked);
        assert_eq!(consumer.command, "echo ${user_data.config}");
        assert!(store.get_user_data(&workflow.key, "config").unwrap().data.is_none());
    }

    #[test]
    fn test_recover_worker() {
        let store = InMemoryStore::new();
        let spec = WorkflowSpec::new(
            "wf",
            vec![JobSpec::new("x", "true"), JobSpec::new("y", "true")],
        );
        let workflow = WorkflowManager::create_workflow_from_spec(&store, &spec).unwrap();
        let manager = WorkflowManager::new(&store, &workflow);
        manager.initialize().unwrap();

        let x = job_by_name(&store, &workflow.key, "x");
        let y = job_by_name(&store, &workflow.key, "y");
        assert!(store.claim_job(&workflow.key, &x.key, "dead").unwrap());
        assert!(store.claim_job(&workflow.key, &y.key, "dead").unwrap());
        assert!(store
            .compare_and_set_status(&workflow.key, &y.key, JobStatus::Scheduled, JobStatus::Submitted)
            .unwrap());

        let summary = manager.recover_worker("dead").unwrap();
        assert_eq!(summary.reset_jobs, vec![x.key.clone()]);
        assert_eq!(summary.terminated_jobs, vec![y.key.clone()]);
        let results = store.list_results(&workflow.key, Some(&y.key)).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].return_code, ORPHANED_JOB_RETURN_CODE);
        assert_eq!(results[0].status, JobStatus::Terminated);
    }
}
