//! Boundary to the graph store that holds workflows, jobs, results, user data and HPC job
//! records.
//!
//! The store is the single source of truth: components never cache a job status across
//! polls. Status writes go through [`GraphStore::compare_and_set_status`] or
//! [`GraphStore::claim_job`], both of which check the lifecycle transition table.

pub mod memory;
pub mod remote;

pub use memory::InMemoryStore;
pub use remote::RemoteStore;

use serde_json::Value;
use std::collections::{HashMap, VecDeque};

use crate::errors::{EngineError, Result};
use crate::models::{HpcJobRecord, JobModel, JobStatus, ResultModel, UserDataItem, WorkflowModel};

/// Selects jobs in [`GraphStore::list_jobs`]. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    /// Jobs blocked by the job with this key
    pub depends_on: Option<String>,
    pub claimed_by: Option<String>,
    /// Jobs that consume the user-data item with this name
    pub consumes: Option<String>,
}

impl JobFilter {
    pub fn with_status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn matches(&self, job: &JobModel) -> bool {
        if let Some(status) = self.status
            && job.status != status
        {
            return false;
        }
        if let Some(ref upstream) = self.depends_on
            && !job.depends_on.contains(upstream)
        {
            return false;
        }
        if let Some(ref worker) = self.claimed_by
            && job.claimed_by.as_deref() != Some(worker.as_str())
        {
            return false;
        }
        if let Some(ref name) = self.consumes
            && !job.input_user_data.contains(name)
        {
            return false;
        }
        true
    }
}

pub trait GraphStore: Send + Sync {
    /// Store a new workflow. Assigns a key when the given one is empty.
    fn create_workflow(&self, workflow: WorkflowModel) -> Result<WorkflowModel>;

    fn get_workflow(&self, workflow_key: &str) -> Result<WorkflowModel>;

    /// Add a job in its current status. Assigns a key when the given one is empty.
    fn add_job(&self, job: JobModel) -> Result<JobModel>;

    fn get_job(&self, workflow_key: &str, job_key: &str) -> Result<JobModel>;

    /// Jobs matching `filter`, in insertion order, starting at `offset`.
    fn list_jobs(
        &self,
        workflow_key: &str,
        filter: &JobFilter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<JobModel>>;

    /// Atomically set the status of a job if it is currently `expected`.
    ///
    /// Returns `Ok(false)` when the job is no longer in `expected`. Returns
    /// `EngineError::InvalidTransition` when `expected -> status` is not a lifecycle edge.
    /// Releasing a claim (SCHEDULED -> READY) clears `claimed_by` and advances `attempt_id`.
    fn compare_and_set_status(
        &self,
        workflow_key: &str,
        job_key: &str,
        expected: JobStatus,
        status: JobStatus,
    ) -> Result<bool>;

    /// Atomically move a job from READY to SCHEDULED and record the claiming worker.
    /// Returns `Ok(false)` if another worker won.
    fn claim_job(&self, workflow_key: &str, job_key: &str, worker_id: &str) -> Result<bool>;

    fn add_result(&self, result: ResultModel) -> Result<ResultModel>;

    fn list_results(&self, workflow_key: &str, job_key: Option<&str>) -> Result<Vec<ResultModel>>;

    /// Declare a user-data item. Fails if the name already exists.
    fn add_user_data(&self, item: UserDataItem) -> Result<UserDataItem>;

    fn get_user_data(&self, workflow_key: &str, name: &str) -> Result<UserDataItem>;

    /// Overwrite the data of an item, creating it if needed. Last writer wins.
    fn put_user_data(&self, workflow_key: &str, name: &str, data: Value) -> Result<UserDataItem>;

    fn list_user_data(&self, workflow_key: &str) -> Result<Vec<UserDataItem>>;

    fn add_hpc_job(&self, record: HpcJobRecord) -> Result<()>;

    fn update_hpc_job(&self, record: &HpcJobRecord) -> Result<()>;

    fn list_hpc_jobs(&self, workflow_key: &str) -> Result<Vec<HpcJobRecord>>;

    /// Discard the record of a job. Removing a missing record is not an error.
    fn remove_hpc_job(&self, workflow_key: &str, job_key: &str) -> Result<()>;

    /// Set the workflow cancel flag. Returns true if the flag changed.
    fn set_workflow_canceled(&self, workflow_key: &str) -> Result<bool>;

    fn is_workflow_canceled(&self, workflow_key: &str) -> Result<bool>;

    /// True when every job of the workflow is in a terminal status.
    fn is_workflow_complete(&self, workflow_key: &str) -> Result<bool>;

    /// Statuses of the jobs that block `job`, keyed by job key.
    fn dependency_statuses(
        &self,
        workflow_key: &str,
        job: &JobModel,
    ) -> Result<HashMap<String, JobStatus>> {
        let mut statuses = HashMap::new();
        for upstream in &job.depends_on {
            let upstream_job = self.get_job(workflow_key, upstream)?;
            statuses.insert(upstream.clone(), upstream_job.status);
        }
        Ok(statuses)
    }

    /// All jobs matching `filter`, fetched page by page.
    fn list_all_jobs(&self, workflow_key: &str, filter: &JobFilter) -> Result<Vec<JobModel>> {
        let mut jobs = Vec::new();
        loop {
            let page = self.list_jobs(workflow_key, filter, jobs.len(), DEFAULT_PAGE_SIZE)?;
            let done = page.len() < DEFAULT_PAGE_SIZE;
            jobs.extend(page);
            if done {
                return Ok(jobs);
            }
        }
    }
}

pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Lazy, restartable, paginated iterator over the READY jobs of a workflow.
///
/// Pages are fetched on demand. Jobs rejected by the predicate are skipped. Claiming a job
/// removes it from the READY set and shifts later pages, so callers `restart()` after every
/// successful claim.
pub struct ReadyJobs<'a> {
    store: &'a dyn GraphStore,
    workflow_key: String,
    filter: JobFilter,
    page_size: usize,
    offset: usize,
    buffer: VecDeque<JobModel>,
    exhausted: bool,
    predicate: Box<dyn Fn(&JobModel) -> bool + 'a>,
}

impl<'a> ReadyJobs<'a> {
    pub fn new(store: &'a dyn GraphStore, workflow_key: &str, page_size: usize) -> Self {
        Self {
            store,
            workflow_key: workflow_key.to_string(),
            filter: JobFilter::with_status(JobStatus::Ready),
            page_size: page_size.max(1),
            offset: 0,
            buffer: VecDeque::new(),
            exhausted: false,
            predicate: Box::new(|_: &JobModel| true),
        }
    }

    /// Only yield jobs for which `predicate` returns true.
    pub fn with_predicate(mut self, predicate: impl Fn(&JobModel) -> bool + 'a) -> Self {
        self.predicate = Box::new(predicate);
        self
    }

    /// Start again from the first page.
    pub fn restart(&mut self) {
        self.offset = 0;
        self.buffer.clear();
        self.exhausted = false;
    }

    fn fetch_page(&mut self) -> Result<()> {
        let page = self
            .store
            .list_jobs(&self.workflow_key, &self.filter, self.offset, self.page_size)?;
        self.offset += page.len();
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl Iterator for ReadyJobs<'_> {
    type Item = Result<JobModel>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(job) = self.buffer.pop_front() {
                if (self.predicate)(&job) {
                    return Some(Ok(job));
                }
                continue;
            }
            if self.exhausted {
                return None;
            }
            if let Err(e) = self.fetch_page() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
    }
}

/// Returns `NotFound` for a missing workflow, used by store implementations.
pub(crate) fn workflow_not_found(workflow_key: &str) -> EngineError {
    EngineError::NotFound(format!("workflow {}", workflow_key))
}

pub(crate) fn job_not_found(workflow_key: &str, job_key: &str) -> EngineError {
    EngineError::NotFound(format!("job {} in workflow {}", job_key, workflow_key))
}
