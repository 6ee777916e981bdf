//! In-process graph store.
//!
//! All state lives behind one `Mutex`, so a claim or status change is a single critical
//! section: at most one worker thread can move a job out of a given status.

use chrono::Utc;
use log::debug;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use super::{GraphStore, JobFilter, job_not_found, workflow_not_found};
use crate::client::state_machine::validate_transition;
use crate::errors::{EngineError, Result};
use crate::models::{HpcJobRecord, JobModel, JobStatus, ResultModel, UserDataItem, WorkflowModel};

#[derive(Debug)]
struct WorkflowState {
    workflow: WorkflowModel,
    jobs: Vec<JobModel>,
    job_index: HashMap<String, usize>,
    results: Vec<ResultModel>,
    user_data: BTreeMap<String, UserDataItem>,
    hpc_jobs: Vec<HpcJobRecord>,
}

impl WorkflowState {
    fn job_mut(&mut self, job_key: &str) -> Result<&mut JobModel> {
        let workflow_key = &self.workflow.key;
        match self.job_index.get(job_key) {
            Some(&idx) => Ok(&mut self.jobs[idx]),
            None => Err(job_not_found(workflow_key, job_key)),
        }
    }
}

#[derive(Debug, Default)]
struct Tables {
    next_id: u64,
    workflows: HashMap<String, WorkflowState>,
}

impl Tables {
    fn next_key(&mut self) -> String {
        self.next_id += 1;
        self.next_id.to_string()
    }

    fn workflow(&self, workflow_key: &str) -> Result<&WorkflowState> {
        self.workflows
            .get(workflow_key)
            .ok_or_else(|| workflow_not_found(workflow_key))
    }

    fn workflow_mut(&mut self, workflow_key: &str) -> Result<&mut WorkflowState> {
        self.workflows
            .get_mut(workflow_key)
            .ok_or_else(|| workflow_not_found(workflow_key))
    }
}

/// Graph store kept in memory. Used by tests, single-host runs, and workflow validation.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| EngineError::Store("in-memory store lock poisoned".to_string()))
    }
}

impl GraphStore for InMemoryStore {
    fn create_workflow(&self, mut workflow: WorkflowModel) -> Result<WorkflowModel> {
        let mut tables = self.lock()?;
        if workflow.key.is_empty() {
            workflow.key = tables.next_key();
        }
        if tables.workflows.contains_key(&workflow.key) {
            return Err(EngineError::Store(format!(
                "workflow {} already exists",
                workflow.key
            )));
        }
        tables.workflows.insert(
            workflow.key.clone(),
            WorkflowState {
                workflow: workflow.clone(),
                jobs: Vec::new(),
                job_index: HashMap::new(),
                results: Vec::new(),
                user_data: BTreeMap::new(),
                hpc_jobs: Vec::new(),
            },
        );
        Ok(workflow)
    }

    fn get_workflow(&self, workflow_key: &str) -> Result<WorkflowModel> {
        let tables = self.lock()?;
        Ok(tables.workflow(workflow_key)?.workflow.clone())
    }

    fn add_job(&self, mut job: JobModel) -> Result<JobModel> {
        let mut tables = self.lock()?;
        if job.key.is_empty() {
            job.key = tables.next_key();
        }
        let state = tables.workflow_mut(&job.workflow_key)?;
        if state.job_index.contains_key(&job.key) {
            return Err(EngineError::Store(format!(
                "job {} already exists in workflow {}",
                job.key, job.workflow_key
            )));
        }
        state.job_index.insert(job.key.clone(), state.jobs.len());
        state.jobs.push(job.clone());
        Ok(job)
    }

    fn get_job(&self, workflow_key: &str, job_key: &str) -> Result<JobModel> {
        let tables = self.lock()?;
        let state = tables.workflow(workflow_key)?;
        state
            .job_index
            .get(job_key)
            .map(|&idx| state.jobs[idx].clone())
            .ok_or_else(|| job_not_found(workflow_key, job_key))
    }

    fn list_jobs(
        &self,
        workflow_key: &str,
        filter: &JobFilter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<JobModel>> {
        let tables = self.lock()?;
        Ok(tables
            .workflow(workflow_key)?
            .jobs
            .iter()
            .filter(|job| filter.matches(job))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    fn compare_and_set_status(
        &self,
        workflow_key: &str,
        job_key: &str,
        expected: JobStatus,
        status: JobStatus,
    ) -> Result<bool> {
        validate_transition(job_key, expected, status)?;
        let mut tables = self.lock()?;
        let job = tables.workflow_mut(workflow_key)?.job_mut(job_key)?;
        if job.status != expected {
            debug!(
                "Status compare failed workflow_key={} job_key={} expected={} actual={}",
                workflow_key, job_key, expected, job.status
            );
            return Ok(false);
        }
        if expected == JobStatus::Scheduled && status == JobStatus::Ready {
            job.attempt_id += 1;
            job.claimed_by = None;
        }
        job.status = status;
        Ok(true)
    }

    fn claim_job(&self, workflow_key: &str, job_key: &str, worker_id: &str) -> Result<bool> {
        let mut tables = self.lock()?;
        let job = tables.workflow_mut(workflow_key)?.job_mut(job_key)?;
        if job.status != JobStatus::Ready {
            return Ok(false);
        }
        validate_transition(job_key, job.status, JobStatus::Scheduled)?;
        job.status = JobStatus::Scheduled;
        job.claimed_by = Some(worker_id.to_string());
        Ok(true)
    }

    fn add_result(&self, mut result: ResultModel) -> Result<ResultModel> {
        let mut tables = self.lock()?;
        if result.key.is_empty() {
            result.key = tables.next_key();
        }
        let state = tables.workflow_mut(&result.workflow_key)?;
        if !state.job_index.contains_key(&result.job_key) {
            return Err(job_not_found(&result.workflow_key, &result.job_key));
        }
        state.results.push(result.clone());
        Ok(result)
    }

    fn list_results(&self, workflow_key: &str, job_key: Option<&str>) -> Result<Vec<ResultModel>> {
        let tables = self.lock()?;
        Ok(tables
            .workflow(workflow_key)?
            .results
            .iter()
            .filter(|r| job_key.is_none_or(|k| r.job_key == k))
            .cloned()
            .collect())
    }

    fn add_user_data(&self, mut item: UserDataItem) -> Result<UserDataItem> {
        let mut tables = self.lock()?;
        if item.key.is_empty() {
            item.key = tables.next_key();
        }
        let state = tables.workflow_mut(&item.workflow_key)?;
        if state.user_data.contains_key(&item.name) {
            return Err(EngineError::Store(format!(
                "user data {} already exists in workflow {}",
                item.name, item.workflow_key
            )));
        }
        state.user_data.insert(item.name.clone(), item.clone());
        Ok(item)
    }

    fn get_user_data(&self, workflow_key: &str, name: &str) -> Result<UserDataItem> {
        let tables = self.lock()?;
        tables
            .workflow(workflow_key)?
            .user_data
            .get(name)
            .cloned()
            .ok_or_else(|| {
                EngineError::NotFound(format!("user data {} in workflow {}", name, workflow_key))
            })
    }

    fn put_user_data(&self, workflow_key: &str, name: &str, data: Value) -> Result<UserDataItem> {
        let mut tables = self.lock()?;
        let new_key = tables.next_key();
        let state = tables.workflow_mut(workflow_key)?;
        let item = state
            .user_data
            .entry(name.to_string())
            .or_insert_with(|| UserDataItem {
                key: new_key,
                workflow_key: workflow_key.to_string(),
                name: name.to_string(),
                data: None,
            });
        item.data = Some(data);
        Ok(item.clone())
    }

    fn list_user_data(&self, workflow_key: &str) -> Result<Vec<UserDataItem>> {
        let tables = self.lock()?;
        Ok(tables
            .workflow(workflow_key)?
            .user_data
            .values()
            .cloned()
            .collect())
    }

    fn add_hpc_job(&self, record: HpcJobRecord) -> Result<()> {
        let mut tables = self.lock()?;
        let state = tables.workflow_mut(&record.workflow_key)?;
        state.hpc_jobs.retain(|r| r.job_key != record.job_key);
        state.hpc_jobs.push(record);
        Ok(())
    }

    fn update_hpc_job(&self, record: &HpcJobRecord) -> Result<()> {
        let mut tables = self.lock()?;
        let state = tables.workflow_mut(&record.workflow_key)?;
        match state
            .hpc_jobs
            .iter_mut()
            .find(|r| r.job_key == record.job_key)
        {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(EngineError::NotFound(format!(
                "HPC job record for job {} in workflow {}",
                record.job_key, record.workflow_key
            ))),
        }
    }

    fn list_hpc_jobs(&self, workflow_key: &str) -> Result<Vec<HpcJobRecord>> {
        let tables = self.lock()?;
        Ok(tables.workflow(workflow_key)?.hpc_jobs.clone())
    }

    fn remove_hpc_job(&self, workflow_key: &str, job_key: &str) -> Result<()> {
        let mut tables = self.lock()?;
        tables
            .workflow_mut(workflow_key)?
            .hpc_jobs
            .retain(|r| r.job_key != job_key);
        Ok(())
    }

    fn set_workflow_canceled(&self, workflow_key: &str) -> Result<bool> {
        let mut tables = self.lock()?;
        let state = tables.workflow_mut(workflow_key)?;
        if state.workflow.is_canceled {
            return Ok(false);
        }
        state.workflow.is_canceled = true;
        debug!(
            "Workflow cancel flag set workflow_key={} at={}",
            workflow_key,
            Utc::now()
        );
        Ok(true)
    }

    fn is_workflow_canceled(&self, workflow_key: &str) -> Result<bool> {
        let tables = self.lock()?;
        Ok(tables.workflow(workflow_key)?.workflow.is_canceled)
    }

    fn is_workflow_complete(&self, workflow_key: &str) -> Result<bool> {
        let tables = self.lock()?;
        Ok(tables
            .workflow(workflow_key)?
            .jobs
            .iter()
            .all(|job| job.status.is_terminal()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};
    use std::sync::Arc;
    use std::thread;

    #[fixture]
    fn store() -> InMemoryStore {
        InMemoryStore::new()
    }

    fn add_ready_job(store: &InMemoryStore, workflow_key: &str, name: &str) -> JobModel {
        let mut job = JobModel::new(workflow_key, name, "true");
        job.status = JobStatus::Ready;
        store.add_job(job).unwrap()
    }

    #[rstest]
    fn test_keys_are_assigned(store: InMemoryStore) {
        let wf = store.create_workflow(WorkflowModel::new("wf")).unwrap();
        assert!(!wf.key.is_empty());
        let a = add_ready_job(&store, &wf.key, "a");
        let b = add_ready_job(&store, &wf.key, "b");
        assert_ne!(a.key, b.key);
        assert_eq!(store.get_job(&wf.key, &b.key).unwrap().name, "b");
    }

    #[rstest]
    fn test_missing_records_are_not_found(store: InMemoryStore) {
        assert!(matches!(
            store.get_workflow("nope"),
            Err(EngineError::NotFound(_))
        ));
        let wf = store.create_workflow(WorkflowModel::new("wf")).unwrap();
        assert!(matches!(
            store.get_job(&wf.key, "nope"),
            Err(EngineError::NotFound(_))
        ));
    }

    #[rstest]
    fn test_compare_and_set_status(store: InMemoryStore) {
        let wf = store.create_workflow(WorkflowModel::new("wf")).unwrap();
        let job = add_ready_job(&store, &wf.key, "a");

        assert!(
            !store
                .compare_and_set_status(&wf.key, &job.key, JobStatus::Blocked, JobStatus::Ready)
                .unwrap()
        );
        assert!(
            store
                .compare_and_set_status(&wf.key, &job.key, JobStatus::Ready, JobStatus::Canceled)
                .unwrap()
        );
        assert_eq!(
            store.get_job(&wf.key, &job.key).unwrap().status,
            JobStatus::Canceled
        );
    }

    #[rstest]
    fn test_invalid_transition_is_rejected(store: InMemoryStore) {
        let wf = store.create_workflow(WorkflowModel::new("wf")).unwrap();
        let job = add_ready_job(&store, &wf.key, "a");
        let err = store
            .compare_and_set_status(&wf.key, &job.key, JobStatus::Ready, JobStatus::Done)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
        assert_eq!(
            store.get_job(&wf.key, &job.key).unwrap().status,
            JobStatus::Ready
        );
    }

    #[rstest]
    fn test_released_claim_starts_new_attempt(store: InMemoryStore) {
        let wf = store.create_workflow(WorkflowModel::new("wf")).unwrap();
        let job = add_ready_job(&store, &wf.key, "a");
        assert_eq!(job.attempt_id, 1);

        assert!(store.claim_job(&wf.key, &job.key, "w1").unwrap());
        assert_eq!(store.get_job(&wf.key, &job.key).unwrap().attempt_id, 1);
        assert!(
            store
                .compare_and_set_status(&wf.key, &job.key, JobStatus::Scheduled, JobStatus::Ready)
                .unwrap()
        );
        let released = store.get_job(&wf.key, &job.key).unwrap();
        assert_eq!(released.attempt_id, 2);
        assert_eq!(released.claimed_by, None);

        assert!(store.claim_job(&wf.key, &job.key, "w2").unwrap());
        let reclaimed = store.get_job(&wf.key, &job.key).unwrap();
        assert_eq!(reclaimed.attempt_id, 2);
        assert_eq!(reclaimed.claimed_by.as_deref(), Some("w2"));
    }

    #[rstest]
    fn test_claim_only_once(store: InMemoryStore) {
        let wf = store.create_workflow(WorkflowModel::new("wf")).unwrap();
        let job = add_ready_job(&store, &wf.key, "a");
        assert!(store.claim_job(&wf.key, &job.key, "w1").unwrap());
        assert!(!store.claim_job(&wf.key, &job.key, "w2").unwrap());
        let claimed = store.get_job(&wf.key, &job.key).unwrap();
        assert_eq!(claimed.status, JobStatus::Scheduled);
        assert_eq!(claimed.claimed_by.as_deref(), Some("w1"));
    }

    #[test]
    fn test_concurrent_claims_have_one_winner() {
        let store = Arc::new(InMemoryStore::new());
        let wf = store.create_workflow(WorkflowModel::new("wf")).unwrap();
        let job = add_ready_job(&store, &wf.key, "a");

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                let wf_key = wf.key.clone();
                let job_key = job.key.clone();
                thread::spawn(move || {
                    store
                        .claim_job(&wf_key, &job_key, &format!("w{}", i))
                        .unwrap()
                })
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
    }

    #[rstest]
    fn test_put_user_data_last_writer_wins(store: InMemoryStore) {
        let wf = store.create_workflow(WorkflowModel::new("wf")).unwrap();
        store
            .put_user_data(&wf.key, "x", serde_json::json!(1))
            .unwrap();
        store
            .put_user_data(&wf.key, "x", serde_json::json!({"v": 2}))
            .unwrap();
        let item = store.get_user_data(&wf.key, "x").unwrap();
        assert_eq!(item.data, Some(serde_json::json!({"v": 2})));
        assert_eq!(store.list_user_data(&wf.key).unwrap().len(), 1);
    }

    #[rstest]
    fn test_workflow_cancel_flag_idempotent(store: InMemoryStore) {
        let wf = store.create_workflow(WorkflowModel::new("wf")).unwrap();
        assert!(!store.is_workflow_canceled(&wf.key).unwrap());
        assert!(store.set_workflow_canceled(&wf.key).unwrap());
        assert!(!store.set_workflow_canceled(&wf.key).unwrap());
        assert!(store.is_workflow_canceled(&wf.key).unwrap());
    }

    #[rstest]
    fn test_workflow_complete(store: InMemoryStore) {
        let wf = store.create_workflow(WorkflowModel::new("wf")).unwrap();
        let job = add_ready_job(&store, &wf.key, "a");
        assert!(!store.is_workflow_complete(&wf.key).unwrap());
        store
            .compare_and_set_status(&wf.key, &job.key, JobStatus::Ready, JobStatus::Disabled)
            .unwrap();
        assert!(store.is_workflow_complete(&wf.key).unwrap());
    }

    #[rstest]
    fn test_hpc_job_records(store: InMemoryStore) {
        let wf = store.create_workflow(WorkflowModel::new("wf")).unwrap();
        let job = add_ready_job(&store, &wf.key, "a");
        let mut record = HpcJobRecord {
            workflow_key: wf.key.clone(),
            job_key: job.key.clone(),
            attempt_id: 1,
            scheduler_name: "fake".to_string(),
            hpc_job_id: "fake-1".to_string(),
            status: crate::models::HpcJobStatus::Queued,
            submitted_at: Utc::now(),
        };
        store.add_hpc_job(record.clone()).unwrap();
        record.status = crate::models::HpcJobStatus::Running;
        store.update_hpc_job(&record).unwrap();
        assert_eq!(store.list_hpc_jobs(&wf.key).unwrap(), vec![record]);
        store.remove_hpc_job(&wf.key, &job.key).unwrap();
        store.remove_hpc_job(&wf.key, &job.key).unwrap();
        assert!(store.list_hpc_jobs(&wf.key).unwrap().is_empty());
    }
}
