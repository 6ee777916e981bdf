//! Workflow and job cancellation.
//!
//! Cancelling a workflow sets its cancel flag, cancels every job that has not started and
//! cancels the batch allocations recorded in the store. Jobs already running locally are
//! stopped by the worker that owns them: workers re-check the flag every poll interval.

use log::{error, info, warn};
use std::collections::HashMap;

use crate::client::hpc::HpcAdapters;
use crate::client::state_machine::{DependencyPolicy, JobEvent, next_status};
use crate::client::store::{GraphStore, JobFilter};
use crate::client::utils::{RetryPolicy, send_with_retries};
use crate::client::workflow_manager::WorkflowManager;
use crate::errors::Result;
use crate::models::{JobModel, JobStatus};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CancelSummary {
    /// The workflow was not canceled before this call
    pub flag_changed: bool,
    /// Unstarted jobs moved to CANCELED by this call
    pub canceled_jobs: Vec<String>,
    /// Batch scheduler job ids a cancel request was sent for
    pub hpc_jobs_canceled: Vec<String>,
    /// Batch scheduler job ids that could not be canceled, with the error
    pub hpc_cancel_failures: Vec<(String, String)>,
    /// Jobs still running; their workers stop them
    pub in_flight_jobs: usize,
}

pub struct CancellationController<'a> {
    store: &'a dyn GraphStore,
    adapters: HpcAdapters,
    retry: RetryPolicy,
}

impl<'a> CancellationController<'a> {
    pub fn new(store: &'a dyn GraphStore, adapters: HpcAdapters) -> Self {
        Self {
            store,
            adapters,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Cancel a workflow. Calling it again is harmless and cancels nothing new.
    pub fn cancel_workflow(&self, workflow_key: &str) -> Result<CancelSummary> {
        let mut summary = CancelSummary {
            flag_changed: send_with_retries(
                || self.store.set_workflow_canceled(workflow_key),
                &self.retry,
            )?,
            ..Default::default()
        };
        if summary.flag_changed {
            info!("Canceling workflow workflow_key={}", workflow_key);
        } else {
            info!("Workflow already canceled workflow_key={}", workflow_key);
        }

        let jobs = send_with_retries(
            || self.store.list_all_jobs(workflow_key, &JobFilter::default()),
            &self.retry,
        )?;
        for job in jobs {
            if job.status.is_in_flight() {
                summary.in_flight_jobs += 1;
                continue;
            }
            if !job.status.is_unstarted() {
                continue;
            }
            let key = job.key.clone();
            if self.cancel_unstarted(workflow_key, job)?.is_some() {
                summary.canceled_jobs.push(key);
            }
        }

        for record in self.store.list_hpc_jobs(workflow_key)? {
            let Some(adapter) = self.adapters.get(&record.scheduler_name) else {
                warn!(
                    "No adapter for scheduler {} of hpc_job_id={}; not canceled",
                    record.scheduler_name, record.hpc_job_id
                );
                summary
                    .hpc_cancel_failures
                    .push((record.hpc_job_id.clone(), "unknown scheduler".to_string()));
                continue;
            };
            match adapter.cancel(&record) {
                Ok(()) => summary.hpc_jobs_canceled.push(record.hpc_job_id.clone()),
                Err(e) => {
                    error!(
                        "Failed to cancel hpc_job_id={} job_key={}: {}",
                        record.hpc_job_id, record.job_key, e
                    );
                    summary
                        .hpc_cancel_failures
                        .push((record.hpc_job_id.clone(), e.to_string()));
                }
            }
        }

        info!(
            "Canceled workflow workflow_key={} canceled_jobs={} hpc_jobs={} in_flight={}",
            workflow_key,
            summary.canceled_jobs.len(),
            summary.hpc_jobs_canceled.len(),
            summary.in_flight_jobs
        );
        Ok(summary)
    }

    /// Move an unstarted job to CANCELED. Returns the status it was canceled from, or `None`
    /// if it had already been claimed or finished.
    fn cancel_unstarted(&self, workflow_key: &str, mut job: JobModel) -> Result<Option<JobStatus>> {
        loop {
            if !job.status.is_unstarted() {
                return Ok(None);
            }
            let status = next_status(
                &job,
                &HashMap::new(),
                JobEvent::CancelRequested,
                DependencyPolicy::default(),
            )?;
            let swapped = send_with_retries(
                || {
                    self.store
                        .compare_and_set_status(workflow_key, &job.key, job.status, status)
                },
                &self.retry,
            )?;
            if swapped {
                return Ok(Some(job.status));
            }
            job = self.store.get_job(workflow_key, &job.key)?;
        }
    }

    /// Cancel one job that has not started, and the jobs that can no longer run without it.
    /// Returns false if the job had already started or finished.
    pub fn cancel_job(&self, workflow_key: &str, job_key: &str) -> Result<bool> {
        let job = self.store.get_job(workflow_key, job_key)?;
        if self.cancel_unstarted(workflow_key, job)?.is_none() {
            warn!(
                "Job is not cancelable workflow_key={} job_key={}",
                workflow_key, job_key
            );
            return Ok(false);
        }
        info!("Canceled job workflow_key={} job_key={}", workflow_key, job_key);
        let workflow = self.store.get_workflow(workflow_key)?;
        WorkflowManager::new(self.store, &workflow)
            .with_retry_policy(self.retry)
            .update_dependents(job_key)?;
        Ok(true)
    }
}
