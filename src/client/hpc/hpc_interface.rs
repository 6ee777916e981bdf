//! Capability trait implemented by every batch scheduler adapter.

use std::collections::HashMap;

use super::common::HpcJobSpec;
use crate::errors::Result;
use crate::models::{HpcJobRecord, HpcJobStatus};

pub trait HpcInterface: Send + Sync {
    /// Write the submission script and hand it to the scheduler.
    ///
    /// Rejections surface as `EngineError::Submission`; the caller puts the job back in the
    /// ready pool.
    fn submit(&self, spec: &HpcJobSpec) -> Result<HpcJobRecord>;

    /// Status of one submitted job. A job id the scheduler no longer lists is `Complete`;
    /// the outcome comes from the job's return-code file, not from the scheduler.
    fn poll(&self, record: &HpcJobRecord) -> Result<HpcJobStatus> {
        let statuses = self.get_statuses()?;
        Ok(statuses
            .get(&record.hpc_job_id)
            .copied()
            .unwrap_or(HpcJobStatus::Complete))
    }

    /// Cancel a submitted job. Canceling a job that already finished is not an error.
    fn cancel(&self, record: &HpcJobRecord) -> Result<()>;

    /// Statuses of all active jobs of the current user, keyed by scheduler job id.
    fn get_statuses(&self) -> Result<HashMap<String, HpcJobStatus>>;
}
