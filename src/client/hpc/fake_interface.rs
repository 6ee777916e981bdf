//! Scheduler adapter that runs submission scripts as local background processes.
//!
//! Useful on laptops and in tests: the job goes through the same submit, poll and cancel
//! protocol as on a cluster. Job ids are `fake-<n>` and are only known to the process that
//! submitted them.

use chrono::Utc;
use log::{debug, info};
use std::collections::HashMap;
use std::fs::{self, File};
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use super::common::{HpcJobSpec, HpcJobStatus, script_body, write_script};
use super::hpc_interface::HpcInterface;
use crate::client::async_cli_command::kill_process_tree;
use crate::errors::{EngineError, Result};
use crate::models::HpcJobRecord;

#[derive(Default)]
pub struct FakeInterface {
    next_id: AtomicU64,
    children: Mutex<HashMap<String, Child>>,
}

impl FakeInterface {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Child>>> {
        self.children
            .lock()
            .map_err(|_| EngineError::Scheduler("fake scheduler lock poisoned".to_string()))
    }
}

impl HpcInterface for FakeInterface {
    fn submit(&self, spec: &HpcJobSpec) -> Result<HpcJobRecord> {
        let script = format!("#!/bin/bash\n# fake scheduler job {}\n\n{}", spec.job_name, script_body(spec));
        write_script(&spec.script_path, &script)
            .map_err(|e| EngineError::Submission(format!("{:#}", e)))?;
        for path in [&spec.stdout_path, &spec.stderr_path] {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
        }
        let stdout = File::create(&spec.stdout_path)?;
        let stderr = File::create(&spec.stderr_path)?;

        let child = Command::new("bash")
            .arg(&spec.script_path)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|e| EngineError::Submission(format!("failed to start fake job: {}", e)))?;

        let hpc_job_id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        info!(
            "Submitted fake job fake_job_id={} job_key={} pid={}",
            hpc_job_id,
            spec.job_key,
            child.id()
        );
        self.lock()?.insert(hpc_job_id.clone(), child);

        Ok(HpcJobRecord {
            workflow_key: spec.workflow_key.clone(),
            job_key: spec.job_key.clone(),
            attempt_id: spec.attempt_id,
            scheduler_name: spec.scheduler_name.clone(),
            hpc_job_id,
            status: HpcJobStatus::Running,
            submitted_at: Utc::now(),
        })
    }

    fn poll(&self, record: &HpcJobRecord) -> Result<HpcJobStatus> {
        let mut children = self.lock()?;
        let status = match children.get_mut(&record.hpc_job_id) {
            Some(child) => match child.try_wait()? {
                None => HpcJobStatus::Running,
                Some(_) => HpcJobStatus::Complete,
            },
            None => HpcJobStatus::Complete,
        };
        if status == HpcJobStatus::Complete {
            children.remove(&record.hpc_job_id);
        }
        Ok(status)
    }

    fn cancel(&self, record: &HpcJobRecord) -> Result<()> {
        let mut children = self.lock()?;
        if let Some(child) = children.get_mut(&record.hpc_job_id) {
            if child.try_wait()?.is_none() {
                kill_process_tree(child.id());
                let _ = child.kill();
                let _ = child.wait();
            }
            info!("Canceled fake job {}", record.hpc_job_id);
        } else {
            debug!("Fake job {} already gone", record.hpc_job_id);
        }
        Ok(())
    }

    fn get_statuses(&self) -> Result<HashMap<String, HpcJobStatus>> {
        let mut children = self.lock()?;
        let mut statuses = HashMap::new();
        for (id, child) in children.iter_mut() {
            if child.try_wait()?.is_none() {
                statuses.insert(id.clone(), HpcJobStatus::Running);
            }
        }
        Ok(statuses)
    }
}
