//! PBS scheduler interface implementation

use anyhow::Context;
use chrono::Utc;
use log::{debug, error, info, trace, warn};
use std::collections::HashMap;
use std::env;

use super::common::{
    HpcJobSpec, HpcJobStatus, command_retry_settings, run_command_with_retries, script_body,
    write_script,
};
use super::hpc_interface::HpcInterface;
use crate::config::SchedulerConfig;
use crate::errors::{EngineError, Result};
use crate::memory_utils::memory_string_to_mb;
use crate::models::HpcJobRecord;
use crate::time_utils::{duration_string_to_seconds, format_walltime};

/// qdel and qstat messages meaning the job is already gone
const GONE_JOB_ERRORS: [&str; 3] = ["Unknown Job Id", "Job has finished", "job has finished"];

pub struct PbsInterface {
    config: SchedulerConfig,
}

impl PbsInterface {
    pub fn new(config: &SchedulerConfig) -> anyhow::Result<Self> {
        Ok(Self {
            config: config.clone(),
        })
    }

    /// Map a PBS job state letter to HpcJobStatus
    pub fn map_status(pbs_state: &str) -> HpcJobStatus {
        match pbs_state {
            "Q" | "H" | "W" | "T" => HpcJobStatus::Queued,
            "R" | "E" | "B" => HpcJobStatus::Running,
            "F" | "X" | "C" => HpcJobStatus::Complete,
            _ => HpcJobStatus::Unknown,
        }
    }

    /// Parse the `qstat` table:
    ///
    /// ```text
    /// Job id            Name             User              Time Use S Queue
    /// ----------------  ---------------- ----------------  -------- - -----
    /// 1234.server       work             user              00:00:01 R workq
    /// ```
    ///
    /// Without `-w` long ids are cut and end in `*`; they are kept as printed.
    pub fn parse_qstat_output(stdout: &str) -> HashMap<String, HpcJobStatus> {
        let mut statuses = HashMap::new();
        for line in stdout.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with("Job id") || line.starts_with('-') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 6 {
                warn!("Skipping malformed qstat line: {}", line);
                continue;
            }
            statuses.insert(fields[0].to_string(), Self::map_status(fields[4]));
        }
        statuses
    }

    /// Find the status of the job `qsub` reported as `hpc_job_id`. Listed ids may be
    /// truncated (`1234.pbs-ser*`) or carry a shorter server name than the full id.
    pub fn lookup_status(
        statuses: &HashMap<String, HpcJobStatus>,
        hpc_job_id: &str,
    ) -> Option<HpcJobStatus> {
        if let Some(status) = statuses.get(hpc_job_id) {
            return Some(*status);
        }
        let sequence = job_sequence(hpc_job_id);
        statuses.iter().find_map(|(listed, status)| {
            let matches = match listed.strip_suffix('*') {
                Some(prefix) => hpc_job_id.starts_with(prefix),
                None => job_sequence(listed) == sequence,
            };
            matches.then_some(*status)
        })
    }

    fn get_qsub_exec() -> String {
        env::var("HPCFLOW_FAKE_QSUB").unwrap_or_else(|_| "qsub".to_string())
    }

    fn get_qstat_exec() -> String {
        env::var("HPCFLOW_FAKE_QSTAT").unwrap_or_else(|_| "qstat".to_string())
    }

    fn get_qdel_exec() -> String {
        env::var("HPCFLOW_FAKE_QDEL").unwrap_or_else(|_| "qdel".to_string())
    }

    pub fn create_submission_script(&self, spec: &HpcJobSpec) -> anyhow::Result<String> {
        let account = self
            .config
            .account
            .as_deref()
            .context("Missing 'account' in PBS scheduler config")?;
        let rr = &spec.resource_requirements;
        let walltime = format_walltime(
            duration_string_to_seconds(&rr.runtime).map_err(anyhow::Error::msg)?,
        );
        let memory_mb = memory_string_to_mb(&rr.memory)
            .with_context(|| format!("Invalid memory requirement: {}", rr.memory))?;

        let mut select = format!("select=1:ncpus={}:mem={}mb", rr.num_cpus, memory_mb);
        if rr.num_gpus > 0 {
            select.push_str(&format!(":ngpus={}", rr.num_gpus));
        }

        let mut script = format!(
            "#!/bin/bash\n\
             #PBS -A {}\n\
             #PBS -N {}\n\
             #PBS -l walltime={}\n\
             #PBS -l {}\n\
             #PBS -o {}\n\
             #PBS -e {}\n",
            account,
            spec.job_name,
            walltime,
            select,
            spec.stdout_path.display(),
            spec.stderr_path.display(),
        );
        if let Some(ref queue) = self.config.partition {
            script.push_str(&format!("#PBS -q {}\n", queue));
        }
        if let Some(ref qos) = self.config.qos {
            script.push_str(&format!("#PBS -l qos={}\n", qos));
        }
        if let Some(ref extra) = self.config.extra {
            script.push_str(&format!("#PBS {}\n", extra));
        }
        script.push('\n');
        script.push_str(&script_body(spec));
        Ok(script)
    }
}

/// Sequence number part of a PBS job id (`1234` in `1234.server`).
fn job_sequence(hpc_job_id: &str) -> &str {
    hpc_job_id
        .split('.')
        .next()
        .unwrap_or(hpc_job_id)
        .trim_end_matches('*')
}

impl HpcInterface for PbsInterface {
    fn submit(&self, spec: &HpcJobSpec) -> Result<HpcJobRecord> {
        let script = self
            .create_submission_script(spec)
            .map_err(|e| EngineError::Submission(format!("{:#}", e)))?;
        write_script(&spec.script_path, &script)
            .map_err(|e| EngineError::Submission(format!("{:#}", e)))?;

        let qsub = Self::get_qsub_exec();
        let filename = spec.script_path.to_string_lossy();
        let (retries, delay) = command_retry_settings();
        let (return_code, stdout, stderr) =
            run_command_with_retries(&qsub, &[&filename], retries, delay, &[])
                .map_err(|e| EngineError::Submission(format!("{:#}", e)))?;

        if return_code != 0 {
            return Err(EngineError::Submission(format!(
                "qsub failed with return code {}: {}",
                return_code,
                stderr.trim()
            )));
        }

        let hpc_job_id = stdout.lines().next().unwrap_or("").trim().to_string();
        if hpc_job_id.is_empty() {
            error!("Failed to parse qsub output: {}", stdout);
            return Err(EngineError::Submission(
                "Failed to parse job ID from qsub output".to_string(),
            ));
        }
        info!(
            "Submitted PBS job pbs_job_id={} job_key={} attempt_id={}",
            hpc_job_id, spec.job_key, spec.attempt_id
        );

        Ok(HpcJobRecord {
            workflow_key: spec.workflow_key.clone(),
            job_key: spec.job_key.clone(),
            attempt_id: spec.attempt_id,
            scheduler_name: spec.scheduler_name.clone(),
            hpc_job_id,
            status: HpcJobStatus::Queued,
            submitted_at: Utc::now(),
        })
    }

    fn cancel(&self, record: &HpcJobRecord) -> Result<()> {
        let qdel = Self::get_qdel_exec();
        let (retries, delay) = command_retry_settings();
        let (return_code, stdout, stderr) = run_command_with_retries(
            &qdel,
            &[&record.hpc_job_id],
            retries,
            delay,
            &GONE_JOB_ERRORS,
        )?;

        let already_gone = GONE_JOB_ERRORS
            .iter()
            .any(|msg| stderr.contains(msg) || stdout.contains(msg));
        if return_code != 0 && !already_gone {
            error!("Failed to cancel PBS job {}: {}", record.hpc_job_id, stderr);
            return Err(EngineError::Scheduler(format!(
                "qdel {} failed: {}",
                record.hpc_job_id,
                stderr.trim()
            )));
        }
        info!("Canceled PBS job {}", record.hpc_job_id);
        Ok(())
    }

    fn poll(&self, record: &HpcJobRecord) -> Result<HpcJobStatus> {
        let qstat = Self::get_qstat_exec();
        let (retries, delay) = command_retry_settings();
        let (return_code, stdout, stderr) = run_command_with_retries(
            &qstat,
            &["-w", &record.hpc_job_id],
            retries,
            delay,
            &GONE_JOB_ERRORS,
        )?;

        if GONE_JOB_ERRORS
            .iter()
            .any(|msg| stderr.contains(msg) || stdout.contains(msg))
        {
            debug!("PBS job {} is no longer listed", record.hpc_job_id);
            return Ok(HpcJobStatus::Complete);
        }
        if return_code != 0 {
            return Err(EngineError::Scheduler(format!(
                "qstat {} failed: {} - {}",
                record.hpc_job_id, return_code, stderr
            )));
        }

        trace!("qstat output: [{}]", stdout);
        let statuses = Self::parse_qstat_output(&stdout);
        Ok(Self::lookup_status(&statuses, &record.hpc_job_id).unwrap_or(HpcJobStatus::Complete))
    }

    fn get_statuses(&self) -> Result<HashMap<String, HpcJobStatus>> {
        let qstat = Self::get_qstat_exec();
        let (retries, delay) = command_retry_settings();
        let (return_code, stdout, stderr) =
            run_command_with_retries(&qstat, &["-w"], retries, delay, &[])?;

        if return_code != 0 {
            return Err(EngineError::Scheduler(format!(
                "qstat command failed: {} - {}",
                return_code, stderr
            )));
        }

        trace!("qstat output: [{}]", stdout);
        let statuses = Self::parse_qstat_output(&stdout);
        debug!("qstat reported {} jobs", statuses.len());
        Ok(statuses)
    }
}
