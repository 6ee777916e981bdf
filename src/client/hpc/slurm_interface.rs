//! Slurm scheduler interface implementation

use anyhow::Context;
use chrono::Utc;
use log::{debug, error, info, trace, warn};
use regex::Regex;
use std::collections::HashMap;
use std::env;

use super::common::{
    HpcJobSpec, HpcJobStatus, command_retry_settings, current_user, run_command_with_retries,
    script_body, write_script,
};
use super::hpc_interface::HpcInterface;
use crate::config::SchedulerConfig;
use crate::errors::{EngineError, Result};
use crate::memory_utils::memory_string_to_mb;
use crate::models::HpcJobRecord;
use crate::time_utils::{duration_string_to_seconds, format_walltime};

/// scancel messages meaning the job is already gone
const GONE_JOB_ERRORS: [&str; 2] = [
    "Invalid job id specified",
    "Job/step already completing or completed",
];

/// Slurm scheduler implementation
pub struct SlurmInterface {
    user: String,
    config: SchedulerConfig,
    sbatch_regex: Regex,
}

impl SlurmInterface {
    pub fn new(config: &SchedulerConfig) -> anyhow::Result<Self> {
        let user = current_user()?;
        let sbatch_regex = Regex::new(r"Submitted batch job (\d+)")?;

        Ok(Self {
            user,
            config: config.clone(),
            sbatch_regex,
        })
    }

    /// Map Slurm status to HpcJobStatus
    pub fn map_status(slurm_status: &str) -> HpcJobStatus {
        match slurm_status {
            "PENDING" | "CONFIGURING" | "REQUEUED" => HpcJobStatus::Queued,
            "RUNNING" => HpcJobStatus::Running,
            "COMPLETED" | "COMPLETING" | "CANCELLED" | "FAILED" | "TIMEOUT" => {
                HpcJobStatus::Complete
            }
            _ => HpcJobStatus::Unknown,
        }
    }

    /// Parse `squeue --Format jobid,state -h` output.
    pub fn parse_squeue_output(stdout: &str) -> HashMap<String, HpcJobStatus> {
        let mut statuses = HashMap::new();
        for line in stdout.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 2 {
                warn!("Skipping malformed squeue line: {}", line);
                continue;
            }

            // "CANCELLED by 1234" arrives as a separate token only with other formats.
            let state = fields[1].trim_end_matches('+');
            statuses.insert(fields[0].to_string(), Self::map_status(state));
        }
        statuses
    }

    /// Extract the job id from sbatch output. Accepts both the default message and
    /// `--parsable` output.
    pub fn parse_sbatch_output(&self, stdout: &str) -> Option<String> {
        if let Some(captures) = self.sbatch_regex.captures(stdout) {
            return captures.get(1).map(|m| m.as_str().to_string());
        }
        let first = stdout.trim().split(';').next()?.trim();
        if !first.is_empty() && first.chars().all(|c| c.is_ascii_digit()) {
            return Some(first.to_string());
        }
        None
    }

    /// Get the squeue executable path (allows for testing with fake binary)
    fn get_squeue_exec() -> String {
        env::var("HPCFLOW_FAKE_SQUEUE").unwrap_or_else(|_| "squeue".to_string())
    }

    /// Get the sbatch executable path (allows for testing with fake binary)
    fn get_sbatch_exec() -> String {
        env::var("HPCFLOW_FAKE_SBATCH").unwrap_or_else(|_| "sbatch".to_string())
    }

    fn get_scancel_exec() -> String {
        env::var("HPCFLOW_FAKE_SCANCEL").unwrap_or_else(|_| "scancel".to_string())
    }

    pub fn create_submission_script(&self, spec: &HpcJobSpec) -> anyhow::Result<String> {
        let account = self
            .config
            .account
            .as_deref()
            .context("Missing 'account' in Slurm scheduler config")?;
        let rr = &spec.resource_requirements;
        let walltime = format_walltime(
            duration_string_to_seconds(&rr.runtime).map_err(anyhow::Error::msg)?,
        );
        let memory_mb = memory_string_to_mb(&rr.memory)
            .with_context(|| format!("Invalid memory requirement: {}", rr.memory))?;

        let mut script = format!(
            "#!/bin/bash\n\
             #SBATCH --account={}\n\
             #SBATCH --job-name={}\n\
             #SBATCH --time={}\n\
             #SBATCH --output={}\n\
             #SBATCH --error={}\n\
             #SBATCH --nodes=1\n\
             #SBATCH --ntasks=1\n\
             #SBATCH --cpus-per-task={}\n\
             #SBATCH --mem={}M\n",
            account,
            spec.job_name,
            walltime,
            spec.stdout_path.display(),
            spec.stderr_path.display(),
            rr.num_cpus,
            memory_mb,
        );
        if rr.num_gpus > 0 {
            script.push_str(&format!("#SBATCH --gpus={}\n", rr.num_gpus));
        }
        if let Some(ref partition) = self.config.partition {
            script.push_str(&format!("#SBATCH --partition={}\n", partition));
        }
        if let Some(ref qos) = self.config.qos {
            script.push_str(&format!("#SBATCH --qos={}\n", qos));
        }
        if let Some(ref extra) = self.config.extra {
            script.push_str(&format!("#SBATCH {}\n", extra));
        }
        script.push('\n');
        script.push_str(&script_body(spec));
        Ok(script)
    }
}

impl HpcInterface for SlurmInterface {
    fn submit(&self, spec: &HpcJobSpec) -> Result<HpcJobRecord> {
        let script = self
            .create_submission_script(spec)
            .map_err(|e| EngineError::Submission(format!("{:#}", e)))?;
        write_script(&spec.script_path, &script)
            .map_err(|e| EngineError::Submission(format!("{:#}", e)))?;

        let sbatch = Self::get_sbatch_exec();
        let filename = spec.script_path.to_string_lossy();
        let (retries, delay) = command_retry_settings();
        let (return_code, stdout, stderr) =
            run_command_with_retries(&sbatch, &[&filename], retries, delay, &[])
                .map_err(|e| EngineError::Submission(format!("{:#}", e)))?;

        if return_code != 0 {
            return Err(EngineError::Submission(format!(
                "sbatch failed with return code {}: {}",
                return_code,
                stderr.trim()
            )));
        }

        let hpc_job_id = self.parse_sbatch_output(&stdout).ok_or_else(|| {
            error!("Failed to parse sbatch output: {}", stdout);
            EngineError::Submission("Failed to parse job ID from sbatch output".to_string())
        })?;
        info!(
            "Submitted Slurm job slurm_job_id={} job_key={} attempt_id={}",
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
        let scancel = Self::get_scancel_exec();
        let (retries, delay) = command_retry_settings();
        let (return_code, stdout, stderr) = run_command_with_retries(
            &scancel,
            &[&record.hpc_job_id],
            retries,
            delay,
            &GONE_JOB_ERRORS,
        )?;

        let already_gone = GONE_JOB_ERRORS
            .iter()
            .any(|msg| stderr.contains(msg) || stdout.contains(msg));
        if return_code != 0 && !already_gone {
            error!(
                "Failed to cancel Slurm job {}: {}",
                record.hpc_job_id, stderr
            );
            return Err(EngineError::Scheduler(format!(
                "scancel {} failed: {}",
                record.hpc_job_id,
                stderr.trim()
            )));
        }
        info!("Canceled Slurm job {}", record.hpc_job_id);
        Ok(())
    }

    fn get_statuses(&self) -> Result<HashMap<String, HpcJobStatus>> {
        let squeue = Self::get_squeue_exec();
        let (retries, delay) = command_retry_settings();
        let (return_code, stdout, stderr) = run_command_with_retries(
            &squeue,
            &["-u", &self.user, "--Format", "jobid,state", "-h"],
            retries,
            delay,
            &[],
        )?;

        if return_code != 0 {
            return Err(EngineError::Scheduler(format!(
                "squeue command failed: {} - {}",
                return_code, stderr
            )));
        }

        trace!("squeue output: [{}]", stdout);
        let statuses = Self::parse_squeue_output(&stdout);
        debug!("squeue reported {} active jobs", statuses.len());
        Ok(statuses)
    }
}
