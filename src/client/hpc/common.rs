//! Types and helpers shared by the batch scheduler adapters.

use anyhow::{Context, Result};
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use crate::models::ResourceRequirements;

pub use crate::models::HpcJobStatus;

/// Supported batch scheduler types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HpcType {
    Slurm,
    Pbs,
    /// Runs submission scripts as local background processes
    Fake,
}

impl std::fmt::Display for HpcType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HpcType::Slurm => write!(f, "slurm"),
            HpcType::Pbs => write!(f, "pbs"),
            HpcType::Fake => write!(f, "fake"),
        }
    }
}

impl std::str::FromStr for HpcType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "slurm" => Ok(HpcType::Slurm),
            "pbs" => Ok(HpcType::Pbs),
            "fake" => Ok(HpcType::Fake),
            _ => Err(format!("Unknown HPC type: {}", s)),
        }
    }
}

/// Everything an adapter needs to submit one job attempt.
#[derive(Debug, Clone)]
pub struct HpcJobSpec {
    pub workflow_key: String,
    pub job_key: String,
    pub attempt_id: i64,
    pub job_name: String,
    /// Name of the adapter in the worker's configuration
    pub scheduler_name: String,
    /// Fully resolved command line
    pub command: String,
    pub resource_requirements: ResourceRequirements,
    /// Directory the script changes into before running the command
    pub working_dir: PathBuf,
    pub script_path: PathBuf,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    /// File the script writes the command's exit code to
    pub return_code_path: PathBuf,
    pub env: Vec<(String, String)>,
}

/// Quote a value for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Script body shared by all adapters: environment, the command, and the exit-code trailer.
pub fn script_body(spec: &HpcJobSpec) -> String {
    let mut body = String::new();
    body.push_str(&format!(
        "cd {}\n",
        shell_quote(&spec.working_dir.to_string_lossy())
    ));
    for (key, value) in &spec.env {
        body.push_str(&format!("export {}={}\n", key, shell_quote(value)));
    }
    body.push('\n');
    body.push_str(&format!("bash -c {}\n", shell_quote(&spec.command)));
    body.push_str("rc=$?\n");
    body.push_str(&format!(
        "echo $rc > {}\n",
        shell_quote(&spec.return_code_path.to_string_lossy())
    ));
    body.push_str("exit $rc\n");
    body
}

/// Write `content` to `filename` and make it executable.
pub fn write_script(filename: &Path, content: &str) -> Result<()> {
    if let Some(parent) = filename.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }
    fs::write(filename, content)
        .with_context(|| format!("Failed to write submission script to {:?}", filename))?;

    #[cfg(unix)]
    {
        let mut perms = fs::metadata(filename)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(filename, perms)?;
    }

    debug!("Created submission script: {:?}", filename);
    Ok(())
}

/// Read the exit code written by the script trailer. None if the file is missing or garbled.
pub fn read_return_code(path: &Path) -> Option<i64> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Run a command with retries for transient errors.
///
/// Returns `(return_code, stdout, stderr)`. Output containing one of `ignore_errors` is
/// returned without retrying.
pub fn run_command_with_retries(
    cmd: &str,
    args: &[&str],
    num_retries: usize,
    retry_delay: Duration,
    ignore_errors: &[&str],
) -> Result<(i32, String, String)> {
    let mut attempts = 0;
    loop {
        attempts += 1;
        trace!("Running command: {} {:?} (attempt {})", cmd, args, attempts);

        let output = Command::new(cmd)
            .args(args)
            .output()
            .with_context(|| format!("Failed to run {}", cmd))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let return_code = output.status.code().unwrap_or(-1);

        let should_ignore = ignore_errors
            .iter()
            .any(|err| stderr.contains(err) || stdout.contains(err));

        if return_code == 0 || should_ignore || attempts >= num_retries {
            return Ok((return_code, stdout, stderr));
        }

        warn!(
            "Command failed (attempt {}/{}): {} - {}",
            attempts, num_retries, return_code, stderr
        );
        thread::sleep(retry_delay);
    }
}

/// Retry settings for scheduler commands. Tests shorten them via `HPCFLOW_HPC_RETRY_DELAY_SECS`.
pub fn command_retry_settings() -> (usize, Duration) {
    let delay = std::env::var("HPCFLOW_HPC_RETRY_DELAY_SECS")
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(10.0);
    (6, Duration::from_secs_f64(delay.max(0.0)))
}

/// Current user name, used to restrict status queries to our own jobs.
pub fn current_user() -> Result<String> {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .context("Neither USER nor USERNAME is set")
}

#[cfg(test)]
pub(crate) fn sample_spec(dir: &Path) -> HpcJobSpec {
    HpcJobSpec {
        workflow_key: "1".to_string(),
        job_key: "7".to_string(),
        attempt_id: 1,
        job_name: "work".to_string(),
        scheduler_name: "test".to_string(),
        command: "echo 'hi there'; exit 4".to_string(),
        resource_requirements: ResourceRequirements::default(),
        working_dir: dir.to_path_buf(),
        script_path: dir.join("hpc/7_1.sh"),
        stdout_path: dir.join("hpc/7_1.o"),
        stderr_path: dir.join("hpc/7_1.e"),
        return_code_path: dir.join("hpc/7_1.rc"),
        env: vec![("HPCFLOW_JOB_KEY".to_string(), "7".to_string())],
    }
}

/// Executable bash script standing in for a scheduler command.
#[cfg(test)]
pub(crate) fn write_stub_command(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    write_script(&path, &format!("#!/bin/bash\n{}\n", body)).unwrap();
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_hpc_type_parse() {
        assert_eq!("SLURM".parse::<HpcType>().unwrap(), HpcType::Slurm);
        assert_eq!("pbs".parse::<HpcType>().unwrap(), HpcType::Pbs);
        assert!("lsf".parse::<HpcType>().is_err());
        assert_eq!(HpcType::Fake.to_string(), "fake");
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("abc"), "'abc'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_script_body_writes_return_code() {
        let dir = tempdir().unwrap();
        let spec = sample_spec(dir.path());
        let script = format!("#!/bin/bash\n{}", script_body(&spec));
        write_script(&spec.script_path, &script).unwrap();

        let output = Command::new("bash").arg(&spec.script_path).output().unwrap();
        assert_eq!(output.status.code(), Some(4));
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "hi there");
        assert_eq!(read_return_code(&spec.return_code_path), Some(4));
    }

    #[test]
    fn test_read_return_code_missing() {
        let dir = tempdir().unwrap();
        assert_eq!(read_return_code(&dir.path().join("nope.rc")), None);
    }

    #[test]
    fn test_run_command_with_retries_ignores_listed_errors() {
        let (rc, _, _) = run_command_with_retries(
            "bash",
            &["-c", "echo 'Invalid job id specified' >&2; exit 1"],
            3,
            Duration::from_millis(1),
            &["Invalid job id specified"],
        )
        .unwrap();
        assert_eq!(rc, 1);
    }
}
