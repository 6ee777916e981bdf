//! A job command running as a local subprocess.
//!
//! The command runs through `bash -c` with stdout and stderr redirected to files. Termination
//! signals go to the whole process tree, since the shell's descendants do the real work.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Child, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use sysinfo::{Pid, PidExt, ProcessExt, Signal, System, SystemExt};

use crate::client::resource_monitor::{
    ProcessStats, ResourceMonitor, ResourceMonitorHandle, process_tree,
};
use crate::client::utils::shell_command;
use crate::errors::{EngineError, Result};
use crate::models::{JobModel, ResourceMonitorConfig};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Return code recorded for a process that ended without an exit code of its own.
pub const UNKNOWN_RETURN_CODE: i64 = -1;

/// Convert an exit status into a return code. Signal deaths become the negated signal number.
pub fn exit_status_to_code(status: ExitStatus) -> i64 {
    if let Some(code) = status.code() {
        return code as i64;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -(signal as i64);
        }
    }
    UNKNOWN_RETURN_CODE
}

fn signal_processes(pids: &[Pid], signal: Signal) -> usize {
    let mut sys = System::new();
    sys.refresh_processes();
    let mut sent = 0;
    for pid in pids {
        if let Some(process) = sys.process(*pid) {
            let delivered = match process.kill_with(signal) {
                Some(ok) => ok,
                None if matches!(signal, Signal::Kill) => process.kill(),
                None => false,
            };
            if delivered {
                sent += 1;
            }
        }
    }
    sent
}

/// Kill `pid` and every process below it. Returns the number of processes signaled.
pub fn kill_process_tree(pid: u32) -> usize {
    let mut sys = System::new();
    sys.refresh_processes();
    let tree = process_tree(&sys, Pid::from_u32(pid));
    signal_processes(&tree, Signal::Kill)
}

pub struct AsyncCliCommand {
    pub job: JobModel,
    child: Option<Child>,
    pub pid: Option<u32>,
    pub start_time: DateTime<Utc>,
    start_instant: Instant,
    pub is_complete: bool,
    pub return_code: Option<i64>,
    pub stdout_path: Option<PathBuf>,
    pub stderr_path: Option<PathBuf>,
    monitor: Option<ResourceMonitorHandle>,
    stats: Option<ProcessStats>,
}

impl AsyncCliCommand {
    pub fn new(job: JobModel) -> Self {
        Self {
            job,
            child: None,
            pid: None,
            start_time: Utc::now(),
            start_instant: Instant::now(),
            is_complete: false,
            return_code: None,
            stdout_path: None,
            stderr_path: None,
            monitor: None,
            stats: None,
        }
    }

    /// Spawn `command` through the shell with the given environment.
    pub fn start(
        &mut self,
        command: &str,
        stdout_path: &Path,
        stderr_path: &Path,
        envs: &[(String, String)],
    ) -> Result<()> {
        if self.child.is_some() {
            return Err(EngineError::Store(format!(
                "job {} is already running",
                self.job.key
            )));
        }
        for path in [stdout_path, stderr_path] {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
        }
        let stdout = File::create(stdout_path)?;
        let stderr = File::create(stderr_path)?;

        let mut cmd = shell_command();
        cmd.arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        for (key, value) in envs {
            cmd.env(key, value);
        }

        let child = cmd.spawn()?;
        self.start_time = Utc::now();
        self.start_instant = Instant::now();
        self.pid = Some(child.id());
        self.child = Some(child);
        self.stdout_path = Some(stdout_path.to_path_buf());
        self.stderr_path = Some(stderr_path.to_path_buf());
        debug!(
            "Spawned job process job_key={} pid={:?} command={}",
            self.job.key, self.pid, command
        );
        Ok(())
    }

    /// Begin sampling the process tree. Does nothing if the process has not started.
    pub fn attach_monitor(&mut self, config: &ResourceMonitorConfig, time_series: Option<PathBuf>) {
        if let Some(pid) = self.pid
            && config.enabled
            && self.monitor.is_none()
        {
            self.monitor = Some(ResourceMonitor::start(pid, config, time_series));
        }
    }

    /// Check whether the process exited without blocking.
    pub fn check_status(&mut self) -> Result<()> {
        if self.is_complete {
            return Ok(());
        }
        let child = self.child_mut()?;
        if let Some(status) = child.try_wait()? {
            self.on_exit(status);
        }
        Ok(())
    }

    /// Block until the process exits and return its code.
    pub fn wait_for_completion(&mut self) -> Result<i64> {
        if !self.is_complete {
            let status = self.child_mut()?.wait()?;
            self.on_exit(status);
        }
        Ok(self.return_code.unwrap_or(UNKNOWN_RETURN_CODE))
    }

    /// Send SIGTERM to the process and its descendants.
    pub fn terminate(&mut self) -> Result<()> {
        let tree = self.tree()?;
        let sent = signal_processes(&tree, Signal::Term);
        debug!(
            "Sent SIGTERM job_key={} processes={}",
            self.job.key, sent
        );
        Ok(())
    }

    /// Kill the process and its descendants immediately.
    pub fn cancel(&mut self) -> Result<()> {
        let tree = self.tree()?;
        signal_processes(&tree, Signal::Kill);
        if !self.is_complete
            && let Some(ref mut child) = self.child
        {
            // The root may already be gone; that is fine.
            let _ = child.kill();
        }
        Ok(())
    }

    /// Stop the process: SIGTERM when the job supports it, wait up to `grace`, then kill the
    /// whole tree. Jobs that do not support termination are killed right away. Returns the
    /// process's return code.
    pub fn terminate_with_grace(&mut self, grace: Duration) -> Result<i64> {
        self.check_status()?;
        if self.is_complete {
            return Ok(self.return_code.unwrap_or(UNKNOWN_RETURN_CODE));
        }
        let tree = self.tree()?;

        if self.job.supports_termination {
            info!(
                "Job SIGTERM job_key={} grace_period_s={:.1}",
                self.job.key,
                grace.as_secs_f64()
            );
            signal_processes(&tree, Signal::Term);
            let deadline = Instant::now() + grace;
            while Instant::now() < deadline {
                self.check_status()?;
                if self.is_complete {
                    break;
                }
                thread::sleep(EXIT_POLL_INTERVAL);
            }
        }

        if self.is_complete {
            // The root exited on its own; descendants that outlived it are still killed.
            if tree.len() > 1 {
                signal_processes(&tree[1..], Signal::Kill);
            }
        } else {
            if self.job.supports_termination {
                warn!(
                    "Job did not exit within grace period job_key={}; sending SIGKILL",
                    self.job.key
                );
            } else {
                info!(
                    "Job SIGKILL job_key={} supports_termination=false",
                    self.job.key
                );
            }
            signal_processes(&tree, Signal::Kill);
            if let Some(ref mut child) = self.child {
                let _ = child.kill();
            }
        }
        self.wait_for_completion()
    }

    pub fn exec_time_minutes(&self) -> f64 {
        self.start_instant.elapsed().as_secs_f64() / 60.0
    }

    /// Resource summary, available once the process has exited and monitoring was attached.
    pub fn take_stats(&mut self) -> Option<ProcessStats> {
        self.stats.take()
    }

    fn child_mut(&mut self) -> Result<&mut Child> {
        let key = self.job.key.clone();
        self.child
            .as_mut()
            .ok_or_else(|| EngineError::NotFound(format!("process for job {}", key)))
    }

    /// Root pid first, then every descendant.
    fn tree(&self) -> Result<Vec<Pid>> {
        let pid = self
            .pid
            .ok_or_else(|| EngineError::NotFound(format!("process for job {}", self.job.key)))?;
        let mut sys = System::new();
        sys.refresh_processes();
        Ok(process_tree(&sys, Pid::from_u32(pid)))
    }

    fn on_exit(&mut self, status: ExitStatus) {
        self.is_complete = true;
        self.return_code = Some(exit_status_to_code(status));
        if let Some(monitor) = self.monitor.take() {
            self.stats = Some(monitor.stop());
        }
        debug!(
            "Job process exited job_key={} return_code={:?}",
            self.job.key, self.return_code
        );
    }
}
