//! Per-job resource sampling.
//!
//! A monitor thread samples the job's root process and all of its descendants at a fixed
//! interval and accumulates peak and average CPU, memory, and process counts. Ticks where the
//! root process cannot be read are skipped.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use sysinfo::{Pid, PidExt, ProcessExt, System, SystemExt};

use crate::memory_utils::bytes_to_gb;
use crate::models::ResourceMonitorConfig;

const STOP_CHECK_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Cpu,
    Memory,
    Process,
}

/// Peak and average of one resource over the life of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceStats {
    pub resource_type: ResourceType,
    pub max: f64,
    pub avg: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessStats {
    pub max_cpu_percent: f64,
    pub avg_cpu_percent: f64,
    pub max_memory_gb: f64,
    pub avg_memory_gb: f64,
    pub peak_num_processes: u64,
    pub resources: Vec<ResourceStats>,
    pub num_samples: u64,
}

#[derive(Debug, Serialize)]
struct Sample {
    timestamp: DateTime<Utc>,
    cpu_percent: f64,
    memory_gb: f64,
    num_processes: u64,
}

#[derive(Debug, Default)]
struct Accumulator {
    max_cpu: f64,
    sum_cpu: f64,
    max_mem: f64,
    sum_mem: f64,
    max_procs: u64,
    sum_procs: u64,
    count: u64,
}

impl Accumulator {
    fn add(&mut self, sample: &Sample) {
        self.max_cpu = self.max_cpu.max(sample.cpu_percent);
        self.sum_cpu += sample.cpu_percent;
        self.max_mem = self.max_mem.max(sample.memory_gb);
        self.sum_mem += sample.memory_gb;
        self.max_procs = self.max_procs.max(sample.num_processes);
        self.sum_procs += sample.num_processes;
        self.count += 1;
    }

    fn finish(self) -> ProcessStats {
        if self.count == 0 {
            return ProcessStats::default();
        }
        let n = self.count as f64;
        let avg_cpu = self.sum_cpu / n;
        let avg_mem = self.sum_mem / n;
        let avg_procs = self.sum_procs as f64 / n;
        ProcessStats {
            max_cpu_percent: self.max_cpu,
            avg_cpu_percent: avg_cpu,
            max_memory_gb: self.max_mem,
            avg_memory_gb: avg_mem,
            peak_num_processes: self.max_procs,
            resources: vec![
                ResourceStats {
                    resource_type: ResourceType::Cpu,
                    max: self.max_cpu,
                    avg: avg_cpu,
                },
                ResourceStats {
                    resource_type: ResourceType::Memory,
                    max: self.max_mem,
                    avg: avg_mem,
                },
                ResourceStats {
                    resource_type: ResourceType::Process,
                    max: self.max_procs as f64,
                    avg: avg_procs,
                },
            ],
            num_samples: self.count,
        }
    }
}

/// Keys of `root` and every process below it.
pub(crate) fn process_tree(sys: &System, root: Pid) -> Vec<Pid> {
    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (pid, process) in sys.processes() {
        if let Some(parent) = process.parent() {
            children.entry(parent).or_default().push(*pid);
        }
    }
    let mut tree = vec![root];
    let mut idx = 0;
    while idx < tree.len() {
        if let Some(kids) = children.get(&tree[idx]) {
            tree.extend(kids.iter().copied());
        }
        idx += 1;
    }
    tree
}

fn take_sample(sys: &mut System, root: Pid) -> Option<Sample> {
    sys.refresh_processes();
    sys.process(root)?;
    let mut cpu = 0.0;
    let mut memory: u64 = 0;
    let mut count = 0;
    for pid in process_tree(sys, root) {
        if let Some(process) = sys.process(pid) {
            cpu += process.cpu_usage() as f64;
            memory += process.memory();
            count += 1;
        }
    }
    Some(Sample {
        timestamp: Utc::now(),
        cpu_percent: cpu,
        memory_gb: bytes_to_gb(memory),
        num_processes: count,
    })
}

pub struct ResourceMonitor;

impl ResourceMonitor {
    /// Start sampling `pid` and its descendants on a background thread.
    ///
    /// When `time_series_path` is set, every sample is also appended to that file as one JSON
    /// object per line.
    pub fn start(
        pid: u32,
        config: &ResourceMonitorConfig,
        time_series_path: Option<PathBuf>,
    ) -> ResourceMonitorHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let interval = Duration::from_secs_f64(config.sample_interval_seconds.max(0.01));

        let thread = thread::spawn(move || {
            let root = Pid::from_u32(pid);
            let mut sys = System::new();
            let mut acc = Accumulator::default();
            let mut writer = time_series_path.and_then(|path| match File::create(&path) {
                Ok(f) => Some(BufWriter::new(f)),
                Err(e) => {
                    warn!(
                        "Failed to create time series file path={} error={}",
                        path.display(),
                        e
                    );
                    None
                }
            });

            loop {
                match take_sample(&mut sys, root) {
                    Some(sample) => {
                        if let Some(ref mut w) = writer
                            && let Ok(line) = serde_json::to_string(&sample)
                        {
                            let _ = writeln!(w, "{}", line);
                        }
                        acc.add(&sample);
                    }
                    None => debug!("Skipping resource sample pid={}", pid),
                }
                if crate::client::utils::sleep_sliced(interval, STOP_CHECK_INTERVAL, || {
                    stop_flag.load(Ordering::SeqCst)
                }) {
                    break;
                }
            }

            if let Some(mut w) = writer {
                let _ = w.flush();
            }
            acc.finish()
        });

        ResourceMonitorHandle {
            stop,
            thread: Some(thread),
        }
    }
}

pub struct ResourceMonitorHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<ProcessStats>>,
}

impl ResourceMonitorHandle {
    /// Stop sampling and return the summary.
    pub fn stop(mut self) -> ProcessStats {
        self.stop.store(true, Ordering::SeqCst);
        match self.thread.take().map(|t| t.join()) {
            Some(Ok(stats)) => stats,
            _ => {
                warn!("Resource monitor thread panicked");
                ProcessStats::default()
            }
        }
    }
}

impl Drop for ResourceMonitorHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::tempdir;

    #[test]
    fn test_accumulator_empty() {
        let stats = Accumulator::default().finish();
        assert_eq!(stats.num_samples, 0);
        assert!(stats.resources.is_empty());
    }

    #[test]
    fn test_accumulator_peak_and_average() {
        let mut acc = Accumulator::default();
        for (cpu, mem, procs) in [(10.0, 1.0, 1), (30.0, 3.0, 3)] {
            acc.add(&Sample {
                timestamp: Utc::now(),
                cpu_percent: cpu,
                memory_gb: mem,
                num_processes: procs,
            });
        }
        let stats = acc.finish();
        assert_eq!(stats.num_samples, 2);
        assert_eq!(stats.max_cpu_percent, 30.0);
        assert_eq!(stats.avg_cpu_percent, 20.0);
        assert_eq!(stats.max_memory_gb, 3.0);
        assert_eq!(stats.avg_memory_gb, 2.0);
        assert_eq!(stats.peak_num_processes, 3);
        assert_eq!(stats.resources.len(), 3);
        assert_eq!(stats.resources[2].resource_type, ResourceType::Process);
        assert_eq!(stats.resources[2].avg, 2.0);
    }

    #[test]
    fn test_monitor_samples_running_process() {
        let dir = tempdir().unwrap();
        let series = dir.path().join("series.jsonl");
        let mut child = Command::new("bash")
            .arg("-c")
            .arg("sleep 2 & sleep 2; wait")
            .spawn()
            .unwrap();
        let config = ResourceMonitorConfig {
            enabled: true,
            sample_interval_seconds: 0.1,
            generate_time_series: true,
        };
        let handle = ResourceMonitor::start(child.id(), &config, Some(series.clone()));
        thread::sleep(Duration::from_millis(700));
        let stats = handle.stop();
        let _ = child.kill();
        let _ = child.wait();

        assert!(stats.num_samples > 0);
        assert!(stats.peak_num_processes >= 1);
        let lines = std::fs::read_to_string(&series).unwrap();
        assert_eq!(lines.lines().count() as u64, stats.num_samples);
    }

    #[test]
    fn test_monitor_of_missing_process_has_no_samples() {
        let config = ResourceMonitorConfig {
            enabled: true,
            sample_interval_seconds: 0.05,
            generate_time_series: false,
        };
        // Pids near u32::MAX are not assigned on Linux.
        let handle = ResourceMonitor::start(u32::MAX - 1, &config, None);
        thread::sleep(Duration::from_millis(150));
        assert_eq!(handle.stop().num_samples, 0);
    }
}
