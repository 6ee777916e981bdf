//! File layout under a worker's output directory.
//!
//! ```text
//! <output_dir>/
//!   job_stdio/job_<wf>_<job>_<attempt>.{o,e}
//!   job_stdio/job_<wf>_<job>_<attempt>.resources.jsonl
//!   user_data/<job>_<attempt>/<NAME>.json
//!   hpc/<job>_<attempt>.sh
//!   hpc/<job>_<attempt>.rc
//!   hpc/<job>_<attempt>.{o,e}
//!   worker_<worker_id>.log
//! ```

use std::path::{Path, PathBuf};

pub fn get_job_stdio_dir(output_dir: &Path) -> PathBuf {
    output_dir.join("job_stdio")
}

pub fn get_job_stdout_path(
    output_dir: &Path,
    workflow_key: &str,
    job_key: &str,
    attempt_id: i64,
) -> PathBuf {
    get_job_stdio_dir(output_dir).join(format!(
        "job_{}_{}_{}.o",
        workflow_key, job_key, attempt_id
    ))
}

pub fn get_job_stderr_path(
    output_dir: &Path,
    workflow_key: &str,
    job_key: &str,
    attempt_id: i64,
) -> PathBuf {
    get_job_stdio_dir(output_dir).join(format!(
        "job_{}_{}_{}.e",
        workflow_key, job_key, attempt_id
    ))
}

pub fn get_job_time_series_path(
    output_dir: &Path,
    workflow_key: &str,
    job_key: &str,
    attempt_id: i64,
) -> PathBuf {
    get_job_stdio_dir(output_dir).join(format!(
        "job_{}_{}_{}.resources.jsonl",
        workflow_key, job_key, attempt_id
    ))
}

/// Directory where a job writes the user-data items it produces, one `<NAME>.json` per item.
pub fn get_user_data_output_dir(output_dir: &Path, job_key: &str, attempt_id: i64) -> PathBuf {
    output_dir
        .join("user_data")
        .join(format!("{}_{}", job_key, attempt_id))
}

pub fn get_hpc_dir(output_dir: &Path) -> PathBuf {
    output_dir.join("hpc")
}

pub fn get_hpc_script_path(output_dir: &Path, job_key: &str, attempt_id: i64) -> PathBuf {
    get_hpc_dir(output_dir).join(format!("{}_{}.sh", job_key, attempt_id))
}

/// File the submission script writes the command's exit code to.
pub fn get_hpc_return_code_path(output_dir: &Path, job_key: &str, attempt_id: i64) -> PathBuf {
    get_hpc_dir(output_dir).join(format!("{}_{}.rc", job_key, attempt_id))
}

pub fn get_hpc_stdout_path(output_dir: &Path, job_key: &str, attempt_id: i64) -> PathBuf {
    get_hpc_dir(output_dir).join(format!("{}_{}.o", job_key, attempt_id))
}

pub fn get_hpc_stderr_path(output_dir: &Path, job_key: &str, attempt_id: i64) -> PathBuf {
    get_hpc_dir(output_dir).join(format!("{}_{}.e", job_key, attempt_id))
}

pub fn get_worker_log_file(output_dir: &Path, worker_id: &str) -> PathBuf {
    output_dir.join(format!("worker_{}.log", worker_id))
}
