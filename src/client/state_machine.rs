//! Job lifecycle state machine.
//!
//! Pure logic with no I/O. Every status write in every store is checked against
//! [`validate_transition`], and the runner derives new statuses with [`next_status`].
//!
//! ```text
//! Uninitialized -> Blocked -> Ready -> Scheduled -> Submitted -> SubmittedPending
//!                                                        |               |
//!                                                        +-> Done | Terminated | Canceled
//! ```
//!
//! Any non-terminal status may also move to `Canceled` or `Disabled`.

use std::collections::HashMap;

use crate::errors::{EngineError, Result};
use crate::models::{JobModel, JobStatus, WorkflowModel};

/// Something that happened to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    /// Workflow initialization. `inputs_ready` is true when every consumed user-data item
    /// holds data.
    Initialize { inputs_ready: bool },
    /// An upstream job or a consumed user-data item changed.
    DependenciesChanged { inputs_ready: bool },
    /// A worker won the compare-and-swap on the job.
    Claimed,
    /// The command started locally or was accepted by the batch scheduler.
    Started,
    /// The batch scheduler reports the job waiting in its queue.
    Queued,
    /// The batch scheduler rejected the submission; the job goes back to the pool.
    SubmissionFailed,
    /// The command could not be started at all.
    LaunchFailed,
    Exited {
        return_code: i64,
        outputs_present: bool,
    },
    CancelRequested,
    TimeLimitReached,
    DisableRequested,
}

/// Result of evaluating a job's upstream statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyState {
    Satisfied,
    /// At least one upstream job has not finished yet.
    Waiting,
    /// An upstream job finished in a status this job cannot accept. The job will never run.
    Unsatisfiable,
}

/// Workflow-level settings that affect dependency evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DependencyPolicy {
    pub ignore_disabled_upstreams: bool,
}

impl DependencyPolicy {
    pub fn from_workflow(workflow: &WorkflowModel) -> Self {
        Self {
            ignore_disabled_upstreams: workflow.ignore_disabled_upstreams,
        }
    }
}

/// Returns true if the lifecycle allows moving from `from` to `to`.
pub fn is_allowed(from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;

    if from.is_terminal() {
        return false;
    }
    if matches!(to, Canceled | Disabled) {
        return true;
    }
    matches!(
        (from, to),
        (Uninitialized, Blocked)
            | (Uninitialized, Ready)
            | (Blocked, Ready)
            | (Ready, Scheduled)
            | (Scheduled, Submitted)
            | (Scheduled, Ready)
            | (Scheduled, Terminated)
            | (Submitted, SubmittedPending)
            | (Submitted, Done)
            | (Submitted, Terminated)
            | (SubmittedPending, Done)
            | (SubmittedPending, Terminated)
    )
}

pub fn validate_transition(job_key: &str, from: JobStatus, to: JobStatus) -> Result<()> {
    if is_allowed(from, to) {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition {
            job: job_key.to_string(),
            from,
            to,
        })
    }
}

/// True if an upstream job in `status` lets `job` proceed.
fn is_acceptable_upstream(job: &JobModel, status: JobStatus, policy: DependencyPolicy) -> bool {
    match status {
        JobStatus::Done => true,
        JobStatus::Disabled => policy.ignore_disabled_upstreams,
        JobStatus::Terminated => !job.cancel_on_blocking_job_failure,
        _ => false,
    }
}

/// Evaluate the statuses of the jobs that block `job`.
///
/// `dependency_statuses` maps upstream job keys to their current status. An upstream key
/// missing from the map counts as not finished.
pub fn dependencies_satisfied(
    job: &JobModel,
    dependency_statuses: &HashMap<String, JobStatus>,
    policy: DependencyPolicy,
) -> DependencyState {
    let mut state = DependencyState::Satisfied;
    for upstream in &job.depends_on {
        match dependency_statuses.get(upstream) {
            Some(&status) if is_acceptable_upstream(job, status, policy) => {}
            Some(&status) if status.is_terminal() => return DependencyState::Unsatisfiable,
            _ => state = DependencyState::Waiting,
        }
    }
    state
}

/// Compute the status `job` moves to when `event` happens.
///
/// Returns the current status for events that leave the job where it is (for example a
/// dependency change that does not unblock it). Any other outcome is checked against the
/// transition table.
pub fn next_status(
    job: &JobModel,
    dependency_statuses: &HashMap<String, JobStatus>,
    event: JobEvent,
    policy: DependencyPolicy,
) -> Result<JobStatus> {
    use JobStatus::*;

    let from = job.status;
    let to = match event {
        JobEvent::Initialize { inputs_ready } | JobEvent::DependenciesChanged { inputs_ready } => {
            let expected = if matches!(event, JobEvent::Initialize { .. }) {
                Uninitialized
            } else {
                Blocked
            };
            if from != expected {
                return Err(EngineError::InvalidTransition {
                    job: job.key.clone(),
                    from,
                    to: Ready,
                });
            }
            match dependencies_satisfied(job, dependency_statuses, policy) {
                DependencyState::Satisfied if inputs_ready => Ready,
                DependencyState::Unsatisfiable => Canceled,
                _ => Blocked,
            }
        }
        JobEvent::Claimed => Scheduled,
        JobEvent::Started => Submitted,
        JobEvent::Queued => SubmittedPending,
        JobEvent::SubmissionFailed => Ready,
        JobEvent::LaunchFailed => Terminated,
        JobEvent::Exited {
            return_code,
            outputs_present,
        } => {
            if return_code == 0 && outputs_present {
                Done
            } else {
                Terminated
            }
        }
        JobEvent::CancelRequested => Canceled,
        JobEvent::TimeLimitReached => Terminated,
        JobEvent::DisableRequested => Disabled,
    };

    if to == from && matches!(to, Blocked | SubmittedPending) {
        return Ok(to);
    }
    validate_transition(&job.key, from, to)?;
    Ok(to)
}
