//! Workflow specification files.
//!
//! A workflow is described in JSON or YAML. Both formats are first converted to
//! `serde_json::Value` and then to `WorkflowSpec`, so behavior is the same for either.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use crate::errors::{EngineError, Result};
use crate::models::{ResourceMonitorConfig, ResourceRequirements, SchedulerAssignment};

/// User data declared by the workflow, optionally with an initial value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserDataSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Named resource requirements that jobs refer to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceRequirementsSpec {
    pub name: String,
    pub num_cpus: i64,
    #[serde(default)]
    pub num_gpus: i64,
    pub memory: String,
    /// Runtime limit (defaults to 1 hour)
    #[serde(default = "ResourceRequirementsSpec::default_runtime")]
    pub runtime: String,
}

impl ResourceRequirementsSpec {
    fn default_runtime() -> String {
        "PT1H".to_string()
    }

    pub fn to_model(&self) -> ResourceRequirements {
        ResourceRequirements {
            num_cpus: self.num_cpus,
            num_gpus: self.num_gpus,
            memory: self.memory.clone(),
            runtime: self.runtime.clone(),
        }
    }
}

/// Specification for a job within a workflow
#[derive(Clone, Default, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobSpec {
    pub name: String,
    pub command: String,
    /// Whether to cancel this job if a blocking job fails (default true)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_on_blocking_job_failure: Option<bool>,
    /// Whether this job handles SIGTERM
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supports_termination: Option<bool>,
    /// Name of the resource requirements configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_requirements: Option<String>,
    /// Names of jobs that must complete before this job can run (exact matches)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<Vec<String>>,
    /// Regex patterns for jobs that must complete before this job can run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depends_on_regexes: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_user_data: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_user_data: Option<Vec<String>>,
    /// `"local"` or the name of a configured batch scheduler. Unset means any worker.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<String>,
}

impl JobSpec {
    pub fn new(name: &str, command: &str) -> JobSpec {
        JobSpec {
            name: name.to_string(),
            command: command.to_string(),
            ..Default::default()
        }
    }

    pub fn scheduler_assignment(&self) -> SchedulerAssignment {
        match self.scheduler.as_deref() {
            None => SchedulerAssignment::None,
            Some("local") => SchedulerAssignment::Local,
            Some(name) => SchedulerAssignment::Hpc {
                name: name.to_string(),
            },
        }
    }
}

/// Specification for a complete workflow
#[derive(Clone, Default, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowSpec {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Treat disabled upstream jobs as satisfied dependencies
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignore_disabled_upstreams: Option<bool>,
    pub jobs: Vec<JobSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_data: Option<Vec<UserDataSpec>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_requirements: Option<Vec<ResourceRequirementsSpec>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_monitor: Option<ResourceMonitorConfig>,
}

fn user_data_variable_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$\{user_data\.(input|output)\.([A-Za-z0-9_.\-]+)\}")
            .expect("user data variable regex is valid")
    })
}

impl WorkflowSpec {
    pub fn new(name: &str, jobs: Vec<JobSpec>) -> WorkflowSpec {
        WorkflowSpec {
            name: name.to_string(),
            jobs,
            ..Default::default()
        }
    }

    pub fn from_json_value(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| EngineError::InvalidSpec(e.to_string()))
    }

    /// Deserialize a WorkflowSpec from a JSON or YAML file. Files without a known extension
    /// are tried as JSON first, then YAML.
    pub fn from_spec_file<P: AsRef<Path>>(path: P) -> Result<WorkflowSpec> {
        let path_ref = path.as_ref();
        let content = fs::read_to_string(path_ref)?;
        let extension = path_ref
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("")
            .to_lowercase();
        let format = match extension.as_str() {
            "json" | "yaml" | "yml" => extension.as_str(),
            _ => {
                if serde_json::from_str::<serde_json::Value>(&content).is_ok() {
                    "json"
                } else {
                    "yaml"
                }
            }
        };
        Self::from_spec_file_content(&content, format)
    }

    /// Deserialize a WorkflowSpec from string content in the given format.
    pub fn from_spec_file_content(content: &str, format: &str) -> Result<WorkflowSpec> {
        let value: serde_json::Value = match format.to_lowercase().as_str() {
            "json" => serde_json::from_str(content)?,
            "yaml" | "yml" => serde_yaml::from_str(content)
                .map_err(|e| EngineError::InvalidSpec(format!("invalid YAML: {}", e)))?,
            _ => {
                return Err(EngineError::InvalidSpec(format!(
                    "Unknown format: {}",
                    format
                )));
            }
        };
        Self::from_json_value(value)
    }

    /// Rewrite `${user_data.input.NAME}` and `${user_data.output.NAME}` variables in commands.
    ///
    /// Inputs become the runtime placeholder `${user_data.NAME}` and are added to the job's
    /// `input_user_data`. Outputs become the path the job must write the item to and are added
    /// to `output_user_data`.
    pub fn substitute_variables(&mut self) {
        let re = user_data_variable_regex();
        for job in &mut self.jobs {
            let mut inputs = Vec::new();
            let mut outputs = Vec::new();
            let command = re.replace_all(&job.command, |caps: &regex::Captures| {
                let name = caps[2].to_string();
                if &caps[1] == "input" {
                    let placeholder = format!("${{user_data.{}}}", name);
                    inputs.push(name);
                    placeholder
                } else {
                    let path = format!("${{HPCFLOW_USER_DATA_OUTPUT_DIR}}/{}.json", name);
                    outputs.push(name);
                    path
                }
            });
            job.command = command.into_owned();
            for (names, target) in [
                (inputs, &mut job.input_user_data),
                (outputs, &mut job.output_user_data),
            ] {
                if names.is_empty() {
                    continue;
                }
                let list = target.get_or_insert_with(Vec::new);
                for name in names {
                    if !list.contains(&name) {
                        list.push(name);
                    }
                }
            }
        }
    }

    /// Check names and references. Returns every problem found.
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push("workflow name must not be empty".to_string());
        }

        let mut job_names = HashSet::new();
        for job in &self.jobs {
            if !job_names.insert(job.name.as_str()) {
                errors.push(format!("duplicate job name '{}'", job.name));
            }
            if job.command.trim().is_empty() {
                errors.push(format!("job '{}' has an empty command", job.name));
            }
        }

        let requirements: HashMap<&str, &ResourceRequirementsSpec> = self
            .resource_requirements
            .iter()
            .flatten()
            .map(|rr| (rr.name.as_str(), rr))
            .collect();
        for rr in requirements.values() {
            if crate::memory_utils::memory_string_to_mb(&rr.memory).is_none() {
                errors.push(format!(
                    "resource requirements '{}' has invalid memory '{}'",
                    rr.name, rr.memory
                ));
            }
            if let Err(e) = crate::time_utils::duration_string_to_seconds(&rr.runtime) {
                errors.push(format!("resource requirements '{}': {}", rr.name, e));
            }
        }

        let mut user_data_names = HashSet::new();
        for item in self.user_data.iter().flatten() {
            if !user_data_names.insert(item.name.as_str()) {
                errors.push(format!("duplicate user data name '{}'", item.name));
            }
        }

        for job in &self.jobs {
            if let Some(ref rr) = job.resource_requirements
                && !requirements.contains_key(rr.as_str())
            {
                errors.push(format!(
                    "job '{}' references unknown resource requirements '{}'",
                    job.name, rr
                ));
            }
            for dep in job.depends_on.iter().flatten() {
                if dep == &job.name {
                    errors.push(format!("job '{}' depends on itself", job.name));
                } else if !job_names.contains(dep.as_str()) {
                    errors.push(format!(
                        "job '{}' depends on unknown job '{}'",
                        job.name, dep
                    ));
                }
            }
            for pattern in job.depends_on_regexes.iter().flatten() {
                if let Err(e) = Regex::new(pattern) {
                    errors.push(format!(
                        "job '{}' has invalid depends_on_regexes entry '{}': {}",
                        job.name, pattern, e
                    ));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Names of all user-data items referenced by jobs or declared at the workflow level.
    pub fn user_data_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        let declared = self.user_data.iter().flatten().map(|u| &u.name);
        let referenced = self.jobs.iter().flat_map(|j| {
            j.input_user_data
                .iter()
                .flatten()
                .chain(j.output_user_data.iter().flatten())
        });
        for name in declared.chain(referenced) {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }
}
