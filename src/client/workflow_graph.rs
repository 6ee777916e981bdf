//! Workflow Graph - a directed graph of jobs and their blocking dependencies
//!
//! Built from a workflow specification at import time, or from stored jobs. Computing the
//! topological levels detects cycles, which abort an import.

use regex::Regex;
use std::collections::{BTreeSet, HashMap, HashSet};

use crate::client::workflow_spec::WorkflowSpec;
use crate::errors::{EngineError, Result};
use crate::models::JobModel;

/// A node in the workflow graph representing a job
#[derive(Debug, Clone)]
pub struct JobNode {
    pub name: String,
    pub command: String,
    /// Scheduler name from the specification, if any
    pub scheduler: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct WorkflowGraph {
    /// Job nodes indexed by name
    nodes: HashMap<String, JobNode>,
    /// Forward edges: job → jobs it depends on (blockers)
    depends_on: HashMap<String, HashSet<String>>,
    /// Reverse edges: job → jobs that depend on it (dependents)
    depended_by: HashMap<String, HashSet<String>>,
    /// Cached topological levels
    levels: Option<Vec<Vec<String>>>,
}

impl WorkflowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_node(&mut self, node: JobNode) {
        self.depends_on.entry(node.name.clone()).or_default();
        self.depended_by.entry(node.name.clone()).or_default();
        self.nodes.insert(node.name.clone(), node);
        self.levels = None;
    }

    /// Add the edge "`job` is blocked by `blocker`". Unknown names and self edges are ignored.
    pub fn add_dependency(&mut self, job: &str, blocker: &str) {
        if job == blocker || !self.nodes.contains_key(job) || !self.nodes.contains_key(blocker) {
            return;
        }
        if let Some(deps) = self.depends_on.get_mut(job) {
            deps.insert(blocker.to_string());
        }
        if let Some(dependents) = self.depended_by.get_mut(blocker) {
            dependents.insert(job.to_string());
        }
        self.levels = None;
    }

    /// Build a workflow graph from a workflow specification.
    ///
    /// Edges come from `depends_on`, `depends_on_regexes`, and from user data: a job that
    /// consumes an item is blocked by every job that produces it.
    pub fn from_spec(spec: &WorkflowSpec) -> Result<Self> {
        let mut graph = Self::new();
        for job in &spec.jobs {
            graph.add_node(JobNode {
                name: job.name.clone(),
                command: job.command.clone(),
                scheduler: job.scheduler.clone(),
            });
        }

        let mut producers: HashMap<&str, Vec<&str>> = HashMap::new();
        for job in &spec.jobs {
            for name in job.output_user_data.iter().flatten() {
                producers.entry(name.as_str()).or_default().push(job.name.as_str());
            }
        }

        for job in &spec.jobs {
            for dep in job.depends_on.iter().flatten() {
                graph.add_dependency(&job.name, dep);
            }

            for regex_str in job.depends_on_regexes.iter().flatten() {
                let re = Regex::new(regex_str).map_err(|e| {
                    EngineError::InvalidSpec(format!("invalid regex '{}': {}", regex_str, e))
                })?;
                for other_job in &spec.jobs {
                    if re.is_match(&other_job.name) {
                        graph.add_dependency(&job.name, &other_job.name);
                    }
                }
            }

            for input in job.input_user_data.iter().flatten() {
                for producer in producers.get(input.as_str()).into_iter().flatten() {
                    graph.add_dependency(&job.name, producer);
                }
            }
        }

        Ok(graph)
    }

    /// Build a graph from stored jobs, using job keys as node names.
    pub fn from_jobs(jobs: &[JobModel]) -> Self {
        let mut graph = Self::new();
        for job in jobs {
            graph.add_node(JobNode {
                name: job.key.clone(),
                command: job.command.clone(),
                scheduler: job.scheduler.hpc_name().map(str::to_string),
            });
        }
        for job in jobs {
            for dep in &job.depends_on {
                graph.add_dependency(&job.key, dep);
            }
        }
        graph
    }

    pub fn get_job(&self, name: &str) -> Option<&JobNode> {
        self.nodes.get(name)
    }

    pub fn job_count(&self) -> usize {
        self.nodes.len()
    }

    /// Get the jobs that a job depends on (its blockers)
    pub fn dependencies_of(&self, job: &str) -> Option<&HashSet<String>> {
        self.depends_on.get(job)
    }

    /// Get the jobs that depend on a job (its dependents)
    pub fn dependents_of(&self, job: &str) -> Option<&HashSet<String>> {
        self.depended_by.get(job)
    }

    /// Jobs with no dependencies, sorted by name
    pub fn roots(&self) -> Vec<&str> {
        let mut roots: Vec<&str> = self
            .depends_on
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(name, _)| name.as_str())
            .collect();
        roots.sort_unstable();
        roots
    }

    /// Jobs that nothing depends on, sorted by name
    pub fn leaves(&self) -> Vec<&str> {
        let mut leaves: Vec<&str> = self
            .depended_by
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(name, _)| name.as_str())
            .collect();
        leaves.sort_unstable();
        leaves
    }

    /// Compute topological levels (jobs grouped by dependency depth)
    ///
    /// Level 0 contains jobs with no dependencies. Level N contains jobs whose dependencies
    /// are all in levels < N. Names within a level are sorted. Fails with
    /// `EngineError::DependencyCycle` naming the jobs that could not be placed.
    pub fn topological_levels(&mut self) -> Result<&Vec<Vec<String>>> {
        if self.levels.is_none() {
            self.levels = Some(self.compute_levels()?);
        }
        let levels: &Vec<Vec<String>> = self.levels.get_or_insert_with(Vec::new);
        Ok(levels)
    }

    fn compute_levels(&self) -> Result<Vec<Vec<String>>> {
        let mut levels = Vec::new();
        let mut remaining: BTreeSet<&str> = self.nodes.keys().map(|s| s.as_str()).collect();
        let mut processed: HashSet<&str> = HashSet::new();

        while !remaining.is_empty() {
            let current_level: Vec<&str> = remaining
                .iter()
                .copied()
                .filter(|name| {
                    self.depends_on
                        .get(*name)
                        .map(|deps| deps.iter().all(|d| processed.contains(d.as_str())))
                        .unwrap_or(true)
                })
                .collect();

            if current_level.is_empty() {
                let stuck: Vec<&str> = remaining.into_iter().collect();
                return Err(EngineError::DependencyCycle(stuck.join(", ")));
            }

            for job in &current_level {
                remaining.remove(job);
                processed.insert(*job);
            }
            levels.push(current_level.into_iter().map(str::to_string).collect());
        }

        Ok(levels)
    }

    /// Jobs that become unblocked once every job in `completed_jobs` has finished.
    pub fn jobs_unblocked_by(&self, completed_jobs: &HashSet<String>) -> Vec<String> {
        let mut unblocked: Vec<String> = self
            .depends_on
            .iter()
            .filter(|(name, deps)| {
                !completed_jobs.contains(*name)
                    && !deps.is_empty()
                    && deps.iter().all(|d| completed_jobs.contains(d))
            })
            .map(|(name, _)| name.clone())
            .collect();
        unblocked.sort();
        unblocked
    }
}
