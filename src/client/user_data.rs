//! Reads and writes the user-data items that jobs exchange.
//!
//! A job consumes items named in `input_user_data` and produces the items named in
//! `output_user_data`. Produced items are written by the job as `<NAME>.json` files in the
//! directory given by `HPCFLOW_USER_DATA_OUTPUT_DIR`; the runner ingests them after exit.

use log::{debug, warn};
use regex::{Captures, Regex};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use crate::client::store::GraphStore;
use crate::client::utils::{RetryPolicy, send_with_retries};
use crate::errors::{EngineError, Result};
use crate::models::{JobModel, UserDataItem};

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$\{user_data\.([A-Za-z0-9_.\-]+)\}").expect("placeholder regex is valid")
    })
}

/// Names referenced by `${user_data.NAME}` placeholders in `command`.
pub fn placeholder_names(command: &str) -> Vec<String> {
    placeholder_regex()
        .captures_iter(command)
        .map(|c| c[1].to_string())
        .collect()
}

/// Replace `${user_data.NAME}` placeholders with item values. Strings are inserted as-is,
/// other values as compact JSON. Placeholders without a matching item are left untouched.
pub fn substitute(command: &str, items: &[UserDataItem]) -> String {
    let values: HashMap<&str, &Value> = items
        .iter()
        .filter_map(|item| item.data.as_ref().map(|d| (item.name.as_str(), d)))
        .collect();
    placeholder_regex()
        .replace_all(command, |caps: &Captures| match values.get(&caps[1]) {
            Some(Value::String(s)) => s.clone(),
            Some(value) => value.to_string(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

pub struct UserDataClient<'a> {
    store: &'a dyn GraphStore,
    retry: RetryPolicy,
}

impl<'a> UserDataClient<'a> {
    pub fn new(store: &'a dyn GraphStore, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Fetch an item, treating a missing record as an item without data.
    fn fetch(&self, workflow_key: &str, name: &str) -> Result<UserDataItem> {
        match send_with_retries(|| self.store.get_user_data(workflow_key, name), &self.retry) {
            Ok(item) => Ok(item),
            Err(EngineError::NotFound(_)) => Ok(UserDataItem::new(workflow_key, name, None)),
            Err(e) => Err(e),
        }
    }

    /// Items consumed by `job`. Fails with `MissingUserData` if any of them holds no data.
    pub fn get_consumed(&self, workflow_key: &str, job: &JobModel) -> Result<Vec<UserDataItem>> {
        let mut items = Vec::with_capacity(job.input_user_data.len());
        let mut missing = Vec::new();
        for name in &job.input_user_data {
            let item = self.fetch(workflow_key, name)?;
            if item.has_data() {
                items.push(item);
            } else {
                missing.push(name.clone());
            }
        }
        if missing.is_empty() {
            Ok(items)
        } else {
            Err(EngineError::MissingUserData {
                job: job.key.clone(),
                names: missing,
            })
        }
    }

    /// True when every item consumed by `job` holds data.
    pub fn inputs_ready(&self, workflow_key: &str, job: &JobModel) -> Result<bool> {
        match self.get_consumed(workflow_key, job) {
            Ok(_) => Ok(true),
            Err(EngineError::MissingUserData { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Overwrite the data of a produced item. Last writer wins.
    pub fn put_produced(&self, workflow_key: &str, name: &str, data: Value) -> Result<UserDataItem> {
        send_with_retries(
            || self.store.put_user_data(workflow_key, name, data.clone()),
            &self.retry,
        )
    }

    /// Names of items `job` declares as outputs that hold no data.
    pub fn missing_produced(&self, workflow_key: &str, job: &JobModel) -> Result<Vec<String>> {
        let mut missing = Vec::new();
        for name in &job.output_user_data {
            if !self.fetch(workflow_key, name)?.has_data() {
                missing.push(name.clone());
            }
        }
        Ok(missing)
    }

    /// Store every `<NAME>.json` in `dir` whose name `job` declares as an output. Returns the
    /// names that were stored. Files that are not valid JSON are skipped.
    pub fn ingest_output_dir(
        &self,
        workflow_key: &str,
        job: &JobModel,
        dir: &Path,
    ) -> Result<Vec<String>> {
        let mut stored = Vec::new();
        for name in &job.output_user_data {
            let path = dir.join(format!("{}.json", name));
            if !path.exists() {
                continue;
            }
            let content = fs::read_to_string(&path)?;
            let value: Value = match serde_json::from_str(&content) {
                Ok(v) => v,
                Err(e) => {
                    warn!(
                        "Ignoring invalid user data file workflow_key={} job_key={} path={} error={}",
                        workflow_key,
                        job.key,
                        path.display(),
                        e
                    );
                    continue;
                }
            };
            self.put_produced(workflow_key, name, value)?;
            debug!(
                "Stored user data workflow_key={} job_key={} name={}",
                workflow_key, job.key, name
            );
            stored.push(name.clone());
        }
        Ok(stored)
    }
}
