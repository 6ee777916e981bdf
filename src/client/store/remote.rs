//! Graph store reached over the REST API of a document database service.
//!
//! Each call is one HTTP request. Connection failures, timeouts and 5xx responses become
//! `EngineError::StoreUnavailable` so that `send_with_retries` can wait the service out.
//! A 409 on a claim or status change means another writer won the race.

use log::trace;
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use super::{GraphStore, JobFilter};
use crate::client::state_machine::validate_transition;
use crate::errors::{EngineError, Result};
use crate::models::{HpcJobRecord, JobModel, JobStatus, ResultModel, UserDataItem, WorkflowModel};

const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Serialize)]
struct StatusChange {
    expected: JobStatus,
    status: JobStatus,
}

#[derive(Debug, Serialize)]
struct ClaimRequest<'a> {
    worker_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct CancelResponse {
    changed: bool,
}

#[derive(Debug, Deserialize)]
struct WorkflowStatusResponse {
    is_canceled: bool,
    is_complete: bool,
}

pub struct RemoteStore {
    client: Client,
    base_url: String,
}

impl RemoteStore {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| EngineError::Store(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = request.send().map_err(map_transport_error)?;
        trace!("Store response status={} url={}", response.status(), response.url());
        Ok(response)
    }

    fn parse<T: DeserializeOwned>(response: Response) -> Result<T> {
        let response = check_status(response)?;
        response
            .json::<T>()
            .map_err(|e| EngineError::Store(format!("invalid response body: {}", e)))
    }

    fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        Self::parse(self.send(self.client.get(self.url(path)))?)
    }

    fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        Self::parse(self.send(self.client.post(self.url(path)).json(body))?)
    }

    fn put_no_content<B: Serialize>(&self, path: &str, body: &B) -> Result<()> {
        check_status(self.send(self.client.put(self.url(path)).json(body))?)?;
        Ok(())
    }

    /// Send a conditional write. Returns false on 409.
    fn conditional(&self, request: RequestBuilder) -> Result<bool> {
        let response = self.send(request)?;
        if response.status() == StatusCode::CONFLICT {
            return Ok(false);
        }
        check_status(response)?;
        Ok(true)
    }
}

fn map_transport_error(err: reqwest::Error) -> EngineError {
    if err.is_connect() || err.is_timeout() || err.is_request() {
        EngineError::StoreUnavailable(err.to_string())
    } else {
        EngineError::Store(err.to_string())
    }
}

fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().to_string();
    let body = response.text().unwrap_or_default();
    Err(match status {
        StatusCode::NOT_FOUND => EngineError::NotFound(format!("{} {}", url, body)),
        s if s.is_server_error() => {
            EngineError::StoreUnavailable(format!("{} returned {}: {}", url, s, body))
        }
        s => EngineError::Store(format!("{} returned {}: {}", url, s, body)),
    })
}

fn job_query(filter: &JobFilter, offset: usize, limit: usize) -> Vec<(&'static str, String)> {
    let mut query = vec![("offset", offset.to_string()), ("limit", limit.to_string())];
    if let Some(status) = filter.status {
        query.push(("status", status.to_string()));
    }
    if let Some(ref key) = filter.depends_on {
        query.push(("depends_on", key.clone()));
    }
    if let Some(ref worker) = filter.claimed_by {
        query.push(("claimed_by", worker.clone()));
    }
    if let Some(ref name) = filter.consumes {
        query.push(("consumes", name.clone()));
    }
    query
}

impl GraphStore for RemoteStore {
    fn create_workflow(&self, workflow: WorkflowModel) -> Result<WorkflowModel> {
        self.post("workflows", &workflow)
    }

    fn get_workflow(&self, workflow_key: &str) -> Result<WorkflowModel> {
        self.get(&format!("workflows/{}", workflow_key))
    }

    fn add_job(&self, job: JobModel) -> Result<JobModel> {
        self.post(&format!("workflows/{}/jobs", job.workflow_key), &job)
    }

    fn get_job(&self, workflow_key: &str, job_key: &str) -> Result<JobModel> {
        self.get(&format!("workflows/{}/jobs/{}", workflow_key, job_key))
    }

    fn list_jobs(
        &self,
        workflow_key: &str,
        filter: &JobFilter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<JobModel>> {
        let request = self
            .client
            .get(self.url(&format!("workflows/{}/jobs", workflow_key)))
            .query(&job_query(filter, offset, limit));
        Self::parse(self.send(request)?)
    }

    fn compare_and_set_status(
        &self,
        workflow_key: &str,
        job_key: &str,
        expected: JobStatus,
        status: JobStatus,
    ) -> Result<bool> {
        validate_transition(job_key, expected, status)?;
        let request = self
            .client
            .put(self.url(&format!(
                "workflows/{}/jobs/{}/status",
                workflow_key, job_key
            )))
            .json(&StatusChange { expected, status });
        self.conditional(request)
    }

    fn claim_job(&self, workflow_key: &str, job_key: &str, worker_id: &str) -> Result<bool> {
        validate_transition(job_key, JobStatus::Ready, JobStatus::Scheduled)?;
        let request = self
            .client
            .post(self.url(&format!(
                "workflows/{}/jobs/{}/claim",
                workflow_key, job_key
            )))
            .json(&ClaimRequest { worker_id });
        self.conditional(request)
    }

    fn add_result(&self, result: ResultModel) -> Result<ResultModel> {
        self.post(&format!("workflows/{}/results", result.workflow_key), &result)
    }

    fn list_results(&self, workflow_key: &str, job_key: Option<&str>) -> Result<Vec<ResultModel>> {
        let mut request = self
            .client
            .get(self.url(&format!("workflows/{}/results", workflow_key)));
        if let Some(key) = job_key {
            request = request.query(&[("job_key", key)]);
        }
        Self::parse(self.send(request)?)
    }

    fn add_user_data(&self, item: UserDataItem) -> Result<UserDataItem> {
        self.post(&format!("workflows/{}/user_data", item.workflow_key), &item)
    }

    fn get_user_data(&self, workflow_key: &str, name: &str) -> Result<UserDataItem> {
        self.get(&format!("workflows/{}/user_data/{}", workflow_key, name))
    }

    fn put_user_data(&self, workflow_key: &str, name: &str, data: Value) -> Result<UserDataItem> {
        let request = self
            .client
            .put(self.url(&format!("workflows/{}/user_data/{}", workflow_key, name)))
            .json(&data);
        Self::parse(self.send(request)?)
    }

    fn list_user_data(&self, workflow_key: &str) -> Result<Vec<UserDataItem>> {
        self.get(&format!("workflows/{}/user_data", workflow_key))
    }

    fn add_hpc_job(&self, record: HpcJobRecord) -> Result<()> {
        let response = self.send(
            self.client
                .post(self.url(&format!("workflows/{}/hpc_jobs", record.workflow_key)))
                .json(&record),
        )?;
        check_status(response)?;
        Ok(())
    }

    fn update_hpc_job(&self, record: &HpcJobRecord) -> Result<()> {
        self.put_no_content(
            &format!(
                "workflows/{}/hpc_jobs/{}",
                record.workflow_key, record.job_key
            ),
            record,
        )
    }

    fn list_hpc_jobs(&self, workflow_key: &str) -> Result<Vec<HpcJobRecord>> {
        self.get(&format!("workflows/{}/hpc_jobs", workflow_key))
    }

    fn remove_hpc_job(&self, workflow_key: &str, job_key: &str) -> Result<()> {
        let response = self.send(self.client.delete(self.url(&format!(
            "workflows/{}/hpc_jobs/{}",
            workflow_key, job_key
        ))))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(response)?;
        Ok(())
    }

    fn set_workflow_canceled(&self, workflow_key: &str) -> Result<bool> {
        let response = self.send(
            self.client
                .put(self.url(&format!("workflows/{}/cancel", workflow_key))),
        )?;
        let body: CancelResponse = Self::parse(response)?;
        Ok(body.changed)
    }

    fn is_workflow_canceled(&self, workflow_key: &str) -> Result<bool> {
        let status: WorkflowStatusResponse =
            self.get(&format!("workflows/{}/status", workflow_key))?;
        Ok(status.is_canceled)
    }

    fn is_workflow_complete(&self, workflow_key: &str) -> Result<bool> {
        let status: WorkflowStatusResponse =
            self.get(&format!("workflows/{}/status", workflow_key))?;
        Ok(status.is_complete)
    }
}
