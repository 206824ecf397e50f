use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use url::Url;

use super::types::{
    to_engine_variables, CreatedInstance, DataPage, Deployment, HistoricProcessInstance, Variables, WorkflowTask,
};
use crate::app::config::WorkflowConfig;
use crate::error::{check_status, Error, Result};
use crate::resilience::{CircuitBreakerStats, ResiliencePipeline};

/// REST root of the engine, relative to the configured base URL.
pub const SERVICE_ROOT: &str = "/flowable-rest/service";
pub const TENANT_HEADER: &str = "x-tenant-id";

const ARCHIVE_FILE_NAME: &str = "deployment.zip";
const ARCHIVE_MIME: &str = "application/zip";

#[derive(Debug, Clone, Copy)]
enum Payload<'a> {
    Empty,
    Json(&'a Value),
    Archive(&'a [u8]),
}

/// Client for the remote BPMN engine. Every call goes through one shared
/// resilience pipeline, so a failing engine trips a single breaker.
pub struct WorkflowGateway {
    client: Client,
    service_url: Url,
    headers: HeaderMap,
    pipeline: ResiliencePipeline,
}

impl WorkflowGateway {
    pub fn from_config(config: &WorkflowConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| Error::transport(format!("Failed to create HTTP client: {}", e)))?;

        let mut headers = HeaderMap::new();
        if let Some(token) = config.service_account_token.as_deref().filter(|t| !t.is_empty()) {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| Error::validation(format!("Invalid service account token: {}", e)))?;
            headers.insert(AUTHORIZATION, value);
        }
        if let Some(tenant) = config.tenant_id.as_deref().filter(|t| !t.is_empty()) {
            let value = HeaderValue::from_str(tenant)
                .map_err(|e| Error::validation(format!("Invalid tenant id: {}", e)))?;
            headers.insert(HeaderName::from_static(TENANT_HEADER), value);
        }

        let service_url = Url::parse(&format!("{}{}", config.base_url.trim_end_matches('/'), SERVICE_ROOT))
            .map_err(|e| Error::validation(format!("Invalid workflow base URL '{}': {}", config.base_url, e)))?;
        if service_url.cannot_be_a_base() {
            return Err(Error::validation(format!("Workflow base URL '{}' cannot carry a path", config.base_url)));
        }
        info!("Workflow gateway targeting {}", service_url);

        Ok(Self {
            client,
            service_url,
            headers,
            pipeline: ResiliencePipeline::new("workflow-engine", &config.resilience.to_pipeline_config()),
        })
    }

    pub fn circuit_stats(&self) -> CircuitBreakerStats {
        self.pipeline.stats()
    }

    /// Uploads a zipped process archive.
    pub async fn deploy(&self, archive: &[u8], cancel: &CancellationToken) -> Result<Deployment> {
        let result: Result<Deployment> = async {
            let body = self
                .call(Method::POST, &["repository", "deployments"], &[], Payload::Archive(archive), cancel)
                .await?;
            parse_body(&body, "deployment")
        }
        .await;

        match &result {
            Ok(deployment) => info!("BPMN deployment successful: {}", deployment.id),
            Err(e) => error!("Error deploying BPMN archive: {}", e),
        }
        result
    }

    /// Starts an instance of `process_key` and returns the new instance id.
    pub async fn start(&self, process_key: &str, variables: &Variables, cancel: &CancellationToken) -> Result<String> {
        let payload = json!({
            "processDefinitionKey": process_key,
            "variables": to_engine_variables(variables),
        });

        let result: Result<String> = async {
            let body = self
                .call(Method::POST, &["runtime", "process-instances"], &[], Payload::Json(&payload), cancel)
                .await?;
            parse_body::<CreatedInstance>(&body, "process instance").map(|created| created.id)
        }
        .await;

        match &result {
            Ok(id) => info!("Process instance started: {} for process {}", id, process_key),
            Err(e) => error!("Error starting process {}: {}", process_key, e),
        }
        result
    }

    pub async fn claim(&self, task_id: &str, assignee: &str, cancel: &CancellationToken) -> Result<()> {
        let payload = json!({ "action": "claim", "assignee": assignee });

        match self
            .call(Method::POST, &["runtime", "tasks", task_id], &[], Payload::Json(&payload), cancel)
            .await
        {
            Ok(_) => {
                info!("Task claimed: {} by user {}", task_id, assignee);
                Ok(())
            }
            Err(e) => {
                error!("Error claiming task {} for user {}: {}", task_id, assignee, e);
                Err(e)
            }
        }
    }

    pub async fn complete(&self, task_id: &str, outputs: &Variables, cancel: &CancellationToken) -> Result<()> {
        let payload = json!({ "action": "complete", "variables": to_engine_variables(outputs) });

        match self
            .call(Method::POST, &["runtime", "tasks", task_id], &[], Payload::Json(&payload), cancel)
            .await
        {
            Ok(_) => {
                info!("Task completed: {}", task_id);
                Ok(())
            }
            Err(e) => {
                error!("Error completing task {}: {}", task_id, e);
                Err(e)
            }
        }
    }

    /// Lists tasks, optionally filtered by assignee and candidate group.
    pub async fn tasks(
        &self,
        assignee: Option<&str>,
        candidate_group: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Vec<WorkflowTask>> {
        let mut query = Vec::new();
        if let Some(assignee) = assignee.filter(|a| !a.is_empty()) {
            query.push(("assignee", assignee));
        }
        if let Some(group) = candidate_group.filter(|g| !g.is_empty()) {
            query.push(("candidateGroup", group));
        }

        let result: Result<Vec<WorkflowTask>> = async {
            let body = self
                .call(Method::GET, &["runtime", "tasks"], &query, Payload::Empty, cancel)
                .await?;
            parse_body::<DataPage<WorkflowTask>>(&body, "task list").map(|page| page.data)
        }
        .await;

        match &result {
            Ok(tasks) => info!(
                "Retrieved {} tasks for assignee {:?}, group {:?}",
                tasks.len(),
                assignee,
                candidate_group
            ),
            Err(e) => error!("Error getting tasks for assignee {:?}, group {:?}: {}", assignee, candidate_group, e),
        }
        result
    }

    pub async fn history(
        &self,
        process_instance_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<HistoricProcessInstance>> {
        let query = [("processInstanceId", process_instance_id)];

        let result: Result<Vec<HistoricProcessInstance>> = async {
            let body = self
                .call(Method::GET, &["history", "historic-process-instances"], &query, Payload::Empty, cancel)
                .await?;
            parse_body::<DataPage<HistoricProcessInstance>>(&body, "history").map(|page| page.data)
        }
        .await;

        match &result {
            Ok(history) => info!(
                "Retrieved {} history records for process instance {}",
                history.len(),
                process_instance_id
            ),
            Err(e) => error!("Error getting history for process instance {}: {}", process_instance_id, e),
        }
        result
    }

    pub async fn signal(
        &self,
        execution_id: &str,
        signal_name: &str,
        variables: &Variables,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let payload = json!({
            "signalName": signal_name,
            "executionId": execution_id,
            "variables": to_engine_variables(variables),
        });

        match self
            .call(Method::POST, &["runtime", "signals"], &[], Payload::Json(&payload), cancel)
            .await
        {
            Ok(_) => {
                info!("Signal sent: {} to execution {}", signal_name, execution_id);
                Ok(())
            }
            Err(e) => {
                error!("Error sending signal {} to execution {}: {}", signal_name, execution_id, e);
                Err(e)
            }
        }
    }

    async fn call(
        &self,
        method: Method,
        segments: &[&str],
        query: &[(&str, &str)],
        payload: Payload<'_>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        // Each segment is percent-encoded, so ids containing '/' or '?' stay one segment.
        let mut url = self.service_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::workflow(format!("{} cannot carry a path", self.service_url)))?
            .extend(segments);
        debug!("Workflow request: {} {}", method, url);

        self.pipeline
            .execute(cancel, || self.send(method.clone(), &url, query, payload))
            .await
    }

    async fn send(&self, method: Method, url: &Url, query: &[(&str, &str)], payload: Payload<'_>) -> Result<String> {
        let mut request = self.client.request(method, url.clone()).headers(self.headers.clone());
        if !query.is_empty() {
            request = request.query(query);
        }

        request = match payload {
            Payload::Empty => request,
            Payload::Json(body) => request.json(body),
            Payload::Archive(bytes) => {
                let part = Part::bytes(bytes.to_vec())
                    .file_name(ARCHIVE_FILE_NAME)
                    .mime_str(ARCHIVE_MIME)?;
                request.multipart(Form::new().part("file", part))
            }
        };

        let response = check_status(request.send().await?).await?;
        Ok(response.text().await?)
    }
}

fn parse_body<T: DeserializeOwned>(body: &str, what: &str) -> Result<T> {
    serde_json::from_str(body).map_err(|e| Error::parse(format!("Failed to parse workflow {} response: {}", what, e)))
}
