//! Cloud Tasks v2 REST client.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use defer_core::errors::TaskError;
use defer_core::paths::QueueIdentity;
use defer_core::queue::{QueueClient, QueueCreation};
use defer_core::task::{CreateTaskRequest, TaskHandle};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::token::{token_source_for, AccessTokenSource};
use crate::wire::{
    encode_body, error_for_status, format_duration, transport_error, WireOAuthToken,
    WireOidcToken,
};

pub const CLOUD_TASKS_ENDPOINT: &str = "https://cloudtasks.googleapis.com/v2";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireCreateTask {
    task: WireTask,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireTask {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    http_request: WireHttpRequest,
    #[serde(skip_serializing_if = "Option::is_none")]
    schedule_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dispatch_deadline: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireHttpRequest {
    url: String,
    http_method: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    oidc_token: Option<WireOidcToken>,
    #[serde(skip_serializing_if = "Option::is_none")]
    oauth_token: Option<WireOAuthToken>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTaskResponse {
    name: String,
    #[serde(default)]
    schedule_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct WireQueue {
    name: String,
}

fn wire_task(request: &CreateTaskRequest) -> WireCreateTask {
    let http = &request.task.http_request;
    WireCreateTask {
        task: WireTask {
            name: request.task.name.clone(),
            http_request: WireHttpRequest {
                url: http.url.clone(),
                http_method: http.http_method.as_str().to_string(),
                headers: http.headers.clone(),
                body: http.body.as_deref().map(encode_body),
                oidc_token: http.oidc_token.as_ref().map(WireOidcToken::from),
                oauth_token: http.oauth_token.as_ref().map(WireOAuthToken::from),
            },
            schedule_time: request
                .task
                .schedule_time
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Nanos, true)),
            dispatch_deadline: request.task.dispatch_deadline.map(format_duration),
        },
    }
}

/// Talks to the Cloud Tasks REST API (or an emulator speaking it).
#[derive(Clone)]
pub struct CloudTasksClient {
    endpoint: String,
    http: reqwest::Client,
    tokens: Arc<dyn AccessTokenSource>,
}

impl CloudTasksClient {
    pub fn new(tokens: Arc<dyn AccessTokenSource>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                TaskError::queue_unavailable(format!("failed to create HTTP client: {e}"))
                    .into_anyhow()
            })?;
        Ok(Self {
            endpoint: CLOUD_TASKS_ENDPOINT.to_string(),
            http,
            tokens,
        })
    }

    /// Production endpoint with application default credentials, or the
    /// given endpoint (emulators take plain http and no credentials).
    pub async fn connect(endpoint: Option<&str>) -> anyhow::Result<Self> {
        let client = Self::new(token_source_for(endpoint).await?)?;
        Ok(match endpoint {
            Some(endpoint) => client.with_endpoint(endpoint),
            None => client,
        })
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn authorized(&self, builder: reqwest::RequestBuilder) -> anyhow::Result<reqwest::RequestBuilder> {
        Ok(match self.tokens.access_token().await? {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        })
    }
}

#[async_trait]
impl QueueClient for CloudTasksClient {
    async fn create_queue(&self, queue: &QueueIdentity) -> anyhow::Result<QueueCreation> {
        let url = format!("{}/{}/queues", self.endpoint, queue.location().path());
        let body = WireQueue { name: queue.path() };

        let response = self
            .authorized(self.http.post(&url).json(&body))
            .await?
            .send()
            .await
            .map_err(|e| transport_error(e, "Cloud Tasks queue create failed"))?;

        let status = response.status();
        if status.is_success() {
            return Ok(QueueCreation::Created);
        }
        if status == StatusCode::CONFLICT {
            debug!(queue = %queue, "queue already exists");
            return Ok(QueueCreation::AlreadyExists);
        }
        let text = response.text().await.unwrap_or_default();
        Err(error_for_status(status, &text, "Cloud Tasks queue create error"))
    }

    async fn create_task(&self, request: CreateTaskRequest) -> anyhow::Result<TaskHandle> {
        let url = format!("{}/{}/tasks", self.endpoint, request.parent.path());
        let body = wire_task(&request);

        let response = self
            .authorized(self.http.post(&url).json(&body))
            .await?
            .send()
            .await
            .map_err(|e| transport_error(e, "Cloud Tasks API request failed"))?;

        let status = response.status();
        if status.is_success() {
            let created: WireTaskResponse = response.json().await.map_err(|e| {
                TaskError::queue_unavailable(format!("failed to parse Cloud Tasks response: {e}"))
                    .into_anyhow()
            })?;
            return Ok(TaskHandle {
                name: created.name,
                schedule_time: created.schedule_time.or(request.task.schedule_time),
            });
        }

        let text = response.text().await.unwrap_or_default();
        Err(error_for_status(status, &text, "Cloud Tasks API error"))
    }
}
