//! Cloud Scheduler v1 REST client.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use defer_core::errors::TaskError;
use defer_core::job::{CreateJobRequest, HttpTarget, JobDefinition, RetryConfig};
use defer_core::paths::JobIdentity;
use defer_core::scheduler::SchedulerClient;
use defer_core::task::HttpMethod;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::token::{token_source_for, AccessTokenSource};
use crate::wire::{
    decode_body, encode_body, error_for_status, format_duration, parse_duration,
    transport_error, WireOAuthToken, WireOidcToken,
};

pub const CLOUD_SCHEDULER_ENDPOINT: &str = "https://cloudscheduler.googleapis.com/v1";

/// Headers the scheduler adds to stored jobs on its own.
const SERVICE_MANAGED_HEADERS: &[&str] = &["user-agent"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireJob {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    schedule: String,
    time_zone: String,
    http_target: WireHttpTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    retry_config: Option<WireRetryConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    attempt_deadline: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireHttpTarget {
    uri: String,
    http_method: HttpMethod,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    oidc_token: Option<WireOidcToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    oauth_token: Option<WireOAuthToken>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRetryConfig {
    #[serde(default)]
    retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_retry_duration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    min_backoff_duration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_backoff_duration: Option<String>,
    #[serde(default)]
    max_doublings: u32,
}

impl From<&JobDefinition> for WireJob {
    fn from(job: &JobDefinition) -> Self {
        let target = &job.http_target;
        let retry = &job.retry_config;
        Self {
            name: job.name.path(),
            description: job.description.clone(),
            schedule: job.schedule.clone(),
            time_zone: job.time_zone.clone(),
            http_target: WireHttpTarget {
                uri: target.uri.clone(),
                http_method: target.http_method,
                headers: target.headers.clone(),
                body: target.body.as_deref().map(encode_body),
                oidc_token: target.oidc_token.as_ref().map(WireOidcToken::from),
                oauth_token: target.oauth_token.as_ref().map(WireOAuthToken::from),
            },
            retry_config: Some(WireRetryConfig {
                retry_count: retry.retry_count,
                max_retry_duration: Some(format_duration(retry.max_retry_duration)),
                min_backoff_duration: Some(format_duration(retry.min_backoff)),
                max_backoff_duration: Some(format_duration(retry.max_backoff)),
                max_doublings: retry.max_doublings,
            }),
            attempt_deadline: job.attempt_deadline.map(format_duration),
        }
    }
}

impl WireJob {
    /// Back to a definition comparable with a locally built one. Output-only
    /// fields were never deserialized; service-managed headers are dropped.
    fn into_definition(self) -> anyhow::Result<JobDefinition> {
        let name: JobIdentity = self.name.parse()?;
        let target = self.http_target;
        let headers = target
            .headers
            .into_iter()
            .filter(|(k, _)| !SERVICE_MANAGED_HEADERS.contains(&k.to_ascii_lowercase().as_str()))
            .collect();
        let body = target.body.as_deref().map(decode_body).transpose()?;

        let defaults = RetryConfig::default();
        let duration = |raw: Option<String>, fallback: Duration| {
            raw.as_deref().and_then(parse_duration).unwrap_or(fallback)
        };
        let retry_config = match self.retry_config {
            Some(retry) => RetryConfig {
                retry_count: retry.retry_count,
                max_retry_duration: duration(retry.max_retry_duration, Duration::ZERO),
                min_backoff: duration(retry.min_backoff_duration, defaults.min_backoff),
                max_backoff: duration(retry.max_backoff_duration, defaults.max_backoff),
                max_doublings: retry.max_doublings,
            },
            None => defaults,
        };

        Ok(JobDefinition {
            name,
            description: self.description,
            schedule: self.schedule,
            time_zone: self.time_zone,
            http_target: HttpTarget {
                uri: target.uri,
                http_method: target.http_method,
                headers,
                body,
                oidc_token: target.oidc_token.map(Into::into),
                oauth_token: target.oauth_token.map(Into::into),
            },
            retry_config,
            attempt_deadline: self.attempt_deadline.as_deref().and_then(parse_duration),
        })
    }
}

#[derive(Clone)]
pub struct CloudSchedulerClient {
    endpoint: String,
    http: reqwest::Client,
    tokens: Arc<dyn AccessTokenSource>,
}

impl CloudSchedulerClient {
    pub fn new(tokens: Arc<dyn AccessTokenSource>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                TaskError::queue_unavailable(format!("failed to create HTTP client: {e}"))
                    .into_anyhow()
            })?;
        Ok(Self {
            endpoint: CLOUD_SCHEDULER_ENDPOINT.to_string(),
            http,
            tokens,
        })
    }

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

    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
        context: &str,
    ) -> anyhow::Result<reqwest::Response> {
        let builder = match self.tokens.access_token().await? {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        };
        builder.send().await.map_err(|e| transport_error(e, context))
    }

    async fn read_job(response: reqwest::Response, context: &str) -> anyhow::Result<JobDefinition> {
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(error_for_status(status, &text, context));
        }
        let job: WireJob = response.json().await.map_err(|e| {
            TaskError::queue_unavailable(format!("{context}: unreadable response: {e}")).into_anyhow()
        })?;
        job.into_definition()
    }
}

#[async_trait]
impl SchedulerClient for CloudSchedulerClient {
    async fn get_job(&self, name: &JobIdentity) -> anyhow::Result<Option<JobDefinition>> {
        let url = format!("{}/{}", self.endpoint, name.path());
        let response = self.send(self.http.get(&url), "Cloud Scheduler get failed").await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::read_job(response, "Cloud Scheduler get error").await.map(Some)
    }

    async fn create_job(&self, request: CreateJobRequest) -> anyhow::Result<JobDefinition> {
        let url = format!("{}/{}/jobs", self.endpoint, request.parent.path());
        let body = WireJob::from(&request.job);
        debug!(job = %request.job.name, "creating scheduler job");
        let response = self
            .send(self.http.post(&url).json(&body), "Cloud Scheduler create failed")
            .await?;
        Self::read_job(response, "Cloud Scheduler create error").await
    }

    async fn update_job(&self, job: JobDefinition) -> anyhow::Result<JobDefinition> {
        let url = format!("{}/{}", self.endpoint, job.name.path());
        let body = WireJob::from(&job);
        debug!(job = %job.name, "updating scheduler job");
        let response = self
            .send(self.http.patch(&url).json(&body), "Cloud Scheduler update failed")
            .await?;
        Self::read_job(response, "Cloud Scheduler update error").await
    }

    async fn delete_job(&self, name: &JobIdentity) -> anyhow::Result<bool> {
        let url = format!("{}/{}", self.endpoint, name.path());
        let response = self.send(self.http.delete(&url), "Cloud Scheduler delete failed").await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(error_for_status(status, &text, "Cloud Scheduler delete error"));
        }
        Ok(true)
    }
}
