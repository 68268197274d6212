//! Task definitions: what gets handed to the queue on every submit.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::TaskError;
use crate::paths::QueueIdentity;

/// HTTP methods a queue can use when calling back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Post,
    Get,
    Head,
    Put,
    Delete,
    Patch,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Post => "POST",
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Options => "OPTIONS",
        }
    }

    /// Cloud Tasks only forwards a body for POST, PUT and PATCH.
    pub fn allows_body(&self) -> bool {
        matches!(self, HttpMethod::Post | HttpMethod::Put | HttpMethod::Patch)
    }

    pub fn from_http(method: &http::Method) -> anyhow::Result<Self> {
        Ok(match *method {
            http::Method::POST => HttpMethod::Post,
            http::Method::GET => HttpMethod::Get,
            http::Method::HEAD => HttpMethod::Head,
            http::Method::PUT => HttpMethod::Put,
            http::Method::DELETE => HttpMethod::Delete,
            http::Method::PATCH => HttpMethod::Patch,
            http::Method::OPTIONS => HttpMethod::Options,
            ref other => {
                return Err(TaskError::validation(format!(
                    "method {other} cannot be used for task callbacks"
                ))
                .into_anyhow())
            }
        })
    }

    pub fn to_http(self) -> http::Method {
        match self {
            HttpMethod::Post => http::Method::POST,
            HttpMethod::Get => http::Method::GET,
            HttpMethod::Head => http::Method::HEAD,
            HttpMethod::Put => http::Method::PUT,
            HttpMethod::Delete => http::Method::DELETE,
            HttpMethod::Patch => http::Method::PATCH,
            HttpMethod::Options => http::Method::OPTIONS,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// OIDC identity token the queue attaches when calling the target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OidcToken {
    pub service_account_email: String,
    /// Defaults to the target URL when absent.
    pub audience: Option<String>,
}

/// OAuth access token the queue attaches when calling Google APIs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthToken {
    pub service_account_email: String,
    pub scope: Option<String>,
}

/// The HTTP call the queue performs when the task is dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequest {
    pub url: String,
    pub http_method: HttpMethod,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Vec<u8>>,
    pub oidc_token: Option<OidcToken>,
    pub oauth_token: Option<OAuthToken>,
}

impl HttpRequest {
    pub fn new(url: impl Into<String>, http_method: HttpMethod) -> Self {
        Self {
            url: url.into(),
            http_method,
            headers: BTreeMap::new(),
            body: None,
            oidc_token: None,
            oauth_token: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    /// `{queue_path}/tasks/{task_id}` when the caller supplied a dedup key.
    pub name: Option<String>,
    pub http_request: HttpRequest,
    /// `None` dispatches immediately.
    pub schedule_time: Option<DateTime<Utc>>,
    pub dispatch_deadline: Option<Duration>,
}

impl TaskDefinition {
    pub fn new(http_request: HttpRequest) -> Self {
        Self {
            name: None,
            http_request,
            schedule_time: None,
            dispatch_deadline: None,
        }
    }

    /// The dedup key, i.e. the last segment of `name`.
    pub fn task_id(&self) -> Option<&str> {
        self.name.as_deref().and_then(|n| n.rsplit('/').next())
    }
}

/// A task draft addressed to a queue. Hooks operate on this value before it
/// is moved into the queue client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTaskRequest {
    pub parent: QueueIdentity,
    pub task: TaskDefinition,
}

/// What the queue returns for an accepted task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskHandle {
    /// Fully qualified task name assigned by the queue.
    pub name: String,
    pub schedule_time: Option<DateTime<Utc>>,
}

impl TaskHandle {
    pub fn task_id(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }
}
