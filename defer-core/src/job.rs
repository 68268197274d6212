//! Job definitions for recurring (cron) invocations.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::paths::{JobIdentity, LocationPath};
use crate::task::{HttpMethod, OAuthToken, OidcToken};

/// The HTTP call the scheduler performs on every tick.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpTarget {
    pub uri: String,
    pub http_method: HttpMethod,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Vec<u8>>,
    pub oidc_token: Option<OidcToken>,
    pub oauth_token: Option<OAuthToken>,
}

impl HttpTarget {
    pub fn new(uri: impl Into<String>, http_method: HttpMethod) -> Self {
        Self {
            uri: uri.into(),
            http_method,
            headers: BTreeMap::new(),
            body: None,
            oidc_token: None,
            oauth_token: None,
        }
    }
}

/// Scheduler-side retry policy for a failed tick.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    pub retry_count: u32,
    /// Zero means unlimited.
    pub max_retry_duration: Duration,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub max_doublings: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_count: 5,
            max_retry_duration: Duration::ZERO,
            min_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(120),
            max_doublings: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDefinition {
    pub name: JobIdentity,
    pub description: Option<String>,
    /// Five-field unix cron expression.
    pub schedule: String,
    /// IANA time zone name.
    pub time_zone: String,
    pub http_target: HttpTarget,
    pub retry_config: RetryConfig,
    pub attempt_deadline: Option<Duration>,
}

impl JobDefinition {
    /// Stable digest of the definition, used to key the in-process
    /// registration cache.
    pub fn fingerprint(&self) -> u64 {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateJobRequest {
    pub parent: LocationPath,
    pub job: JobDefinition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobOutcome {
    Created,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHandle {
    /// `projects/{project}/locations/{location}/jobs/{job}`
    pub name: String,
    pub outcome: JobOutcome,
}
