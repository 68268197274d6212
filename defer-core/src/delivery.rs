//! Delivery metadata read from inbound callback headers.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use http::HeaderMap;
use serde::Serialize;
use tracing::warn;

use crate::errors::TaskError;

pub const QUEUE_NAME_HEADER: &str = "x-cloudtasks-queuename";
pub const TASK_NAME_HEADER: &str = "x-cloudtasks-taskname";
pub const RETRY_COUNT_HEADER: &str = "x-cloudtasks-taskretrycount";
pub const EXECUTION_COUNT_HEADER: &str = "x-cloudtasks-taskexecutioncount";
pub const ETA_HEADER: &str = "x-cloudtasks-tasketa";
pub const PREVIOUS_RESPONSE_HEADER: &str = "x-cloudtasks-taskpreviousresponse";
pub const RETRY_REASON_HEADER: &str = "x-cloudtasks-taskretryreason";
pub const SCHEDULER_JOB_NAME_HEADER: &str = "x-cloudscheduler-jobname";
pub const SCHEDULER_SCHEDULE_TIME_HEADER: &str = "x-cloudscheduler-scheduletime";

/// Read-only view of one delivery. Scoped to a single callback request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryContext {
    pub queue_name: Option<String>,
    pub task_name: Option<String>,
    /// Times this task has been retried; 0 on first delivery.
    pub retry_count: u32,
    /// Times the target actually answered (excludes queue-side failures).
    pub execution_count: u32,
    /// Original schedule time.
    pub eta: Option<DateTime<Utc>>,
    pub previous_response: Option<u16>,
    pub retry_reason: Option<String>,
    pub job_name: Option<String>,
    pub schedule_time: Option<DateTime<Utc>>,
    /// Captures matched by the execute route, e.g. `id` for `/items/{id}`.
    pub path_params: BTreeMap<String, String>,
}

impl DeliveryContext {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            queue_name: header_str(headers, QUEUE_NAME_HEADER),
            task_name: header_str(headers, TASK_NAME_HEADER),
            retry_count: header_num(headers, RETRY_COUNT_HEADER).unwrap_or(0),
            execution_count: header_num(headers, EXECUTION_COUNT_HEADER).unwrap_or(0),
            eta: header_str(headers, ETA_HEADER).and_then(|v| parse_eta(&v)),
            previous_response: header_num(headers, PREVIOUS_RESPONSE_HEADER),
            retry_reason: header_str(headers, RETRY_REASON_HEADER),
            job_name: header_str(headers, SCHEDULER_JOB_NAME_HEADER),
            schedule_time: header_str(headers, SCHEDULER_SCHEDULE_TIME_HEADER)
                .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
                .map(|t| t.with_timezone(&Utc)),
            path_params: BTreeMap::new(),
        }
    }

    pub fn with_path_params(mut self, path_params: BTreeMap<String, String>) -> Self {
        self.path_params = path_params;
        self
    }

    pub fn path_param(&self, name: &str) -> Option<&str> {
        self.path_params.get(name).map(String::as_str)
    }

    /// Delivery attempt, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.retry_count.saturating_add(1)
    }

    pub fn is_scheduled(&self) -> bool {
        self.job_name.is_some()
    }

    /// Short task id (last segment of the task name).
    pub fn task_id(&self) -> Option<&str> {
        self.task_name
            .as_deref()
            .map(|n| n.rsplit('/').next().unwrap_or(n))
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn header_num<T: std::str::FromStr>(headers: &HeaderMap, name: &str) -> Option<T> {
    let raw = header_str(headers, name)?;
    match raw.parse::<T>() {
        Ok(n) => Some(n),
        Err(_) => {
            warn!(header = name, value = %raw, "ignoring malformed delivery header");
            None
        }
    }
}

/// The ETA header carries fractional epoch seconds.
fn parse_eta(raw: &str) -> Option<DateTime<Utc>> {
    let secs: f64 = raw.parse().ok()?;
    let whole = secs.trunc() as i64;
    let nanos = ((secs - secs.trunc()) * 1e9).round() as u32;
    Utc.timestamp_opt(whole, nanos.min(999_999_999)).single()
}

/// Caps how many times a handler is willing to run for one task,
/// independent of the queue's own retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    max_retries: u32,
}

impl RetryBudget {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Attempts `1..=max_retries` pass; later attempts fail with
    /// `RetryBudgetExceeded`.
    pub fn check(&self, ctx: &DeliveryContext) -> anyhow::Result<()> {
        let attempt = ctx.attempt();
        if attempt > self.max_retries {
            return Err(TaskError::retry_budget_exceeded(format!(
                "Max retries exhausted: attempt {attempt} exceeds budget of {}",
                self.max_retries
            ))
            .with_data(serde_json::json!({
                "attempt": attempt,
                "maxRetries": self.max_retries,
                "task": ctx.task_name,
            }))
            .into_anyhow());
        }
        Ok(())
    }
}

pub fn max_retries(count: u32) -> RetryBudget {
    RetryBudget::new(count)
}
