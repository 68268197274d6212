//! Per-call execution options.
//!
//! Options are plain values: route defaults and per-call overrides are
//! merged field by field, then validated once before a task draft is built.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::errors::TaskError;

/// Shortest dispatch deadline the queue accepts for HTTP targets.
pub const MIN_DEADLINE: Duration = Duration::from_secs(15);
/// Longest dispatch deadline the queue accepts for HTTP targets.
pub const MAX_DEADLINE: Duration = Duration::from_secs(30 * 60);

/// Furthest ahead a task may be scheduled.
pub const MAX_DELAY: TimeDelta = TimeDelta::days(30);

const MAX_TASK_ID_LEN: usize = 500;

/// Header prefixes set by the infrastructure itself on delivery.
const RESERVED_HEADER_PREFIXES: &[&str] = &["x-cloudtasks-", "x-cloudscheduler", "x-google-"];
const RESERVED_HEADERS: &[&str] = &["authorization", "host", "content-length"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOptions {
    /// Relative dispatch offset. Zero or absent means "now".
    pub delay: Option<TimeDelta>,
    /// Dedup key scoped to the queue.
    pub task_id: Option<String>,
    pub deadline: Option<Duration>,
    /// Extra headers sent with the callback.
    pub headers: BTreeMap<String, String>,
}

impl ExecutionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: TimeDelta) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Delay in whole seconds; negative values and values past
    /// [`MAX_DELAY`] fail validation.
    pub fn with_countdown(self, seconds: i64) -> Self {
        let delay = TimeDelta::try_seconds(seconds).unwrap_or(if seconds < 0 {
            TimeDelta::MIN
        } else {
            TimeDelta::MAX
        });
        self.with_delay(delay)
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        set_header(&mut self.headers, name.into(), value.into());
        self
    }

    /// Layer `overrides` on top of `self`. Fields set in `overrides` win;
    /// headers merge by case-insensitive name.
    pub fn merge(&self, overrides: &ExecutionOptions) -> ExecutionOptions {
        let mut headers = self.headers.clone();
        for (name, value) in &overrides.headers {
            set_header(&mut headers, name.clone(), value.clone());
        }
        ExecutionOptions {
            delay: overrides.delay.or(self.delay),
            task_id: overrides.task_id.clone().or_else(|| self.task_id.clone()),
            deadline: overrides.deadline.or(self.deadline),
            headers,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(delay) = self.delay {
            if delay < TimeDelta::zero() {
                return Err(TaskError::validation(format!(
                    "delay must not be negative (got {}s)",
                    delay.num_seconds()
                ))
                .into_anyhow());
            }
            if delay > MAX_DELAY {
                return Err(TaskError::validation(format!(
                    "delay must be at most {} days (got {}s)",
                    MAX_DELAY.num_days(),
                    delay.num_seconds()
                ))
                .into_anyhow());
            }
        }

        if let Some(task_id) = &self.task_id {
            validate_task_id(task_id)?;
        }

        if let Some(deadline) = self.deadline {
            if deadline < MIN_DEADLINE || deadline > MAX_DEADLINE {
                return Err(TaskError::validation(format!(
                    "deadline must be between {}s and {}s (got {}s)",
                    MIN_DEADLINE.as_secs(),
                    MAX_DEADLINE.as_secs(),
                    deadline.as_secs()
                ))
                .into_anyhow());
            }
        }

        for name in self.headers.keys() {
            validate_header_name(name)?;
        }

        Ok(())
    }

    /// Absolute dispatch time for this call, `None` for immediate dispatch.
    /// Delays that overflow the calendar also yield `None`; `validate`
    /// rejects them first.
    pub fn schedule_time(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.delay {
            Some(delay) if delay > TimeDelta::zero() => now.checked_add_signed(delay),
            _ => None,
        }
    }
}

fn validate_task_id(task_id: &str) -> anyhow::Result<()> {
    if task_id.is_empty() || task_id.len() > MAX_TASK_ID_LEN {
        return Err(TaskError::validation(format!(
            "task_id must be 1 to {MAX_TASK_ID_LEN} characters"
        ))
        .into_anyhow());
    }
    if !task_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(TaskError::validation(format!(
            "task_id '{task_id}' may only contain letters, digits, '-' and '_'"
        ))
        .into_anyhow());
    }
    Ok(())
}

pub(crate) fn validate_header_name(name: &str) -> anyhow::Result<()> {
    if http::HeaderName::from_bytes(name.as_bytes()).is_err() {
        return Err(TaskError::validation(format!("'{name}' is not a valid header name")).into_anyhow());
    }
    if is_reserved_header(name) {
        return Err(TaskError::validation(format!("header '{name}' is reserved")).into_anyhow());
    }
    Ok(())
}

/// Headers the queue or scheduler sets on delivery; callers may not send them.
pub fn is_reserved_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    RESERVED_HEADERS.contains(&lower.as_str())
        || RESERVED_HEADER_PREFIXES.iter().any(|p| lower.starts_with(p))
}

/// Insert a header. An existing entry whose name differs only in case keeps
/// its spelling and takes the new value.
pub(crate) fn set_header(headers: &mut BTreeMap<String, String>, name: String, value: String) {
    let existing = headers
        .keys()
        .find(|k| k.eq_ignore_ascii_case(&name))
        .cloned();
    headers.insert(existing.unwrap_or(name), value);
}

/// Drop reserved headers, returning the names removed.
pub(crate) fn strip_reserved_headers(headers: &mut BTreeMap<String, String>) -> Vec<String> {
    let reserved: Vec<String> = headers
        .keys()
        .filter(|name| is_reserved_header(name))
        .cloned()
        .collect();
    for name in &reserved {
        headers.remove(name);
    }
    reserved
}
