//! Resource identities for queues, scheduler locations and jobs.
//!
//! Identities are the natural keys for the "ensure exists" cache and render
//! to the canonical resource paths used by the Cloud Tasks and Cloud
//! Scheduler APIs (`projects/{project}/locations/{location}/queues/{queue}`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::TaskError;

const MAX_QUEUE_ID_LEN: usize = 100;
const MAX_JOB_ID_LEN: usize = 500;

fn check_segment(kind: &str, value: &str) -> anyhow::Result<()> {
    if value.trim().is_empty() {
        return Err(TaskError::validation(format!("{kind} must not be empty")).into_anyhow());
    }
    if value.contains('/') {
        return Err(
            TaskError::validation(format!("{kind} '{value}' must not contain '/'")).into_anyhow(),
        );
    }
    Ok(())
}

fn check_resource_id(kind: &str, value: &str, max_len: usize) -> anyhow::Result<()> {
    check_segment(kind, value)?;
    if value.len() > max_len {
        return Err(TaskError::validation(format!(
            "{kind} '{value}' is longer than {max_len} characters"
        ))
        .into_anyhow());
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(TaskError::validation(format!(
            "{kind} '{value}' may only contain letters, digits, '-' and '_'"
        ))
        .into_anyhow());
    }
    Ok(())
}

/// `projects/{project}/locations/{location}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocationPath {
    project: String,
    location: String,
}

impl LocationPath {
    pub fn new(project: impl Into<String>, location: impl Into<String>) -> anyhow::Result<Self> {
        let project = project.into();
        let location = location.into();
        check_segment("project", &project)?;
        check_segment("location", &location)?;
        Ok(Self { project, location })
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn path(&self) -> String {
        format!("projects/{}/locations/{}", self.project, self.location)
    }

    pub fn queue(&self, queue: impl Into<String>) -> anyhow::Result<QueueIdentity> {
        QueueIdentity::new(self.project.clone(), self.location.clone(), queue)
    }

    pub fn job(&self, job: impl Into<String>) -> anyhow::Result<JobIdentity> {
        JobIdentity::new(self.project.clone(), self.location.clone(), job)
    }
}

impl fmt::Display for LocationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

impl FromStr for LocationPath {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split('/').collect::<Vec<_>>().as_slice() {
            ["projects", project, "locations", location] => Self::new(*project, *location),
            _ => Err(TaskError::validation(format!(
                "'{s}' is not a location path (projects/{{project}}/locations/{{location}})"
            ))
            .into_anyhow()),
        }
    }
}

/// `(project, location, queue)`; the key for idempotent queue creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueIdentity {
    location: LocationPath,
    queue: String,
}

impl QueueIdentity {
    pub fn new(
        project: impl Into<String>,
        location: impl Into<String>,
        queue: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let location = LocationPath::new(project, location)?;
        let queue = queue.into();
        check_resource_id("queue", &queue, MAX_QUEUE_ID_LEN)?;
        if queue.contains('_') {
            return Err(TaskError::validation(format!(
                "queue '{queue}' may only contain letters, digits and '-'"
            ))
            .into_anyhow());
        }
        Ok(Self { location, queue })
    }

    pub fn location(&self) -> &LocationPath {
        &self.location
    }

    pub fn project(&self) -> &str {
        self.location.project()
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// `projects/{project}/locations/{location}/queues/{queue}`
    pub fn path(&self) -> String {
        format!("{}/queues/{}", self.location.path(), self.queue)
    }

    /// Fully qualified task name for a caller-supplied dedup key.
    pub fn task_path(&self, task_id: &str) -> String {
        format!("{}/tasks/{}", self.path(), task_id)
    }
}

impl fmt::Display for QueueIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

impl FromStr for QueueIdentity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split('/').collect::<Vec<_>>().as_slice() {
            ["projects", project, "locations", location, "queues", queue] => {
                Self::new(*project, *location, *queue)
            }
            _ => Err(TaskError::validation(format!(
                "'{s}' is not a queue path (projects/{{project}}/locations/{{location}}/queues/{{queue}})"
            ))
            .into_anyhow()),
        }
    }
}

/// `(project, location, job)`; the key for scheduled job upserts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobIdentity {
    location: LocationPath,
    job: String,
}

impl JobIdentity {
    pub fn new(
        project: impl Into<String>,
        location: impl Into<String>,
        job: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let location = LocationPath::new(project, location)?;
        let job = job.into();
        check_resource_id("job", &job, MAX_JOB_ID_LEN)?;
        Ok(Self { location, job })
    }

    pub fn location(&self) -> &LocationPath {
        &self.location
    }

    pub fn job(&self) -> &str {
        &self.job
    }

    /// `projects/{project}/locations/{location}/jobs/{job}`
    pub fn path(&self) -> String {
        format!("{}/jobs/{}", self.location.path(), self.job)
    }
}

impl fmt::Display for JobIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

impl FromStr for JobIdentity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split('/').collect::<Vec<_>>().as_slice() {
            ["projects", project, "locations", location, "jobs", job] => {
                Self::new(*project, *location, *job)
            }
            _ => Err(TaskError::validation(format!(
                "'{s}' is not a job path (projects/{{project}}/locations/{{location}}/jobs/{{job}})"
            ))
            .into_anyhow()),
        }
    }
}

/// Derive a stable job id from a route: `POST /scheduled/timed_hello`
/// becomes `post-scheduled-timed_hello`.
pub fn job_id_for_route(method: &str, path: &str) -> String {
    let raw = format!("{}-{}", method.to_ascii_lowercase(), path.trim_matches('/'));
    let mut id = String::with_capacity(raw.len());
    let mut last_dash = false;
    for c in raw.chars() {
        let c = if c.is_ascii_alphanumeric() || c == '_' { c } else { '-' };
        if c == '-' && last_dash {
            continue;
        }
        last_dash = c == '-';
        id.push(c);
    }
    let id = id.trim_end_matches('-');
    id.chars().take(MAX_JOB_ID_LEN).collect()
}
