use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::delayer::{encode_payload, TaskTarget};
use crate::ensure::EnsureRegistry;
use crate::errors::TaskError;
use crate::hooks::{NoopHook, ScheduledHook};
use crate::job::{CreateJobRequest, HttpTarget, JobDefinition, JobHandle, JobOutcome, RetryConfig};
use crate::options::{set_header, strip_reserved_headers, validate_header_name};
use crate::paths::{job_id_for_route, JobIdentity, LocationPath};
use crate::schedule::{validate_schedule, CronSchedule};

/// Scheduler-management interface of the external scheduler service.
#[async_trait]
pub trait SchedulerClient: Send + Sync {
    /// `Ok(None)` when no job with that name exists.
    async fn get_job(&self, name: &JobIdentity) -> anyhow::Result<Option<JobDefinition>>;

    async fn create_job(&self, request: CreateJobRequest) -> anyhow::Result<JobDefinition>;

    async fn update_job(&self, job: JobDefinition) -> anyhow::Result<JobDefinition>;

    /// `Ok(false)` when there was nothing to delete.
    async fn delete_job(&self, name: &JobIdentity) -> anyhow::Result<bool>;

    /// Create the job, or update it in place when the stored definition
    /// differs (or `force` is set). Never creates a second job.
    async fn create_or_update_job(
        &self,
        request: CreateJobRequest,
        force: bool,
    ) -> anyhow::Result<JobHandle> {
        let name = request.job.name.path();
        let outcome = match self.get_job(&request.job.name).await? {
            None => {
                self.create_job(request).await?;
                JobOutcome::Created
            }
            Some(existing) if existing == request.job && !force => JobOutcome::Unchanged,
            Some(_) => {
                self.update_job(request.job).await?;
                JobOutcome::Updated
            }
        };
        Ok(JobHandle { name, outcome })
    }
}

/// Registers job definitions, skipping a write when the same definition
/// was the last one written for that job in this process.
#[derive(Clone)]
pub struct JobRegistrar {
    client: Arc<dyn SchedulerClient>,
    registry: Arc<EnsureRegistry>,
}

impl JobRegistrar {
    pub fn new(client: Arc<dyn SchedulerClient>) -> Self {
        Self::with_registry(client, EnsureRegistry::global())
    }

    pub fn with_registry(client: Arc<dyn SchedulerClient>, registry: Arc<EnsureRegistry>) -> Self {
        Self { client, registry }
    }

    pub fn client(&self) -> &Arc<dyn SchedulerClient> {
        &self.client
    }

    pub async fn register(
        &self,
        request: CreateJobRequest,
        force: bool,
        timeout: Duration,
    ) -> anyhow::Result<JobHandle> {
        let name = request.job.name.path();
        let fingerprint = request.job.fingerprint();

        let mut outcome = JobOutcome::Unchanged;
        let slot = &mut outcome;
        let client = &self.client;
        let job_name = &name;
        self.registry
            .ensure_version(&name, fingerprint, force, move || async move {
                let handle = tokio::time::timeout(timeout, client.create_or_update_job(request, force))
                    .await
                    .map_err(|_| {
                        TaskError::queue_unavailable(format!(
                            "scheduler did not register {job_name} within {}ms",
                            timeout.as_millis()
                        ))
                        .into_anyhow()
                    })?
                    .map_err(|err| {
                        warn!(job = %job_name, error = %err, "job registration failed");
                        match TaskError::kind_of(&err) {
                            Some(_) => err,
                            None => TaskError::queue_unavailable(format!(
                                "scheduler rejected job {job_name}"
                            ))
                            .with_source(err)
                            .into_anyhow(),
                        }
                    })?;
                *slot = handle.outcome;
                Ok(())
            })
            .await?;

        match outcome {
            JobOutcome::Created => info!(job = %name, "scheduled job created"),
            JobOutcome::Updated => info!(job = %name, "scheduled job updated"),
            JobOutcome::Unchanged => debug!(job = %name, "scheduled job unchanged"),
        }
        Ok(JobHandle { name, outcome })
    }

    /// Remove a job. Missing jobs and scheduler errors are logged, not raised.
    pub async fn delete(&self, name: &JobIdentity) -> bool {
        self.registry.invalidate(&name.path());
        match self.client.delete_job(name).await {
            Ok(deleted) => {
                if deleted {
                    info!(job = %name, "scheduled job deleted");
                }
                deleted
            }
            Err(err) => {
                warn!(job = %name, error = %err, "scheduled job deletion failed");
                false
            }
        }
    }
}

pub const DEFAULT_JOB_CREATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Registration options for one scheduled route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOptions {
    /// Job id; derived from the route when absent.
    pub name: Option<String>,
    pub schedule: String,
    pub time_zone: String,
    pub description: Option<String>,
    pub retry_config: RetryConfig,
    pub attempt_deadline: Option<Duration>,
    /// Update the job even when the stored definition matches.
    pub force: bool,
    pub headers: BTreeMap<String, String>,
}

impl JobOptions {
    pub fn new(schedule: impl Into<String>) -> Self {
        Self {
            name: None,
            schedule: schedule.into(),
            time_zone: "UTC".to_string(),
            description: None,
            retry_config: RetryConfig::default(),
            attempt_deadline: None,
            force: false,
            headers: BTreeMap::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_time_zone(mut self, time_zone: impl Into<String>) -> Self {
        self.time_zone = time_zone.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    pub fn with_attempt_deadline(mut self, deadline: Duration) -> Self {
        self.attempt_deadline = Some(deadline);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        set_header(&mut self.headers, name.into(), value.into());
        self
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}

/// Builds a job definition for one route and registers it.
#[derive(Clone)]
pub struct JobScheduler {
    target: TaskTarget,
    route_path: Option<String>,
    location: LocationPath,
    registrar: JobRegistrar,
    hook: ScheduledHook,
    options: JobOptions,
    create_timeout: Duration,
}

impl JobScheduler {
    pub fn new(
        target: TaskTarget,
        location: LocationPath,
        registrar: JobRegistrar,
        options: JobOptions,
    ) -> Self {
        Self {
            target,
            route_path: None,
            location,
            registrar,
            hook: Arc::new(NoopHook),
            options,
            create_timeout: DEFAULT_JOB_CREATE_TIMEOUT,
        }
    }

    pub fn with_hook(mut self, hook: ScheduledHook) -> Self {
        self.hook = hook;
        self
    }

    pub fn with_create_timeout(mut self, timeout: Duration) -> Self {
        self.create_timeout = timeout;
        self
    }

    /// Path the job name is derived from when no explicit name is given.
    /// Defaults to the target URL's path.
    pub fn with_route_path(mut self, path: impl Into<String>) -> Self {
        self.route_path = Some(path.into());
        self
    }

    pub fn options(&self) -> &JobOptions {
        &self.options
    }

    pub fn job_identity(&self) -> anyhow::Result<JobIdentity> {
        let id = match &self.options.name {
            Some(name) => name.clone(),
            None => {
                let path = match &self.route_path {
                    Some(path) => path.clone(),
                    None => url::Url::parse(&self.target.url)
                        .map(|u| u.path().to_string())
                        .unwrap_or_else(|_| self.target.url.clone()),
                };
                job_id_for_route(self.target.method.as_str(), &path)
            }
        };
        self.location.job(id)
    }

    /// Validate the schedule and build the hooked draft. Never touches the
    /// scheduler.
    pub fn build_request(&self, body: Option<Vec<u8>>) -> anyhow::Result<CreateJobRequest> {
        validate_schedule(&self.options.schedule, &self.options.time_zone)?;

        for name in self.options.headers.keys() {
            validate_header_name(name)?;
        }
        if body.is_some() && !self.target.method.allows_body() {
            return Err(TaskError::validation(format!(
                "{} jobs cannot carry a payload",
                self.target.method
            ))
            .into_anyhow());
        }

        let mut http_target = HttpTarget::new(self.target.url.clone(), self.target.method);
        http_target.headers = self.options.headers.clone();
        set_header(
            &mut http_target.headers,
            "Content-Type".to_string(),
            "application/json".to_string(),
        );
        http_target.body = body;

        let job = JobDefinition {
            name: self.job_identity()?,
            description: self.options.description.clone(),
            schedule: self.options.schedule.trim().to_string(),
            time_zone: self.options.time_zone.trim().to_string(),
            http_target,
            retry_config: self.options.retry_config.clone(),
            attempt_deadline: self.options.attempt_deadline,
        };

        let draft = CreateJobRequest {
            parent: self.location.clone(),
            job,
        };
        let mut draft = self.hook.apply(draft);
        for header in strip_reserved_headers(&mut draft.job.http_target.headers) {
            warn!(job = %draft.job.name, header = %header, "dropped reserved header set by hook");
        }
        Ok(draft)
    }

    pub async fn schedule_body(&self, body: Option<Vec<u8>>) -> anyhow::Result<JobHandle> {
        let request = self.build_request(body)?;
        if let Ok(cron) = CronSchedule::parse(&request.job.schedule, &request.job.time_zone) {
            debug!(
                job = %request.job.name,
                next_run = ?cron.next_after(chrono::Utc::now()),
                "registering scheduled job"
            );
        }
        self.registrar
            .register(request, self.options.force, self.create_timeout)
            .await
    }

    pub async fn schedule<I: Serialize + ?Sized>(&self, input: &I) -> anyhow::Result<JobHandle> {
        let body = encode_payload(input)?;
        self.schedule_body(body).await
    }

    /// Remove this route's job from the scheduler.
    pub async fn delete(&self) -> anyhow::Result<bool> {
        let name = self.job_identity()?;
        Ok(self.registrar.delete(&name).await)
    }
}
