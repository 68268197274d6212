//! Scheduled routes: a cron job registered with the scheduler that calls
//! a guarded execute endpoint.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use defer_auth::{CallbackAuthenticator, OidcAuthenticator, OidcOptions};
use defer_core::config::DeferSettings;
use defer_core::delayer::TaskTarget;
use defer_core::ensure::EnsureRegistry;
use defer_core::hooks::{NoopHook, ScheduledHook};
use defer_core::job::JobHandle;
use defer_core::paths::{JobIdentity, LocationPath};
use defer_core::scheduler::{
    JobOptions, JobRegistrar, JobScheduler, SchedulerClient, DEFAULT_JOB_CREATE_TIMEOUT,
};
use defer_core::task::HttpMethod;

use crate::delayed::Payload;
use crate::execute::{
    callback_guard, normalize_base_url, normalize_path, render_execute_url, render_segments,
    Executor, DEFAULT_EXECUTE_PREFIX,
};
use crate::handler::{erase, ErasedHandler, TaskHandler};

#[derive(Clone)]
struct ScheduledShared {
    base_url: String,
    location: LocationPath,
    registrar: JobRegistrar,
    hook: ScheduledHook,
    authenticator: Arc<dyn CallbackAuthenticator>,
    execute_prefix: String,
    create_timeout: Duration,
    max_retries: Option<u32>,
}

#[derive(Clone)]
pub struct ScheduledRouteBuilder {
    shared: ScheduledShared,
}

impl ScheduledRouteBuilder {
    pub fn new(
        base_url: &str,
        location: LocationPath,
        client: Arc<dyn SchedulerClient>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            shared: ScheduledShared {
                base_url: normalize_base_url(base_url)?,
                location,
                registrar: JobRegistrar::new(client),
                hook: Arc::new(NoopHook),
                authenticator: Arc::new(OidcAuthenticator::from_options(OidcOptions::default())),
                execute_prefix: DEFAULT_EXECUTE_PREFIX.to_string(),
                create_timeout: DEFAULT_JOB_CREATE_TIMEOUT,
                max_retries: None,
            },
        })
    }

    pub fn from_settings(
        settings: &DeferSettings,
        client: Arc<dyn SchedulerClient>,
        authenticator: Arc<dyn CallbackAuthenticator>,
    ) -> anyhow::Result<Self> {
        let mut builder = Self::new(&settings.base_url, settings.scheduler_location_path()?, client)?
            .with_authenticator(authenticator)
            .with_job_create_timeout(settings.task_create_timeout);
        builder.shared.max_retries = settings.max_retries;
        Ok(builder)
    }

    pub fn with_hook(mut self, hook: ScheduledHook) -> Self {
        self.shared.hook = hook;
        self
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn CallbackAuthenticator>) -> Self {
        self.shared.authenticator = authenticator;
        self
    }

    pub fn with_execute_prefix(mut self, prefix: &str) -> Self {
        self.shared.execute_prefix = normalize_path(prefix);
        if self.shared.execute_prefix == "/" {
            self.shared.execute_prefix.clear();
        }
        self
    }

    pub fn with_job_create_timeout(mut self, timeout: Duration) -> Self {
        self.shared.create_timeout = timeout;
        self
    }

    pub fn with_registry(mut self, registry: Arc<EnsureRegistry>) -> Self {
        let client = Arc::clone(self.shared.registrar.client());
        self.shared.registrar = JobRegistrar::with_registry(client, registry);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.shared.max_retries = Some(max_retries);
        self
    }

    pub fn location(&self) -> &LocationPath {
        &self.shared.location
    }

    pub fn route<I, T, H>(&self, method: HttpMethod, path: &str, handler: H) -> ScheduledRoute<I>
    where
        I: Payload,
        H: TaskHandler<T, I>,
    {
        let path = normalize_path(path);
        let execute_path = format!("{}{}", self.shared.execute_prefix, path);
        let execute_url = format!("{}{}", self.shared.base_url, execute_path);
        ScheduledRoute {
            shared: Arc::new(self.shared.clone()),
            method,
            path,
            execute_path,
            execute_url,
            max_retries: self.shared.max_retries,
            handler: erase(handler),
        }
    }

    pub fn post<I, T, H>(&self, path: &str, handler: H) -> ScheduledRoute<I>
    where
        I: Payload,
        H: TaskHandler<T, I>,
    {
        self.route(HttpMethod::Post, path, handler)
    }

    pub fn get<I, T, H>(&self, path: &str, handler: H) -> ScheduledRoute<I>
    where
        I: Payload,
        H: TaskHandler<T, I>,
    {
        self.route(HttpMethod::Get, path, handler)
    }
}

/// One handler the scheduler invokes on a cron schedule.
pub struct ScheduledRoute<I> {
    shared: Arc<ScheduledShared>,
    method: HttpMethod,
    path: String,
    execute_path: String,
    execute_url: String,
    max_retries: Option<u32>,
    handler: ErasedHandler<I>,
}

impl<I> Clone for ScheduledRoute<I> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            method: self.method,
            path: self.path.clone(),
            execute_path: self.execute_path.clone(),
            execute_url: self.execute_url.clone(),
            max_retries: self.max_retries,
            handler: Arc::clone(&self.handler),
        }
    }
}

impl<I: Payload> ScheduledRoute<I> {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn execute_path(&self) -> &str {
        &self.execute_path
    }

    /// For paths with captures this is the template.
    pub fn execute_url(&self) -> &str {
        &self.execute_url
    }

    /// Bind a cron schedule to this route. The job is named after the
    /// route's method and path unless `options` names it.
    pub fn scheduler(&self, options: JobOptions) -> ScheduledCall<I> {
        ScheduledCall {
            route: self.clone(),
            options,
            path_params: BTreeMap::new(),
        }
    }

    /// Only the execute endpoint; there is nothing to submit.
    pub fn router(&self) -> Router {
        let executor = Executor {
            route: Arc::from(format!("{} {}", self.method, self.path)),
            handler: Arc::clone(&self.handler),
            max_retries: self.max_retries,
        };
        let guard = callback_guard(
            Arc::clone(&self.shared.authenticator),
            &self.shared.base_url,
            &self.execute_path,
        );
        let execute = executor.method_router(self.method, guard);
        Router::new().route(&self.execute_path, execute)
    }
}

/// A route bound to a schedule.
pub struct ScheduledCall<I> {
    route: ScheduledRoute<I>,
    options: JobOptions,
    path_params: BTreeMap<String, String>,
}

impl<I: Payload> ScheduledCall<I> {
    /// Fill a `{name}` capture of the route path. Each distinct set of
    /// captures is its own job unless the options name one.
    pub fn with_path_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.path_params.insert(name.into(), value.into());
        self
    }

    fn job_scheduler(&self) -> anyhow::Result<JobScheduler> {
        let route = &self.route;
        let url = render_execute_url(&route.shared.base_url, &route.execute_path, &self.path_params)?;
        let route_path = format!("/{}", render_segments(&route.path, &self.path_params)?.join("/"));
        Ok(JobScheduler::new(
            TaskTarget::new(url, route.method),
            route.shared.location.clone(),
            route.shared.registrar.clone(),
            self.options.clone(),
        )
        .with_hook(Arc::clone(&route.shared.hook))
        .with_create_timeout(route.shared.create_timeout)
        .with_route_path(route_path))
    }

    pub fn job_identity(&self) -> anyhow::Result<JobIdentity> {
        self.job_scheduler()?.job_identity()
    }

    pub fn options(&self) -> &JobOptions {
        &self.options
    }

    /// Validate the schedule, then create or update the job. Identical
    /// registrations within one process hit the scheduler once.
    pub async fn schedule(&self, input: &I) -> anyhow::Result<JobHandle> {
        self.job_scheduler()?.schedule(input).await
    }

    pub async fn delete(&self) -> anyhow::Result<bool> {
        self.job_scheduler()?.delete().await
    }
}
