//! Delayed routes: a public submit endpoint that enqueues a task and a
//! guarded execute endpoint the queue calls back.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use defer_axum::DelayedRouteBuilder;
//! use defer_core::{MemoryQueue, QueueIdentity};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Greeting { name: String }
//!
//! async fn hello(input: Greeting) -> anyhow::Result<String> {
//!     Ok(format!("hello {}", input.name))
//! }
//!
//! # async fn run() -> anyhow::Result<()> {
//! let queue = QueueIdentity::new("my-project", "us-central1", "default")?;
//! let builder = DelayedRouteBuilder::new("https://svc.example.com", queue, Arc::new(MemoryQueue::new()))?;
//! let route = builder.post("/hello", hello);
//! route.delay(&Greeting { name: "ada".into() }).await?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        rejection::{QueryRejection, RawPathParamsRejection},
        Query, RawPathParams,
    },
    http::StatusCode,
    routing::on,
    Json, Router,
};
use bytes::Bytes;
use defer_auth::{CallbackAuthenticator, OidcAuthenticator, OidcOptions};
use defer_core::config::DeferSettings;
use defer_core::delayer::{Delayer, TaskTarget, DEFAULT_CREATE_TIMEOUT};
use defer_core::ensure::EnsureRegistry;
use defer_core::errors::TaskError;
use defer_core::hooks::{DelayedHook, NoopHook};
use defer_core::options::ExecutionOptions;
use defer_core::paths::QueueIdentity;
use defer_core::queue::{QueueClient, QueueHandle};
use defer_core::task::{HttpMethod, TaskHandle};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::DeferAxumError;
use crate::execute::{
    callback_guard, collect_path_params, decode_input, method_filter, normalize_base_url,
    normalize_path, render_execute_url, Executor, DEFAULT_EXECUTE_PREFIX,
};
use crate::handler::{erase, ErasedHandler, TaskHandler};

/// Bound shared by every payload type.
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Payload for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

#[derive(Clone)]
struct DelayedShared {
    base_url: String,
    queue: QueueIdentity,
    handle: QueueHandle,
    hook: DelayedHook,
    authenticator: Arc<dyn CallbackAuthenticator>,
    execute_prefix: String,
    create_timeout: Duration,
    auto_create_queue: bool,
    default_options: ExecutionOptions,
    max_retries: Option<u32>,
}

/// Produces [`DelayedRoute`]s that share one queue, hook chain and
/// callback authenticator.
#[derive(Clone)]
pub struct DelayedRouteBuilder {
    shared: DelayedShared,
}

impl DelayedRouteBuilder {
    /// Callbacks are verified as Google OIDC tokens unless another
    /// authenticator is set.
    pub fn new(
        base_url: &str,
        queue: QueueIdentity,
        client: Arc<dyn QueueClient>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            shared: DelayedShared {
                base_url: normalize_base_url(base_url)?,
                queue,
                handle: QueueHandle::new(client),
                hook: Arc::new(NoopHook),
                authenticator: Arc::new(OidcAuthenticator::from_options(OidcOptions::default())),
                execute_prefix: DEFAULT_EXECUTE_PREFIX.to_string(),
                create_timeout: DEFAULT_CREATE_TIMEOUT,
                auto_create_queue: true,
                default_options: ExecutionOptions::default(),
                max_retries: None,
            },
        })
    }

    /// Base URL, queue, default deadline, retry ceiling and submit timeout
    /// from settings.
    pub fn from_settings(
        settings: &DeferSettings,
        client: Arc<dyn QueueClient>,
        authenticator: Arc<dyn CallbackAuthenticator>,
    ) -> anyhow::Result<Self> {
        let mut builder = Self::new(&settings.base_url, settings.queue_identity()?, client)?
            .with_authenticator(authenticator)
            .with_task_create_timeout(settings.task_create_timeout);
        if let Some(deadline) = settings.default_deadline {
            builder.shared.default_options = builder.shared.default_options.with_deadline(deadline);
        }
        builder.shared.max_retries = settings.max_retries;
        Ok(builder)
    }

    pub fn with_hook(mut self, hook: DelayedHook) -> Self {
        self.shared.hook = hook;
        self
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn CallbackAuthenticator>) -> Self {
        self.shared.authenticator = authenticator;
        self
    }

    /// Path prefix for execute endpoints, `/_tasks` by default.
    pub fn with_execute_prefix(mut self, prefix: &str) -> Self {
        self.shared.execute_prefix = normalize_path(prefix);
        if self.shared.execute_prefix == "/" {
            self.shared.execute_prefix.clear();
        }
        self
    }

    pub fn with_task_create_timeout(mut self, timeout: Duration) -> Self {
        self.shared.create_timeout = timeout;
        self
    }

    pub fn with_auto_create_queue(mut self, enabled: bool) -> Self {
        self.shared.auto_create_queue = enabled;
        self
    }

    /// Use a private ensure registry instead of the process-wide one.
    pub fn with_registry(mut self, registry: Arc<EnsureRegistry>) -> Self {
        let client = Arc::clone(self.shared.handle.client());
        self.shared.handle = QueueHandle::with_registry(client, registry);
        self
    }

    /// Options every route starts from.
    pub fn with_default_options(mut self, options: ExecutionOptions) -> Self {
        self.shared.default_options = options;
        self
    }

    /// Retry ceiling applied to routes that do not set their own.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.shared.max_retries = Some(max_retries);
        self
    }

    pub fn queue(&self) -> &QueueIdentity {
        &self.shared.queue
    }

    pub fn base_url(&self) -> &str {
        &self.shared.base_url
    }

    pub fn route<I, T, H>(&self, method: HttpMethod, path: &str, handler: H) -> DelayedRoute<I>
    where
        I: Payload,
        H: TaskHandler<T, I>,
    {
        let path = normalize_path(path);
        let execute_path = format!("{}{}", self.shared.execute_prefix, path);
        let execute_url = format!("{}{}", self.shared.base_url, execute_path);
        DelayedRoute {
            shared: Arc::new(self.shared.clone()),
            method,
            path,
            execute_path,
            execute_url,
            default_options: self.shared.default_options.clone(),
            max_retries: self.shared.max_retries,
            handler: erase(handler),
        }
    }

    pub fn post<I, T, H>(&self, path: &str, handler: H) -> DelayedRoute<I>
    where
        I: Payload,
        H: TaskHandler<T, I>,
    {
        self.route(HttpMethod::Post, path, handler)
    }

    pub fn put<I, T, H>(&self, path: &str, handler: H) -> DelayedRoute<I>
    where
        I: Payload,
        H: TaskHandler<T, I>,
    {
        self.route(HttpMethod::Put, path, handler)
    }

    pub fn patch<I, T, H>(&self, path: &str, handler: H) -> DelayedRoute<I>
    where
        I: Payload,
        H: TaskHandler<T, I>,
    {
        self.route(HttpMethod::Patch, path, handler)
    }

    pub fn get<I, T, H>(&self, path: &str, handler: H) -> DelayedRoute<I>
    where
        I: Payload,
        H: TaskHandler<T, I>,
    {
        self.route(HttpMethod::Get, path, handler)
    }

    pub fn delete<I, T, H>(&self, path: &str, handler: H) -> DelayedRoute<I>
    where
        I: Payload,
        H: TaskHandler<T, I>,
    {
        self.route(HttpMethod::Delete, path, handler)
    }
}

/// One deferred handler.
pub struct DelayedRoute<I> {
    shared: Arc<DelayedShared>,
    method: HttpMethod,
    path: String,
    execute_path: String,
    execute_url: String,
    default_options: ExecutionOptions,
    max_retries: Option<u32>,
    handler: ErasedHandler<I>,
}

impl<I> Clone for DelayedRoute<I> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            method: self.method,
            path: self.path.clone(),
            execute_path: self.execute_path.clone(),
            execute_url: self.execute_url.clone(),
            default_options: self.default_options.clone(),
            max_retries: self.max_retries,
            handler: Arc::clone(&self.handler),
        }
    }
}

impl<I: Payload> DelayedRoute<I> {
    /// Merged over the builder's defaults.
    pub fn with_default_options(mut self, options: ExecutionOptions) -> Self {
        self.default_options = self.shared.default_options.merge(&options);
        self
    }

    /// Give up (and acknowledge the task) once the attempt number passes
    /// `max_retries`.
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

    /// For paths with captures this is the template, e.g.
    /// `https://svc.example.com/_tasks/items/{id}`.
    pub fn execute_url(&self) -> &str {
        &self.execute_url
    }

    pub fn queue(&self) -> &QueueIdentity {
        &self.shared.queue
    }

    fn delayer(&self, url: String, options: ExecutionOptions) -> Delayer {
        Delayer::new(
            TaskTarget::new(url, self.method),
            self.shared.queue.clone(),
            self.shared.handle.clone(),
        )
        .with_hook(Arc::clone(&self.shared.hook))
        .with_options(options)
        .with_create_timeout(self.shared.create_timeout)
        .with_auto_create_queue(self.shared.auto_create_queue)
    }

    /// Per-call options; they win over the route defaults.
    pub fn options(&self, options: ExecutionOptions) -> DelayedCall<I> {
        DelayedCall {
            route: self.clone(),
            options: self.default_options.merge(&options),
            path_params: BTreeMap::new(),
        }
    }

    /// Fill a `{name}` capture of the route path.
    pub fn with_path_param(&self, name: impl Into<String>, value: impl Into<String>) -> DelayedCall<I> {
        self.options(ExecutionOptions::new()).with_path_param(name, value)
    }

    pub async fn delay(&self, input: &I) -> anyhow::Result<TaskHandle> {
        self.options(ExecutionOptions::new()).delay(input).await
    }

    fn executor(&self) -> Executor<I> {
        Executor {
            route: Arc::from(format!("{} {}", self.method, self.path)),
            handler: Arc::clone(&self.handler),
            max_retries: self.max_retries,
        }
    }

    /// Submit endpoint at the route path plus the guarded execute endpoint.
    /// Merge it at the root: the execute URL is built from the base URL.
    pub fn router(&self) -> Router {
        let route = self.clone();
        let submit = move |captures: Result<RawPathParams, RawPathParamsRejection>,
                           params: Result<Query<SubmitParams>, QueryRejection>,
                           body: Bytes| async move {
            let path_params = collect_path_params(captures)?;
            let Query(params) = params
                .map_err(|e| TaskError::validation(format!("invalid submit parameters: {e}")))?;
            let input: I = decode_input(&body)?;
            let mut call = route.options(params.into_options());
            call.path_params = path_params;
            let handle = call.delay(&input).await?;
            debug!(route = %route.path, task = %handle.name, "submit acknowledged");
            let ack = SubmitAck::new(&handle, &route.shared.queue);
            Ok::<_, DeferAxumError>((StatusCode::ACCEPTED, Json(ack)))
        };

        let guard = callback_guard(
            Arc::clone(&self.shared.authenticator),
            &self.shared.base_url,
            &self.execute_path,
        );
        let execute = self.executor().method_router(self.method, guard);

        Router::new()
            .route(&self.path, on(method_filter(self.method), submit))
            .route(&self.execute_path, execute)
    }
}

/// A delayed call with per-call options and path captures applied.
pub struct DelayedCall<I> {
    route: DelayedRoute<I>,
    options: ExecutionOptions,
    path_params: BTreeMap<String, String>,
}

impl<I: Payload> DelayedCall<I> {
    pub fn options(&self) -> &ExecutionOptions {
        &self.options
    }

    pub fn with_path_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.path_params.insert(name.into(), value.into());
        self
    }

    /// Execute URL with the captures filled in.
    pub fn target_url(&self) -> anyhow::Result<String> {
        render_execute_url(
            &self.route.shared.base_url,
            &self.route.execute_path,
            &self.path_params,
        )
    }

    pub async fn delay(&self, input: &I) -> anyhow::Result<TaskHandle> {
        let url = self.target_url()?;
        self.route
            .delayer(url, self.options.clone())
            .delay(input)
            .await
    }
}

/// Query parameters accepted by submit endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SubmitParams {
    /// Seconds from now.
    pub countdown: Option<i64>,
    pub task_id: Option<String>,
    /// Dispatch deadline in seconds.
    pub deadline: Option<u64>,
}

impl SubmitParams {
    pub fn into_options(self) -> ExecutionOptions {
        let mut options = ExecutionOptions::new();
        if let Some(countdown) = self.countdown {
            options = options.with_countdown(countdown);
        }
        if let Some(task_id) = self.task_id {
            options = options.with_task_id(task_id);
        }
        if let Some(deadline) = self.deadline {
            options = options.with_deadline(Duration::from_secs(deadline));
        }
        options
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitAck {
    pub task_name: String,
    pub task_id: String,
    pub queue: String,
    pub schedule_time: Option<String>,
}

impl SubmitAck {
    pub fn new(handle: &TaskHandle, queue: &QueueIdentity) -> Self {
        Self {
            task_name: handle.name.clone(),
            task_id: handle.task_id().to_string(),
            queue: queue.path(),
            schedule_time: handle.schedule_time.map(|t| t.to_rfc3339()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_params_become_options() {
        let options = SubmitParams {
            countdown: Some(30),
            task_id: Some("abc".into()),
            deadline: Some(60),
        }
        .into_options();
        assert_eq!(options.task_id.as_deref(), Some("abc"));
        assert_eq!(options.deadline, Some(Duration::from_secs(60)));
        assert_eq!(options.delay, Some(chrono::TimeDelta::seconds(30)));
    }

    #[test]
    fn empty_params_are_empty_options() {
        assert_eq!(SubmitParams::default().into_options(), ExecutionOptions::new());
    }
}
