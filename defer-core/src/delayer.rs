//! Building and submitting one deferred call.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::errors::TaskError;
use crate::hooks::{DelayedHook, NoopHook};
use crate::options::{set_header, strip_reserved_headers, ExecutionOptions};
use crate::paths::QueueIdentity;
use crate::queue::QueueHandle;
use crate::task::{CreateTaskRequest, HttpMethod, HttpRequest, TaskDefinition, TaskHandle};

pub const DEFAULT_CREATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Where the queue calls back to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskTarget {
    pub url: String,
    pub method: HttpMethod,
}

impl TaskTarget {
    pub fn new(url: impl Into<String>, method: HttpMethod) -> Self {
        Self {
            url: url.into(),
            method,
        }
    }
}

/// Serialize a payload for the task body. `null` means "no body".
pub fn encode_payload<I: Serialize + ?Sized>(input: &I) -> anyhow::Result<Option<Vec<u8>>> {
    let value = serde_json::to_value(input).map_err(|e| {
        TaskError::validation(format!("payload could not be serialized: {e}")).into_anyhow()
    })?;
    if value.is_null() {
        return Ok(None);
    }
    let bytes = serde_json::to_vec(&value).map_err(|e| {
        TaskError::validation(format!("payload could not be serialized: {e}")).into_anyhow()
    })?;
    Ok(Some(bytes))
}

/// Turns a payload plus options into a task draft, runs the hook chain and
/// hands the result to the queue.
#[derive(Clone)]
pub struct Delayer {
    target: TaskTarget,
    queue: QueueIdentity,
    handle: QueueHandle,
    hook: DelayedHook,
    options: ExecutionOptions,
    create_timeout: Duration,
    auto_create_queue: bool,
}

impl Delayer {
    pub fn new(target: TaskTarget, queue: QueueIdentity, handle: QueueHandle) -> Self {
        Self {
            target,
            queue,
            handle,
            hook: Arc::new(NoopHook),
            options: ExecutionOptions::default(),
            create_timeout: DEFAULT_CREATE_TIMEOUT,
            auto_create_queue: true,
        }
    }

    pub fn with_hook(mut self, hook: DelayedHook) -> Self {
        self.hook = hook;
        self
    }

    /// Replace the options used for this call.
    pub fn with_options(mut self, options: ExecutionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_create_timeout(mut self, timeout: Duration) -> Self {
        self.create_timeout = timeout;
        self
    }

    pub fn with_auto_create_queue(mut self, enabled: bool) -> Self {
        self.auto_create_queue = enabled;
        self
    }

    pub fn target(&self) -> &TaskTarget {
        &self.target
    }

    pub fn queue(&self) -> &QueueIdentity {
        &self.queue
    }

    pub fn options(&self) -> &ExecutionOptions {
        &self.options
    }

    /// Validate options and build the hooked draft without touching the
    /// queue.
    pub fn build_request(
        &self,
        body: Option<Vec<u8>>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<CreateTaskRequest> {
        self.options.validate()?;

        if body.is_some() && !self.target.method.allows_body() {
            return Err(TaskError::validation(format!(
                "{} tasks cannot carry a payload",
                self.target.method
            ))
            .into_anyhow());
        }

        let mut headers = self.options.headers.clone();
        set_header(&mut headers, "Content-Type".to_string(), "application/json".to_string());

        let mut request = HttpRequest::new(self.target.url.clone(), self.target.method);
        request.headers = headers;
        request.body = body;

        let mut task = TaskDefinition::new(request);
        task.name = self
            .options
            .task_id
            .as_deref()
            .map(|id| self.queue.task_path(id));
        task.schedule_time = self.options.schedule_time(now);
        task.dispatch_deadline = self.options.deadline;

        let draft = CreateTaskRequest {
            parent: self.queue.clone(),
            task,
        };
        let mut draft = self.hook.apply(draft);
        for header in strip_reserved_headers(&mut draft.task.http_request.headers) {
            warn!(queue = %self.queue, header = %header, "dropped reserved header set by hook");
        }
        Ok(draft)
    }

    /// Submit a pre-encoded body.
    pub async fn delay_body(&self, body: Option<Vec<u8>>) -> anyhow::Result<TaskHandle> {
        let request = self.build_request(body, Utc::now())?;
        debug!(
            queue = %self.queue,
            url = %request.task.http_request.url,
            task_id = ?request.task.task_id(),
            schedule_time = ?request.task.schedule_time,
            "built task draft"
        );

        if self.auto_create_queue {
            self.handle.ensure_exists(&self.queue).await?;
        }
        self.handle.submit(request, self.create_timeout).await
    }

    pub async fn delay<I: Serialize + ?Sized>(&self, input: &I) -> anyhow::Result<TaskHandle> {
        let body = encode_payload(input)?;
        self.delay_body(body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{chained_hook, HeaderHook, TaskHook};
    use crate::memory::MemoryQueue;

    fn delayer() -> Delayer {
        Delayer::new(
            TaskTarget::new("https://svc.example.com/_tasks/hello", HttpMethod::Post),
            QueueIdentity::new("p", "us-central1", "default").unwrap(),
            QueueHandle::new(Arc::new(MemoryQueue::new())),
        )
    }

    #[test]
    fn caller_content_type_is_replaced_not_duplicated() {
        let request = delayer()
            .with_options(ExecutionOptions::new().with_header("content-type", "text/plain"))
            .build_request(None, Utc::now())
            .unwrap();
        let headers = &request.task.http_request.headers;
        let content_types: Vec<_> = headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case("content-type"))
            .collect();
        assert_eq!(content_types.len(), 1);
        assert_eq!(content_types[0].1, "application/json");
    }

    #[test]
    fn hooks_cannot_set_reserved_headers() {
        let hooks: Vec<Arc<dyn TaskHook<CreateTaskRequest>>> = vec![
            Arc::new(HeaderHook::new("Authorization", "Bearer forged")),
            Arc::new(HeaderHook::new("X-CloudTasks-TaskRetryCount", "0")),
            Arc::new(HeaderHook::new("X-Tenant", "acme")),
        ];
        let request = delayer()
            .with_hook(Arc::new(chained_hook(hooks)))
            .build_request(None, Utc::now())
            .unwrap();
        let names: Vec<&str> = request
            .task
            .http_request
            .headers
            .keys()
            .map(String::as_str)
            .collect();
        assert_eq!(names, vec!["Content-Type", "X-Tenant"]);
    }
}
