use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::ensure::EnsureRegistry;
use crate::errors::{ErrorKind, TaskError};
use crate::paths::QueueIdentity;
use crate::task::{CreateTaskRequest, TaskHandle};

/// Result of a create-if-absent call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueCreation {
    Created,
    AlreadyExists,
}

/// Queue-management interface of the external task service.
///
/// Implementations map "already exists" on `create_queue` to
/// [`QueueCreation::AlreadyExists`] and a name collision on `create_task` to
/// a `DuplicateTask` [`TaskError`].
#[async_trait]
pub trait QueueClient: Send + Sync {
    async fn create_queue(&self, queue: &QueueIdentity) -> anyhow::Result<QueueCreation>;

    async fn create_task(&self, request: CreateTaskRequest) -> anyhow::Result<TaskHandle>;
}

/// Queue access with idempotent, cached queue creation.
#[derive(Clone)]
pub struct QueueHandle {
    client: Arc<dyn QueueClient>,
    registry: Arc<EnsureRegistry>,
}

impl QueueHandle {
    /// Uses the process-wide ensure registry.
    pub fn new(client: Arc<dyn QueueClient>) -> Self {
        Self::with_registry(client, EnsureRegistry::global())
    }

    pub fn with_registry(client: Arc<dyn QueueClient>, registry: Arc<EnsureRegistry>) -> Self {
        Self { client, registry }
    }

    pub fn client(&self) -> &Arc<dyn QueueClient> {
        &self.client
    }

    /// Create the queue unless this process already did. "Already exists"
    /// is success; any other failure is a `QueueCreationError` and is not
    /// cached.
    pub async fn ensure_exists(&self, queue: &QueueIdentity) -> anyhow::Result<()> {
        let path = queue.path();
        let ran = self
            .registry
            .ensure(&path, || async {
                match self.client.create_queue(queue).await {
                    Ok(QueueCreation::Created) => {
                        info!(queue = %path, "created task queue");
                        Ok(())
                    }
                    Ok(QueueCreation::AlreadyExists) => {
                        debug!(queue = %path, "task queue already exists");
                        Ok(())
                    }
                    Err(err) => {
                        warn!(queue = %path, error = %err, "task queue creation failed");
                        Err(TaskError::queue_creation(format!("could not ensure queue {path}"))
                            .with_source(err)
                            .into_anyhow())
                    }
                }
            })
            .await?;

        if !ran {
            debug!(queue = %path, "task queue ensured earlier in this process");
        }
        Ok(())
    }

    /// Hand a task to the queue. A client that does not answer within
    /// `timeout` is reported as `QueueUnavailable`.
    pub async fn submit(
        &self,
        request: CreateTaskRequest,
        timeout: Duration,
    ) -> anyhow::Result<TaskHandle> {
        let queue = request.parent.path();
        let task_id = request.task.task_id().map(str::to_string);

        let result = tokio::time::timeout(timeout, self.client.create_task(request))
            .await
            .map_err(|_| {
                TaskError::queue_unavailable(format!(
                    "queue {queue} did not accept the task within {}ms",
                    timeout.as_millis()
                ))
                .into_anyhow()
            })?;

        match result {
            Ok(handle) => {
                info!(queue = %queue, task = %handle.name, "task submitted");
                Ok(handle)
            }
            Err(err) => match TaskError::kind_of(&err) {
                Some(ErrorKind::DuplicateTask) => {
                    warn!(queue = %queue, task_id = ?task_id, "duplicate task rejected");
                    Err(err)
                }
                Some(_) => {
                    warn!(queue = %queue, error = %err, "task submission failed");
                    Err(err)
                }
                None => {
                    warn!(queue = %queue, error = %err, "task submission failed");
                    Err(TaskError::queue_unavailable(format!("queue {queue} rejected the task"))
                        .with_source(err)
                        .into_anyhow())
                }
            },
        }
    }
}
