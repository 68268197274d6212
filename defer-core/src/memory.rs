//! In-memory queue and scheduler backends.
//!
//! These behave like the managed services where it matters for callers:
//! queues must exist before tasks are accepted, a pending task name cannot
//! be reused, and jobs are stored by name. Used for local mode and tests.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::errors::TaskError;
use crate::job::{CreateJobRequest, JobDefinition};
use crate::paths::{JobIdentity, QueueIdentity};
use crate::queue::{QueueClient, QueueCreation};
use crate::scheduler::SchedulerClient;
use crate::task::{CreateTaskRequest, TaskHandle};

/// A task held by [`MemoryQueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredTask {
    pub name: String,
    pub request: CreateTaskRequest,
    pub due: DateTime<Utc>,
    pub retry_count: u32,
    pub execution_count: u32,
    pub previous_response: Option<u16>,
    leased: bool,
}

impl StoredTask {
    pub fn queue_name(&self) -> &str {
        self.request.parent.queue()
    }

    pub fn task_id(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }
}

#[derive(Debug, Default)]
pub struct MemoryQueue {
    queues: RwLock<HashSet<String>>,
    tasks: RwLock<BTreeMap<String, StoredTask>>,
    create_queue_calls: AtomicUsize,
    create_task_calls: AtomicUsize,
    unavailable: AtomicBool,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail as if the service were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn create_queue_calls(&self) -> usize {
        self.create_queue_calls.load(Ordering::SeqCst)
    }

    pub fn create_task_calls(&self) -> usize {
        self.create_task_calls.load(Ordering::SeqCst)
    }

    pub fn has_queue(&self, queue: &QueueIdentity) -> bool {
        self.queues.read().contains(&queue.path())
    }

    /// Pending tasks ordered by due time.
    pub fn pending(&self) -> Vec<StoredTask> {
        let mut tasks: Vec<StoredTask> = self.tasks.read().values().cloned().collect();
        tasks.sort_by(|a, b| a.due.cmp(&b.due).then_with(|| a.name.cmp(&b.name)));
        tasks
    }

    pub fn pending_count(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn get(&self, name: &str) -> Option<StoredTask> {
        self.tasks.read().get(name).cloned()
    }

    /// Lease every task due at `now`. Leased tasks stay pending (their
    /// names remain reserved) until completed or released.
    pub fn lease_due(&self, now: DateTime<Utc>) -> Vec<StoredTask> {
        let mut tasks = self.tasks.write();
        let mut due: Vec<StoredTask> = tasks
            .values_mut()
            .filter(|t| !t.leased && t.due <= now)
            .map(|t| {
                t.leased = true;
                t.clone()
            })
            .collect();
        due.sort_by(|a, b| a.due.cmp(&b.due));
        due
    }

    /// The task was acknowledged; forget it.
    pub fn complete(&self, name: &str) -> Option<StoredTask> {
        self.tasks.write().remove(name)
    }

    /// The delivery failed; make the task due again at `next_due`.
    pub fn release(&self, name: &str, status: Option<u16>, next_due: DateTime<Utc>) {
        if let Some(task) = self.tasks.write().get_mut(name) {
            task.leased = false;
            task.retry_count += 1;
            if status.is_some() {
                task.execution_count += 1;
            }
            task.previous_response = status;
            task.due = next_due;
        }
    }

    fn check_available(&self) -> anyhow::Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(TaskError::queue_unavailable("in-memory queue is unavailable").into_anyhow());
        }
        Ok(())
    }
}

#[async_trait]
impl QueueClient for MemoryQueue {
    async fn create_queue(&self, queue: &QueueIdentity) -> anyhow::Result<QueueCreation> {
        self.create_queue_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        if self.queues.write().insert(queue.path()) {
            Ok(QueueCreation::Created)
        } else {
            Ok(QueueCreation::AlreadyExists)
        }
    }

    async fn create_task(&self, request: CreateTaskRequest) -> anyhow::Result<TaskHandle> {
        self.create_task_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let queue = request.parent.path();
        if !self.queues.read().contains(&queue) {
            return Err(TaskError::queue_unavailable(format!("queue {queue} does not exist")).into_anyhow());
        }

        let name = request
            .task
            .name
            .clone()
            .unwrap_or_else(|| request.parent.task_path(&uuid::Uuid::new_v4().simple().to_string()));

        let mut tasks = self.tasks.write();
        if tasks.contains_key(&name) {
            return Err(TaskError::duplicate_task(format!("task {name} is already pending"))
                .with_data(serde_json::json!({ "task": name }))
                .into_anyhow());
        }

        let handle = TaskHandle {
            name: name.clone(),
            schedule_time: request.task.schedule_time,
        };
        let due = request.task.schedule_time.unwrap_or_else(Utc::now);
        tasks.insert(
            name.clone(),
            StoredTask {
                name,
                request,
                due,
                retry_count: 0,
                execution_count: 0,
                previous_response: None,
                leased: false,
            },
        );
        Ok(handle)
    }
}

#[derive(Debug, Default)]
pub struct MemoryScheduler {
    jobs: RwLock<BTreeMap<String, JobDefinition>>,
    calls: AtomicUsize,
    writes: AtomicUsize,
    unavailable: AtomicBool,
}

impl MemoryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Every call made against this scheduler.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Creates and updates only.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn job(&self, name: &JobIdentity) -> Option<JobDefinition> {
        self.jobs.read().get(&name.path()).cloned()
    }

    pub fn jobs(&self) -> Vec<JobDefinition> {
        self.jobs.read().values().cloned().collect()
    }

    fn enter(&self) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(TaskError::queue_unavailable("in-memory scheduler is unavailable").into_anyhow());
        }
        Ok(())
    }
}

#[async_trait]
impl SchedulerClient for MemoryScheduler {
    async fn get_job(&self, name: &JobIdentity) -> anyhow::Result<Option<JobDefinition>> {
        self.enter()?;
        Ok(self.job(name))
    }

    async fn create_job(&self, request: CreateJobRequest) -> anyhow::Result<JobDefinition> {
        self.enter()?;
        let path = request.job.name.path();
        let mut jobs = self.jobs.write();
        if jobs.contains_key(&path) {
            return Err(TaskError::duplicate_task(format!("job {path} already exists")).into_anyhow());
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        jobs.insert(path, request.job.clone());
        Ok(request.job)
    }

    async fn update_job(&self, job: JobDefinition) -> anyhow::Result<JobDefinition> {
        self.enter()?;
        let path = job.name.path();
        let mut jobs = self.jobs.write();
        if !jobs.contains_key(&path) {
            return Err(TaskError::not_found(format!("job {path} does not exist")).into_anyhow());
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        jobs.insert(path, job.clone());
        Ok(job)
    }

    async fn delete_job(&self, name: &JobIdentity) -> anyhow::Result<bool> {
        self.enter()?;
        Ok(self.jobs.write().remove(&name.path()).is_some())
    }
}
