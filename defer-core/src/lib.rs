//! defer-core: framework-agnostic core for deferring HTTP handlers to a
//! managed task queue.
//!
//! A delayed call becomes a [`CreateTaskRequest`] that targets the route's
//! execute endpoint; a scheduled route becomes a [`CreateJobRequest`]
//! registered once. Both pass through a [`hooks::TaskHook`] chain before
//! they reach the external service.

pub mod config;
pub mod delayer;
pub mod delivery;
pub mod ensure;
pub mod errors;
pub mod hooks;
pub mod job;
pub mod memory;
pub mod options;
pub mod paths;
pub mod queue;
pub mod schedule;
pub mod scheduler;
pub mod task;

pub use config::{load_env_config, DeferConfig, DeferConfigSnapshot, DeferSettings};
pub use delayer::{encode_payload, Delayer, TaskTarget};
pub use delivery::{max_retries, DeliveryContext, RetryBudget};
pub use ensure::EnsureRegistry;
pub use errors::{ErrorKind, TaskError, TaskResult};
pub use hooks::{
    chained_hook, ChainedHook, DeadlineHook, DelayedHook, HeaderHook, HttpDraft, NoopHook,
    OAuthHook, OidcHook, ScheduledHook, TaskHook,
};
pub use job::{CreateJobRequest, HttpTarget, JobDefinition, JobHandle, JobOutcome, RetryConfig};
pub use memory::{MemoryQueue, MemoryScheduler, StoredTask};
pub use options::ExecutionOptions;
pub use paths::{JobIdentity, LocationPath, QueueIdentity};
pub use queue::{QueueClient, QueueCreation, QueueHandle};
pub use schedule::{validate_schedule, CronSchedule};
pub use scheduler::{JobOptions, JobRegistrar, JobScheduler, SchedulerClient};
pub use task::{CreateTaskRequest, HttpMethod, HttpRequest, OAuthToken, OidcToken, TaskDefinition, TaskHandle};
