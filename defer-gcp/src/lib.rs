//! defer-gcp: Google Cloud Tasks and Cloud Scheduler backends for
//! `defer-core`, plus a [`LocalDispatcher`] for running without them.

pub mod local;
pub mod scheduler;
pub mod tasks;
pub mod token;
pub mod wire;

pub use local::{DeliveryOutcome, LocalDispatchConfig, LocalDispatcher};
pub use scheduler::{CloudSchedulerClient, CLOUD_SCHEDULER_ENDPOINT};
pub use tasks::{CloudTasksClient, CLOUD_TASKS_ENDPOINT};
pub use token::{token_source_for, AccessTokenSource, GcpTokenSource, StaticTokenSource};
