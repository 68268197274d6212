mod handlers;
mod hooks;

use std::sync::Arc;

use anyhow::Result;
use defer_auth::{authenticator_for, CallbackAuthenticator, OidcOptions};
use defer_axum::{tasks, DelayedRoute, DelayedRouteBuilder, ScheduledRoute, ScheduledRouteBuilder, TaskApp};
use defer_core::{
    DeferConfigSnapshot, DeferSettings, JobOptions, MemoryQueue, MemoryScheduler, QueueClient,
    SchedulerClient,
};
use defer_gcp::{CloudSchedulerClient, CloudTasksClient};

pub use handlers::{Greeting, Tick};

/// Where tasks and jobs go, and who may call back.
pub struct Backends {
    pub queue: Arc<dyn QueueClient>,
    pub scheduler: Arc<dyn SchedulerClient>,
    pub authenticator: Arc<dyn CallbackAuthenticator>,
    /// Set in local mode; drained by a `LocalDispatcher`.
    pub local_queue: Option<Arc<MemoryQueue>>,
}

impl Backends {
    pub fn local() -> Self {
        let queue = Arc::new(MemoryQueue::new());
        Self {
            queue: queue.clone(),
            scheduler: Arc::new(MemoryScheduler::new()),
            authenticator: authenticator_for(true, OidcOptions::default()),
            local_queue: Some(queue),
        }
    }

    pub async fn connect(settings: &DeferSettings, snapshot: &DeferConfigSnapshot) -> Result<Self> {
        if settings.is_local {
            return Ok(Self::local());
        }
        Ok(Self {
            queue: Arc::new(CloudTasksClient::connect(settings.tasks_endpoint.as_deref()).await?),
            scheduler: Arc::new(
                CloudSchedulerClient::connect(settings.scheduler_endpoint.as_deref()).await?,
            ),
            authenticator: authenticator_for(false, OidcOptions::from_snapshot(snapshot)),
            local_queue: None,
        })
    }
}

pub struct Routes {
    pub hello: DelayedRoute<Greeting>,
    pub fail_twice: DelayedRoute<Greeting>,
    pub timed_hello: ScheduledRoute<Tick>,
}

pub struct Demo {
    pub app: TaskApp,
    pub routes: Routes,
    pub local_queue: Option<Arc<MemoryQueue>>,
}

impl Demo {
    /// Register the cron jobs this service owns.
    pub async fn register_schedules(&self) -> Result<()> {
        self.routes
            .timed_hello
            .scheduler(
                JobOptions::new("*/5 * * * *")
                    .with_name("testing-examples-scheduled-hello")
                    .with_time_zone("Asia/Kolkata")
                    .with_description("Says hello every five minutes"),
            )
            .schedule(&Tick {
                source: "scheduler".to_string(),
            })
            .await?;
        Ok(())
    }
}

pub fn build(settings: &DeferSettings, backends: Backends) -> Result<Demo> {
    let delayed = DelayedRouteBuilder::from_settings(
        settings,
        backends.queue,
        Arc::clone(&backends.authenticator),
    )?
    .with_hook(hooks::delayed_hooks(settings));

    let scheduled =
        ScheduledRouteBuilder::from_settings(settings, backends.scheduler, backends.authenticator)?
            .with_hook(hooks::scheduled_hooks(settings));

    let routes = Routes {
        hello: delayed.post("/delayed/hello", handlers::hello),
        fail_twice: delayed
            .post("/delayed/fail_twice", handlers::fail_twice)
            .with_max_retries(2),
        timed_hello: scheduled.post("/scheduled/timed_hello", handlers::timed_hello),
    };

    let app = tasks()
        .delayed(&routes.hello)
        .delayed(&routes.fail_twice)
        .scheduled(&routes.timed_hello)
        .merge(axum::Router::new().route("/health", axum::routing::get(|| async { "ok" })));

    Ok(Demo {
        app,
        routes,
        local_queue: backends.local_queue,
    })
}
