use std::sync::Arc;
use std::time::Duration;

use defer_core::{
    chained_hook, CreateJobRequest, CreateTaskRequest, DeadlineHook, DeferSettings, DelayedHook,
    OidcHook, ScheduledHook, TaskHook,
};

const MAX_DEADLINE: Duration = Duration::from_secs(30 * 60);

/// OIDC identity on every callback when a service account is configured;
/// dispatch deadlines capped at 30 minutes.
pub fn delayed_hooks(settings: &DeferSettings) -> DelayedHook {
    let mut hooks: Vec<Arc<dyn TaskHook<CreateTaskRequest>>> = Vec::new();
    if let Some(account) = &settings.service_account {
        hooks.push(Arc::new(OidcHook::new(account.clone())));
    }
    hooks.push(Arc::new(DeadlineHook::at_most(MAX_DEADLINE)));
    Arc::new(chained_hook(hooks))
}

pub fn scheduled_hooks(settings: &DeferSettings) -> ScheduledHook {
    let mut hooks: Vec<Arc<dyn TaskHook<CreateJobRequest>>> = Vec::new();
    if let Some(account) = &settings.service_account {
        hooks.push(Arc::new(OidcHook::new(account.clone())));
    }
    Arc::new(chained_hook(hooks))
}
