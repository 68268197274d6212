//! # Hooks
//!
//! A hook is a pure mutator over an outgoing draft: it receives the draft
//! by value and returns the (possibly changed) draft. Hooks close over
//! construction-time data only, so one chain instance can serve concurrent
//! submissions.
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use defer_core::hooks::{chained_hook, DeadlineHook, DelayedHook, OidcHook};
//! use defer_core::task::CreateTaskRequest;
//!
//! let hook: DelayedHook = Arc::new(chained_hook::<CreateTaskRequest>(vec![
//!     Arc::new(OidcHook::new("tasks@my-project.iam.gserviceaccount.com")),
//!     Arc::new(DeadlineHook::new(Duration::from_secs(1800))),
//! ]));
//! # let _ = hook;
//! ```
//!
//! Ordering inside a [`ChainedHook`] is strictly left to right:
//! `chain([h1, h2]).apply(d) == h2.apply(h1.apply(d))`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::job::CreateJobRequest;
use crate::options::set_header;
use crate::task::{CreateTaskRequest, OAuthToken, OidcToken};

/// The parts of a task or job draft that hooks may touch.
pub trait HttpDraft {
    fn target_url(&self) -> &str;
    fn headers_mut(&mut self) -> &mut BTreeMap<String, String>;
    fn set_oidc_token(&mut self, token: OidcToken);
    fn set_oauth_token(&mut self, token: OAuthToken);
    fn deadline(&self) -> Option<Duration>;
    fn set_deadline(&mut self, deadline: Duration);
}

impl HttpDraft for CreateTaskRequest {
    fn target_url(&self) -> &str {
        &self.task.http_request.url
    }

    fn headers_mut(&mut self) -> &mut BTreeMap<String, String> {
        &mut self.task.http_request.headers
    }

    fn set_oidc_token(&mut self, token: OidcToken) {
        self.task.http_request.oidc_token = Some(token);
    }

    fn set_oauth_token(&mut self, token: OAuthToken) {
        self.task.http_request.oauth_token = Some(token);
    }

    fn deadline(&self) -> Option<Duration> {
        self.task.dispatch_deadline
    }

    fn set_deadline(&mut self, deadline: Duration) {
        self.task.dispatch_deadline = Some(deadline);
    }
}

impl HttpDraft for CreateJobRequest {
    fn target_url(&self) -> &str {
        &self.job.http_target.uri
    }

    fn headers_mut(&mut self) -> &mut BTreeMap<String, String> {
        &mut self.job.http_target.headers
    }

    fn set_oidc_token(&mut self, token: OidcToken) {
        self.job.http_target.oidc_token = Some(token);
    }

    fn set_oauth_token(&mut self, token: OAuthToken) {
        self.job.http_target.oauth_token = Some(token);
    }

    fn deadline(&self) -> Option<Duration> {
        self.job.attempt_deadline
    }

    fn set_deadline(&mut self, deadline: Duration) {
        self.job.attempt_deadline = Some(deadline);
    }
}

pub trait TaskHook<D>: Send + Sync {
    fn apply(&self, draft: D) -> D;
}

/// Hook applied to delayed task drafts.
pub type DelayedHook = Arc<dyn TaskHook<CreateTaskRequest>>;
/// Hook applied to scheduled job drafts.
pub type ScheduledHook = Arc<dyn TaskHook<CreateJobRequest>>;

/// Leaves the draft untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHook;

impl<D> TaskHook<D> for NoopHook {
    fn apply(&self, draft: D) -> D {
        draft
    }
}

/// Ordered composite of hooks. The empty chain is the identity.
pub struct ChainedHook<D> {
    hooks: Vec<Arc<dyn TaskHook<D>>>,
}

impl<D> ChainedHook<D> {
    pub fn new(hooks: Vec<Arc<dyn TaskHook<D>>>) -> Self {
        Self { hooks }
    }

    pub fn then(mut self, hook: Arc<dyn TaskHook<D>>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

impl<D> Default for ChainedHook<D> {
    fn default() -> Self {
        Self { hooks: Vec::new() }
    }
}

impl<D> Clone for ChainedHook<D> {
    fn clone(&self) -> Self {
        Self {
            hooks: self.hooks.clone(),
        }
    }
}

impl<D> TaskHook<D> for ChainedHook<D> {
    fn apply(&self, draft: D) -> D {
        self.hooks.iter().fold(draft, |draft, hook| hook.apply(draft))
    }
}

pub fn chained_hook<D>(hooks: Vec<Arc<dyn TaskHook<D>>>) -> ChainedHook<D> {
    ChainedHook::new(hooks)
}

/// Attach an OIDC identity token so the callback can be authenticated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OidcHook {
    service_account_email: String,
    audience: Option<String>,
}

impl OidcHook {
    /// Audience defaults to the draft's target URL.
    pub fn new(service_account_email: impl Into<String>) -> Self {
        Self {
            service_account_email: service_account_email.into(),
            audience: None,
        }
    }

    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }
}

impl<D: HttpDraft> TaskHook<D> for OidcHook {
    fn apply(&self, mut draft: D) -> D {
        let audience = self
            .audience
            .clone()
            .unwrap_or_else(|| draft.target_url().to_string());
        draft.set_oidc_token(OidcToken {
            service_account_email: self.service_account_email.clone(),
            audience: Some(audience),
        });
        draft
    }
}

/// Attach an OAuth access token, for targets that are Google APIs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthHook {
    service_account_email: String,
    scope: Option<String>,
}

impl OAuthHook {
    pub fn new(service_account_email: impl Into<String>) -> Self {
        Self {
            service_account_email: service_account_email.into(),
            scope: None,
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }
}

impl<D: HttpDraft> TaskHook<D> for OAuthHook {
    fn apply(&self, mut draft: D) -> D {
        draft.set_oauth_token(OAuthToken {
            service_account_email: self.service_account_email.clone(),
            scope: self.scope.clone(),
        });
        draft
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeadlineMode {
    Set,
    AtMost,
}

/// Set the dispatch/attempt deadline, or clamp it to a maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlineHook {
    duration: Duration,
    mode: DeadlineMode,
}

impl DeadlineHook {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            mode: DeadlineMode::Set,
        }
    }

    /// Lower any larger deadline to `duration`; fills it in when unset.
    pub fn at_most(duration: Duration) -> Self {
        Self {
            duration,
            mode: DeadlineMode::AtMost,
        }
    }
}

impl<D: HttpDraft> TaskHook<D> for DeadlineHook {
    fn apply(&self, mut draft: D) -> D {
        let deadline = match (self.mode, draft.deadline()) {
            (DeadlineMode::AtMost, Some(current)) => current.min(self.duration),
            _ => self.duration,
        };
        draft.set_deadline(deadline);
        draft
    }
}

/// Add or override a single named header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderHook {
    name: String,
    value: String,
}

impl HeaderHook {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl<D: HttpDraft> TaskHook<D> for HeaderHook {
    fn apply(&self, mut draft: D) -> D {
        set_header(draft.headers_mut(), self.name.clone(), self.value.clone());
        draft
    }
}
