use std::sync::Arc;
use std::time::Duration;

use defer_core::hooks::{chained_hook, DeadlineHook, HeaderHook, NoopHook, OidcHook, TaskHook};
use defer_core::{CreateJobRequest, CreateTaskRequest, HttpMethod, HttpRequest, HttpTarget};
use defer_core::{JobDefinition, LocationPath, QueueIdentity, RetryConfig, TaskDefinition};
use proptest::prelude::*;

type Hook = Arc<dyn TaskHook<CreateTaskRequest>>;

fn draft() -> CreateTaskRequest {
    let mut request = HttpRequest::new("https://svc.example.com/_tasks/hello", HttpMethod::Post);
    request
        .headers
        .insert("Content-Type".to_string(), "application/json".to_string());
    request
        .headers
        .insert("X-Caller".to_string(), "kept".to_string());
    CreateTaskRequest {
        parent: QueueIdentity::new("p", "l", "q").unwrap(),
        task: TaskDefinition::new(request),
    }
}

fn job_draft() -> CreateJobRequest {
    let location = LocationPath::new("p", "l").unwrap();
    CreateJobRequest {
        parent: location.clone(),
        job: JobDefinition {
            name: location.job("post-scheduled-timed_hello").unwrap(),
            description: None,
            schedule: "*/5 * * * *".to_string(),
            time_zone: "UTC".to_string(),
            http_target: HttpTarget::new("https://svc.example.com/_tasks/timed", HttpMethod::Post),
            retry_config: RetryConfig::default(),
            attempt_deadline: None,
        },
    }
}

#[derive(Debug, Clone)]
enum HookStep {
    Header(String, String),
    Deadline(u64),
    AtMost(u64),
    Noop,
}

impl HookStep {
    fn build(&self) -> Hook {
        match self {
            HookStep::Header(name, value) => Arc::new(HeaderHook::new(name.clone(), value.clone())),
            HookStep::Deadline(secs) => Arc::new(DeadlineHook::new(Duration::from_secs(*secs))),
            HookStep::AtMost(secs) => Arc::new(DeadlineHook::at_most(Duration::from_secs(*secs))),
            HookStep::Noop => Arc::new(NoopHook),
        }
    }
}

fn hook_step() -> impl Strategy<Value = HookStep> {
    prop_oneof![
        ("X-[A-C]", "[a-z]{1,4}").prop_map(|(n, v)| HookStep::Header(n, v)),
        (15u64..1800).prop_map(HookStep::Deadline),
        (15u64..1800).prop_map(HookStep::AtMost),
        Just(HookStep::Noop),
    ]
}

proptest! {
    #[test]
    fn chain_applies_hooks_left_to_right(steps in prop::collection::vec(hook_step(), 0..6)) {
        let hooks: Vec<Hook> = steps.iter().map(HookStep::build).collect();
        let chained = chained_hook(hooks.clone()).apply(draft());
        let folded = hooks.iter().fold(draft(), |d, h| h.apply(d));
        prop_assert_eq!(chained, folded);
    }

    #[test]
    fn chain_never_drops_caller_headers(steps in prop::collection::vec(hook_step(), 0..6)) {
        let hooks: Vec<Hook> = steps.iter().map(HookStep::build).collect();
        let out = chained_hook(hooks).apply(draft());
        prop_assert_eq!(out.task.http_request.headers.get("X-Caller").map(String::as_str), Some("kept"));
        prop_assert!(out.task.http_request.headers.contains_key("Content-Type"));
    }

    #[test]
    fn reapplying_a_chain_is_idempotent(steps in prop::collection::vec(hook_step(), 0..6)) {
        let chain = chained_hook(steps.iter().map(HookStep::build).collect::<Vec<Hook>>());
        let once = chain.apply(draft());
        let twice = chain.apply(once.clone());
        prop_assert_eq!(once, twice);
    }
}

#[test]
fn empty_chain_is_identity() {
    let chain = chained_hook::<CreateTaskRequest>(Vec::new());
    assert!(chain.is_empty());
    assert_eq!(chain.apply(draft()), draft());
}

#[test]
fn later_hooks_win_on_the_same_header() {
    let chain = chained_hook::<CreateTaskRequest>(vec![
        Arc::new(HeaderHook::new("X-Stage", "first")),
        Arc::new(HeaderHook::new("x-stage", "second")),
    ]);
    let out = chain.apply(draft());
    assert_eq!(out.task.http_request.headers["X-Stage"], "second");
    assert!(!out.task.http_request.headers.contains_key("x-stage"));
}

#[test]
fn oidc_audience_defaults_to_target_url() {
    let out = OidcHook::new("tasks@p.iam.gserviceaccount.com").apply(draft());
    let token = out.task.http_request.oidc_token.expect("token attached");
    assert_eq!(token.service_account_email, "tasks@p.iam.gserviceaccount.com");
    assert_eq!(
        token.audience.as_deref(),
        Some("https://svc.example.com/_tasks/hello")
    );
}

#[test]
fn deadline_clamp_only_lowers() {
    let mut d = draft();
    d.task.dispatch_deadline = Some(Duration::from_secs(60));
    let out = DeadlineHook::at_most(Duration::from_secs(1800)).apply(d);
    assert_eq!(out.task.dispatch_deadline, Some(Duration::from_secs(60)));

    let out = DeadlineHook::at_most(Duration::from_secs(30)).apply(out);
    assert_eq!(out.task.dispatch_deadline, Some(Duration::from_secs(30)));
}

#[test]
fn same_hooks_decorate_job_drafts() {
    let chain = chained_hook::<CreateJobRequest>(vec![
        Arc::new(OidcHook::new("scheduler@p.iam.gserviceaccount.com")),
        Arc::new(DeadlineHook::new(Duration::from_secs(600))),
    ]);
    let out = chain.apply(job_draft());
    assert_eq!(out.job.attempt_deadline, Some(Duration::from_secs(600)));
    assert_eq!(
        out.job.http_target.oidc_token.unwrap().audience.as_deref(),
        Some("https://svc.example.com/_tasks/timed")
    );
}
