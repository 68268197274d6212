//! The execute endpoint shared by delayed and scheduled routes.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{rejection::RawPathParamsRejection, RawPathParams},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{on, MethodFilter, MethodRouter},
    Json,
};
use bytes::Bytes;
use defer_auth::CallbackAuthenticator;
use defer_core::delivery::{DeliveryContext, RetryBudget};
use defer_core::errors::{ErrorKind, TaskError};
use defer_core::task::HttpMethod;
use serde::de::DeserializeOwned;
use tracing::{error, info, warn};

use crate::callback::{verify_callback, CallbackGuard};
use crate::error::task_error_response;
use crate::handler::ErasedHandler;

pub const DEFAULT_EXECUTE_PREFIX: &str = "/_tasks";

pub(crate) fn method_filter(method: HttpMethod) -> MethodFilter {
    match method {
        HttpMethod::Get => MethodFilter::GET,
        HttpMethod::Post => MethodFilter::POST,
        HttpMethod::Put => MethodFilter::PUT,
        HttpMethod::Patch => MethodFilter::PATCH,
        HttpMethod::Delete => MethodFilter::DELETE,
        HttpMethod::Head => MethodFilter::HEAD,
        HttpMethod::Options => MethodFilter::OPTIONS,
    }
}

/// `/hello` stays as is, `hello/` becomes `/hello`.
pub(crate) fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// Base URL without a trailing slash. Only absolute http(s) URLs without
/// a query or fragment are accepted.
pub(crate) fn normalize_base_url(base_url: &str) -> anyhow::Result<String> {
    let parsed = url::Url::parse(base_url.trim()).map_err(|e| {
        TaskError::validation(format!("base url '{base_url}' is invalid: {e}")).into_anyhow()
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(
            TaskError::validation(format!("base url '{base_url}' must be http or https"))
                .into_anyhow(),
        );
    }
    if parsed.query().is_some() || parsed.fragment().is_some() {
        return Err(TaskError::validation(format!(
            "base url '{base_url}' must not carry a query or fragment"
        ))
        .into_anyhow());
    }
    Ok(parsed.as_str().trim_end_matches('/').to_string())
}

fn capture_name(segment: &str) -> Option<(&str, bool)> {
    let inner = segment.strip_prefix('{')?.strip_suffix('}')?;
    if inner.starts_with('{') {
        return None;
    }
    match inner.strip_prefix('*') {
        Some(name) => Some((name, true)),
        None => Some((inner, false)),
    }
}

/// Whether `path` has `{name}` or `{*name}` captures.
pub(crate) fn has_captures(path: &str) -> bool {
    path.split('/').any(|segment| capture_name(segment).is_some())
}

/// Decoded path segments of `template` with every capture filled from
/// `params`. A `{*name}` capture may span several segments.
pub(crate) fn render_segments(
    template: &str,
    params: &BTreeMap<String, String>,
) -> anyhow::Result<Vec<String>> {
    let mut segments = Vec::new();
    for segment in template.trim_start_matches('/').split('/') {
        let Some((name, wildcard)) = capture_name(segment) else {
            segments.push(segment.to_string());
            continue;
        };
        let value = params.get(name).ok_or_else(|| {
            TaskError::validation(format!("missing path parameter '{name}' for {template}"))
                .into_anyhow()
        })?;
        let parts: Vec<&str> = if wildcard {
            value.trim_start_matches('/').split('/').collect()
        } else {
            vec![value.as_str()]
        };
        for part in parts {
            if part.is_empty() || part == "." || part == ".." {
                return Err(TaskError::validation(format!(
                    "path parameter '{name}' has an unusable value '{value}'"
                ))
                .into_anyhow());
            }
            segments.push(part.to_string());
        }
    }
    Ok(segments)
}

/// `base_url` joined with `template`, captures filled from `params` and
/// percent-encoded. Templates without captures are joined as is.
pub(crate) fn render_execute_url(
    base_url: &str,
    template: &str,
    params: &BTreeMap<String, String>,
) -> anyhow::Result<String> {
    if !has_captures(template) {
        return Ok(format!("{base_url}{template}"));
    }
    let segments = render_segments(template, params)?;
    let mut url = url::Url::parse(base_url).map_err(|e| {
        TaskError::validation(format!("base url '{base_url}' is invalid: {e}")).into_anyhow()
    })?;
    url.path_segments_mut()
        .map_err(|_| {
            TaskError::validation(format!("base url '{base_url}' cannot carry a path")).into_anyhow()
        })?
        .pop_if_empty()
        .extend(&segments);
    Ok(url.to_string())
}

/// Guard for an execute path: a fixed audience, or one per request path
/// when the path has captures.
pub(crate) fn callback_guard(
    authenticator: Arc<dyn CallbackAuthenticator>,
    base_url: &str,
    execute_path: &str,
) -> CallbackGuard {
    if has_captures(execute_path) {
        CallbackGuard::per_request_path(authenticator, base_url)
    } else {
        CallbackGuard::new(authenticator, format!("{base_url}{execute_path}"))
    }
}

/// Captures of the matched route; routes without captures yield none.
pub(crate) fn collect_path_params(
    params: Result<RawPathParams, RawPathParamsRejection>,
) -> anyhow::Result<BTreeMap<String, String>> {
    match params {
        Ok(params) => Ok(params
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect()),
        Err(RawPathParamsRejection::MissingPathParams(_)) => Ok(BTreeMap::new()),
        Err(err) => Err(TaskError::validation(format!("invalid path parameters: {err}")).into_anyhow()),
    }
}

/// Empty bodies read as JSON `null`, so unit payloads need no body.
pub(crate) fn decode_input<I: DeserializeOwned>(body: &[u8]) -> anyhow::Result<I> {
    let body: &[u8] = if body.iter().all(u8::is_ascii_whitespace) {
        b"null"
    } else {
        body
    };
    serde_json::from_slice(body).map_err(|e| {
        TaskError::validation(format!("payload could not be decoded: {e}")).into_anyhow()
    })
}

/// Runs one handler for one delivery.
pub(crate) struct Executor<I> {
    pub(crate) route: Arc<str>,
    pub(crate) handler: ErasedHandler<I>,
    pub(crate) max_retries: Option<u32>,
}

impl<I> Clone for Executor<I> {
    fn clone(&self) -> Self {
        Self {
            route: Arc::clone(&self.route),
            handler: Arc::clone(&self.handler),
            max_retries: self.max_retries,
        }
    }
}

impl<I> Executor<I>
where
    I: DeserializeOwned + Send + 'static,
{
    pub(crate) async fn run(
        &self,
        headers: HeaderMap,
        path_params: BTreeMap<String, String>,
        body: Bytes,
    ) -> Response {
        let ctx = DeliveryContext::from_headers(&headers).with_path_params(path_params);
        let attempt = ctx.attempt();

        if let Some(max) = self.max_retries {
            if let Err(err) = RetryBudget::new(max).check(&ctx) {
                warn!(route = %self.route, attempt, max_retries = max, task = ?ctx.task_name, "retry budget exhausted, dropping task");
                return task_error_response(&TaskError::normalize(err));
            }
        }

        let input: I = match decode_input(&body) {
            Ok(input) => input,
            Err(err) => {
                warn!(route = %self.route, attempt, error = %err, "task payload rejected");
                return task_error_response(&TaskError::normalize(err));
            }
        };

        match (self.handler)(ctx.clone(), input).await {
            Ok(value) => {
                info!(route = %self.route, attempt, task = ?ctx.task_name, "task executed");
                (StatusCode::OK, Json(value)).into_response()
            }
            Err(err) => {
                let err = TaskError::normalize(err);
                if err.kind == ErrorKind::RetryBudgetExceeded {
                    warn!(route = %self.route, attempt, "handler gave up: {}", err.message);
                } else {
                    error!(route = %self.route, attempt, task = ?ctx.task_name, error = %err, "task failed");
                }
                task_error_response(&err)
            }
        }
    }

    /// Method router for the execute path, guarded by the authenticator.
    pub(crate) fn method_router(&self, method: HttpMethod, guard: CallbackGuard) -> MethodRouter
    where
        I: Send + Sync,
    {
        let executor = self.clone();
        let execute = move |params: Result<RawPathParams, RawPathParamsRejection>,
                            headers: HeaderMap,
                            body: Bytes| async move {
            match collect_path_params(params) {
                Ok(path_params) => executor.run(headers, path_params, body).await,
                Err(err) => task_error_response(&TaskError::normalize(err)),
            }
        };
        on(method_filter(method), execute)
            .route_layer(middleware::from_fn_with_state(guard, verify_callback))
    }
}
