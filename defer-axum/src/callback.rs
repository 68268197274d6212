//! Guards execute endpoints so only the queue (or scheduler) can call them.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use defer_auth::CallbackAuthenticator;
use tracing::debug;

use crate::error::DeferAxumError;

#[derive(Clone)]
enum Audience {
    Fixed(Arc<str>),
    /// Base URL joined with the path each callback arrives on.
    RequestPath(Arc<str>),
}

/// Authenticator plus the audience expected for one execute route.
#[derive(Clone)]
pub struct CallbackGuard {
    authenticator: Arc<dyn CallbackAuthenticator>,
    audience: Audience,
}

impl CallbackGuard {
    pub fn new(authenticator: Arc<dyn CallbackAuthenticator>, audience: impl Into<String>) -> Self {
        Self {
            authenticator,
            audience: Audience::Fixed(Arc::from(audience.into())),
        }
    }

    /// For execute routes with path captures: each task targets its own
    /// URL, so the audience is `base_url` plus the request path.
    pub fn per_request_path(
        authenticator: Arc<dyn CallbackAuthenticator>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            authenticator,
            audience: Audience::RequestPath(Arc::from(base_url.into())),
        }
    }

    pub fn audience_for(&self, path: &str) -> String {
        match &self.audience {
            Audience::Fixed(audience) => audience.to_string(),
            Audience::RequestPath(base_url) => format!("{base_url}{path}"),
        }
    }
}

/// `from_fn_with_state` middleware. On success the verified
/// [`defer_auth::CallbackPrincipal`] is stored in the request extensions.
pub async fn verify_callback(
    State(guard): State<CallbackGuard>,
    mut request: Request,
    next: Next,
) -> Response {
    let headers = request.headers().clone();
    let audience = guard.audience_for(request.uri().path());
    match guard.authenticator.authenticate(&headers, &audience).await {
        Ok(principal) => {
            debug!(audience = %audience, local = principal.local, "callback authenticated");
            request.extensions_mut().insert(principal);
            next.run(request).await
        }
        Err(err) => DeferAxumError(err).into_response(),
    }
}
