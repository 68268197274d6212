//! Extractors for hand-written callback handlers.

use std::convert::Infallible;
use std::ops::Deref;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use defer_auth::CallbackPrincipal;
use defer_core::delivery::{DeliveryContext, RetryBudget};
use defer_core::errors::TaskError;

use crate::error::DeferAxumError;

/// Cloud Tasks / Cloud Scheduler delivery headers. Never rejects; missing
/// or malformed headers read as defaults (attempt 1).
#[derive(Debug, Clone, Default)]
pub struct CloudTasksHeaders(pub DeliveryContext);

impl Deref for CloudTasksHeaders {
    type Target = DeliveryContext;

    fn deref(&self) -> &DeliveryContext {
        &self.0
    }
}

impl<S> FromRequestParts<S> for CloudTasksHeaders
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(DeliveryContext::from_headers(&parts.headers)))
    }
}

/// Rejects with `RetryBudgetExceeded` once the attempt number passes `N`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MaxRetries<const N: u32>;

impl<S, const N: u32> FromRequestParts<S> for MaxRetries<N>
where
    S: Send + Sync,
{
    type Rejection = DeferAxumError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let ctx = DeliveryContext::from_headers(&parts.headers);
        RetryBudget::new(N).check(&ctx)?;
        Ok(Self)
    }
}

/// The principal [`crate::callback::verify_callback`] accepted.
#[derive(Debug, Clone)]
pub struct VerifiedCaller(pub CallbackPrincipal);

impl<S> FromRequestParts<S> for VerifiedCaller
where
    S: Send + Sync,
{
    type Rejection = DeferAxumError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CallbackPrincipal>()
            .cloned()
            .map(Self)
            .ok_or_else(|| TaskError::unauthorized("callback was not authenticated").into())
    }
}
