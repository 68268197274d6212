// Callback authentication core.

use std::sync::Arc;

use async_trait::async_trait;
use defer_core::config::DeferConfigSnapshot;
use defer_core::errors::TaskError;
use http::HeaderMap;
use serde::Serialize;
use tracing::warn;

use crate::options::OidcOptions;
use crate::verifier::{Claims, Hs256Verifier, JwksVerifier, TokenVerifier};

pub fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let v = headers.get(http::header::AUTHORIZATION)?.to_str().ok()?;
    let v = v.trim();
    let prefix = "Bearer ";
    if v.len() <= prefix.len() || !v[..prefix.len()].eq_ignore_ascii_case(prefix) {
        return None;
    }
    Some(v[prefix.len()..].trim().to_string())
}

/// Who made the callback.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CallbackPrincipal {
    pub subject: Option<String>,
    pub email: Option<String>,
    pub issuer: Option<String>,
    /// Local mode; nothing was verified.
    pub local: bool,
}

impl From<Claims> for CallbackPrincipal {
    fn from(claims: Claims) -> Self {
        Self {
            subject: claims.sub,
            email: claims.email,
            issuer: Some(claims.iss),
            local: false,
        }
    }
}

/// Decides whether an inbound callback may reach a task handler.
///
/// `audience` is the execute URL of the route being called.
#[async_trait]
pub trait CallbackAuthenticator: Send + Sync {
    async fn authenticate(
        &self,
        headers: &HeaderMap,
        audience: &str,
    ) -> anyhow::Result<CallbackPrincipal>;
}

/// Local/offline mode. No queue infrastructure is trusted, so there is
/// nothing to verify.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalAuthenticator;

#[async_trait]
impl CallbackAuthenticator for LocalAuthenticator {
    async fn authenticate(
        &self,
        _headers: &HeaderMap,
        _audience: &str,
    ) -> anyhow::Result<CallbackPrincipal> {
        Ok(CallbackPrincipal {
            local: true,
            ..Default::default()
        })
    }
}

/// Verifies the `Authorization: Bearer <OIDC token>` the queue attaches.
pub struct OidcAuthenticator {
    verifier: Arc<dyn TokenVerifier>,
    options: OidcOptions,
}

impl OidcAuthenticator {
    pub fn new(verifier: Arc<dyn TokenVerifier>, options: OidcOptions) -> Self {
        Self { verifier, options }
    }

    /// Google JWKS, or HS256 when a shared secret is configured.
    pub fn from_options(options: OidcOptions) -> Self {
        let verifier: Arc<dyn TokenVerifier> = match &options.hs256_secret {
            Some(secret) => Arc::new(Hs256Verifier::new(secret.clone(), options.issuers.clone())),
            None => Arc::new(JwksVerifier::new(&options)),
        };
        Self::new(verifier, options)
    }

    fn check_allowlist(&self, principal: &CallbackPrincipal) -> anyhow::Result<()> {
        if !self.options.has_allowlist() {
            return Ok(());
        }
        let allowed = principal
            .email
            .as_deref()
            .is_some_and(|e| self.options.allowed_emails.contains(e))
            || principal
                .subject
                .as_deref()
                .is_some_and(|s| self.options.allowed_subjects.contains(s));
        if !allowed {
            return Err(TaskError::unauthorized("caller is not allowed to invoke tasks").into_anyhow());
        }
        Ok(())
    }
}

#[async_trait]
impl CallbackAuthenticator for OidcAuthenticator {
    async fn authenticate(
        &self,
        headers: &HeaderMap,
        audience: &str,
    ) -> anyhow::Result<CallbackPrincipal> {
        let Some(token) = extract_bearer_token(headers) else {
            warn!(audience, "callback rejected: missing bearer token");
            return Err(TaskError::unauthorized("missing bearer token").into_anyhow());
        };

        let claims = match self.verifier.verify(&token, audience).await {
            Ok(claims) => claims,
            Err(err) => {
                warn!(audience, error = %err, "callback rejected: token verification failed");
                return Err(TaskError::unauthorized("invalid identity token")
                    .with_source(err.into())
                    .into_anyhow());
            }
        };

        if claims.email.is_some() && claims.email_verified == Some(false) {
            warn!(audience, "callback rejected: unverified email");
            return Err(TaskError::unauthorized("identity token email is not verified").into_anyhow());
        }

        let principal = CallbackPrincipal::from(claims);
        if let Err(err) = self.check_allowlist(&principal) {
            warn!(audience, email = ?principal.email, subject = ?principal.subject, "callback rejected: principal not allowed");
            return Err(err);
        }
        Ok(principal)
    }
}

/// Pick the authenticator once, at startup.
pub fn authenticator_for(is_local: bool, options: OidcOptions) -> Arc<dyn CallbackAuthenticator> {
    if is_local {
        Arc::new(LocalAuthenticator)
    } else {
        Arc::new(OidcAuthenticator::from_options(options))
    }
}

/// Same as [`authenticator_for`], reading `local` and `auth.*` from config.
pub fn authenticator_from_config(snapshot: &DeferConfigSnapshot) -> Arc<dyn CallbackAuthenticator> {
    let is_local = snapshot.get_bool("local").unwrap_or(false);
    authenticator_for(is_local, OidcOptions::from_snapshot(snapshot))
}
