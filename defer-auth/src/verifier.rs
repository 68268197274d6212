//! Identity-token verification.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::jwk::{Jwk, JwkSet};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::options::OidcOptions;

/// Claims carried by a Google-signed OIDC token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub email_verified: Option<bool>,
    #[serde(default)]
    pub azp: Option<String>,
    pub exp: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("jwks refresh failed: {0}")]
    JwksRefresh(String),
}

/// Identity-verification interface: `verify(token, expected_audience)`.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str, audience: &str) -> Result<Claims, VerifyError>;
}

fn validation_for(algorithm: Algorithm, issuers: &[String], audience: &str) -> Validation {
    let mut validation = Validation::new(algorithm);
    validation.algorithms = vec![algorithm];
    validation.validate_nbf = true;
    validation.set_issuer(issuers);
    validation.set_audience(&[audience]);
    validation.set_required_spec_claims(&["exp", "iss", "aud"]);
    validation
}

/// Shared-secret verifier for development and tests.
pub struct Hs256Verifier {
    secret: String,
    issuers: Vec<String>,
}

impl Hs256Verifier {
    pub fn new(secret: impl Into<String>, issuers: Vec<String>) -> Self {
        Self {
            secret: secret.into(),
            issuers,
        }
    }
}

#[async_trait]
impl TokenVerifier for Hs256Verifier {
    async fn verify(&self, token: &str, audience: &str) -> Result<Claims, VerifyError> {
        let validation = validation_for(Algorithm::HS256, &self.issuers, audience);
        decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )
        .map(|data| data.claims)
        .map_err(|e| VerifyError::InvalidToken(e.to_string()))
    }
}

struct CachedJwks {
    set: Arc<JwkSet>,
    fetched_at: Instant,
}

impl CachedJwks {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() < ttl
    }
}

/// Verifies RS256/ES256 tokens against a JWKS endpoint (Google's by
/// default), caching the key set for `jwks_cache_ttl`.
pub struct JwksVerifier {
    jwks_url: String,
    issuers: Vec<String>,
    ttl: Duration,
    http: reqwest::Client,
    cache: RwLock<Option<CachedJwks>>,
}

impl JwksVerifier {
    pub fn new(options: &OidcOptions) -> Self {
        Self {
            jwks_url: options.jwks_url.clone(),
            issuers: options.issuers.clone(),
            ttl: options.jwks_cache_ttl,
            http: reqwest::Client::new(),
            cache: RwLock::new(None),
        }
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    async fn get_jwk(&self, kid: &str) -> Result<Option<Jwk>, VerifyError> {
        if let Some(jwk) = self.cached_jwk(kid).await {
            return Ok(Some(jwk));
        }

        // Unknown kid: keys may have rotated.
        self.refresh().await?;
        Ok(self.cached_jwk(kid).await)
    }

    async fn cached_jwk(&self, kid: &str) -> Option<Jwk> {
        let cache = self.cache.read().await;
        let set = match cache.as_ref() {
            Some(cached) if cached.is_fresh(self.ttl) => Arc::clone(&cached.set),
            _ => return None,
        };
        drop(cache);

        set.keys
            .iter()
            .find(|jwk| jwk.common.key_id.as_deref() == Some(kid))
            .cloned()
    }

    async fn refresh(&self) -> Result<(), VerifyError> {
        let set = self
            .http
            .get(&self.jwks_url)
            .send()
            .await
            .map_err(|e| VerifyError::JwksRefresh(e.to_string()))?
            .error_for_status()
            .map_err(|e| VerifyError::JwksRefresh(e.to_string()))?
            .json::<JwkSet>()
            .await
            .map_err(|e| VerifyError::JwksRefresh(e.to_string()))?;

        debug!(url = %self.jwks_url, keys = set.keys.len(), "refreshed jwks");
        *self.cache.write().await = Some(CachedJwks {
            set: Arc::new(set),
            fetched_at: Instant::now(),
        });
        Ok(())
    }
}

#[async_trait]
impl TokenVerifier for JwksVerifier {
    async fn verify(&self, token: &str, audience: &str) -> Result<Claims, VerifyError> {
        let header = decode_header(token).map_err(|e| VerifyError::InvalidToken(e.to_string()))?;
        let kid = header
            .kid
            .ok_or_else(|| VerifyError::InvalidToken("missing kid".to_string()))?;
        let algorithm = match header.alg {
            Algorithm::RS256 => Algorithm::RS256,
            Algorithm::ES256 => Algorithm::ES256,
            other => {
                return Err(VerifyError::InvalidToken(format!(
                    "unsupported algorithm: {other:?}"
                )))
            }
        };

        let jwk = self
            .get_jwk(&kid)
            .await?
            .ok_or_else(|| VerifyError::InvalidToken("unknown kid".to_string()))?;
        let key = DecodingKey::from_jwk(&jwk)
            .map_err(|e| VerifyError::InvalidToken(format!("invalid jwk: {e}")))?;

        let validation = validation_for(algorithm, &self.issuers, audience);
        decode::<Claims>(token, &key, &validation)
            .map(|data| data.claims)
            .map_err(|e| VerifyError::InvalidToken(e.to_string()))
    }
}
