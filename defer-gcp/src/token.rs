//! Access tokens for the Google REST APIs.

use std::sync::Arc;

use async_trait::async_trait;
use defer_core::errors::TaskError;

pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Supplies the bearer token for outgoing API calls. `None` sends the
/// request unauthenticated, which is what emulators expect.
#[async_trait]
pub trait AccessTokenSource: Send + Sync {
    async fn access_token(&self) -> anyhow::Result<Option<String>>;
}

/// Application default credentials via `gcp_auth`.
pub struct GcpTokenSource {
    provider: Arc<dyn gcp_auth::TokenProvider>,
    scopes: Vec<&'static str>,
}

impl GcpTokenSource {
    pub fn new(provider: Arc<dyn gcp_auth::TokenProvider>) -> Self {
        Self {
            provider,
            scopes: vec![CLOUD_PLATFORM_SCOPE],
        }
    }

    /// Discover credentials from the environment (metadata server,
    /// `GOOGLE_APPLICATION_CREDENTIALS`, gcloud).
    pub async fn discover() -> anyhow::Result<Self> {
        let provider = gcp_auth::provider().await.map_err(|e| {
            TaskError::queue_unavailable(format!("failed to initialize GCP auth: {e}")).into_anyhow()
        })?;
        Ok(Self::new(provider))
    }

    pub fn with_scopes(mut self, scopes: Vec<&'static str>) -> Self {
        self.scopes = scopes;
        self
    }
}

#[async_trait]
impl AccessTokenSource for GcpTokenSource {
    async fn access_token(&self) -> anyhow::Result<Option<String>> {
        let token = self.provider.token(&self.scopes).await.map_err(|e| {
            TaskError::queue_unavailable(format!("failed to get GCP access token: {e}")).into_anyhow()
        })?;
        Ok(Some(token.as_str().to_string()))
    }
}

/// A fixed token, or none at all.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenSource(Option<String>);

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    pub fn anonymous() -> Self {
        Self(None)
    }
}

#[async_trait]
impl AccessTokenSource for StaticTokenSource {
    async fn access_token(&self) -> anyhow::Result<Option<String>> {
        Ok(self.0.clone())
    }
}

/// Plain-http endpoints are emulators and get no credentials; everything
/// else uses application default credentials.
pub async fn token_source_for(endpoint: Option<&str>) -> anyhow::Result<Arc<dyn AccessTokenSource>> {
    match endpoint {
        Some(endpoint) if endpoint.starts_with("http://") => Ok(Arc::new(StaticTokenSource::anonymous())),
        _ => Ok(Arc::new(GcpTokenSource::discover().await?)),
    }
}
