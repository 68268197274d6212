use std::collections::BTreeSet;
use std::time::Duration;

use defer_core::config::DeferConfigSnapshot;

pub const GOOGLE_JWKS_URL: &str = "https://www.googleapis.com/oauth2/v3/certs";
pub const GOOGLE_ISSUERS: [&str; 2] = ["https://accounts.google.com", "accounts.google.com"];
pub const DEFAULT_JWKS_TTL: Duration = Duration::from_secs(300);

/// Settings for verifying callback identity tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OidcOptions {
    pub issuers: Vec<String>,
    /// When non-empty, only these token emails are accepted.
    pub allowed_emails: BTreeSet<String>,
    /// When non-empty, only these token subjects are accepted.
    pub allowed_subjects: BTreeSet<String>,
    pub jwks_url: String,
    pub jwks_cache_ttl: Duration,
    /// Shared-secret mode for development and tests.
    pub hs256_secret: Option<String>,
}

impl Default for OidcOptions {
    fn default() -> Self {
        Self {
            issuers: GOOGLE_ISSUERS.iter().map(|s| s.to_string()).collect(),
            allowed_emails: BTreeSet::new(),
            allowed_subjects: BTreeSet::new(),
            jwks_url: GOOGLE_JWKS_URL.to_string(),
            jwks_cache_ttl: DEFAULT_JWKS_TTL,
            hs256_secret: None,
        }
    }
}

impl OidcOptions {
    /// Reads the `auth.*` keys; anything absent keeps its default.
    pub fn from_snapshot(snapshot: &DeferConfigSnapshot) -> Self {
        let mut options = Self::default();

        let issuers = snapshot.get_list("auth.issuers");
        if !issuers.is_empty() {
            options.issuers = issuers;
        }
        options.allowed_emails = snapshot.get_list("auth.allowed_emails").into_iter().collect();
        options.allowed_subjects = snapshot
            .get_list("auth.allowed_subjects")
            .into_iter()
            .collect();
        // The identity the queue signs with is always acceptable.
        if let Some(account) = snapshot.get_string("auth.service_account") {
            if !options.allowed_emails.is_empty() {
                options.allowed_emails.insert(account);
            }
        }
        if let Some(url) = snapshot.get_string("auth.jwks_url") {
            options.jwks_url = url;
        }
        if let Some(ttl) = snapshot.get_u64("auth.jwks_cache_ttl_secs") {
            options.jwks_cache_ttl = Duration::from_secs(ttl);
        }
        options.hs256_secret = snapshot.get_string("auth.hs256_secret");
        options
    }

    pub fn with_allowed_email(mut self, email: impl Into<String>) -> Self {
        self.allowed_emails.insert(email.into());
        self
    }

    pub fn with_allowed_subject(mut self, subject: impl Into<String>) -> Self {
        self.allowed_subjects.insert(subject.into());
        self
    }

    pub fn with_issuers<I, S>(mut self, issuers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.issuers = issuers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_hs256_secret(mut self, secret: impl Into<String>) -> Self {
        self.hs256_secret = Some(secret.into());
        self
    }

    pub(crate) fn has_allowlist(&self) -> bool {
        !self.allowed_emails.is_empty() || !self.allowed_subjects.is_empty()
    }
}
