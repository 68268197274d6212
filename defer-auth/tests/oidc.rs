use std::sync::Arc;

use defer_auth::{
    authenticator_for, CallbackAuthenticator, Hs256Verifier, LocalAuthenticator,
    OidcAuthenticator, OidcOptions, TokenVerifier,
};
use defer_core::{ErrorKind, TaskError};
use http::{HeaderMap, HeaderValue};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::{json, Value};

const SECRET: &str = "test-secret";
const AUDIENCE: &str = "https://svc.example.com/_tasks/hello";
const ISSUER: &str = "https://accounts.google.com";

fn signed_token(secret: &str, claims: Value) -> String {
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

fn claims(aud: &str, email: &str) -> Value {
    json!({
        "iss": ISSUER,
        "aud": aud,
        "sub": "1234567890",
        "email": email,
        "email_verified": true,
        "exp": chrono::Utc::now().timestamp() + 600,
    })
}

fn bearer(token: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        http::header::AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
    );
    headers
}

fn options() -> OidcOptions {
    OidcOptions::default().with_hs256_secret(SECRET)
}

fn assert_unauthorized(result: anyhow::Result<defer_auth::CallbackPrincipal>) {
    let err = result.expect_err("callback should be rejected");
    assert_eq!(TaskError::kind_of(&err), Some(ErrorKind::Unauthorized));
}

#[tokio::test]
async fn valid_token_for_the_execute_url_passes() {
    let auth = OidcAuthenticator::from_options(options());
    let token = signed_token(SECRET, claims(AUDIENCE, "tasks@p.iam.gserviceaccount.com"));

    let principal = auth.authenticate(&bearer(&token), AUDIENCE).await.unwrap();
    assert_eq!(principal.email.as_deref(), Some("tasks@p.iam.gserviceaccount.com"));
    assert_eq!(principal.issuer.as_deref(), Some(ISSUER));
    assert!(!principal.local);
}

#[tokio::test]
async fn missing_token_is_unauthorized() {
    let auth = OidcAuthenticator::from_options(options());
    assert_unauthorized(auth.authenticate(&HeaderMap::new(), AUDIENCE).await);
}

#[tokio::test]
async fn token_for_another_route_is_unauthorized() {
    let auth = OidcAuthenticator::from_options(options());
    let token = signed_token(
        SECRET,
        claims("https://svc.example.com/_tasks/other", "tasks@p.iam.gserviceaccount.com"),
    );
    assert_unauthorized(auth.authenticate(&bearer(&token), AUDIENCE).await);
}

#[tokio::test]
async fn wrong_signature_is_unauthorized() {
    let auth = OidcAuthenticator::from_options(options());
    let token = signed_token("other-secret", claims(AUDIENCE, "tasks@p.iam.gserviceaccount.com"));
    assert_unauthorized(auth.authenticate(&bearer(&token), AUDIENCE).await);
}

#[tokio::test]
async fn wrong_issuer_is_unauthorized() {
    let auth = OidcAuthenticator::from_options(options());
    let mut c = claims(AUDIENCE, "tasks@p.iam.gserviceaccount.com");
    c["iss"] = json!("https://evil.example.com");
    assert_unauthorized(auth.authenticate(&bearer(&signed_token(SECRET, c)), AUDIENCE).await);
}

#[tokio::test]
async fn expired_token_is_unauthorized() {
    let auth = OidcAuthenticator::from_options(options());
    let mut c = claims(AUDIENCE, "tasks@p.iam.gserviceaccount.com");
    c["exp"] = json!(chrono::Utc::now().timestamp() - 3600);
    assert_unauthorized(auth.authenticate(&bearer(&signed_token(SECRET, c)), AUDIENCE).await);
}

#[tokio::test]
async fn allowlist_restricts_principals() {
    let auth = OidcAuthenticator::from_options(
        options().with_allowed_email("tasks@p.iam.gserviceaccount.com"),
    );

    let allowed = signed_token(SECRET, claims(AUDIENCE, "tasks@p.iam.gserviceaccount.com"));
    assert!(auth.authenticate(&bearer(&allowed), AUDIENCE).await.is_ok());

    let stranger = signed_token(SECRET, claims(AUDIENCE, "someone@else.com"));
    assert_unauthorized(auth.authenticate(&bearer(&stranger), AUDIENCE).await);
}

#[tokio::test]
async fn custom_verifiers_plug_in() {
    let verifier: Arc<dyn TokenVerifier> =
        Arc::new(Hs256Verifier::new(SECRET, vec![ISSUER.to_string()]));
    let auth = OidcAuthenticator::new(verifier, OidcOptions::default());
    let token = signed_token(SECRET, claims(AUDIENCE, "tasks@p.iam.gserviceaccount.com"));
    assert!(auth.authenticate(&bearer(&token), AUDIENCE).await.is_ok());
}

#[tokio::test]
async fn local_mode_skips_verification() {
    let auth = authenticator_for(true, options());
    let principal = auth.authenticate(&HeaderMap::new(), AUDIENCE).await.unwrap();
    assert!(principal.local);

    let direct = LocalAuthenticator.authenticate(&HeaderMap::new(), AUDIENCE).await.unwrap();
    assert_eq!(direct, principal);
}

#[tokio::test]
async fn non_local_mode_verifies() {
    let auth = authenticator_for(false, options());
    assert_unauthorized(auth.authenticate(&HeaderMap::new(), AUDIENCE).await);
}
