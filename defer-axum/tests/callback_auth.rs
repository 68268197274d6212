use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::http::Request;
use axum::routing::post;
use axum::{middleware, Json, Router};
use defer_auth::{OidcAuthenticator, OidcOptions};
use defer_axum::{tasks, verify_callback, CallbackGuard, DelayedRouteBuilder, VerifiedCaller};
use defer_core::{EnsureRegistry, MemoryQueue, QueueIdentity};
use http_body_util::BodyExt;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::{json, Value};
use tower::ServiceExt;

const SECRET: &str = "callback-secret";
const EXECUTE_URL: &str = "https://svc.example.com/_tasks/hello";

fn token(aud: &str) -> String {
    let claims = json!({
        "iss": "https://accounts.google.com",
        "aud": aud,
        "sub": "1234567890",
        "email": "tasks@p.iam.gserviceaccount.com",
        "email_verified": true,
        "exp": chrono::Utc::now().timestamp() + 600,
    });
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

fn execute_request(uri: &str, bearer: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(token) = bearer {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::from(json!({ "name": "ada" }).to_string())).unwrap()
}

async fn json_body(res: axum::response::Response) -> Value {
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn guarded_app(calls: Arc<AtomicUsize>) -> Router {
    let identity = QueueIdentity::new("p", "us-central1", "default").unwrap();
    let authenticator = OidcAuthenticator::from_options(OidcOptions::default().with_hs256_secret(SECRET));
    let route = DelayedRouteBuilder::new("https://svc.example.com", identity, Arc::new(MemoryQueue::new()))
        .unwrap()
        .with_authenticator(Arc::new(authenticator))
        .with_registry(Arc::new(EnsureRegistry::new()))
        .post("/hello", move |input: Value| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(input)
            }
        });
    tasks().delayed(&route).into_router()
}

#[tokio::test]
async fn missing_token_is_rejected_before_the_handler() {
    let calls = Arc::new(AtomicUsize::new(0));
    let res = guarded_app(calls.clone())
        .oneshot(execute_request("/_tasks/hello", None))
        .await
        .unwrap();

    assert_eq!(res.status().as_u16(), 401);
    assert_eq!(json_body(res).await["name"], "Unauthorized");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn token_for_the_execute_url_is_accepted() {
    let calls = Arc::new(AtomicUsize::new(0));
    let res = guarded_app(calls.clone())
        .oneshot(execute_request("/_tasks/hello", Some(&token(EXECUTE_URL))))
        .await
        .unwrap();

    assert_eq!(res.status().as_u16(), 200);
    assert_eq!(json_body(res).await, json!({ "name": "ada" }));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn token_for_another_route_is_rejected() {
    let calls = Arc::new(AtomicUsize::new(0));
    let res = guarded_app(calls.clone())
        .oneshot(execute_request(
            "/_tasks/hello",
            Some(&token("https://svc.example.com/_tasks/other")),
        ))
        .await
        .unwrap();

    assert_eq!(res.status().as_u16(), 401);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn submit_endpoint_is_not_guarded() {
    let calls = Arc::new(AtomicUsize::new(0));
    let res = guarded_app(calls.clone())
        .oneshot(execute_request("/hello", None))
        .await
        .unwrap();

    assert_eq!(res.status().as_u16(), 202);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn hand_written_routes_can_use_the_guard() {
    let authenticator = OidcAuthenticator::from_options(OidcOptions::default().with_hs256_secret(SECRET));
    let guard = CallbackGuard::new(Arc::new(authenticator), EXECUTE_URL);
    let router = Router::new()
        .route(
            "/_tasks/hello",
            post(|VerifiedCaller(principal): VerifiedCaller| async move { Json(principal) }),
        )
        .route_layer(middleware::from_fn_with_state(guard, verify_callback));

    let res = router
        .oneshot(execute_request("/_tasks/hello", Some(&token(EXECUTE_URL))))
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 200);
    let body = json_body(res).await;
    assert_eq!(body["email"], "tasks@p.iam.gserviceaccount.com");
    assert_eq!(body["local"], false);
}

#[tokio::test]
async fn captured_routes_expect_the_delivered_url_as_audience() {
    let identity = QueueIdentity::new("p", "us-central1", "default").unwrap();
    let authenticator = OidcAuthenticator::from_options(OidcOptions::default().with_hs256_secret(SECRET));
    let route = DelayedRouteBuilder::new("https://svc.example.com", identity, Arc::new(MemoryQueue::new()))
        .unwrap()
        .with_authenticator(Arc::new(authenticator))
        .with_registry(Arc::new(EnsureRegistry::new()))
        .post("/items/{id}", |input: Value| async move { Ok::<_, anyhow::Error>(input) });
    let app = tasks().delayed(&route).into_router();

    let good = token("https://svc.example.com/_tasks/items/42");
    let res = app
        .clone()
        .oneshot(execute_request("/_tasks/items/42", Some(&good)))
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 200);

    let other_item = token("https://svc.example.com/_tasks/items/43");
    let res = app
        .oneshot(execute_request("/_tasks/items/42", Some(&other_item)))
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 401);
}
