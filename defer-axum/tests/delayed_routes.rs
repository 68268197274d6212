use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::http::Request;
use defer_auth::LocalAuthenticator;
use defer_axum::{tasks, DelayedRouteBuilder, SubmitAck};
use defer_core::delivery::RETRY_COUNT_HEADER;
use defer_core::{
    DeliveryContext, EnsureRegistry, ExecutionOptions, MemoryQueue, QueueIdentity, TaskError,
};
use http_body_util::BodyExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower::ServiceExt;

const BASE_URL: &str = "https://svc.example.com";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Greeting {
    name: String,
}

async fn hello(input: Greeting) -> anyhow::Result<Value> {
    Ok(json!({ "message": format!("hello {}", input.name) }))
}

async fn boom(_input: Greeting) -> anyhow::Result<Value> {
    Err(anyhow::anyhow!("boom"))
}

async fn ping() -> anyhow::Result<&'static str> {
    Ok("pong")
}

fn builder(queue: Arc<MemoryQueue>) -> DelayedRouteBuilder {
    let identity = QueueIdentity::new("p", "us-central1", "default").unwrap();
    DelayedRouteBuilder::new(BASE_URL, identity, queue)
        .unwrap()
        .with_authenticator(Arc::new(LocalAuthenticator))
        .with_registry(Arc::new(EnsureRegistry::new()))
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(res: axum::response::Response) -> Value {
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn submit_enqueues_a_task_for_the_execute_url() {
    let queue = Arc::new(MemoryQueue::new());
    let route = builder(queue.clone()).post("/hello", hello);
    assert_eq!(route.execute_url(), "https://svc.example.com/_tasks/hello");

    let res = tasks()
        .delayed(&route)
        .into_router()
        .oneshot(post("/hello", json!({ "name": "ada" })))
        .await
        .unwrap();

    assert_eq!(res.status().as_u16(), 202);
    assert!(res.headers().get("x-request-id").is_some());
    let ack: SubmitAck = serde_json::from_value(json_body(res).await).unwrap();
    assert_eq!(ack.queue, "projects/p/locations/us-central1/queues/default");
    assert!(ack.schedule_time.is_none());

    let pending = queue.pending();
    assert_eq!(pending.len(), 1);
    let http = &pending[0].request.task.http_request;
    assert_eq!(http.url, "https://svc.example.com/_tasks/hello");
    assert_eq!(http.headers.get("Content-Type").map(String::as_str), Some("application/json"));
    let body: Greeting = serde_json::from_slice(http.body.as_deref().unwrap()).unwrap();
    assert_eq!(body, Greeting { name: "ada".into() });
    assert_eq!(pending[0].name, ack.task_name);
    assert_eq!(queue.create_queue_calls(), 1);
}

#[tokio::test]
async fn submit_honors_countdown_and_task_id() {
    let queue = Arc::new(MemoryQueue::new());
    let route = builder(queue.clone()).post("/hello", hello);
    let router = tasks().delayed(&route).into_router();

    let res = router
        .clone()
        .oneshot(post("/hello?countdown=60&task_id=abc", json!({ "name": "ada" })))
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 202);
    let ack: SubmitAck = serde_json::from_value(json_body(res).await).unwrap();
    assert_eq!(ack.task_id, "abc");
    assert!(ack.schedule_time.is_some());

    let res = router
        .oneshot(post("/hello?task_id=abc", json!({ "name": "ada" })))
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 409);
    let body = json_body(res).await;
    assert_eq!(body["name"], "DuplicateTask");
    assert_eq!(queue.pending_count(), 1);
}

#[tokio::test]
async fn invalid_submissions_never_reach_the_queue() {
    let queue = Arc::new(MemoryQueue::new());
    let route = builder(queue.clone()).post("/hello", hello);
    let router = tasks().delayed(&route).into_router();

    let res = router
        .clone()
        .oneshot(post("/hello?countdown=-5", json!({ "name": "ada" })))
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 400);
    assert_eq!(json_body(res).await["name"], "ValidationError");

    for countdown in ["9223372036854775807", "10000000000000", "2592001"] {
        let res = router
            .clone()
            .oneshot(post(&format!("/hello?countdown={countdown}"), json!({ "name": "ada" })))
            .await
            .unwrap();
        assert_eq!(res.status().as_u16(), 400, "countdown={countdown}");
        assert_eq!(json_body(res).await["name"], "ValidationError");
    }

    let res = router
        .clone()
        .oneshot(post("/hello?countdown=soon", json!({ "name": "ada" })))
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 400);

    let res = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/hello")
                .body(Body::from("{\"name\":"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 400);
    assert_eq!(queue.create_task_calls(), 0);
}

#[tokio::test]
async fn queue_outage_surfaces_as_unavailable() {
    let queue = Arc::new(MemoryQueue::new());
    queue.set_unavailable(true);
    let route = builder(queue.clone()).post("/hello", hello);

    let res = tasks()
        .delayed(&route)
        .into_router()
        .oneshot(post("/hello", json!({ "name": "ada" })))
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 503);
}

#[tokio::test]
async fn execute_runs_the_handler() {
    let queue = Arc::new(MemoryQueue::new());
    let route = builder(queue).post("/hello", hello);

    let res = tasks()
        .delayed(&route)
        .into_router()
        .oneshot(post("/_tasks/hello", json!({ "name": "ada" })))
        .await
        .unwrap();

    assert_eq!(res.status().as_u16(), 200);
    assert!(res.headers().get("x-request-id").is_some());
    assert_eq!(json_body(res).await, json!({ "message": "hello ada" }));
}

#[tokio::test]
async fn handler_failures_are_retry_eligible() {
    let queue = Arc::new(MemoryQueue::new());
    let route = builder(queue).post("/boom", boom);

    let res = tasks()
        .delayed(&route)
        .into_router()
        .oneshot(post("/_tasks/boom", json!({ "name": "ada" })))
        .await
        .unwrap();

    assert_eq!(res.status().as_u16(), 500);
    let body = json_body(res).await;
    assert_eq!(body["name"], "HandlerError");
    assert_eq!(body["message"], "boom");
}

#[tokio::test]
async fn bad_execute_payload_is_a_validation_error() {
    let queue = Arc::new(MemoryQueue::new());
    let route = builder(queue).post("/hello", hello);

    let res = tasks()
        .delayed(&route)
        .into_router()
        .oneshot(post("/_tasks/hello", json!({ "nom": 1 })))
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 400);
}

#[tokio::test]
async fn retry_budget_stops_redelivery() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let queue = Arc::new(MemoryQueue::new());
    let route = builder(queue)
        .post("/flaky", move |ctx: DeliveryContext, _input: Greeting| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(json!({ "attempt": ctx.attempt() }))
            }
        })
        .with_max_retries(2);
    let router = tasks().delayed(&route).into_router();

    let delivery = |retry_count: u32| {
        Request::builder()
            .method("POST")
            .uri("/_tasks/flaky")
            .header(RETRY_COUNT_HEADER, retry_count.to_string())
            .body(Body::from(json!({ "name": "ada" }).to_string()))
            .unwrap()
    };

    let res = router.clone().oneshot(delivery(1)).await.unwrap();
    assert_eq!(res.status().as_u16(), 200);
    assert_eq!(json_body(res).await["attempt"], 2);

    let res = router.oneshot(delivery(2)).await.unwrap();
    assert_eq!(res.status().as_u16(), 200);
    let body = json_body(res).await;
    assert_eq!(body["name"], "RetryBudgetExceeded");
    assert_eq!(body["data"]["attempt"], 3);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unit_routes_need_no_body() {
    let queue = Arc::new(MemoryQueue::new());
    let route = builder(queue.clone()).get("/ping", ping);

    let res = tasks()
        .delayed(&route)
        .into_router()
        .oneshot(Request::builder().uri("/_tasks/ping").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 200);
    assert_eq!(json_body(res).await, json!("pong"));

    route.delay(&()).await.unwrap();
    assert!(queue.pending()[0].request.task.http_request.body.is_none());
}

#[tokio::test]
async fn programmatic_delay_merges_options() {
    let queue = Arc::new(MemoryQueue::new());
    let route = builder(queue.clone())
        .post("/hello", hello)
        .with_default_options(ExecutionOptions::new().with_header("X-Tenant", "acme"));

    let handle = route
        .options(ExecutionOptions::new().with_task_id("welcome-ada").with_countdown(30))
        .delay(&Greeting { name: "ada".into() })
        .await
        .unwrap();

    assert_eq!(handle.task_id(), "welcome-ada");
    let task = queue.get(&handle.name).unwrap();
    assert_eq!(
        task.request.task.http_request.headers.get("X-Tenant").map(String::as_str),
        Some("acme")
    );
    assert!(task.request.task.schedule_time.is_some());

    let err = route
        .options(ExecutionOptions::new().with_task_id("welcome-ada"))
        .delay(&Greeting { name: "ada".into() })
        .await
        .unwrap_err();
    assert_eq!(TaskError::kind_of(&err), Some(defer_core::ErrorKind::DuplicateTask));
}

#[tokio::test]
async fn execute_prefix_is_configurable() {
    let queue = Arc::new(MemoryQueue::new());
    let route = builder(queue)
        .with_execute_prefix("/internal/")
        .post("hello", hello);

    assert_eq!(route.path(), "/hello");
    assert_eq!(route.execute_path(), "/internal/hello");
    assert_eq!(route.execute_url(), "https://svc.example.com/internal/hello");
}

async fn rename_item(ctx: DeliveryContext, input: Greeting) -> anyhow::Result<Value> {
    Ok(json!({ "item": ctx.path_param("id"), "name": input.name }))
}

#[tokio::test]
async fn path_captures_are_filled_into_the_task_url() {
    let queue = Arc::new(MemoryQueue::new());
    let route = builder(queue.clone()).post("/items/{id}", rename_item);
    assert_eq!(route.execute_path(), "/_tasks/items/{id}");

    let res = tasks()
        .delayed(&route)
        .into_router()
        .oneshot(post("/items/a%20b", json!({ "name": "ada" })))
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 202);

    let pending = queue.pending();
    assert_eq!(
        pending[0].request.task.http_request.url,
        "https://svc.example.com/_tasks/items/a%20b"
    );
}

#[tokio::test]
async fn execute_hands_path_captures_to_the_handler() {
    let queue = Arc::new(MemoryQueue::new());
    let route = builder(queue).post("/items/{id}", rename_item);

    let res = tasks()
        .delayed(&route)
        .into_router()
        .oneshot(post("/_tasks/items/42", json!({ "name": "ada" })))
        .await
        .unwrap();

    assert_eq!(res.status().as_u16(), 200);
    assert_eq!(json_body(res).await, json!({ "item": "42", "name": "ada" }));
}

#[tokio::test]
async fn programmatic_delay_needs_every_capture() {
    let queue = Arc::new(MemoryQueue::new());
    let route = builder(queue.clone()).post("/items/{id}", rename_item);
    let greeting = Greeting { name: "ada".into() };

    let err = route.delay(&greeting).await.unwrap_err();
    assert_eq!(TaskError::kind_of(&err), Some(defer_core::ErrorKind::Validation));
    assert_eq!(queue.create_task_calls(), 0);

    let handle = route
        .options(ExecutionOptions::new().with_task_id("item-7"))
        .with_path_param("id", "7")
        .delay(&greeting)
        .await
        .unwrap();
    let task = queue.get(&handle.name).unwrap();
    assert_eq!(task.request.task.http_request.url, "https://svc.example.com/_tasks/items/7");
}
