use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use defer_core::{
    CreateTaskRequest, HttpMethod, HttpRequest, MemoryQueue, QueueClient, QueueIdentity,
    TaskDefinition,
};
use defer_gcp::{DeliveryOutcome, LocalDispatchConfig, LocalDispatcher};
use tokio::sync::Mutex;

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

async fn enqueue(queue: &MemoryQueue, url: String) -> String {
    let identity = QueueIdentity::new("p", "us-central1", "default").unwrap();
    queue.create_queue(&identity).await.unwrap();
    let mut http = HttpRequest::new(url, HttpMethod::Post);
    http.headers.insert("Content-Type".into(), "application/json".into());
    http.body = Some(br#"{"name":"ada"}"#.to_vec());
    let mut task = TaskDefinition::new(http);
    task.name = Some(identity.task_path("abc"));
    queue
        .create_task(CreateTaskRequest {
            parent: identity,
            task,
        })
        .await
        .unwrap()
        .name
}

fn config(max_attempts: u32) -> LocalDispatchConfig {
    LocalDispatchConfig {
        poll_interval: Duration::from_millis(10),
        retry_delay: Duration::ZERO,
        max_attempts,
    }
}

#[tokio::test]
async fn deliveries_carry_cloud_tasks_headers() {
    let seen: Arc<Mutex<Vec<HeaderMap>>> = Arc::default();
    let recorder = seen.clone();
    let base = serve(Router::new().route(
        "/_tasks/hello",
        post(move |headers: HeaderMap, body: String| {
            let recorder = recorder.clone();
            async move {
                assert_eq!(body, r#"{"name":"ada"}"#);
                recorder.lock().await.push(headers);
                StatusCode::OK
            }
        }),
    ))
    .await;

    let queue = Arc::new(MemoryQueue::new());
    let name = enqueue(&queue, format!("{base}/_tasks/hello")).await;
    let dispatcher = LocalDispatcher::new(queue.clone()).with_config(config(3));

    let outcomes = dispatcher.dispatch_due().await;
    assert_eq!(outcomes, vec![(name, DeliveryOutcome::Acknowledged(200))]);
    assert_eq!(queue.pending_count(), 0);

    let seen = seen.lock().await;
    let headers = &seen[0];
    assert_eq!(headers["x-cloudtasks-queuename"], "default");
    assert_eq!(headers["x-cloudtasks-taskname"], "abc");
    assert_eq!(headers["x-cloudtasks-taskretrycount"], "0");
    assert_eq!(headers["content-type"], "application/json");
}

#[tokio::test]
async fn failed_deliveries_are_retried_then_dropped() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let base = serve(Router::new().route(
        "/_tasks/boom",
        post(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }),
    ))
    .await;

    let queue = Arc::new(MemoryQueue::new());
    let name = enqueue(&queue, format!("{base}/_tasks/boom")).await;
    let dispatcher = LocalDispatcher::new(queue.clone()).with_config(config(2));

    let first = dispatcher.dispatch_due().await;
    assert_eq!(first, vec![(name.clone(), DeliveryOutcome::Retrying(Some(500)))]);
    let task = queue.get(&name).unwrap();
    assert_eq!(task.retry_count, 1);
    assert_eq!(task.previous_response, Some(500));

    let second = dispatcher.dispatch_due().await;
    assert_eq!(second, vec![(name, DeliveryOutcome::Dropped(Some(500)))]);
    assert_eq!(queue.pending_count(), 0);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn future_tasks_wait_until_due() {
    let queue = Arc::new(MemoryQueue::new());
    let identity = QueueIdentity::new("p", "us-central1", "default").unwrap();
    queue.create_queue(&identity).await.unwrap();
    let mut task = TaskDefinition::new(HttpRequest::new("http://127.0.0.1:9/_tasks/x", HttpMethod::Post));
    task.schedule_time = Some(chrono::Utc::now() + chrono::Duration::hours(1));
    queue
        .create_task(CreateTaskRequest {
            parent: identity,
            task,
        })
        .await
        .unwrap();

    let dispatcher = LocalDispatcher::new(queue.clone()).with_config(config(3));
    assert!(dispatcher.dispatch_due().await.is_empty());
    assert_eq!(queue.pending_count(), 1);
}
