//! Local mode: drains a [`MemoryQueue`] by calling execute endpoints the
//! way Cloud Tasks would, delivery headers included.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use defer_core::delivery::{
    ETA_HEADER, EXECUTION_COUNT_HEADER, PREVIOUS_RESPONSE_HEADER, QUEUE_NAME_HEADER,
    RETRY_COUNT_HEADER, TASK_NAME_HEADER,
};
use defer_core::memory::{MemoryQueue, StoredTask};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDispatchConfig {
    pub poll_interval: Duration,
    pub retry_delay: Duration,
    /// Deliveries per task before it is dropped.
    pub max_attempts: u32,
}

impl Default for LocalDispatchConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            retry_delay: Duration::from_secs(1),
            max_attempts: 5,
        }
    }
}

/// How one delivery ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acknowledged(u16),
    Retrying(Option<u16>),
    Dropped(Option<u16>),
}

pub struct LocalDispatcher {
    queue: Arc<MemoryQueue>,
    http: reqwest::Client,
    config: LocalDispatchConfig,
}

impl LocalDispatcher {
    pub fn new(queue: Arc<MemoryQueue>) -> Self {
        Self {
            queue,
            http: reqwest::Client::new(),
            config: LocalDispatchConfig::default(),
        }
    }

    pub fn with_config(mut self, config: LocalDispatchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    /// Deliver everything due now, in due order.
    pub async fn dispatch_due(&self) -> Vec<(String, DeliveryOutcome)> {
        let mut outcomes = Vec::new();
        for task in self.queue.lease_due(Utc::now()) {
            let outcome = self.deliver(&task).await;
            outcomes.push((task.name.clone(), outcome));
        }
        outcomes
    }

    async fn deliver(&self, task: &StoredTask) -> DeliveryOutcome {
        let http = &task.request.task.http_request;
        let mut request = self
            .http
            .request(http.http_method.to_http(), &http.url)
            .header(QUEUE_NAME_HEADER, task.queue_name())
            .header(TASK_NAME_HEADER, task.task_id())
            .header(RETRY_COUNT_HEADER, task.retry_count.to_string())
            .header(EXECUTION_COUNT_HEADER, task.execution_count.to_string())
            .header(ETA_HEADER, format!("{:.6}", task.due.timestamp_micros() as f64 / 1e6));
        if let Some(previous) = task.previous_response {
            request = request.header(PREVIOUS_RESPONSE_HEADER, previous.to_string());
        }
        for (name, value) in &http.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &http.body {
            request = request.body(body.clone());
        }
        if let Some(deadline) = task.request.task.dispatch_deadline {
            request = request.timeout(deadline);
        }

        let status = match request.send().await {
            Ok(response) => Some(response.status()),
            Err(err) => {
                warn!(task = %task.name, error = %err, "local delivery failed");
                None
            }
        };

        if let Some(status) = status.filter(|s| s.is_success()) {
            debug!(task = %task.name, status = status.as_u16(), "local delivery acknowledged");
            self.queue.complete(&task.name);
            return DeliveryOutcome::Acknowledged(status.as_u16());
        }

        let code = status.map(|s| s.as_u16());
        let attempt = task.retry_count + 1;
        if attempt >= self.config.max_attempts {
            warn!(task = %task.name, attempt, status = ?code, "dropping task after final attempt");
            self.queue.complete(&task.name);
            return DeliveryOutcome::Dropped(code);
        }

        let delay = chrono::Duration::from_std(self.config.retry_delay).unwrap_or_default();
        self.queue.release(&task.name, code, Utc::now() + delay);
        DeliveryOutcome::Retrying(code)
    }

    /// Poll forever on the current runtime.
    pub fn spawn(self) -> JoinHandle<()> {
        info!(
            poll_ms = self.config.poll_interval.as_millis() as u64,
            "local task dispatcher started"
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.poll_interval);
            loop {
                ticker.tick().await;
                self.dispatch_due().await;
            }
        })
    }
}
