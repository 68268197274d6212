use defer_core::{DeliveryContext, TaskError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Greeting {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub source: String,
}

pub async fn hello(greeting: Greeting) -> anyhow::Result<Value> {
    info!(name = %greeting.name, "saying hello");
    Ok(json!({ "message": format!("Hello, {}!", greeting.name) }))
}

/// Always fails; the route's retry budget is what stops redelivery.
pub async fn fail_twice(ctx: DeliveryContext, _greeting: Greeting) -> anyhow::Result<Value> {
    Err(TaskError::handler(format!("attempt {} failed on purpose", ctx.attempt())).into_anyhow())
}

pub async fn timed_hello(ctx: DeliveryContext, tick: Tick) -> anyhow::Result<Value> {
    info!(job = ?ctx.job_name, source = %tick.source, "timed hello");
    Ok(json!({ "message": "Hello on schedule!", "job": ctx.job_name }))
}
