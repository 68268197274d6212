use anyhow::Result;
use defer_core::{load_env_config, DeferConfig, DeferSettings};
use defer_gcp::LocalDispatcher;
use tasks_full::{build, Backends};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let json_logs = std::env::var("DEFER__LOG__FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let mut config = DeferConfig::new();
    config.set("http.host", "127.0.0.1");
    config.set("http.port", "3030");
    load_env_config(&mut config, "DEFER");
    let snapshot = config.snapshot();
    let settings = DeferSettings::from_snapshot(&snapshot)?;

    let demo = build(&settings, Backends::connect(&settings, &snapshot).await?)?;
    // Jobs are only registered against a deployed environment.
    match demo.local_queue.clone() {
        Some(queue) => {
            LocalDispatcher::new(queue).spawn();
        }
        None => demo.register_schedules().await?,
    }

    let host = snapshot.get_string("http.host").unwrap_or_else(|| "127.0.0.1".to_string());
    let port = snapshot.get_string("http.port").unwrap_or_else(|| "3030".to_string());
    let addr = format!("{host}:{port}");

    println!("[tasks-full] listening on http://{addr}");

    demo.app.listen(addr).await?;

    Ok(())
}
