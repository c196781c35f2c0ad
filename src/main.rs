use anyhow::Result;
use receipts_ocr_client::{metrics, Config, EventSink, InputFile, RequestOrchestrator};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[tokio::main]
async fn main() -> Result<()> {
    let default_filter = tracing_subscriber::EnvFilter::new("info")
        .add_directive("hyper_util=warn".parse()?)
        .add_directive("reqwest=warn".parse()?);
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or(default_filter);
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let paths: Vec<String> = std::env::args().skip(1).collect();
    if paths.is_empty() {
        eprintln!("usage: receipts-ocr-client <image>...");
        return Err(anyhow::anyhow!("no input files given"));
    }

    metrics::init_metrics();

    let config = Config::load()?;
    tracing::info!("Remote recognition service: {}", config.remote.base_url);

    let sink = Arc::new(EventSink::new(config.log_capacity));
    let orchestrator = RequestOrchestrator::from_config(&config, sink.clone())?;

    let first_probe = Arc::new(Notify::new());
    let _health_updates = {
        let first_probe = first_probe.clone();
        orchestrator.monitor().start_monitoring(move |status| {
            tracing::debug!(
                available = status.is_available,
                retry_count = status.retry_count,
                "Health status updated"
            );
            first_probe.notify_one();
        })
    };

    let wait = config.health.probe_timeout + Duration::from_secs(1);
    if tokio::time::timeout(wait, first_probe.notified()).await.is_err() {
        tracing::warn!("No health status after {}ms; continuing", wait.as_millis());
    }

    let mut failures = 0usize;
    for path in &paths {
        let outcome = match InputFile::from_path(path).await {
            Ok(file) => orchestrator.submit(file).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(result) => println!("{}", serde_json::to_string_pretty(&result)?),
            Err(e) => {
                failures += 1;
                let report = serde_json::json!({ "file": path, "error": e.to_string() });
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
        }
    }

    orchestrator.monitor().stop_monitoring();
    tracing::debug!("Metrics:\n{}", metrics::export_metrics());

    if failures > 0 {
        return Err(anyhow::anyhow!("{} of {} submissions failed", failures, paths.len()));
    }
    Ok(())
}
