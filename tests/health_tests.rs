//! Health monitor scheduling, pause semantics and the bounded retry chain

mod common;

use common::{json, ScriptedTransport, BASE_URL};
use receipts_ocr_client::config::HealthConfig;
use receipts_ocr_client::{
    ClientError, EventSink, HealthMonitor, HealthState, LogFilter, LogLevel, RemoteClient,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

fn monitor_over(transport: Arc<ScriptedTransport>) -> (Arc<HealthMonitor>, Arc<EventSink>) {
    let sink = Arc::new(EventSink::new(200));
    let client = RemoteClient::new(transport, BASE_URL);
    let monitor = Arc::new(HealthMonitor::new(client, HealthConfig::default(), sink.clone()));
    (monitor, sink)
}

#[tokio::test(start_paused = true)]
async fn test_double_start_runs_one_loop() {
    let transport = ScriptedTransport::healthy();
    let (monitor, _) = monitor_over(transport.clone());

    let _first = monitor.start_monitoring(|_| {});
    let _second = monitor.start_monitoring(|_| {});

    // Immediate probe plus the ticks at 10s and 20s
    sleep(Duration::from_secs(25)).await;
    assert_eq!(transport.calls_to("/health"), 3);
    assert!(monitor.is_monitoring());
}

#[tokio::test(start_paused = true)]
async fn test_paused_ticks_are_skipped_not_deferred() {
    let transport = ScriptedTransport::healthy();
    let (monitor, _) = monitor_over(transport.clone());
    let _updates = monitor.start_monitoring(|_| {});

    sleep(Duration::from_secs(1)).await;
    assert_eq!(transport.calls_to("/health"), 1);

    monitor.pause_monitoring();
    sleep(Duration::from_secs(30)).await;
    assert_eq!(transport.calls_to("/health"), 1, "no probes while paused");
    assert!(monitor.snapshot().paused);

    monitor.resume_monitoring();
    sleep(Duration::from_secs(1)).await;
    assert_eq!(transport.calls_to("/health"), 1, "resume does not probe immediately");

    // Next scheduled tick is at 40s
    sleep(Duration::from_secs(9)).await;
    assert_eq!(transport.calls_to("/health"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failures_exhaust_bounded_chain() {
    let transport = ScriptedTransport::new();
    transport.on("/health", |_| json(503, serde_json::json!({ "error": "warming up" })));
    let (monitor, sink) = monitor_over(transport.clone());

    let status = monitor.check_health().await;

    assert!(!status.is_healthy);
    assert!(!status.is_available);
    assert_eq!(status.retry_count, 4);
    assert_eq!(transport.calls_to("/health"), 4, "initial probe plus three retries");
    assert_eq!(status.error.as_deref(), Some("HTTP 503: warming up"));

    let errors = sink.entries(&LogFilter::level(LogLevel::Error));
    assert_eq!(errors.len(), 1);
    assert!(errors[0].message.contains("unavailable after 4 attempts"));
}

#[tokio::test(start_paused = true)]
async fn test_retries_are_spaced_by_fixed_delay() {
    let transport = ScriptedTransport::new();
    transport.on("/health", |_| {
        Err(ClientError::Network("connection refused".into()))
    });
    let (monitor, _) = monitor_over(transport.clone());

    let started = tokio::time::Instant::now();
    monitor.check_health().await;
    assert_eq!(started.elapsed(), Duration::from_secs(6));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_and_error_payload_read_differently() {
    let transport = ScriptedTransport::healthy();
    transport.delay("/health", Duration::from_secs(10));
    let (monitor, _) = monitor_over(transport.clone());
    let timed_out = monitor.check_health().await;
    assert!(timed_out.error.unwrap().contains("timed out after 3000ms"));

    let transport = ScriptedTransport::new();
    transport.on("/health", |_| {
        json(500, serde_json::json!({ "error": "OCR engine not initialized" }))
    });
    let (monitor, _) = monitor_over(transport);
    let failed = monitor.check_health().await;
    assert!(failed.error.unwrap().contains("OCR engine not initialized"));

    assert_eq!(timed_out.retry_count, failed.retry_count);
}

#[tokio::test(start_paused = true)]
async fn test_unhealthy_status_is_a_failure() {
    let transport = ScriptedTransport::new();
    transport.on("/health", |_| json(200, serde_json::json!({ "status": "starting" })));
    let (monitor, _) = monitor_over(transport);

    let status = monitor.check_health().await;
    assert!(!status.is_available);
    assert!(status.error.unwrap().contains("starting"));
}

#[tokio::test(start_paused = true)]
async fn test_tick_after_exhaustion_probes_once() {
    let transport = ScriptedTransport::new();
    transport.on("/health", |_| json(503, serde_json::json!({})));
    let (monitor, _) = monitor_over(transport.clone());
    let _updates = monitor.start_monitoring(|_| {});

    // Chain: probes at 0, 2, 4, 6s. Then one probe per tick at 10s and 20s.
    sleep(Duration::from_secs(21)).await;
    assert_eq!(transport.calls_to("/health"), 6);
    assert_eq!(monitor.status().retry_count, 6);
}

#[tokio::test]
async fn test_success_publishes_engine_and_resets_state() {
    let transport = ScriptedTransport::new();
    transport.on("/health", |_| {
        json(200, serde_json::json!({ "status": "ok", "engine": "paddle", "version": "3.1" }))
    });
    let (monitor, _) = monitor_over(transport);
    assert_eq!(monitor.state(), HealthState::Unknown);

    let seen = Arc::new(AtomicUsize::new(0));
    let _sub = {
        let seen = seen.clone();
        monitor.subscribe(move |status| {
            assert!(status.is_available);
            seen.fetch_add(1, Ordering::SeqCst);
        })
    };

    let status = monitor.force_check().await;
    assert_eq!(status.engine_name.as_deref(), Some("paddle"));
    assert_eq!(status.backend_version.as_deref(), Some("3.1"));
    assert!(status.last_checked.is_some());
    assert_eq!(monitor.state(), HealthState::Healthy);
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_is_idempotent() {
    let transport = ScriptedTransport::healthy();
    let (monitor, _) = monitor_over(transport.clone());

    monitor.stop_monitoring();
    let _updates = monitor.start_monitoring(|_| {});
    sleep(Duration::from_millis(10)).await;
    monitor.stop_monitoring();
    monitor.stop_monitoring();
    assert!(!monitor.is_monitoring());

    sleep(Duration::from_secs(30)).await;
    assert_eq!(transport.calls_to("/health"), 1);
}
