use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Once;
use std::time::Instant;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Transport metrics
    pub static ref HTTP_REQUESTS: IntCounterVec = IntCounterVec::new(
        Opts::new("ocr_http_requests_total", "Outbound HTTP requests by method and outcome"),
        &["method", "outcome"]
    ).unwrap();

    pub static ref HTTP_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "ocr_http_request_duration_seconds",
            "Outbound HTTP request latency in seconds"
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0])
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_PROBES: IntCounterVec = IntCounterVec::new(
        Opts::new("ocr_health_probes_total", "Health probes by outcome"),
        &["outcome"]
    ).unwrap();

    // Submission metrics
    pub static ref SUBMISSIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("ocr_submissions_total", "Submissions by engine and outcome"),
        &["engine", "outcome"]
    ).unwrap();

    pub static ref EVENT_LOG_ENTRIES: IntGauge = IntGauge::new(
        "ocr_event_log_entries",
        "Entries currently retained by the event sink"
    ).unwrap();

    pub static ref RELAY_LINES: IntCounter = IntCounter::new(
        "ocr_relay_lines_total",
        "Remote log lines forwarded by the relay"
    ).unwrap();
}

static INIT: Once = Once::new();

/// Register every collector with [`REGISTRY`]; safe to call repeatedly.
pub fn init_metrics() {
    INIT.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(HTTP_REQUESTS.clone()),
            Box::new(HTTP_LATENCY.clone()),
            Box::new(HEALTH_PROBES.clone()),
            Box::new(SUBMISSIONS.clone()),
            Box::new(EVENT_LOG_ENTRIES.clone()),
            Box::new(RELAY_LINES.clone()),
        ];
        for collector in collectors {
            if let Err(e) = REGISTRY.register(collector) {
                tracing::warn!("Failed to register metric collector: {}", e);
            }
        }
        tracing::info!("Metrics registry initialized with {} collectors", REGISTRY.gather().len());
    });
}

/// Helper struct for timing operations
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn observe_duration_seconds(&self, histogram: &Histogram) {
        histogram.observe(self.start.elapsed().as_secs_f64());
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

/// Export metrics in Prometheus format
pub fn export_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent_and_exports() {
        init_metrics();
        init_metrics();

        SUBMISSIONS.with_label_values(&["local", "success"]).inc();
        let text = export_metrics();
        assert!(text.contains("ocr_submissions_total"));
    }
}
