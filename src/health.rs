//! Health Monitor
//!
//! Periodically probes the remote recognition service and publishes a
//! [`HealthStatus`] after every completed probe.
//!
//! ## States
//! ```text
//! ┌─────────┐  start   ┌─────────┐  2xx + healthy  ┌─────────┐
//! │ Unknown │ ───────▶ │ Probing │ ──────────────▶ │ Healthy │
//! └─────────┘          └────┬────┘                 └────┬────┘
//!                           │ failure / timeout         │ next tick
//!                           ▼                           │
//!                      ┌──────────┐  next tick / retry  │
//!                      │ Degraded │ ────────▶ Probing ◀─┘
//!                      └──────────┘
//! ```
//!
//! `paused` is a flag, not a state: while set, scheduled ticks are skipped
//! and any in-flight retry chain stops at its next delay.
//!
//! ## Retry chain
//! A failed probe increments `retry_count` and, while
//! `retry_count <= max_retries`, sleeps `retry_delay` and probes again.
//! Once the count passes `max_retries` the chain ends; the next scheduled
//! tick probes once more without restarting the chain, and only a success
//! or [`HealthMonitor::force_check`] resets the count.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::HealthConfig;
use crate::error::{ClientError, Result};
use crate::event_sink::{EventSink, LogCategory, LogLevel};
use crate::listeners::{ListenerSet, Subscription};
use crate::metrics;
use crate::remote::{HealthPayload, RemoteClient};

/// Outcome of the last completed probe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub is_healthy: bool,
    pub is_available: bool,
    pub last_checked: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub engine_name: Option<String>,
    pub backend_version: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    #[default]
    Unknown,
    Probing,
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    pub status: HealthStatus,
    pub state: HealthState,
    pub paused: bool,
    pub monitoring: bool,
}

struct MonitorState {
    status: HealthStatus,
    state: HealthState,
    retry_count: u32,
}

pub struct HealthMonitor {
    client: RemoteClient,
    config: HealthConfig,
    sink: Arc<EventSink>,
    inner: Mutex<MonitorState>,
    paused: AtomicBool,
    /// Bumped on every pause; a retry chain started under an older epoch stops
    pause_epoch: AtomicU64,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    listeners: ListenerSet<HealthStatus>,
}

impl HealthMonitor {
    pub fn new(client: RemoteClient, config: HealthConfig, sink: Arc<EventSink>) -> Self {
        Self {
            client,
            config,
            sink,
            inner: Mutex::new(MonitorState {
                status: HealthStatus::default(),
                state: HealthState::Unknown,
                retry_count: 0,
            }),
            paused: AtomicBool::new(false),
            pause_epoch: AtomicU64::new(0),
            loop_handle: Mutex::new(None),
            listeners: ListenerSet::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn handle(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.loop_handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register `on_change` and start the probe loop: one immediate probe,
    /// then one per interval. The loop is started at most once; later calls
    /// only add their listener.
    pub fn start_monitoring<F>(self: &Arc<Self>, on_change: F) -> Subscription
    where
        F: Fn(&HealthStatus) + Send + Sync + 'static,
    {
        let subscription = self.listeners.subscribe(on_change);

        let mut handle = self.handle();
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            tracing::debug!("Health monitoring already running");
            return subscription;
        }

        let weak = Arc::downgrade(self);
        let period = self.config.interval;
        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(monitor) = weak.upgrade() else {
                    break;
                };
                if monitor.is_paused() {
                    tracing::debug!("Health monitor paused; skipping tick");
                    continue;
                }
                monitor.check_health().await;
            }
        }));
        drop(handle);

        self.sink.info(
            LogCategory::Health,
            format!(
                "Health monitoring started (every {}ms)",
                self.config.interval.as_millis()
            ),
        );
        subscription
    }

    pub fn stop_monitoring(&self) {
        let handle = self.handle().take();
        if let Some(handle) = handle {
            handle.abort();
            self.sink.info(LogCategory::Health, "Health monitoring stopped");
        }
    }

    pub fn pause_monitoring(&self) {
        self.pause_epoch.fetch_add(1, Ordering::SeqCst);
        if !self.paused.swap(true, Ordering::SeqCst) {
            self.sink.debug(LogCategory::Health, "Health monitoring paused");
        }
    }

    pub fn resume_monitoring(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            self.sink.debug(LogCategory::Health, "Health monitoring resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_monitoring(&self) -> bool {
        self.handle().as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn status(&self) -> HealthStatus {
        self.lock().status.clone()
    }

    pub fn state(&self) -> HealthState {
        self.lock().state
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        let (status, state) = {
            let inner = self.lock();
            (inner.status.clone(), inner.state)
        };
        MonitorSnapshot {
            status,
            state,
            paused: self.is_paused(),
            monitoring: self.is_monitoring(),
        }
    }

    /// Additional status listener, independent of `start_monitoring`.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&HealthStatus) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    /// Probe now and follow the bounded retry chain on failure. Returns the
    /// status published last.
    pub async fn check_health(&self) -> HealthStatus {
        let epoch = self.pause_epoch.load(Ordering::SeqCst);

        loop {
            self.lock().state = HealthState::Probing;

            match self.probe().await {
                Ok(payload) => return self.record_success(payload),
                Err(err) => {
                    let status = self.record_failure(&err);
                    if status.retry_count > self.config.max_retries {
                        self.sink.error(
                            LogCategory::Health,
                            format!(
                                "Remote service unavailable after {} attempts",
                                status.retry_count
                            ),
                            Some(&err),
                        );
                        return status;
                    }

                    if self.pause_epoch.load(Ordering::SeqCst) != epoch {
                        tracing::debug!("Retry chain cancelled by pause");
                        return status;
                    }
                    tokio::time::sleep(self.config.retry_delay).await;
                    if self.pause_epoch.load(Ordering::SeqCst) != epoch {
                        tracing::debug!("Retry chain cancelled by pause");
                        return status;
                    }
                }
            }
        }
    }

    /// User-triggered retry: reset the count and probe immediately.
    pub async fn force_check(&self) -> HealthStatus {
        self.lock().retry_count = 0;
        self.sink.info(LogCategory::Health, "Manual health check requested");
        self.check_health().await
    }

    async fn probe(&self) -> Result<HealthPayload> {
        let timeout = self.config.probe_timeout;
        match tokio::time::timeout(timeout, self.client.health(timeout)).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::timeout("Health check", timeout)),
        }
    }

    fn record_success(&self, payload: HealthPayload) -> HealthStatus {
        metrics::HEALTH_PROBES.with_label_values(&["success"]).inc();

        let (status, recovered) = {
            let mut inner = self.lock();
            let recovered = inner.state == HealthState::Degraded || !inner.status.is_available;
            inner.retry_count = 0;
            inner.state = HealthState::Healthy;
            inner.status = HealthStatus {
                is_healthy: true,
                is_available: true,
                last_checked: Some(Utc::now()),
                error: None,
                retry_count: 0,
                engine_name: payload.ocr_engine.clone(),
                backend_version: payload.version.clone(),
            };
            (inner.status.clone(), recovered)
        };

        let engine = payload.ocr_engine.as_deref().unwrap_or("unknown");
        if recovered {
            self.sink.success(
                LogCategory::Health,
                format!("Remote service available (engine: {})", engine),
            );
        } else {
            self.sink.debug(
                LogCategory::Health,
                format!("Remote service healthy (engine: {})", engine),
            );
        }

        self.publish(&status);
        status
    }

    fn record_failure(&self, err: &ClientError) -> HealthStatus {
        let outcome = if matches!(err, ClientError::Timeout { .. }) {
            "timeout"
        } else {
            "failure"
        };
        metrics::HEALTH_PROBES.with_label_values(&[outcome]).inc();

        let status = {
            let mut inner = self.lock();
            inner.retry_count += 1;
            inner.state = HealthState::Degraded;
            inner.status = HealthStatus {
                is_healthy: false,
                is_available: false,
                last_checked: Some(Utc::now()),
                error: Some(err.to_string()),
                retry_count: inner.retry_count,
                engine_name: None,
                backend_version: None,
            };
            inner.status.clone()
        };

        self.sink.log(
            LogLevel::Warn,
            LogCategory::Health,
            format!(
                "Health check failed (attempt {}/{}): {}",
                status.retry_count,
                self.config.max_retries + 1,
                err
            ),
            Some(serde_json::json!({ "transient": err.is_transient() })),
            None,
        );

        self.publish(&status);
        status
    }

    fn publish(&self, status: &HealthStatus) {
        for failure in self.listeners.notify(status) {
            tracing::warn!(
                listener = failure.listener_id,
                "Health listener panicked: {}",
                failure.message
            );
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.handle().take() {
            handle.abort();
        }
    }
}
