//! Best-effort relay of remote-service log lines.
//!
//! While active, lines arrive over the server-sent event stream at
//! `GET /events`; when that stream cannot be opened at all, the relay polls
//! `GET /events?since=T` instead. Any stream or poll error stops the relay:
//! log lines are a convenience during a submission, never a requirement.

use futures::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::task::JoinHandle;

use crate::config::RelayConfig;
use crate::error::{ClientError, Result};
use crate::event_sink::{EventSink, LogCategory, LogLevel};
use crate::listeners::{ListenerSet, Subscription};
use crate::metrics;
use crate::remote::{RemoteClient, StreamedLog};

pub struct LogRelay {
    client: RemoteClient,
    config: RelayConfig,
    sink: Arc<EventSink>,
    listeners: ListenerSet<StreamedLog>,
    active: AtomicBool,
    /// Identifies the current streaming session so a finished task from an
    /// earlier session cannot clear a newer one
    session: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LogRelay {
    pub fn new(client: RemoteClient, config: RelayConfig, sink: Arc<EventSink>) -> Self {
        Self {
            client,
            config,
            sink,
            listeners: ListenerSet::new(),
            active: AtomicBool::new(false),
            session: AtomicU64::new(0),
            task: Mutex::new(None),
        }
    }

    fn task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&StreamedLog) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    pub fn is_streaming(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Open the event stream in the background. No-op while already active.
    pub fn start_streaming(self: &Arc<Self>) {
        let mut task = self.task();
        if self.active.swap(true, Ordering::SeqCst) {
            return;
        }
        let session = self.session.fetch_add(1, Ordering::SeqCst) + 1;

        let weak = Arc::downgrade(self);
        let client = self.client.clone();
        let poll_interval = self.config.poll_interval;

        *task = Some(tokio::spawn(async move {
            let started_at = unix_now();
            let reason = match client.transport().open_stream(&client.events_url()).await {
                Ok(stream) => relay_stream(&weak, stream).await,
                Err(err) => {
                    if let Some(relay) = weak.upgrade() {
                        relay.sink.warn(
                            LogCategory::Network,
                            format!(
                                "Event stream unavailable ({}); polling every {}ms",
                                err,
                                poll_interval.as_millis()
                            ),
                        );
                    }
                    relay_polling(&weak, &client, started_at, poll_interval).await
                }
            };

            if let Some(relay) = weak.upgrade() {
                relay.finish_session(session, &reason);
            }
        }));
        drop(task);

        self.sink.debug(LogCategory::Network, "Log streaming started");
    }

    /// Close the stream. Safe to call when never started.
    pub fn stop_streaming(&self) {
        let handle = self.task().take();
        if let Some(handle) = handle {
            handle.abort();
        }
        if self.active.swap(false, Ordering::SeqCst) {
            self.sink.debug(LogCategory::Network, "Log streaming stopped");
        }
    }

    /// Pull-based fallback: lines newer than `since` (Unix seconds). Refused
    /// while the relay is active.
    pub async fn poll_logs(&self, since: f64) -> Result<Vec<StreamedLog>> {
        if self.is_streaming() {
            return Err(ClientError::StreamingActive);
        }
        let lines = self.client.poll_events(since).await?;
        Ok(lines.into_iter().filter(|l| l.timestamp > since).collect())
    }

    fn finish_session(&self, session: u64, reason: &str) {
        if self.session.load(Ordering::SeqCst) != session {
            return;
        }
        if self.active.swap(false, Ordering::SeqCst) {
            self.sink.warn(LogCategory::Network, format!("Log relay stopped: {}", reason));
        }
    }

    fn dispatch(&self, line: &StreamedLog) {
        metrics::RELAY_LINES.inc();
        self.sink.log(
            remote_level(&line.level),
            LogCategory::Recognition,
            format!("[remote] {}", line.message),
            Some(serde_json::json!({ "remoteTimestamp": line.timestamp })),
            None,
        );

        for failure in self.listeners.notify(line) {
            self.sink.warn(
                LogCategory::System,
                format!("Log relay subscriber failed: {}", failure.message),
            );
        }
    }
}

impl Drop for LogRelay {
    fn drop(&mut self) {
        if let Some(handle) = self.task().take() {
            handle.abort();
        }
    }
}

async fn relay_stream(relay: &Weak<LogRelay>, mut stream: crate::transport::ByteStream) -> String {
    let mut buffer: Vec<u8> = Vec::new();

    while let Some(chunk) = stream.next().await {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(err) => return format!("stream error: {}", err),
        };
        buffer.extend_from_slice(&bytes);

        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            if let Some(log) = parse_event_line(line.trim_end_matches(['\r', '\n'])) {
                let Some(relay) = relay.upgrade() else {
                    return "relay dropped".to_string();
                };
                relay.dispatch(&log);
            }
        }
    }

    "stream closed by remote".to_string()
}

async fn relay_polling(
    relay: &Weak<LogRelay>,
    client: &RemoteClient,
    mut since: f64,
    interval: std::time::Duration,
) -> String {
    loop {
        match client.poll_events(since).await {
            Ok(lines) => {
                let Some(relay) = relay.upgrade() else {
                    return "relay dropped".to_string();
                };
                for line in lines.iter().filter(|l| l.timestamp > since) {
                    relay.dispatch(line);
                }
                if let Some(latest) = lines.iter().map(|l| l.timestamp).reduce(f64::max) {
                    since = since.max(latest);
                }
            }
            Err(err) => return format!("poll failed: {}", err),
        }
        tokio::time::sleep(interval).await;
    }
}

/// Parse one server-sent event line. Only `data:` lines carry payloads; a
/// payload that is not a JSON log record is relayed as a plain message.
pub fn parse_event_line(line: &str) -> Option<StreamedLog> {
    let data = line.strip_prefix("data:")?.trim();
    if data.is_empty() {
        return None;
    }
    Some(
        serde_json::from_str::<StreamedLog>(data).unwrap_or_else(|_| StreamedLog {
            timestamp: unix_now(),
            level: "info".to_string(),
            message: data.to_string(),
        }),
    )
}

fn remote_level(level: &str) -> LogLevel {
    match level.to_ascii_lowercase().as_str() {
        "debug" | "trace" => LogLevel::Debug,
        "warn" | "warning" => LogLevel::Warn,
        "error" | "critical" | "fatal" => LogLevel::Error,
        "success" => LogLevel::Success,
        _ => LogLevel::Info,
    }
}

fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
