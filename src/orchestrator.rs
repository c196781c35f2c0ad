//! Request Orchestrator
//!
//! Sequences one submission end to end:
//!
//! ```text
//! idle → preprocessing → engine-selection ─┬─ remote: pause, stream ─┬→ awaiting-response
//!                                          └─ local ─────────────────┘          │
//!                                                           idle ← cleanup ←────┘
//! ```
//!
//! The engine is chosen once, from the monitor's last published status. A
//! failed remote call is returned to the caller; it never falls back to the
//! local engine mid-submission. The remote scope is owned by
//! [`RemoteCallScope`], whose `Drop` stops streaming, unsubscribes and resumes
//! monitoring, in that order, however the call ends. Overlapping remote calls
//! keep the monitor paused until the last of them has settled.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{ClientError, Result};
use crate::event_sink::{EventSink, LogCategory, LogLevel};
use crate::health::HealthMonitor;
use crate::listeners::Subscription;
use crate::local::{LocalEngine, TesseractEngine};
use crate::metrics::{self, Timer};
use crate::preprocess::{InputFile, NormalizedImage, Preprocessor, Transformation};
use crate::receipt::{self, ParsedReceipt};
use crate::relay::LogRelay;
use crate::remote::{LayoutSummary, OcrPayload, RemoteClient, TextBlock};
use crate::transport::{LoggingTransport, ReqwestTransport, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionPhase {
    Idle,
    Preprocessing,
    EngineSelection,
    Streaming,
    AwaitingResponse,
    Cleanup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Remote,
    Local,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Remote => "remote",
            EngineKind::Local => "local",
        }
    }
}

/// Uniform result shape for both engines.
#[derive(Debug, Clone, Serialize)]
pub struct RecognitionResult {
    pub submission_id: Uuid,
    pub engine: EngineKind,
    pub filename: String,
    pub text: String,
    pub confidence: Option<f64>,
    pub blocks: Vec<TextBlock>,
    pub parsed: ParsedReceipt,
    pub layout: Option<LayoutSummary>,
    pub preprocessing: Vec<Transformation>,
    /// Remote log lines relayed while the call was in flight
    pub remote_log_lines: usize,
    pub elapsed_ms: u64,
}

struct EngineOutput {
    text: String,
    confidence: Option<f64>,
    blocks: Vec<TextBlock>,
    parsed: ParsedReceipt,
    layout: Option<LayoutSummary>,
    remote_log_lines: usize,
}

/// Monitoring paused and log streaming active for as long as this lives.
///
/// Overlapping submissions share one pause and one stream: the first scope
/// to enter acquires them and the last one to leave releases them.
struct RemoteCallScope<'a> {
    relay: &'a LogRelay,
    monitor: &'a HealthMonitor,
    phase: &'a watch::Sender<SubmissionPhase>,
    active: &'a Mutex<usize>,
    subscription: Option<Subscription>,
}

impl<'a> RemoteCallScope<'a> {
    fn enter(orchestrator: &'a RequestOrchestrator, lines: Arc<AtomicUsize>) -> Self {
        let relay = &orchestrator.relay;
        let monitor = orchestrator.monitor.as_ref();

        let subscription = {
            let mut active = lock_scopes(&orchestrator.remote_scopes);
            *active += 1;
            if *active == 1 {
                monitor.pause_monitoring();
            }
            let subscription = relay.subscribe(move |_| {
                lines.fetch_add(1, Ordering::Relaxed);
            });
            if *active == 1 {
                relay.start_streaming();
            }
            subscription
        };
        orchestrator.phase.send_replace(SubmissionPhase::Streaming);

        Self {
            relay: relay.as_ref(),
            monitor,
            phase: &orchestrator.phase,
            active: &orchestrator.remote_scopes,
            subscription: Some(subscription),
        }
    }
}

impl Drop for RemoteCallScope<'_> {
    fn drop(&mut self) {
        let mut active = lock_scopes(self.active);
        *active = active.saturating_sub(1);
        let last = *active == 0;

        if last {
            self.phase.send_replace(SubmissionPhase::Cleanup);
            self.relay.stop_streaming();
        }
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        if last {
            self.monitor.resume_monitoring();
        }
    }
}

fn lock_scopes(scopes: &Mutex<usize>) -> MutexGuard<'_, usize> {
    scopes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct RequestOrchestrator {
    client: RemoteClient,
    preprocessor: Preprocessor,
    monitor: Arc<HealthMonitor>,
    relay: Arc<LogRelay>,
    local: Option<Arc<dyn LocalEngine>>,
    sink: Arc<EventSink>,
    submit_timeout: Duration,
    generation: AtomicU64,
    phase: watch::Sender<SubmissionPhase>,
    /// Remote calls currently holding the monitor pause and the log stream
    remote_scopes: Mutex<usize>,
}

impl RequestOrchestrator {
    pub fn new(
        client: RemoteClient,
        preprocessor: Preprocessor,
        monitor: Arc<HealthMonitor>,
        relay: Arc<LogRelay>,
        sink: Arc<EventSink>,
        submit_timeout: Duration,
    ) -> Self {
        let (phase, _) = watch::channel(SubmissionPhase::Idle);
        Self {
            client,
            preprocessor,
            monitor,
            relay,
            local: None,
            sink,
            submit_timeout,
            generation: AtomicU64::new(0),
            phase,
            remote_scopes: Mutex::new(0),
        }
    }

    pub fn with_local_engine(mut self, engine: Arc<dyn LocalEngine>) -> Self {
        self.local = Some(engine);
        self
    }

    /// Wire every component from `config` over `transport`. The transport is
    /// wrapped once in a [`LoggingTransport`] so all outbound calls reach `sink`.
    pub fn from_parts(
        config: &Config,
        transport: Arc<dyn Transport>,
        sink: Arc<EventSink>,
    ) -> Self {
        let transport: Arc<dyn Transport> =
            Arc::new(LoggingTransport::new(transport, sink.clone()));
        let client = RemoteClient::new(transport, config.remote.base_url.clone());

        let monitor = Arc::new(HealthMonitor::new(
            client.clone(),
            config.health.clone(),
            sink.clone(),
        ));
        let relay = Arc::new(LogRelay::new(client.clone(), config.relay.clone(), sink.clone()));
        let preprocessor = Preprocessor::new(config.preprocess.clone(), sink.clone())
            .with_orientation_detector(Arc::new(client.clone()));

        let orchestrator = Self::new(
            client,
            preprocessor,
            monitor,
            relay,
            sink,
            config.remote.submit_timeout,
        );

        if config.local_engine.enabled {
            orchestrator.with_local_engine(Arc::new(TesseractEngine::new(&config.local_engine)))
        } else {
            orchestrator
        }
    }

    pub fn from_config(config: &Config, sink: Arc<EventSink>) -> Result<Self> {
        let transport = Arc::new(ReqwestTransport::new()?);
        Ok(Self::from_parts(config, transport, sink))
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    pub fn relay(&self) -> &Arc<LogRelay> {
        &self.relay
    }

    pub fn sink(&self) -> &Arc<EventSink> {
        &self.sink
    }

    pub fn phase(&self) -> SubmissionPhase {
        *self.phase.borrow()
    }

    pub fn phase_updates(&self) -> watch::Receiver<SubmissionPhase> {
        self.phase.subscribe()
    }

    fn set_phase(&self, phase: SubmissionPhase) {
        self.phase.send_replace(phase);
    }

    /// Back to idle unless another remote call is still in flight.
    fn settle_phase(&self) {
        if *lock_scopes(&self.remote_scopes) == 0 {
            self.set_phase(SubmissionPhase::Idle);
        }
    }

    /// Submit one file. A newer call started before this one finished
    /// preprocessing makes this one return [`ClientError::Superseded`].
    pub async fn submit(&self, file: InputFile) -> Result<RecognitionResult> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let submission_id = Uuid::new_v4();
        let timer = Timer::new();

        self.sink.log(
            LogLevel::Info,
            LogCategory::User,
            format!("Submitting {}", file.name),
            Some(serde_json::json!({
                "submissionId": submission_id.to_string(),
                "bytes": file.bytes.len(),
            })),
            None,
        );

        self.set_phase(SubmissionPhase::Preprocessing);
        let remote_reachable = self.monitor.status().is_available;
        let prepared = self.preprocessor.process(file, remote_reachable).await;

        if self.generation.load(Ordering::SeqCst) != generation {
            self.sink.info(
                LogCategory::User,
                format!("Discarding {}: a newer file was selected", prepared.image.file_name),
            );
            return Err(ClientError::Superseded);
        }

        self.set_phase(SubmissionPhase::EngineSelection);
        let engine = match self.select_engine() {
            Ok(engine) => engine,
            Err(err) => {
                self.settle_phase();
                self.sink.error(
                    LogCategory::Recognition,
                    "No recognition engine available",
                    Some(&err),
                );
                return Err(err);
            }
        };

        let outcome = match engine {
            EngineKind::Remote => self.run_remote(&prepared.image).await,
            EngineKind::Local => self.run_local(&prepared.image).await,
        };
        self.settle_phase();

        match outcome {
            Ok(output) => {
                metrics::SUBMISSIONS.with_label_values(&[engine.as_str(), "success"]).inc();
                let result = RecognitionResult {
                    submission_id,
                    engine,
                    filename: prepared.image.file_name.clone(),
                    text: output.text,
                    confidence: output.confidence,
                    blocks: output.blocks,
                    parsed: output.parsed,
                    layout: output.layout,
                    preprocessing: prepared.transformations,
                    remote_log_lines: output.remote_log_lines,
                    elapsed_ms: timer.elapsed_ms(),
                };
                self.sink.success(
                    LogCategory::Recognition,
                    format!(
                        "Recognised {} via {} engine ({} items, {}ms)",
                        result.filename,
                        engine.as_str(),
                        result.parsed.items.len(),
                        result.elapsed_ms
                    ),
                );
                Ok(result)
            }
            Err(err) => {
                metrics::SUBMISSIONS.with_label_values(&[engine.as_str(), "failure"]).inc();
                self.sink.error(
                    LogCategory::Recognition,
                    format!("Submission via {} engine failed", engine.as_str()),
                    Some(&err),
                );
                Err(err)
            }
        }
    }

    /// Snapshot read of the monitor; never waits for a probe.
    fn select_engine(&self) -> Result<EngineKind> {
        let status = self.monitor.status();
        if status.is_available {
            self.sink.info(LogCategory::Recognition, "Using remote engine");
            return Ok(EngineKind::Remote);
        }
        if self.local.is_some() {
            self.sink.warn(
                LogCategory::Recognition,
                "Remote service unavailable; using local engine",
            );
            return Ok(EngineKind::Local);
        }
        Err(ClientError::NoEngineAvailable(
            status
                .error
                .unwrap_or_else(|| "remote service has not reported healthy".to_string()),
        ))
    }

    async fn run_remote(&self, image: &NormalizedImage) -> Result<EngineOutput> {
        let lines = Arc::new(AtomicUsize::new(0));
        let _scope = RemoteCallScope::enter(self, lines.clone());

        self.set_phase(SubmissionPhase::AwaitingResponse);
        let payload = match tokio::time::timeout(
            self.submit_timeout,
            self.client.submit(image, self.submit_timeout),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(ClientError::timeout("OCR submission", self.submit_timeout)),
        };

        Ok(normalize_remote(payload, lines.load(Ordering::Relaxed)))
    }

    async fn run_local(&self, image: &NormalizedImage) -> Result<EngineOutput> {
        let engine = self
            .local
            .as_ref()
            .ok_or_else(|| {
                ClientError::NoEngineAvailable("no local engine configured".to_string())
            })?;

        self.set_phase(SubmissionPhase::AwaitingResponse);
        let recognition = engine.recognize(image).await?;
        self.sink.debug(
            LogCategory::Recognition,
            format!(
                "{} recognised {} characters (confidence {:.2})",
                engine.name(),
                recognition.text.len(),
                recognition.confidence
            ),
        );

        Ok(EngineOutput {
            parsed: receipt::parse_text(&recognition.text),
            text: recognition.text,
            confidence: Some(recognition.confidence),
            blocks: Vec::new(),
            layout: None,
            remote_log_lines: 0,
        })
    }
}

/// Fill in fields the remote response may omit, using the same parser as the
/// local path. Blocks are read top to bottom.
fn normalize_remote(payload: OcrPayload, remote_log_lines: usize) -> EngineOutput {
    let confidence = payload.mean_confidence();

    let mut ordered: Vec<&TextBlock> = payload.blocks.iter().collect();
    ordered.sort_by(|a, b| a.y.total_cmp(&b.y));
    let lines: Vec<&str> = ordered.iter().map(|b| b.text.as_str()).collect();

    let text = payload.raw_text.clone().unwrap_or_else(|| lines.join("\n"));
    let parsed = match payload.parsed {
        Some(parsed) => parsed,
        None if !lines.is_empty() => receipt::parse_receipt(&lines),
        None => receipt::parse_text(&text),
    };

    EngineOutput {
        text,
        confidence,
        blocks: payload.blocks,
        parsed,
        layout: payload.layout,
        remote_log_lines,
    }
}
