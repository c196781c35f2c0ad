pub mod config;
pub mod error;
pub mod event_sink;
pub mod health;
pub mod listeners;
pub mod local;
pub mod metrics;
pub mod orchestrator;
pub mod preprocess;
pub mod receipt;
pub mod relay;
pub mod remote;
pub mod transport;

// Re-export commonly used types for easier testing
pub use crate::config::Config;
pub use crate::error::{ClientError, Result};
pub use crate::event_sink::{EventSink, LogCategory, LogEntry, LogFilter, LogLevel};
pub use crate::health::{HealthMonitor, HealthState, HealthStatus, MonitorSnapshot};
pub use crate::listeners::Subscription;
pub use crate::local::{LocalEngine, LocalRecognition, TesseractEngine};
pub use crate::orchestrator::{EngineKind, RecognitionResult, RequestOrchestrator, SubmissionPhase};
pub use crate::preprocess::{
    ContainerDecoder, InputFile, NormalizedImage, OrientationDetector, OrientationEstimate,
    PreprocessResult, Preprocessor, RotationSource, Transformation,
};
pub use crate::receipt::{ParsedReceipt, ReceiptItem};
pub use crate::relay::LogRelay;
pub use crate::remote::{RemoteClient, StreamedLog};
pub use crate::transport::{
    HttpRequest, HttpResponse, LoggingTransport, ReqwestTransport, Transport,
};
