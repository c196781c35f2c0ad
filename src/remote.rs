//! Typed client for the remote recognition service.

use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ClientError, Result};
use crate::preprocess::{NormalizedImage, OrientationDetector, OrientationEstimate};
use crate::receipt::ParsedReceipt;
use crate::transport::{HttpRequest, Transport};

/// Response of `GET /health`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthPayload {
    #[serde(default)]
    pub status: String,
    #[serde(default, alias = "engine")]
    pub ocr_engine: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
}

impl HealthPayload {
    pub fn is_healthy(&self) -> bool {
        matches!(self.status.to_ascii_lowercase().as_str(), "healthy" | "ok")
    }
}

/// One recognised region with its bounding box in image pixels.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextBlock {
    pub text: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default, alias = "_x")]
    pub x: f64,
    #[serde(default, alias = "_y")]
    pub y: f64,
    #[serde(default, alias = "_w")]
    pub width: f64,
    #[serde(default, alias = "_h")]
    pub height: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutSummary {
    pub column_count: u32,
    pub row_count: u32,
}

/// Response of `POST /ocr`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OcrPayload {
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default, alias = "text")]
    pub raw_text: Option<String>,
    #[serde(default, alias = "structuredBlocks")]
    pub blocks: Vec<TextBlock>,
    #[serde(default, alias = "parsedFields")]
    pub parsed: Option<ParsedReceipt>,
    #[serde(default)]
    pub layout: Option<LayoutSummary>,
    #[serde(default)]
    pub error: Option<String>,
}

impl OcrPayload {
    /// Mean block confidence, when any blocks were returned.
    pub fn mean_confidence(&self) -> Option<f64> {
        if self.blocks.is_empty() {
            return None;
        }
        Some(self.blocks.iter().map(|b| b.confidence).sum::<f64>() / self.blocks.len() as f64)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RotationPayload {
    #[serde(alias = "angle")]
    orientation: i32,
    #[serde(default)]
    confidence: f64,
}

/// One remote-origin log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamedLog {
    /// Unix seconds, fractional
    #[serde(default)]
    pub timestamp: f64,
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub message: String,
}

fn default_level() -> String {
    "info".to_string()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EventsPayload {
    Lines(Vec<StreamedLog>),
    Wrapped { logs: Vec<StreamedLog> },
}

#[derive(Clone)]
pub struct RemoteClient {
    transport: Arc<dyn Transport>,
    base_url: String,
}

impl RemoteClient {
    pub fn new(transport: Arc<dyn Transport>, base_url: impl Into<String>) -> Self {
        Self {
            transport,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn events_url(&self) -> String {
        self.url("/events")
    }

    /// One probe. Unhealthy statuses are errors quoting the reported status.
    pub async fn health(&self, timeout: Duration) -> Result<HealthPayload> {
        let response = self
            .transport
            .send(HttpRequest::get(self.url("/health")).with_timeout(timeout))
            .await?
            .error_for_status()?;

        let payload: HealthPayload = response.json()?;
        if !payload.is_healthy() {
            return Err(ClientError::Unhealthy(format!(
                "service reported status '{}'",
                payload.status
            )));
        }
        Ok(payload)
    }

    pub async fn submit(&self, image: &NormalizedImage, timeout: Duration) -> Result<OcrPayload> {
        let request = HttpRequest::post_file(
            self.url("/ocr"),
            "file",
            image.file_name.clone(),
            image.mime.clone(),
            image.bytes.clone(),
        )
        .with_timeout(timeout);

        let response = self.transport.send(request).await?.error_for_status()?;
        let payload: OcrPayload = response.json()?;

        // A 2xx body with only an error ("No text detected") is still a failure
        if payload.raw_text.is_none() && payload.blocks.is_empty() {
            return Err(ClientError::Recognition(
                payload
                    .error
                    .unwrap_or_else(|| "response carried no recognised text".to_string()),
            ));
        }
        Ok(payload)
    }

    pub async fn detect_orientation(&self, png: &[u8]) -> Result<OrientationEstimate> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(png);
        let body = serde_json::json!({ "image": format!("data:image/png;base64,{}", encoded) });

        let response = self
            .transport
            .send(HttpRequest::post_json(self.url("/detect-rotation"), body))
            .await?
            .error_for_status()?;
        let payload: RotationPayload = response.json()?;
        Ok(OrientationEstimate {
            angle: payload.orientation,
            confidence: payload.confidence,
        })
    }

    /// Buffered lines newer than `since` (Unix seconds).
    pub async fn poll_events(&self, since: f64) -> Result<Vec<StreamedLog>> {
        let response = self
            .transport
            .send(HttpRequest::get(format!("{}?since={}", self.events_url(), since)))
            .await?
            .error_for_status()?;

        Ok(match response.json::<EventsPayload>()? {
            EventsPayload::Lines(lines) => lines,
            EventsPayload::Wrapped { logs } => logs,
        })
    }
}

#[async_trait]
impl OrientationDetector for RemoteClient {
    async fn detect(&self, png: &[u8]) -> Result<OrientationEstimate> {
        self.detect_orientation(png).await
    }
}
