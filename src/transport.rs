//! HTTP transport seam
//!
//! Every component talks to the remote service through [`Transport`]. The
//! production stack is a [`ReqwestTransport`] wrapped once in a
//! [`LoggingTransport`], which records each dispatch and completion in the
//! event sink without ever copying request or response payloads.

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ClientError, Result};
use crate::event_sink::{EventSink, LogCategory, LogLevel};
use crate::metrics::{self, Timer};

/// Longest body preview ever written to the event log.
pub const BODY_PREVIEW_LIMIT: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

#[derive(Debug, Clone)]
pub enum RequestBody {
    Empty,
    Json(serde_json::Value),
    Multipart {
        field: String,
        file_name: String,
        mime: String,
        data: Vec<u8>,
    },
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub body: RequestBody,
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            body: RequestBody::Empty,
            timeout: None,
        }
    }

    pub fn post_json(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            body: RequestBody::Json(body),
            timeout: None,
        }
    }

    pub fn post_file(
        url: impl Into<String>,
        field: impl Into<String>,
        file_name: impl Into<String>,
        mime: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            body: RequestBody::Multipart {
                field: field.into(),
                file_name: file_name.into(),
                mime: mime.into(),
                data,
            },
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(ClientError::from)
    }

    /// Human-readable failure reason: the `{error}` field when the body
    /// carries one, otherwise the status line.
    pub fn error_message(&self) -> String {
        #[derive(serde::Deserialize)]
        struct ErrorBody {
            error: String,
        }

        match serde_json::from_slice::<ErrorBody>(&self.body) {
            Ok(body) => body.error,
            Err(_) => format!("HTTP {}", self.status),
        }
    }

    /// Convert a non-2xx response into [`ClientError::Http`].
    pub fn error_for_status(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ClientError::Http {
                status: self.status,
                message: self.error_message(),
            })
        }
    }
}

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform one request. Non-2xx statuses are returned, not raised.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;

    /// Open a long-lived one-way byte stream (server-sent events).
    async fn open_stream(&self, url: &str) -> Result<ByteStream>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
        };

        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(&value),
            RequestBody::Multipart {
                field,
                file_name,
                mime,
                data,
            } => {
                let part = reqwest::multipart::Part::bytes(data)
                    .file_name(file_name)
                    .mime_str(&mime)?;
                builder.multipart(reqwest::multipart::Form::new().part(field, part))
            }
        };

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ClientError::Timeout {
                    operation: format!("{} {}", request.method.as_str(), request.url),
                    timeout_ms: request.timeout.map_or(0, |t| t.as_millis() as u64),
                }
            } else {
                ClientError::from(e)
            }
        })?;

        let status = response.status().as_u16();
        let body = response.bytes().await?.to_vec();
        Ok(HttpResponse { status, body })
    }

    async fn open_stream(&self, url: &str) -> Result<ByteStream> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
            return Err(ClientError::Http {
                status,
                message: HttpResponse::new(status, body).error_message(),
            });
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(ClientError::from));
        Ok(Box::pin(stream))
    }
}

/// Decorator that mirrors every outbound call into the event sink.
pub struct LoggingTransport {
    inner: Arc<dyn Transport>,
    sink: Arc<EventSink>,
}

impl LoggingTransport {
    pub fn new(inner: Arc<dyn Transport>, sink: Arc<EventSink>) -> Self {
        Self { inner, sink }
    }
}

#[async_trait]
impl Transport for LoggingTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let method = request.method.as_str();
        let url = request.url.clone();

        self.sink.log(
            LogLevel::Debug,
            LogCategory::Network,
            format!("{} {}", method, url),
            Some(serde_json::json!({
                "method": method,
                "url": url,
                "body": describe_body(&request.body),
            })),
            None,
        );

        let timer = Timer::new();
        let result = self.inner.send(request).await;
        let latency_ms = timer.elapsed_ms();
        timer.observe_duration_seconds(&metrics::HTTP_LATENCY);

        match &result {
            Ok(response) => {
                let level = match response.status {
                    200..=399 => LogLevel::Info,
                    400..=499 => LogLevel::Warn,
                    _ => LogLevel::Error,
                };
                let outcome = if response.is_success() {
                    "success"
                } else {
                    "http_error"
                };
                metrics::HTTP_REQUESTS
                    .with_label_values(&[method, outcome])
                    .inc();
                self.sink.log(
                    level,
                    LogCategory::Network,
                    format!("{} {} → {} ({}ms)", method, url, response.status, latency_ms),
                    Some(serde_json::json!({
                        "status": response.status,
                        "latencyMs": latency_ms,
                        "responseBytes": response.body.len(),
                    })),
                    None,
                );
            }
            Err(err) => {
                metrics::HTTP_REQUESTS.with_label_values(&[method, "failure"]).inc();
                self.sink.log(
                    LogLevel::Error,
                    LogCategory::Network,
                    format!("{} {} failed: {} ({}ms)", method, url, err, latency_ms),
                    Some(serde_json::json!({ "latencyMs": latency_ms })),
                    None,
                );
            }
        }

        result
    }

    async fn open_stream(&self, url: &str) -> Result<ByteStream> {
        self.sink.debug(LogCategory::Network, format!("STREAM {}", url));
        let timer = Timer::new();

        match self.inner.open_stream(url).await {
            Ok(stream) => {
                self.sink.info(
                    LogCategory::Network,
                    format!("STREAM {} opened ({}ms)", url, timer.elapsed_ms()),
                );
                Ok(stream)
            }
            Err(err) => {
                self.sink.log(
                    LogLevel::Warn,
                    LogCategory::Network,
                    format!("STREAM {} failed: {} ({}ms)", url, err, timer.elapsed_ms()),
                    None,
                    None,
                );
                Err(err)
            }
        }
    }
}

/// Summarise a request body for logging: sizes and a short prefix, never the payload.
pub fn describe_body(body: &RequestBody) -> String {
    match body {
        RequestBody::Empty => "none".to_string(),
        RequestBody::Json(value) => {
            let text = value.to_string();
            format!("json ({} bytes): {}", text.len(), preview(&text, BODY_PREVIEW_LIMIT))
        }
        RequestBody::Multipart {
            field,
            file_name,
            mime,
            data,
        } => format!(
            "multipart {}='{}' ({}, {} bytes)",
            field,
            file_name,
            mime,
            data.len()
        ),
    }
}

fn preview(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}… [{} bytes elided]", &text[..end], text.len() - end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_sink::LogFilter;

    struct StaticTransport {
        status: u16,
        fail: bool,
    }

    #[async_trait]
    impl Transport for StaticTransport {
        async fn send(&self, _request: HttpRequest) -> Result<HttpResponse> {
            if self.fail {
                Err(ClientError::Network("connection refused".into()))
            } else {
                Ok(HttpResponse::new(self.status, br#"{"error":"nope"}"#.to_vec()))
            }
        }

        async fn open_stream(&self, _url: &str) -> Result<ByteStream> {
            Err(ClientError::Network("no streams".into()))
        }
    }

    fn logging(status: u16, fail: bool) -> (LoggingTransport, Arc<EventSink>) {
        let sink = Arc::new(EventSink::new(50));
        let transport =
            LoggingTransport::new(Arc::new(StaticTransport { status, fail }), sink.clone());
        (transport, sink)
    }

    #[tokio::test]
    async fn test_logs_dispatch_and_completion() {
        let (transport, sink) = logging(200, false);
        transport.send(HttpRequest::get("http://svc/health")).await.unwrap();

        let entries = sink.entries(&LogFilter::category(LogCategory::Network));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].level, LogLevel::Debug);
        assert_eq!(entries[0].message, "GET http://svc/health");
        assert_eq!(entries[1].level, LogLevel::Info);
        assert!(entries[1].message.contains("→ 200"));
    }

    #[tokio::test]
    async fn test_client_and_server_errors_escalate_level() {
        let (transport, sink) = logging(404, false);
        transport.send(HttpRequest::get("http://svc/missing")).await.unwrap();
        assert_eq!(sink.entries(&LogFilter::default())[1].level, LogLevel::Warn);

        let (transport, sink) = logging(503, false);
        transport.send(HttpRequest::get("http://svc/health")).await.unwrap();
        assert_eq!(sink.entries(&LogFilter::default())[1].level, LogLevel::Error);
    }

    #[tokio::test]
    async fn test_failure_is_logged_and_returned() {
        let (transport, sink) = logging(200, true);
        let result = transport.send(HttpRequest::get("http://svc/health")).await;
        assert!(result.is_err());

        let last = sink.entries(&LogFilter::default()).pop().unwrap();
        assert_eq!(last.level, LogLevel::Error);
        assert!(last.message.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_large_bodies_are_never_logged() {
        let (transport, sink) = logging(200, false);
        let image = "A".repeat(100_000);
        transport
            .send(HttpRequest::post_json(
                "http://svc/detect-rotation",
                serde_json::json!({ "image": format!("data:image/png;base64,{}", image) }),
            ))
            .await
            .unwrap();

        for entry in sink.entries(&LogFilter::default()) {
            let serialized = serde_json::to_string(&entry).unwrap();
            assert!(serialized.len() < 1_000, "entry leaked payload: {} bytes", serialized.len());
        }
    }

    #[test]
    fn test_describe_multipart_reports_size_only() {
        let body = RequestBody::Multipart {
            field: "file".into(),
            file_name: "receipt.jpg".into(),
            mime: "image/jpeg".into(),
            data: vec![0u8; 4096],
        };
        assert_eq!(describe_body(&body), "multipart file='receipt.jpg' (image/jpeg, 4096 bytes)");
    }

    #[test]
    fn test_error_message_prefers_error_field() {
        let body = br#"{"error":"OCR engine not initialized"}"#.to_vec();
        let with_field = HttpResponse::new(500, body);
        assert_eq!(with_field.error_message(), "OCR engine not initialized");
        assert_eq!(
            HttpResponse::new(502, b"<html>".to_vec()).error_message(),
            "HTTP 502"
        );
    }
}
