//! Scripted in-memory transport shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream;
use receipts_ocr_client::transport::{ByteStream, HttpRequest, HttpResponse, Transport};
use receipts_ocr_client::{ClientError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const BASE_URL: &str = "http://ocr.test";

type Handler = Arc<dyn Fn(&HttpRequest) -> Result<HttpResponse> + Send + Sync>;

#[derive(Clone)]
pub enum StreamScript {
    Refuse,
    /// Deliver the chunks, then end the stream
    Finite(Vec<String>),
    /// Deliver the chunks, then stay open
    HoldOpen(Vec<String>),
    /// Deliver the chunks, then fail
    FailAfter(Vec<String>),
}

pub struct ScriptedTransport {
    routes: Mutex<HashMap<String, Handler>>,
    delays: Mutex<HashMap<String, Duration>>,
    calls: Mutex<Vec<String>>,
    stream: Mutex<StreamScript>,
    streams_opened: Mutex<usize>,
}

pub fn json(status: u16, body: serde_json::Value) -> Result<HttpResponse> {
    Ok(HttpResponse::new(status, body.to_string().into_bytes()))
}

pub fn path_of(url: &str) -> &str {
    let rest = url.strip_prefix(BASE_URL).unwrap_or(url);
    rest.split('?').next().unwrap_or(rest)
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            routes: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            stream: Mutex::new(StreamScript::Refuse),
            streams_opened: Mutex::new(0),
        })
    }

    /// Transport whose `/health` reports a ready service.
    pub fn healthy() -> Arc<Self> {
        let transport = Self::new();
        transport.on("/health", |_| {
            json(200, serde_json::json!({ "status": "healthy", "ocr_engine": "ready" }))
        });
        transport
    }

    pub fn on<F>(&self, path: &str, handler: F)
    where
        F: Fn(&HttpRequest) -> Result<HttpResponse> + Send + Sync + 'static,
    {
        self.routes.lock().unwrap().insert(path.to_string(), Arc::new(handler));
    }

    pub fn delay(&self, path: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(path.to_string(), delay);
    }

    pub fn set_stream(&self, script: StreamScript) {
        *self.stream.lock().unwrap() = script;
    }

    pub fn calls_to(&self, path: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|u| path_of(u) == path).count()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn streams_opened(&self) -> usize {
        *self.streams_opened.lock().unwrap()
    }
}

fn chunks(lines: Vec<String>) -> impl futures::Stream<Item = Result<Vec<u8>>> + Send {
    stream::iter(lines.into_iter().map(|l| Ok(l.into_bytes())))
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.calls.lock().unwrap().push(request.url.clone());
        let path = path_of(&request.url).to_string();

        let delay = self.delays.lock().unwrap().get(&path).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let handler = self.routes.lock().unwrap().get(&path).cloned();
        match handler {
            Some(handler) => handler(&request),
            None => json(404, serde_json::json!({ "error": "Not found" })),
        }
    }

    async fn open_stream(&self, _url: &str) -> Result<ByteStream> {
        let script = self.stream.lock().unwrap().clone();
        let stream: ByteStream = match script {
            StreamScript::Refuse => {
                return Err(ClientError::Http {
                    status: 404,
                    message: "Not found".into(),
                })
            }
            StreamScript::Finite(lines) => Box::pin(chunks(lines)),
            StreamScript::HoldOpen(lines) => {
                use futures::StreamExt;
                Box::pin(chunks(lines).chain(stream::pending()))
            }
            StreamScript::FailAfter(lines) => {
                use futures::StreamExt;
                Box::pin(chunks(lines).chain(stream::once(async {
                    Err(ClientError::Network("connection reset by peer".into()))
                })))
            }
        };
        *self.streams_opened.lock().unwrap() += 1;
        Ok(stream)
    }
}

pub fn event(timestamp: f64, level: &str, message: &str) -> String {
    format!(
        "data: {}\n\n",
        serde_json::json!({ "timestamp": timestamp, "level": level, "message": message })
    )
}

/// Poll `condition` every 5ms until it holds or `limit` elapses.
pub async fn wait_until<F: Fn() -> bool>(condition: F, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

pub fn png(width: u32, height: u32) -> Vec<u8> {
    let pixels = image::RgbImage::from_pixel(width, height, image::Rgb([250, 250, 250]));
    let image = image::DynamicImage::ImageRgb8(pixels);
    let mut buffer = Vec::new();
    image
        .write_to(&mut std::io::Cursor::new(&mut buffer), image::ImageFormat::Png)
        .unwrap();
    buffer
}
