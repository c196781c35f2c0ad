use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Image error: {0}")]
    Image(String),

    #[error("Preprocessing error: {0}")]
    Preprocess(String),

    #[error("Service unhealthy: {0}")]
    Unhealthy(String),

    #[error("Recognition failed: {0}")]
    Recognition(String),

    #[error("Local engine error: {0}")]
    LocalEngine(String),

    #[error("No recognition engine available: {0}")]
    NoEngineAvailable(String),

    #[error("Submission superseded by a newer file selection")]
    Superseded,

    #[error("Log polling is unavailable while the relay is active")]
    StreamingActive,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid data format: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;

impl ClientError {
    pub fn timeout(operation: impl Into<String>, timeout: std::time::Duration) -> Self {
        ClientError::Timeout {
            operation: operation.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Timeouts, refused connections and 5xx responses: the failures a later
    /// probe may not see again.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Network(_) | ClientError::Timeout { .. } => true,
            ClientError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Timeout {
                operation: err
                    .url()
                    .map(|u| u.to_string())
                    .unwrap_or_else(|| "request".to_string()),
                timeout_ms: 0,
            }
        } else if let Some(status) = err.status() {
            ClientError::Http {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            ClientError::Network(err.to_string())
        }
    }
}

impl From<image::ImageError> for ClientError {
    fn from(err: image::ImageError) -> Self {
        ClientError::Image(err.to_string())
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for ClientError {
    fn from(err: anyhow::Error) -> Self {
        ClientError::Internal(err.to_string())
    }
}
