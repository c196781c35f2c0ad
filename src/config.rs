use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ClientError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub remote: RemoteConfig,
    pub health: HealthConfig,
    pub relay: RelayConfig,
    pub preprocess: PreprocessConfig,
    pub local_engine: LocalEngineConfig,
    /// Maximum number of entries retained by the event sink
    pub log_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub base_url: String,
    /// Upper bound for a single submission round-trip
    pub submit_timeout: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5001".to_string(),
            submit_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    pub interval: Duration,
    pub probe_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(3),
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Interval of the pull fallback used when the event stream cannot be opened
    pub poll_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessConfig {
    pub jpeg_quality: u8,
    pub orientation_min_confidence: f64,
    pub detect_orientation: bool,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: 85,
            orientation_min_confidence: 0.3,
            detect_orientation: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalEngineConfig {
    pub enabled: bool,
    pub binary: String,
    pub language: String,
}

impl Default for LocalEngineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            binary: "tesseract".to_string(),
            language: "eng".to_string(),
        }
    }
}

pub const DEFAULT_LOG_CAPACITY: usize = 500;

impl Default for Config {
    fn default() -> Self {
        Self {
            remote: RemoteConfig::default(),
            health: HealthConfig::default(),
            relay: RelayConfig::default(),
            preprocess: PreprocessConfig::default(),
            local_engine: LocalEngineConfig::default(),
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

/// Parse an environment variable, keeping `default` when it is unset or malformed.
fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "Ignoring malformed configuration value");
            default
        }),
        Err(_) => default,
    }
}

fn env_millis(key: &str, default: Duration) -> Duration {
    Duration::from_millis(env_parse(key, default.as_millis() as u64))
}

impl Config {
    pub fn load() -> Result<Self> {
        let remote_defaults = RemoteConfig::default();
        let base_url = env::var("OCR_API_URL")
            .unwrap_or(remote_defaults.base_url)
            .trim_end_matches('/')
            .to_string();

        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ClientError::Config(format!(
                "OCR_API_URL must be an http(s) URL, got {}",
                base_url
            )));
        }

        let health_defaults = HealthConfig::default();
        let health = HealthConfig {
            interval: env_millis("OCR_HEALTH_INTERVAL_MS", health_defaults.interval),
            probe_timeout: env_millis("OCR_HEALTH_TIMEOUT_MS", health_defaults.probe_timeout),
            max_retries: env_parse("OCR_HEALTH_MAX_RETRIES", health_defaults.max_retries),
            retry_delay: env_millis("OCR_HEALTH_RETRY_DELAY_MS", health_defaults.retry_delay),
        };

        let relay = RelayConfig {
            poll_interval: env_millis(
                "OCR_RELAY_POLL_INTERVAL_MS",
                RelayConfig::default().poll_interval,
            ),
        };

        let preprocess_defaults = PreprocessConfig::default();
        let preprocess = PreprocessConfig {
            jpeg_quality: env_parse("OCR_JPEG_QUALITY", preprocess_defaults.jpeg_quality)
                .clamp(1, 100),
            orientation_min_confidence: env_parse(
                "OCR_ORIENTATION_MIN_CONFIDENCE",
                preprocess_defaults.orientation_min_confidence,
            ),
            detect_orientation: env_parse(
                "OCR_DETECT_ORIENTATION",
                preprocess_defaults.detect_orientation,
            ),
        };

        let local_defaults = LocalEngineConfig::default();
        let local_engine = LocalEngineConfig {
            enabled: env_parse("OCR_LOCAL_ENGINE", local_defaults.enabled),
            binary: env::var("TESSERACT_BIN").unwrap_or(local_defaults.binary),
            language: env::var("TESSERACT_LANG").unwrap_or(local_defaults.language),
        };

        Ok(Self {
            remote: RemoteConfig {
                base_url,
                submit_timeout: env_millis("OCR_SUBMIT_TIMEOUT_MS", remote_defaults.submit_timeout),
            },
            health,
            relay,
            preprocess,
            local_engine,
            log_capacity: env_parse("OCR_LOG_CAPACITY", DEFAULT_LOG_CAPACITY).max(1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults_match_documented_values() {
        let health = HealthConfig::default();
        assert_eq!(health.interval, Duration::from_secs(10));
        assert_eq!(health.probe_timeout, Duration::from_secs(3));
        assert_eq!(health.max_retries, 3);
        assert_eq!(health.retry_delay, Duration::from_secs(2));

        let preprocess = PreprocessConfig::default();
        assert_eq!(preprocess.jpeg_quality, 85);
        assert!((preprocess.orientation_min_confidence - 0.3).abs() < f64::EPSILON);
    }

    #[test]
    #[serial]
    fn test_load_reads_environment() {
        env::set_var("OCR_API_URL", "http://ocr.internal:9000/");
        env::set_var("OCR_HEALTH_MAX_RETRIES", "5");
        env::set_var("OCR_LOG_CAPACITY", "not-a-number");

        let config = Config::load().unwrap();
        assert_eq!(config.remote.base_url, "http://ocr.internal:9000");
        assert_eq!(config.health.max_retries, 5);
        assert_eq!(config.log_capacity, DEFAULT_LOG_CAPACITY);

        env::remove_var("OCR_API_URL");
        env::remove_var("OCR_HEALTH_MAX_RETRIES");
        env::remove_var("OCR_LOG_CAPACITY");
    }

    #[test]
    #[serial]
    fn test_load_rejects_non_http_url() {
        env::set_var("OCR_API_URL", "ftp://example.com");
        let err = Config::load().unwrap_err();
        assert!(matches!(err, ClientError::Config(ref m) if m.contains("ftp://example.com")));
        env::remove_var("OCR_API_URL");
    }
}
