//! Environment-driven configuration.
//!
//! Every recognized key is read once at startup into an explicit record;
//! malformed values are startup errors (the process exits with code 2,
//! see `main.rs`). No other code reads the environment.

use std::net::SocketAddr;
use std::time::Duration;

/// Default Vision-style face detection endpoint.
const DEFAULT_FACE_DETECTOR_URL: &str = "https://vision.googleapis.com/v1/images:annotate";

/// Default Live model served over the bidirectional WebSocket.
const DEFAULT_LIVE_MODEL: &str = "models/gemini-2.0-flash-live-001";

/// Default model used for spatial surface analysis.
const DEFAULT_SPATIAL_MODEL: &str = "gemini-1.5-pro";

/// Log verbosity, mirrored into the tracing `EnvFilter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// A configuration error. Carries the offending key so the operator can
/// fix exactly one thing.
#[derive(Debug)]
pub struct ConfigError {
    pub key: &'static str,
    pub detail: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid configuration: {}: {}", self.key, self.detail)
    }
}

impl std::error::Error for ConfigError {}

/// Fully resolved gateway configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Credential for the upstream Live service and the surface analyzer.
    pub live_api_key: String,
    /// Blob store root (filesystem implementation).
    pub blob_bucket: String,
    /// Record store location (sqlite implementation).
    pub record_namespace: String,
    /// Video sampling cadence.
    pub sample_interval: Duration,
    /// Faces above which a frame is blocked outright.
    pub crowd_threshold: usize,
    /// Minimum Gaussian blur radius in pixels.
    pub blur_radius_min: u32,
    /// Lifetime of minted download URLs.
    pub signed_url_ttl: Duration,
    /// Per-source requests/minute on the privacy and spatial endpoints.
    pub rate_limit_rpm: u32,
    /// Idle watchdog timeout for sessions.
    pub session_idle: Duration,
    /// Hard wall-clock cap per session.
    pub session_max: Duration,
    /// Allowed CORS origins; empty disallows cross-origin calls.
    pub cors_allowed_origins: Vec<String>,
    /// Log verbosity.
    pub log_level: LogLevel,
    /// Listen address.
    pub bind_addr: SocketAddr,
    /// Face-detection endpoint.
    pub face_detector_url: String,
    /// Live model identifier (sent in the setup message).
    pub live_model: String,
    /// Spatial analyzer model identifier.
    pub spatial_model: String,
    /// HMAC key for minted download URLs.
    pub url_signing_key: Vec<u8>,
    /// Short-term RMS energy above which client audio counts as speech.
    pub interrupt_rms: u32,
    /// Sustained speech duration that triggers barge-in.
    pub interrupt_min: Duration,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let live_api_key = std::env::var("LIVE_API_KEY").map_err(|_| ConfigError {
            key: "LIVE_API_KEY",
            detail: "required but not set".into(),
        })?;
        if live_api_key.trim().is_empty() {
            return Err(ConfigError {
                key: "LIVE_API_KEY",
                detail: "must not be empty".into(),
            });
        }

        let url_signing_key = match std::env::var("URL_SIGNING_KEY") {
            Ok(v) if !v.is_empty() => v.into_bytes(),
            // Random per boot: previously minted URLs die with the process.
            _ => rand::random::<[u8; 32]>().to_vec(),
        };

        Ok(Self {
            live_api_key,
            blob_bucket: env_or("BLOB_BUCKET", "./data/blobs"),
            record_namespace: env_or("RECORD_NAMESPACE", "./data/gallery.db"),
            sample_interval: Duration::from_millis(parse_u64("SAMPLE_INTERVAL_MS", 1000, 50)?),
            crowd_threshold: parse_u64("CROWD_THRESHOLD", 3, 1)? as usize,
            blur_radius_min: parse_u64("BLUR_RADIUS_MIN", 15, 1)? as u32,
            signed_url_ttl: Duration::from_secs(parse_u64("SIGNED_URL_TTL_SECS", 900, 1)?),
            rate_limit_rpm: parse_u64("RATE_LIMIT_RPM", 10, 1)? as u32,
            session_idle: Duration::from_secs(parse_u64("SESSION_IDLE_SECS", 300, 1)?),
            session_max: Duration::from_secs(parse_u64("SESSION_MAX_SECS", 3600, 1)?),
            cors_allowed_origins: parse_origins(),
            log_level: parse_log_level()?,
            bind_addr: parse_bind_addr()?,
            face_detector_url: env_or("FACE_DETECTOR_URL", DEFAULT_FACE_DETECTOR_URL),
            live_model: env_or("LIVE_MODEL", DEFAULT_LIVE_MODEL),
            spatial_model: env_or("SPATIAL_MODEL", DEFAULT_SPATIAL_MODEL),
            url_signing_key,
            interrupt_rms: parse_u64("INTERRUPT_RMS", 900, 1)? as u32,
            interrupt_min: Duration::from_millis(parse_u64("INTERRUPT_MIN_MS", 200, 20)?),
        })
    }

    /// A configuration suitable for tests: no environment access.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            live_api_key: "test-key".into(),
            blob_bucket: "./data/blobs".into(),
            record_namespace: ":memory:".into(),
            sample_interval: Duration::from_millis(1000),
            crowd_threshold: 3,
            blur_radius_min: 15,
            signed_url_ttl: Duration::from_secs(900),
            rate_limit_rpm: 10,
            session_idle: Duration::from_secs(300),
            session_max: Duration::from_secs(3600),
            cors_allowed_origins: Vec::new(),
            log_level: LogLevel::Info,
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            face_detector_url: DEFAULT_FACE_DETECTOR_URL.into(),
            live_model: DEFAULT_LIVE_MODEL.into(),
            spatial_model: DEFAULT_SPATIAL_MODEL.into(),
            url_signing_key: b"test-signing-key".to_vec(),
            interrupt_rms: 900,
            interrupt_min: Duration::from_millis(200),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_u64(key: &'static str, default: u64, min: u64) -> Result<u64, ConfigError> {
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) if raw.is_empty() => Ok(default),
        Ok(raw) => {
            let value: u64 = raw.parse().map_err(|_| ConfigError {
                key,
                detail: format!("expected an integer, got {raw:?}"),
            })?;
            if value < min {
                return Err(ConfigError {
                    key,
                    detail: format!("must be at least {min}"),
                });
            }
            Ok(value)
        }
    }
}

fn parse_origins() -> Vec<String> {
    std::env::var("CORS_ALLOWED_ORIGINS")
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

fn parse_log_level() -> Result<LogLevel, ConfigError> {
    match std::env::var("LOG_LEVEL") {
        Err(_) => Ok(LogLevel::Info),
        Ok(raw) if raw.is_empty() => Ok(LogLevel::Info),
        Ok(raw) => LogLevel::parse(&raw).ok_or(ConfigError {
            key: "LOG_LEVEL",
            detail: format!("expected one of debug|info|warn|error, got {raw:?}"),
        }),
    }
}

fn parse_bind_addr() -> Result<SocketAddr, ConfigError> {
    let raw = env_or("BIND_ADDR", "0.0.0.0:8080");
    raw.parse().map_err(|_| ConfigError {
        key: "BIND_ADDR",
        detail: format!("expected host:port, got {raw:?}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_level_parse() {
        assert_eq!(LogLevel::parse("debug"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("INFO"), Some(LogLevel::Info));
        assert_eq!(LogLevel::parse("trace"), None);
        assert_eq!(LogLevel::parse(""), None);
    }

    #[test]
    fn log_level_as_str_roundtrip() {
        for level in [
            LogLevel::Debug,
            LogLevel::Info,
            LogLevel::Warn,
            LogLevel::Error,
        ] {
            assert_eq!(LogLevel::parse(level.as_str()), Some(level));
        }
    }

    #[test]
    fn defaults_are_the_documented_values() {
        let config = Config::for_tests();
        assert_eq!(config.sample_interval, Duration::from_millis(1000));
        assert_eq!(config.crowd_threshold, 3);
        assert_eq!(config.blur_radius_min, 15);
        assert_eq!(config.signed_url_ttl, Duration::from_secs(900));
        assert_eq!(config.rate_limit_rpm, 10);
        assert_eq!(config.session_idle, Duration::from_secs(300));
    }

    #[test]
    fn config_error_display_names_key() {
        let err = ConfigError {
            key: "SAMPLE_INTERVAL_MS",
            detail: "expected an integer".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("SAMPLE_INTERVAL_MS"));
        assert!(msg.contains("expected an integer"));
    }
}
