//! Tracker configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/parcel-tracker/tracker.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `tracking.ws_url` (ws:// or wss://)
//! - `api.base_url` (http:// or https://)
//!
//! # Token file format
//! Raw token string on a single line; trimmed on read.  The token is
//! optional: without it the client connects anonymously.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::connection::ConnectionConfig;

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Top-level tracker configuration.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub schema_version: u32,
    /// The identity token (read from the token file, not the file path).
    pub token: Option<String>,
    pub tracking: TrackingConfig,
    pub api: ApiConfig,
    pub reconnect: ReconnectConfig,
    pub heartbeat: HeartbeatConfig,
    pub reconcile: ReconcileConfig,
}

#[derive(Debug, Clone)]
pub struct TrackingConfig {
    pub ws_url: String,
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Attempt `k` waits `base_delay * k`.
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(DEFAULT_RECONNECT_BASE_DELAY_MS),
            max_attempts: DEFAULT_RECONNECT_MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub interval: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileConfig {
    /// Delay between an applied live event and the authoritative re-fetch.
    pub settle_delay: Duration,
    /// Debounce for the re-fetch triggered by `package_created`.
    pub created_refetch_delay: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(DEFAULT_SETTLE_DELAY_MS),
            created_refetch_delay: Duration::from_millis(DEFAULT_CREATED_REFETCH_DELAY_MS),
        }
    }
}

const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 3_000;
const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;
const DEFAULT_SETTLE_DELAY_MS: u64 = 2_000;
const DEFAULT_CREATED_REFETCH_DELAY_MS: u64 = 100;

impl TrackerConfig {
    /// Connection-manager settings derived from this config.
    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            ws_url: self.tracking.ws_url.clone(),
            token: self.token.clone(),
            reconnect: self.reconnect,
            heartbeat_interval: self.heartbeat.interval,
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    tracking: Option<RawTrackingConfig>,
    api: Option<RawApiConfig>,
    auth: Option<RawAuthConfig>,
    reconnect: Option<RawReconnectConfig>,
    heartbeat: Option<RawHeartbeatConfig>,
    reconcile: Option<RawReconcileConfig>,
}

#[derive(Debug, Deserialize)]
struct RawTrackingConfig {
    ws_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawApiConfig {
    base_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawAuthConfig {
    token_file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawReconnectConfig {
    base_delay_ms: Option<u64>,
    max_attempts: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawHeartbeatConfig {
    interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawReconcileConfig {
    settle_delay_ms: Option<u64>,
    created_refetch_delay_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load tracker config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<TrackerConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load tracker config from the default path `/etc/parcel-tracker/tracker.toml`.
pub fn load_config() -> Result<TrackerConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/parcel-tracker/tracker.toml"))
}

/// Load tracker config from a TOML string.
///
/// `auth.token_file` is read relative to the process working directory.
pub fn load_config_from_str(toml_str: &str) -> Result<TrackerConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {schema_version}"
        )));
    }

    let ws_url = raw
        .tracking
        .and_then(|t| t.ws_url)
        .ok_or_else(|| ConfigError::MissingField("tracking.ws_url".to_owned()))?;
    require_scheme("tracking.ws_url", &ws_url, &["ws", "wss"])?;

    let base_url = raw
        .api
        .and_then(|a| a.base_url)
        .ok_or_else(|| ConfigError::MissingField("api.base_url".to_owned()))?;
    require_scheme("api.base_url", &base_url, &["http", "https"])?;

    let token = match raw.auth.and_then(|a| a.token_file) {
        Some(path) => Some(read_token_file(&path)?).filter(|t| !t.is_empty()),
        None => None,
    };

    let reconnect = match raw.reconnect {
        Some(r) => ReconnectConfig {
            base_delay: Duration::from_millis(
                r.base_delay_ms.unwrap_or(DEFAULT_RECONNECT_BASE_DELAY_MS),
            ),
            max_attempts: r.max_attempts.unwrap_or(DEFAULT_RECONNECT_MAX_ATTEMPTS),
        },
        None => ReconnectConfig::default(),
    };

    let interval_ms = raw
        .heartbeat
        .and_then(|h| h.interval_ms)
        .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_MS);
    if interval_ms == 0 {
        return Err(ConfigError::InvalidValue(
            "heartbeat.interval_ms must be greater than 0".to_owned(),
        ));
    }

    let reconcile = match raw.reconcile {
        Some(r) => ReconcileConfig {
            settle_delay: Duration::from_millis(
                r.settle_delay_ms.unwrap_or(DEFAULT_SETTLE_DELAY_MS),
            ),
            created_refetch_delay: Duration::from_millis(
                r.created_refetch_delay_ms
                    .unwrap_or(DEFAULT_CREATED_REFETCH_DELAY_MS),
            ),
        },
        None => ReconcileConfig::default(),
    };

    Ok(TrackerConfig {
        schema_version,
        token,
        tracking: TrackingConfig { ws_url },
        api: ApiConfig { base_url },
        reconnect,
        heartbeat: HeartbeatConfig {
            interval: Duration::from_millis(interval_ms),
        },
        reconcile,
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn require_scheme(field: &str, value: &str, schemes: &[&str]) -> Result<(), ConfigError> {
    let parsed = url::Url::parse(value)
        .map_err(|e| ConfigError::InvalidValue(format!("{field} '{value}': {e}")))?;
    if !schemes.contains(&parsed.scheme()) {
        return Err(ConfigError::InvalidValue(format!(
            "{field} must use one of {schemes:?}, got '{}'",
            parsed.scheme()
        )));
    }
    Ok(())
}

fn read_token_file(path: &str) -> Result<String, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading token file '{path}': {e}")))?;
    Ok(content.trim().to_owned())
}
