//! Engine configuration, loaded from environment variables (spec §9 design
//! notes supplement — the distilled spec has no config section of its own,
//! but every numeric default named elsewhere in the spec needs to be
//! operator-tunable without a recompile). Modeled loosely on the teacher's
//! env-driven config loading, without its YAML-layering/config-hash
//! machinery — this engine has no multi-environment config fan-out to merge.

use opsync_breaker::CircuitBreakerConfig;
use opsync_metrics::AlertThresholds;
use opsync_types::DEFAULT_MAX_ATTEMPTS;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ConfigError(pub String);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid engine configuration: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub base_url: String,
    pub app_version: String,
    pub device_id: String,
    pub lock_ttl: chrono::Duration,
    pub heartbeat_interval: chrono::Duration,
    pub http_timeout: Duration,
    pub backoff: opsync_backoff::BackoffPolicy,
    pub breaker: CircuitBreakerConfig,
    pub alert_thresholds: AlertThresholds,
    pub default_max_attempts: u32,
    /// Upper bound on how long `peek_next_runnable` returning `None` waits
    /// before the loop re-checks (spec §4.9 step 2: "up to a small cap").
    pub idle_poll_cap: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            app_version: "0.0.1".to_string(),
            device_id: "unknown-device".to_string(),
            lock_ttl: opsync_lock::DEFAULT_TTL,
            heartbeat_interval: opsync_lock::DEFAULT_HEARTBEAT_INTERVAL,
            http_timeout: opsync_http::DEFAULT_TIMEOUT,
            backoff: opsync_backoff::BackoffPolicy::default(),
            breaker: CircuitBreakerConfig::default(),
            alert_thresholds: AlertThresholds::default(),
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            idle_poll_cap: Duration::from_secs(1),
        }
    }
}

impl EngineConfig {
    /// Load overrides from `OPSYNC_*` environment variables, falling back to
    /// [`EngineConfig::default`] for anything unset. The caller is
    /// responsible for loading a `.env` file (e.g. via `dotenvy::dotenv()`)
    /// before calling this, matching the teacher's CLI entry point.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Some(v) = env_str("OPSYNC_BASE_URL")? {
            cfg.base_url = v;
        }
        if let Some(v) = env_str("OPSYNC_APP_VERSION")? {
            cfg.app_version = v;
        }
        if let Some(v) = env_str("OPSYNC_DEVICE_ID")? {
            cfg.device_id = v;
        }
        if let Some(v) = env_u64("OPSYNC_LOCK_TTL_SECS")? {
            cfg.lock_ttl = chrono::Duration::seconds(v as i64);
        }
        if let Some(v) = env_u64("OPSYNC_HEARTBEAT_INTERVAL_SECS")? {
            cfg.heartbeat_interval = chrono::Duration::seconds(v as i64);
        }
        if let Some(v) = env_u64("OPSYNC_HTTP_TIMEOUT_SECS")? {
            cfg.http_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("OPSYNC_BACKOFF_BASE_MS")? {
            cfg.backoff.base = Duration::from_millis(v);
        }
        if let Some(v) = env_u64("OPSYNC_BACKOFF_CAP_MS")? {
            cfg.backoff.cap = Duration::from_millis(v);
        }
        if let Some(v) = env_u64("OPSYNC_BACKOFF_JITTER_MS")? {
            cfg.backoff.jitter = Duration::from_millis(v);
        }
        if let Some(v) = env_u64("OPSYNC_BREAKER_WINDOW_SECS")? {
            cfg.breaker.window = chrono::Duration::seconds(v as i64);
        }
        if let Some(v) = env_u64("OPSYNC_BREAKER_THRESHOLD")? {
            cfg.breaker.threshold = v as u32;
        }
        if let Some(v) = env_u64("OPSYNC_BREAKER_COOLDOWN_SECS")? {
            cfg.breaker.cooldown = chrono::Duration::seconds(v as i64);
        }
        if let Some(v) = env_u64("OPSYNC_QUEUE_DEPTH_HIGH")? {
            cfg.alert_thresholds.queue_depth_high = v;
        }
        if let Some(v) = env_u64("OPSYNC_FAILED_DEPTH_HIGH")? {
            cfg.alert_thresholds.failed_depth_high = v;
        }
        if let Some(v) = env_u64("OPSYNC_BREAKER_OPEN_DURATION_HIGH_SECS")? {
            cfg.alert_thresholds.breaker_open_duration_high = chrono::Duration::seconds(v as i64);
        }
        if let Some(v) = env_u64("OPSYNC_DEFAULT_MAX_ATTEMPTS")? {
            cfg.default_max_attempts = v as u32;
        }

        Ok(cfg)
    }
}

fn env_str(key: &'static str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(v) if v.is_empty() => Ok(None),
        Ok(v) => Ok(Some(v)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => {
            Err(ConfigError(format!("{key} is not valid unicode")))
        }
    }
}

fn env_u64(key: &'static str) -> Result<Option<u64>, ConfigError> {
    match env_str(key)? {
        None => Ok(None),
        Some(v) => v
            .parse::<u64>()
            .map(Some)
            .map_err(|e| ConfigError(format!("{key}={v}: {e}"))),
    }
}
