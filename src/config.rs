//! Worker configuration: defaults, then an optional YAML file named by
//! `INGEST_CONFIG`, then environment overrides.

use crate::queue::QueueConfig;
use crate::uploader::RetryPolicy;
use serde::Deserialize;
use std::{path::PathBuf, str::FromStr, time::Duration};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct IngestConfig {
    pub backend_url: String,
    pub backend_api_key: Option<String>,
    pub port: u16,
    pub state_dir: Option<PathBuf>,
    pub redis_url: Option<String>,
    pub download_dir: Option<PathBuf>,
    pub queue_capacity: usize,
    pub dedup_window_days: i64,
    pub max_attempts: u32,
    pub retry_base_secs: u64,
    pub retry_cap_secs: u64,
    pub upload_concurrency: usize,
    pub upload_timeout_secs: u64,
    pub health_interval_secs: u64,
    pub health_down_interval_secs: u64,
    pub capture_deadline_secs: u64,
    pub account_ttl_mins: i64,
    pub history_capacity: usize,
    pub notify_coalesce_secs: u64,
    pub allow_unattributed: bool,
    pub extension_version: String,
    pub http_timeout_secs: u64,
    pub http_connect_timeout_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            backend_url: "http://127.0.0.1:3001/api".to_string(),
            backend_api_key: None,
            port: 8787,
            state_dir: None,
            redis_url: None,
            download_dir: None,
            queue_capacity: 256,
            dedup_window_days: 7,
            max_attempts: 6,
            retry_base_secs: 2,
            retry_cap_secs: 300,
            upload_concurrency: 2,
            upload_timeout_secs: 30,
            health_interval_secs: 30,
            health_down_interval_secs: 15,
            capture_deadline_secs: 30,
            account_ttl_mins: 30,
            history_capacity: 100,
            notify_coalesce_secs: 30,
            allow_unattributed: false,
            extension_version: env!("CARGO_PKG_VERSION").to_string(),
            http_timeout_secs: 15,
            http_connect_timeout_secs: 5,
        }
    }
}

impl IngestConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match env_string("INGEST_CONFIG") {
            Some(path) => Self::from_yaml_file(PathBuf::from(path))?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        info!(
            target = "ingest.api",
            backend = %config.backend_url,
            port = config.port,
            concurrency = config.upload_concurrency,
            "configuration loaded"
        );
        Ok(config)
    }

    pub fn from_yaml_file(path: PathBuf) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_yaml::from_str(raw)?;
        config.sanitize();
        Ok(config)
    }

    /// Applies `KEY=value` overrides from `lookup`. Unparseable or
    /// non-positive numbers are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let text = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = text("BACKEND_URL") {
            self.backend_url = v;
        }
        if let Some(v) = text("BACKEND_API_KEY") {
            self.backend_api_key = Some(v);
        }
        if let Some(v) = text("PORT").and_then(|v| v.parse::<u16>().ok()).filter(|v| *v > 0) {
            self.port = v;
        }
        if let Some(v) = text("STATE_DIR") {
            self.state_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = text("REDIS_URL") {
            self.redis_url = Some(v);
        }
        if let Some(v) = text("DOWNLOAD_DIR") {
            self.download_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = text("QUEUE_CAPACITY").and_then(|v| parse_positive(&v)) {
            self.queue_capacity = v;
        }
        if let Some(v) = text("DEDUP_WINDOW_DAYS").and_then(|v| parse_positive(&v)) {
            self.dedup_window_days = v;
        }
        if let Some(v) = text("MAX_ATTEMPTS").and_then(|v| parse_positive(&v)) {
            self.max_attempts = v;
        }
        if let Some(v) = text("RETRY_BASE_SECS").and_then(|v| parse_positive(&v)) {
            self.retry_base_secs = v;
        }
        if let Some(v) = text("RETRY_CAP_SECS").and_then(|v| parse_positive(&v)) {
            self.retry_cap_secs = v;
        }
        if let Some(v) = text("UPLOAD_CONCURRENCY").and_then(|v| parse_positive(&v)) {
            self.upload_concurrency = v;
        }
        if let Some(v) = text("UPLOAD_TIMEOUT_SECS").and_then(|v| parse_positive(&v)) {
            self.upload_timeout_secs = v;
        }
        if let Some(v) = text("HEALTH_INTERVAL_SECS").and_then(|v| parse_positive(&v)) {
            self.health_interval_secs = v;
        }
        if let Some(v) = text("HEALTH_DOWN_INTERVAL_SECS").and_then(|v| parse_positive(&v)) {
            self.health_down_interval_secs = v;
        }
        if let Some(v) = text("CAPTURE_DEADLINE_SECS").and_then(|v| parse_positive(&v)) {
            self.capture_deadline_secs = v;
        }
        if let Some(v) = text("ACCOUNT_TTL_MINS").and_then(|v| parse_positive(&v)) {
            self.account_ttl_mins = v;
        }
        if let Some(v) = text("HISTORY_CAPACITY").and_then(|v| parse_positive(&v)) {
            self.history_capacity = v;
        }
        if let Some(v) = text("NOTIFY_COALESCE_SECS").and_then(|v| parse_positive(&v)) {
            self.notify_coalesce_secs = v;
        }
        if let Some(v) = text("ALLOW_UNATTRIBUTED").and_then(|v| parse_flag(&v)) {
            self.allow_unattributed = v;
        }
        if let Some(v) = text("EXTENSION_VERSION") {
            self.extension_version = v;
        }
        if let Some(v) = text("HTTP_TIMEOUT_SECS").and_then(|v| parse_positive(&v)) {
            self.http_timeout_secs = v;
        }
        if let Some(v) = text("HTTP_CONNECT_TIMEOUT_SECS").and_then(|v| parse_positive(&v)) {
            self.http_connect_timeout_secs = v;
        }
        self.sanitize();
    }

    /// Zero values from YAML fall back to defaults.
    fn sanitize(&mut self) {
        let d = Self::default();
        keep_positive(&mut self.queue_capacity, d.queue_capacity);
        keep_positive(&mut self.dedup_window_days, d.dedup_window_days);
        keep_positive(&mut self.max_attempts, d.max_attempts);
        keep_positive(&mut self.retry_base_secs, d.retry_base_secs);
        keep_positive(&mut self.retry_cap_secs, d.retry_cap_secs);
        keep_positive(&mut self.upload_concurrency, d.upload_concurrency);
        keep_positive(&mut self.upload_timeout_secs, d.upload_timeout_secs);
        keep_positive(&mut self.health_interval_secs, d.health_interval_secs);
        keep_positive(&mut self.health_down_interval_secs, d.health_down_interval_secs);
        keep_positive(&mut self.capture_deadline_secs, d.capture_deadline_secs);
        keep_positive(&mut self.account_ttl_mins, d.account_ttl_mins);
        keep_positive(&mut self.history_capacity, d.history_capacity);
        keep_positive(&mut self.notify_coalesce_secs, d.notify_coalesce_secs);
        keep_positive(&mut self.http_timeout_secs, d.http_timeout_secs);
        keep_positive(&mut self.http_connect_timeout_secs, d.http_connect_timeout_secs);
        if self.retry_cap_secs < self.retry_base_secs {
            self.retry_cap_secs = self.retry_base_secs;
        }
        self.backend_url = self.backend_url.trim_end_matches('/').to_string();
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            capacity: self.queue_capacity,
            dedup_window: chrono::Duration::days(self.dedup_window_days),
            max_attempts: self.max_attempts,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_secs(self.retry_base_secs),
            factor: 2,
            cap: Duration::from_secs(self.retry_cap_secs),
            max_attempts: self.max_attempts,
        }
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn health_down_interval(&self) -> Duration {
        Duration::from_secs(self.health_down_interval_secs)
    }

    pub fn capture_deadline(&self) -> Duration {
        Duration::from_secs(self.capture_deadline_secs)
    }

    pub fn account_ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.account_ttl_mins)
    }

    /// Files picked up from `DOWNLOAD_DIR` carry no tab, so no account can
    /// be attributed to them; without `ALLOW_UNATTRIBUTED` every one of them
    /// is refused.
    pub fn watcher_captures_refused(&self) -> bool {
        self.download_dir.is_some() && !self.allow_unattributed
    }

    pub fn notify_coalesce(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.notify_coalesce_secs as i64)
    }
}

fn keep_positive<T: PartialOrd + Default>(value: &mut T, fallback: T) {
    if *value <= T::default() {
        *value = fallback;
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_positive<T>(raw: &str) -> Option<T>
where
    T: FromStr + PartialOrd + Default,
{
    raw.parse::<T>().ok().filter(|v| *v > T::default())
}

pub(crate) fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
