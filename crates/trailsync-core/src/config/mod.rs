//! Engine configuration loaded from `TRAILSYNC_*` environment variables.
//!
//! Every value has a default, so an empty environment yields a working
//! offline queue. Sync additionally needs `TRAILSYNC_COLLECTOR_URL`.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::conflict::{ResolverConfig, StrategyKind, TieBreak};
use crate::queue::{QueueConfig, DEFAULT_MAX_QUEUE_SIZE, DEFAULT_MAX_RETRIES};
use crate::sync::{
    HttpTransportConfig, SyncConfig, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX,
    DEFAULT_BATCH_SIZE, DEFAULT_SYNC_INTERVAL,
};
use crate::util::is_http_url;

const DB_FILE_NAME: &str = "trailsync.db";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub db_path: PathBuf,
    pub collector_url: Option<String>,
    pub auth_token: Option<String>,
    pub tenant_id: Option<String>,
    pub max_retries: u32,
    pub max_queue_size: usize,
    pub batch_size: usize,
    pub sync_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub request_timeout: Duration,
    pub remote_lookup: bool,
    pub conflict_strategy: StrategyKind,
    pub tie_break: TieBreak,
    pub sync_on_reconnect: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            collector_url: None,
            auth_token: None,
            tenant_id: None,
            max_retries: DEFAULT_MAX_RETRIES,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            remote_lookup: false,
            conflict_strategy: StrategyKind::default(),
            tie_break: TieBreak::default(),
            sync_on_reconnect: true,
        }
    }
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("EngineConfig")
            .field("db_path", &self.db_path)
            .field("collector_url", &self.collector_url)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
            .field("tenant_id", &self.tenant_id)
            .field("max_retries", &self.max_retries)
            .field("max_queue_size", &self.max_queue_size)
            .field("batch_size", &self.batch_size)
            .field("sync_interval", &self.sync_interval)
            .field("backoff_base", &self.backoff_base)
            .field("backoff_max", &self.backoff_max)
            .field("request_timeout", &self.request_timeout)
            .field("remote_lookup", &self.remote_lookup)
            .field("conflict_strategy", &self.conflict_strategy)
            .field("tie_break", &self.tie_break)
            .field("sync_on_reconnect", &self.sync_on_reconnect)
            .finish()
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let db_path = optional_trimmed(&lookup, "TRAILSYNC_DB_PATH")
            .map_or(defaults.db_path, PathBuf::from);

        let collector_url = optional_trimmed(&lookup, "TRAILSYNC_COLLECTOR_URL")
            .map(|value| value.trim_end_matches('/').to_string());
        if let Some(url) = collector_url.as_deref() {
            if !is_http_url(url) {
                return Err(ConfigError::Invalid(
                    "TRAILSYNC_COLLECTOR_URL must start with http:// or https://".to_string(),
                ));
            }
        }

        let auth_token = optional_trimmed(&lookup, "TRAILSYNC_AUTH_TOKEN");
        let tenant_id = optional_trimmed(&lookup, "TRAILSYNC_TENANT_ID");

        let max_retries = parse_in_range(&lookup, "TRAILSYNC_MAX_RETRIES", defaults.max_retries, 1..=100)?;
        let max_queue_size = parse_in_range(
            &lookup,
            "TRAILSYNC_MAX_QUEUE_SIZE",
            defaults.max_queue_size,
            1..=1_000_000,
        )?;
        let batch_size = parse_in_range(&lookup, "TRAILSYNC_BATCH_SIZE", defaults.batch_size, 1..=500)?;
        let sync_interval_secs = parse_in_range(
            &lookup,
            "TRAILSYNC_SYNC_INTERVAL_SECS",
            defaults.sync_interval.as_secs(),
            1..=86_400,
        )?;
        let backoff_base_ms = parse_in_range(
            &lookup,
            "TRAILSYNC_BACKOFF_BASE_MS",
            duration_millis(defaults.backoff_base),
            10..=600_000,
        )?;
        let backoff_max_ms = parse_in_range(
            &lookup,
            "TRAILSYNC_BACKOFF_MAX_MS",
            duration_millis(defaults.backoff_max),
            10..=3_600_000,
        )?;
        if backoff_max_ms < backoff_base_ms {
            return Err(ConfigError::Invalid(
                "TRAILSYNC_BACKOFF_MAX_MS must be >= TRAILSYNC_BACKOFF_BASE_MS".to_string(),
            ));
        }
        let request_timeout_secs = parse_in_range(
            &lookup,
            "TRAILSYNC_REQUEST_TIMEOUT_SECS",
            defaults.request_timeout.as_secs(),
            1..=300,
        )?;

        let remote_lookup = parse_bool(&lookup, "TRAILSYNC_REMOTE_LOOKUP", defaults.remote_lookup)?;
        let sync_on_reconnect =
            parse_bool(&lookup, "TRAILSYNC_SYNC_ON_RECONNECT", defaults.sync_on_reconnect)?;

        let conflict_strategy = match optional_trimmed(&lookup, "TRAILSYNC_CONFLICT_STRATEGY") {
            Some(value) => StrategyKind::from_str(&value).map_err(|_| {
                ConfigError::Invalid(
                    "TRAILSYNC_CONFLICT_STRATEGY must be one of timestamp, last-write-wins, score"
                        .to_string(),
                )
            })?,
            None => defaults.conflict_strategy,
        };
        let tie_break = match optional_trimmed(&lookup, "TRAILSYNC_TIE_BREAK")
            .map(|value| value.to_ascii_lowercase())
            .as_deref()
        {
            None | Some("local") => TieBreak::PreferLocal,
            Some("remote") => TieBreak::PreferRemote,
            Some(_) => {
                return Err(ConfigError::Invalid(
                    "TRAILSYNC_TIE_BREAK must be local or remote".to_string(),
                ))
            }
        };

        Ok(Self {
            db_path,
            collector_url,
            auth_token,
            tenant_id,
            max_retries,
            max_queue_size,
            batch_size,
            sync_interval: Duration::from_secs(sync_interval_secs),
            backoff_base: Duration::from_millis(backoff_base_ms),
            backoff_max: Duration::from_millis(backoff_max_ms),
            request_timeout: Duration::from_secs(request_timeout_secs),
            remote_lookup,
            conflict_strategy,
            tie_break,
            sync_on_reconnect,
        })
    }

    pub const fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_retries: self.max_retries,
            max_queue_size: self.max_queue_size,
        }
    }

    pub const fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            batch_size: self.batch_size,
            sync_interval: self.sync_interval,
            backoff_base: self.backoff_base,
            backoff_max: self.backoff_max,
            sync_on_reconnect: self.sync_on_reconnect,
        }
    }

    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig::default()
    }

    /// HTTP transport settings; `None` without a collector URL
    pub fn transport_config(&self) -> Option<HttpTransportConfig> {
        Some(HttpTransportConfig {
            endpoint: self.collector_url.clone()?,
            auth_token: self.auth_token.clone(),
            tenant_id: self.tenant_id.clone(),
            request_timeout: self.request_timeout,
            remote_lookup: self.remote_lookup,
        })
    }
}

/// `<data dir>/trailsync/trailsync.db`, or the working directory when the
/// platform has no data directory
pub fn default_db_path() -> PathBuf {
    dirs::data_dir().map_or_else(
        || PathBuf::from(DB_FILE_NAME),
        |dir| dir.join("trailsync").join(DB_FILE_NAME),
    )
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn parse_in_range<T>(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
    range: std::ops::RangeInclusive<T>,
) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + fmt::Display + Copy,
{
    let Some(raw) = optional_trimmed(lookup, name) else {
        return Ok(default);
    };
    let value = raw.parse::<T>().map_err(|_| {
        ConfigError::Invalid(format!(
            "{name} must be an integer in [{}, {}]",
            range.start(),
            range.end()
        ))
    })?;
    if !range.contains(&value) {
        return Err(ConfigError::Invalid(format!(
            "{name} must be in [{}, {}]",
            range.start(),
            range.end()
        )));
    }
    Ok(value)
}

fn parse_bool(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: bool,
) -> Result<bool, ConfigError> {
    let Some(raw) = optional_trimmed(lookup, name) else {
        return Ok(default);
    };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid(format!("{name} must be true or false"))),
    }
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
