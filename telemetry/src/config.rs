//! Runtime configuration from environment variables.
//!
//! All variables are optional and prefixed `RUN_TELEMETRY_`. A `.env` file in
//! the working directory or any ancestor is loaded first.

use shared_types::Level;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::hub::{HubConfig, OverflowPolicy};

pub const ENV_PREFIX: &str = "RUN_TELEMETRY_";

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Root under which each run gets `<data_dir>/<run_id>/`
    pub data_dir: PathBuf,
    pub bind_addr: SocketAddr,
    /// Events below this level are not recorded; spans always are
    pub min_level: Level,
    pub hub: HubConfig,
    /// How long a terminal run stays observable before it is pruned
    pub retention: Duration,
    pub prune_interval: Duration,
    /// Bound on any single external call made under a safe point guard
    pub external_call_timeout: Duration,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/runs"),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            min_level: Level::Info,
            hub: HubConfig::default(),
            retention: Duration::from_secs(600),
            prune_interval: Duration::from_secs(30),
            external_call_timeout: Duration::from_millis(30_000),
        }
    }
}

impl TelemetryConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; keys are full variable names.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |name: &str| {
            let key = format!("{ENV_PREFIX}{name}");
            lookup(&key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(|v| (key, v))
        };

        let data_dir = get("DATA_DIR")
            .map(|(_, v)| PathBuf::from(v))
            .unwrap_or(defaults.data_dir);
        let bind_addr = parse_or(get("BIND"), defaults.bind_addr)?;
        let min_level = parse_or(get("MIN_LEVEL"), defaults.min_level)?;
        let subscriber_capacity =
            positive(parse_or(get("SUBSCRIBER_QUEUE"), defaults.hub.subscriber_capacity), "SUBSCRIBER_QUEUE")?;
        let ingress_capacity =
            positive(parse_or(get("ROOM_INGRESS"), defaults.hub.ingress_capacity), "ROOM_INGRESS")?;
        let publish_timeout_ms = parse_or(
            get("PUBLISH_TIMEOUT_MS"),
            defaults.hub.publish_timeout.as_millis() as u64,
        )?;
        let ordered_overflow = parse_or(get("ORDERED_OVERFLOW"), defaults.hub.ordered_overflow)?;
        let retention_secs = parse_or(get("RETENTION_SECS"), defaults.retention.as_secs())?;
        let prune_interval_secs = positive(
            parse_or(get("PRUNE_INTERVAL_SECS"), defaults.prune_interval.as_secs()),
            "PRUNE_INTERVAL_SECS",
        )?;
        let external_call_timeout_ms = positive(
            parse_or(
                get("EXTERNAL_CALL_TIMEOUT_MS"),
                defaults.external_call_timeout.as_millis() as u64,
            ),
            "EXTERNAL_CALL_TIMEOUT_MS",
        )?;

        Ok(Self {
            data_dir,
            bind_addr,
            min_level,
            hub: HubConfig {
                subscriber_capacity,
                ingress_capacity,
                publish_timeout: Duration::from_millis(publish_timeout_ms),
                ordered_overflow,
            },
            retention: Duration::from_secs(retention_secs),
            prune_interval: Duration::from_secs(prune_interval_secs),
            external_call_timeout: Duration::from_millis(external_call_timeout_ms),
        })
    }

    pub fn run_dir(&self, run_id: &shared_types::RunId) -> PathBuf {
        self.data_dir.join(run_id.as_str())
    }
}

fn parse_or<T>(entry: Option<(String, String)>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match entry {
        None => Ok(default),
        Some((key, value)) => value.parse::<T>().map_err(|e| ConfigError::Invalid {
            reason: e.to_string(),
            key,
            value,
        }),
    }
}

fn positive<T>(value: Result<T, ConfigError>, name: &str) -> Result<T, ConfigError>
where
    T: PartialEq + Default + std::fmt::Display,
{
    let value = value?;
    if value == T::default() {
        return Err(ConfigError::Invalid {
            key: format!("{ENV_PREFIX}{name}"),
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

/// Load `.env` from the working directory or the nearest ancestor that has one.
pub fn load_env_file() {
    let cwd = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(e) => {
            tracing::warn!(error = %e, "Could not determine current directory for .env lookup");
            return;
        }
    };

    let mut current = cwd.clone();
    loop {
        let candidate = current.join(".env");
        if candidate.exists() {
            match dotenvy::from_path(&candidate) {
                Ok(_) => {
                    tracing::info!(path = %candidate.display(), "Loaded environment from .env");
                }
                Err(e) => {
                    tracing::warn!(
                        path = %candidate.display(),
                        error = %e,
                        "Failed to load .env file"
                    );
                }
            }
            return;
        }

        if !current.pop() {
            break;
        }
    }

    tracing::debug!(cwd = %cwd.display(), "No .env file found; using process environment only");
}
