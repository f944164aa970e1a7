//! Runtime settings
//!
//! Every knob has a default; `KUBEDECK_*` environment variables override them.
//! Environment access goes through [`EnvSource`] so parsing can be tested
//! without touching process-global state.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default bound for a single reachability probe
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
/// Default re-fetch interval for live feeds
pub const DEFAULT_FEED_INTERVAL: Duration = Duration::from_secs(10);
/// Default capacity of the exec input queue, in messages
pub const DEFAULT_EXEC_INPUT_QUEUE: usize = 64;
/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

const ENV_PROBE_TIMEOUT: &str = "KUBEDECK_PROBE_TIMEOUT_SECS";
const ENV_FEED_INTERVAL: &str = "KUBEDECK_FEED_INTERVAL_SECS";
const ENV_EXEC_INPUT_QUEUE: &str = "KUBEDECK_EXEC_INPUT_QUEUE";
const ENV_CONNECT_TIMEOUT: &str = "KUBEDECK_CONNECT_TIMEOUT_SECS";
const ENV_READ_TIMEOUT: &str = "KUBEDECK_READ_TIMEOUT_SECS";
const ENV_DATA_DIR: &str = "KUBEDECK_DATA_DIR";
const ENV_LOG_FORMAT: &str = "KUBEDECK_LOG_FORMAT";

/// Trait for reading environment configuration
#[cfg_attr(test, mockall::automock)]
pub trait EnvSource: Send + Sync {
    /// Get a variable, `None` when unset
    fn var(&self, key: &str) -> Option<String>;
}

/// Reads from the process environment
#[derive(Clone, Copy, Debug, Default)]
pub struct OsEnv;

impl EnvSource for OsEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per line
    #[default]
    Json,
    /// Human-readable multi-line output
    Pretty,
}

/// Runtime settings for the control plane core
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Bound for one reachability probe call
    pub probe_timeout: Duration,
    /// Default interval between live feed refreshes
    pub feed_interval: Duration,
    /// Capacity of the per-session exec input queue
    pub exec_input_queue: usize,
    /// Connect timeout applied to every built client
    pub connect_timeout: Duration,
    /// Read timeout applied to every built client
    pub read_timeout: Duration,
    /// Directory for persisted bundles; `None` keeps bundles in memory only
    pub data_dir: Option<PathBuf>,
    /// Log output format
    pub log_format: LogFormat,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            feed_interval: DEFAULT_FEED_INTERVAL,
            exec_input_queue: DEFAULT_EXEC_INPUT_QUEUE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            data_dir: None,
            log_format: LogFormat::default(),
        }
    }
}

impl Settings {
    /// Load settings from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_source(&OsEnv)
    }

    /// Load settings from any environment source
    pub fn from_source(env: &dyn EnvSource) -> Result<Self> {
        let defaults = Self::default();
        let log_format = match env.var(ENV_LOG_FORMAT).as_deref() {
            None => defaults.log_format,
            Some("json") => LogFormat::Json,
            Some("pretty") => LogFormat::Pretty,
            Some(other) => {
                return Err(Error::validation_for_field(
                    ENV_LOG_FORMAT,
                    format!("unknown log format '{}', expected json or pretty", other),
                ))
            }
        };

        let exec_input_queue = parse_number(env, ENV_EXEC_INPUT_QUEUE)?
            .map(|n| n as usize)
            .unwrap_or(defaults.exec_input_queue);
        if exec_input_queue == 0 {
            return Err(Error::validation_for_field(
                ENV_EXEC_INPUT_QUEUE,
                "queue capacity must be at least 1",
            ));
        }

        Ok(Self {
            probe_timeout: parse_secs(env, ENV_PROBE_TIMEOUT)?.unwrap_or(defaults.probe_timeout),
            feed_interval: parse_secs(env, ENV_FEED_INTERVAL)?.unwrap_or(defaults.feed_interval),
            exec_input_queue,
            connect_timeout: parse_secs(env, ENV_CONNECT_TIMEOUT)?
                .unwrap_or(defaults.connect_timeout),
            read_timeout: parse_secs(env, ENV_READ_TIMEOUT)?.unwrap_or(defaults.read_timeout),
            data_dir: env
                .var(ENV_DATA_DIR)
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            log_format,
        })
    }
}

fn parse_number(env: &dyn EnvSource, key: &str) -> Result<Option<u64>> {
    match env.var(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<u64>().map(Some).map_err(|e| {
            Error::validation_for_field(key, format!("'{}' is not a number: {}", raw, e))
        }),
    }
}

fn parse_secs(env: &dyn EnvSource, key: &str) -> Result<Option<Duration>> {
    match parse_number(env, key)? {
        Some(0) => Err(Error::validation_for_field(key, "duration must be positive")),
        other => Ok(other.map(Duration::from_secs)),
    }
}
