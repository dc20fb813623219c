//! Configuration and data directory discovery

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use chrono_tz::Tz;
use thiserror::Error;

use crate::usage::cache::DEFAULT_CACHE_TTL;
use crate::usage::pricing::Plan;
use crate::usage::telemetry::storage::DEFAULT_MAX_RECORDS;

/// Default listen address of the collector
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:4317";

/// Environment variable overriding the data directory
pub const DATA_DIR_ENV: &str = "CCM_DATA_DIR";

const APP_DIR_NAME: &str = "claude-code-usage-collector";
const DEFAULT_MAX_AGE: Duration = Duration::from_secs(30 * 24 * 60 * 60);
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),
    #[error("invalid listen address {0}: {1}")]
    InvalidAddress(String, std::net::AddrParseError),
    #[error("{name} is out of range: {value}")]
    OutOfRange { name: &'static str, value: u64 },
}

/// Get the collector data directory path
/// Priority: 1. Explicit path, 2. CCM_DATA_DIR env var, 3. Platform local data dir
pub fn get_data_dir(custom_path: Option<&str>) -> PathBuf {
    if let Some(path) = custom_path {
        return PathBuf::from(path);
    }

    if let Ok(env_path) = env::var(DATA_DIR_ENV) {
        if !env_path.is_empty() {
            return PathBuf::from(env_path);
        }
    }

    if let Some(dir) = dirs::data_local_dir() {
        return dir.join(APP_DIR_NAME);
    }

    // Fallback for edge cases
    PathBuf::from(format!(".{}", APP_DIR_NAME))
}

/// Parse an IANA timezone name such as `Europe/Paris`
pub fn parse_timezone(name: &str) -> Result<Tz, ConfigError> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| ConfigError::UnknownTimezone(name.to_string()))
}

pub fn parse_listen_addr(addr: &str) -> Result<SocketAddr, ConfigError> {
    addr.parse()
        .map_err(|e| ConfigError::InvalidAddress(addr.to_string(), e))
}

const SECONDS_PER_MINUTE: u64 = 60;
const SECONDS_PER_DAY: u64 = 24 * 60 * SECONDS_PER_MINUTE;

fn checked_secs(name: &'static str, value: u64, unit: u64) -> Result<u64, ConfigError> {
    value
        .checked_mul(unit)
        .ok_or(ConfigError::OutOfRange { name, value })
}

/// Bounds on stored history. `None` disables a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_age: Option<Duration>,
    pub max_records: Option<usize>,
    pub sweep_interval: Duration,
}

impl RetentionPolicy {
    /// Build from command-line units. A zero age or cap disables that bound;
    /// the sweep interval is at least one minute.
    pub fn from_units(retention_days: u64, max_records: usize, sweep_minutes: u64) -> Result<Self, ConfigError> {
        let max_age = match retention_days {
            0 => None,
            days => Some(Duration::from_secs(checked_secs(
                "retention days",
                days,
                SECONDS_PER_DAY,
            )?)),
        };
        let sweep_interval = Duration::from_secs(checked_secs(
            "sweep minutes",
            sweep_minutes.max(1),
            SECONDS_PER_MINUTE,
        )?);

        let policy = Self {
            max_age,
            max_records: (max_records > 0).then_some(max_records),
            sweep_interval,
        };
        // The sweeper converts the age to a calendar span
        if let Some(age) = policy.max_age {
            chrono::Duration::from_std(age).map_err(|_| ConfigError::OutOfRange {
                name: "retention days",
                value: retention_days,
            })?;
        }
        Ok(policy)
    }

    pub fn is_disabled(&self) -> bool {
        self.max_age.is_none() && self.max_records.is_none()
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_age: Some(DEFAULT_MAX_AGE),
            max_records: Some(DEFAULT_MAX_RECORDS),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub data_dir: PathBuf,
    /// Empty disables authentication
    pub auth_token: String,
    pub retention: RetentionPolicy,
    pub cache_ttl: Duration,
    pub timezone: Tz,
    pub plan: Plan,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 4317)),
            data_dir: get_data_dir(None),
            auth_token: String::new(),
            retention: RetentionPolicy::default(),
            cache_ttl: DEFAULT_CACHE_TTL,
            timezone: Tz::UTC,
            plan: Plan::unset(),
        }
    }
}
