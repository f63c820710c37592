//! Process configuration from `PISONET_*` environment variables.

use std::env;
use std::fmt;
use std::path::PathBuf;

use chrono::NaiveTime;
use zeroize::Zeroizing;

use crate::business_time::{BusinessClock, DEFAULT_UTC_OFFSET_MINUTES};
use crate::error::ConfigError;
use crate::storage;

pub const ENV_DATA_DIR: &str = "PISONET_DATA_DIR";
pub const ENV_PORT: &str = "PISONET_PORT";
pub const ENV_HARVEST_KEY: &str = "PISONET_HARVEST_KEY";
pub const ENV_UTC_OFFSET_MINUTES: &str = "PISONET_UTC_OFFSET_MINUTES";
pub const ENV_AGGREGATION_TIME: &str = "PISONET_AGGREGATION_TIME";
pub const ENV_SCHEDULER_ENABLED: &str = "PISONET_SCHEDULER_ENABLED";

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_AGGREGATION_TIME: &str = "23:59";

#[derive(Clone)]
pub struct Config {
    pub port: u16,
    pub data_dir: PathBuf,
    pub harvest_key: Zeroizing<String>,
    pub clock: BusinessClock,
    /// Business wall-clock time of the daily aggregation run.
    pub aggregation_time: NaiveTime,
    pub scheduler_enabled: bool,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("data_dir", &self.data_dir)
            .field("harvest_key", &"<redacted>")
            .field("utc_offset", &self.clock.offset())
            .field("aggregation_time", &self.aggregation_time)
            .field("scheduler_enabled", &self.scheduler_enabled)
            .finish()
    }
}

impl Config {
    /// The harvest key comes from `PISONET_HARVEST_KEY`, then the OS keyring.
    pub fn from_env() -> Result<Self, ConfigError> {
        let harvest_key = env::var(ENV_HARVEST_KEY)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .map(Zeroizing::new)
            .or_else(|| storage::get_credential(storage::KEY_HARVEST_KEY))
            .ok_or(ConfigError::Missing(ENV_HARVEST_KEY))?;

        Self::from_env_with_key(harvest_key)
    }

    /// For one-shot commands that never check the harvest key.
    pub fn from_env_with_key(harvest_key: Zeroizing<String>) -> Result<Self, ConfigError> {
        let port = parse_var(ENV_PORT, DEFAULT_PORT)?;
        let utc_offset_minutes = parse_var(ENV_UTC_OFFSET_MINUTES, DEFAULT_UTC_OFFSET_MINUTES)?;
        let clock = BusinessClock::new(utc_offset_minutes).map_err(|_| {
            ConfigError::InvalidValue {
                name: ENV_UTC_OFFSET_MINUTES,
                value: utc_offset_minutes.to_string(),
            }
        })?;

        let time_raw =
            env::var(ENV_AGGREGATION_TIME).unwrap_or_else(|_| DEFAULT_AGGREGATION_TIME.into());
        let aggregation_time = NaiveTime::parse_from_str(time_raw.trim(), "%H:%M").map_err(|_| {
            ConfigError::InvalidValue {
                name: ENV_AGGREGATION_TIME,
                value: time_raw.clone(),
            }
        })?;

        let scheduler_enabled = match env::var(ENV_SCHEDULER_ENABLED) {
            Ok(v) => parse_bool(&v).ok_or(ConfigError::InvalidValue {
                name: ENV_SCHEDULER_ENABLED,
                value: v,
            })?,
            Err(_) => true,
        };

        Ok(Config {
            port,
            data_dir: env::var(ENV_DATA_DIR)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATA_DIR)),
            harvest_key,
            clock,
            aggregation_time,
            scheduler_enabled,
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value: raw }),
        Err(_) => Ok(default),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
