use std::{env, fmt::Display, path::PathBuf, str::FromStr, time::Duration};

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid {key} value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Session cookie keys are derived from `SECRET_KEY`, which needs this much material.
pub const MIN_SECRET_KEY_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct ClickHouseConfig {
    pub url: String,
    pub user: String,
    pub password: String,
    pub database: String,
    pub table: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub port: u16,

    pub api_base_url: String,
    pub api_token: String,
    pub api_city: String,
    pub api_vehicle_type: String,
    pub route_cache_ttl: Duration,

    pub session_api_token: Option<String>,
    pub secret_key: Option<String>,
    pub users_file: PathBuf,
    pub city_configs_file: PathBuf,

    pub use_clickhouse: bool,
    pub clickhouse: ClickHouseConfig,
    pub local_data_file: PathBuf,

    pub static_dir: PathBuf,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let loader = Loader { lookup };

        let cache_hours: u64 = loader.parse("ROUTE_CACHE_HOURS", "1")?;
        let ch_host = loader.string("CH_HOST", "localhost");
        let ch_port: u16 = loader.parse("CH_PORT", "8123")?;
        let ch_timeout: u64 = loader.parse("CH_TIMEOUT_SECS", "5")?;

        Ok(Self {
            bind_addr: loader.string("BIND_ADDR", "0.0.0.0"),
            port: loader.parse("PORT", "8000")?,

            api_base_url: loader.string("API_BASE_URL", "http://localhost:8090"),
            api_token: loader.string("API_TOKEN", "test"),
            api_city: loader.string("API_CITY", "chennai"),
            api_vehicle_type: loader.string("API_VEHICLE_TYPE", "bus"),
            route_cache_ttl: Duration::from_secs(cache_hours * 3600),

            session_api_token: loader.optional("SESSION_API_TOKEN"),
            secret_key: loader.secret("SECRET_KEY", MIN_SECRET_KEY_LEN)?,
            users_file: loader.string("USERS_FILE", "users.json").into(),
            city_configs_file: loader.string("CITY_CONFIGS_FILE", "configs.json").into(),

            use_clickhouse: loader.flag("USE_CLICKHOUSE")?,
            clickhouse: ClickHouseConfig {
                url: format!("http://{ch_host}:{ch_port}"),
                user: loader.string("CH_USER", "default"),
                password: loader.optional("CH_PASSWORD").unwrap_or_default(),
                database: loader.string("CH_DATABASE", "default"),
                table: loader.string("CH_TABLE", "observations"),
                timeout: Duration::from_secs(ch_timeout),
            },
            local_data_file: loader.string("LOCAL_DATA_FILE", "local_data.json").into(),

            static_dir: loader.string("STATIC_DIR", "static").into(),
        })
    }

    /// Per-city/per-vehicle client settings. Anything missing yields an empty object.
    pub async fn get_configs(&self, city: &str, vehicle_type: &str) -> Value {
        let contents = match tokio::fs::read_to_string(&self.city_configs_file).await {
            Ok(contents) => contents,
            Err(e) => {
                warn!(path = %self.city_configs_file.display(), error = %e, "City configs unavailable");
                return Value::Object(Map::new());
            }
        };

        let tree: Value = match serde_json::from_str(&contents) {
            Ok(tree) => tree,
            Err(e) => {
                warn!(path = %self.city_configs_file.display(), error = %e, "City configs are not valid JSON");
                return Value::Object(Map::new());
            }
        };

        tree.get(city)
            .and_then(|vehicles| vehicles.get(vehicle_type))
            .filter(|v| v.is_object())
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()))
    }
}

struct Loader<F> {
    lookup: F,
}

impl<F> Loader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| {
            info!("{key} not set, using default: {default}");
            default.to_string()
        })
    }

    fn parse<T: FromStr>(&self, key: &'static str, default: &str) -> Result<T, ConfigError>
    where
        T::Err: Display,
    {
        let value = self.string(key, default);

        value.trim().parse().map_err(|e: T::Err| {
            warn!("Invalid {key} value: {e}");
            ConfigError::Invalid {
                key,
                value: value.clone(),
                reason: e.to_string(),
            }
        })
    }

    fn secret(&self, key: &'static str, min_len: usize) -> Result<Option<String>, ConfigError> {
        match self.optional(key) {
            Some(value) if value.len() < min_len => Err(ConfigError::Invalid {
                key,
                value: "<redacted>".to_string(),
                reason: format!("must be at least {min_len} bytes"),
            }),
            value => Ok(value),
        }
    }

    fn flag(&self, key: &'static str) -> Result<bool, ConfigError> {
        let Some(value) = self.optional(key) else {
            return Ok(false);
        };

        match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                key,
                value,
                reason: "expected a boolean".to_string(),
            }),
        }
    }
}
