use dotenvy::dotenv;
use rumqttc::QoS;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use uuid::Uuid;

const REDACTED: &str = "<redacted>";

/// Broker connection and topic settings.
#[derive(Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub max_retries: usize,
    pub retry_interval: Duration,
    pub qos: QoS,

    pub command_topic: String,
    pub telemetry_topic: String,
    pub status_topic: Option<String>,
}

impl BrokerConfig {
    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty()
    }

    /// Delays between reconnect attempts: doubling from the retry interval,
    /// capped at one minute, at most `max_retries` entries.
    pub fn reconnect_delays(&self) -> impl Iterator<Item = Duration> {
        let factor = (self.retry_interval.as_millis() as u64 / 2).max(1);
        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(Duration::from_secs(60))
            .map(jitter)
            .take(self.max_retries)
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &REDACTED)
            .field("client_id", &self.client_id)
            .field("keep_alive", &self.keep_alive)
            .field("connect_timeout", &self.connect_timeout)
            .field("max_retries", &self.max_retries)
            .field("retry_interval", &self.retry_interval)
            .field("qos", &self.qos)
            .field("command_topic", &self.command_topic)
            .field("telemetry_topic", &self.telemetry_topic)
            .field("status_topic", &self.status_topic)
            .finish()
    }
}

#[derive(Clone)]
pub struct DatabaseConfig {
    pub name: String,
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub pool_size: u32,
    pub query_timeout: Duration,
}

impl DatabaseConfig {
    /// SQLite file backing the store. `:memory:` is passed through untouched.
    pub fn database_path(&self) -> String {
        if self.name == ":memory:" || self.name.ends_with(".db") {
            self.name.clone()
        } else {
            format!("{}.db", self.name)
        }
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("name", &self.name)
            .field("user", &self.user)
            .field("password", &REDACTED)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("pool_size", &self.pool_size)
            .field("query_timeout", &self.query_timeout)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub broker: BrokerConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub brightness_max: u8,
    pub sensor_fields: Vec<String>,
    pub log_level: tracing::Level,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable {0} is missing or invalid.")]
    MissingOrInvalid(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
}

impl Config {
    /// Validate timeout values and other critical configurations.
    fn validate(&self) -> Result<(), ConfigError> {
        const MIN_TIMEOUT: u64 = 100;
        const MAX_TIMEOUT: u64 = 1_000_000;

        let checks = [
            ("MQTT_RETRY_INTERVAL_MS", self.broker.retry_interval),
            ("MQTT_CONNECT_TIMEOUT_MS", self.broker.connect_timeout),
            ("DB_QUERY_TIMEOUT_MS", self.database.query_timeout),
        ];
        for (name, value) in checks {
            let ms = value.as_millis() as u64;
            if !(MIN_TIMEOUT..=MAX_TIMEOUT).contains(&ms) {
                return Err(ConfigError::ParsingError(format!(
                    "{} must be between {} and {} ms",
                    name, MIN_TIMEOUT, MAX_TIMEOUT
                )));
            }
        }

        if !(1..=100).contains(&self.broker.max_retries) {
            return Err(ConfigError::ParsingError(
                "MQTT_MAX_RETRIES must be between 1 and 100".to_string(),
            ));
        }
        if self.database.pool_size == 0 {
            return Err(ConfigError::ParsingError(
                "DB_POOL_SIZE must be at least 1".to_string(),
            ));
        }
        if self.sensor_fields.is_empty() {
            return Err(ConfigError::MissingOrInvalid(
                "TELEMETRY_SENSOR_FIELDS".to_string(),
            ));
        }

        Ok(())
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok(); // Load environment variables from .env file
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let number = |key: &str, default: &str| -> Result<u64, ConfigError> {
            parse(key, &text(key, default))
        };
        let millis = |key: &str, default: &str| number(key, default).map(Duration::from_millis);

        let qos = match number("MQTT_QOS", "1")? {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            _ => {
                return Err(ConfigError::ParsingError(
                    "MQTT_QOS must be 0, 1 or 2".to_string(),
                ))
            }
        };

        let broker = BrokerConfig {
            host: text("MQTT_HOST", "mosquitto"),
            port: parse("MQTT_PORT", &text("MQTT_PORT", "1883"))?,
            username: text("MQTT_USERNAME", ""),
            password: text("MQTT_PASSWORD", ""),
            client_id: lookup("MQTT_CLIENT_ID")
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| format!("domotic-bridge-{}", Uuid::new_v4())),
            keep_alive: Duration::from_secs(number("MQTT_KEEP_ALIVE_SECS", "60")?),
            connect_timeout: millis("MQTT_CONNECT_TIMEOUT_MS", "5000")?,
            max_retries: parse("MQTT_MAX_RETRIES", &text("MQTT_MAX_RETRIES", "5"))?,
            retry_interval: millis("MQTT_RETRY_INTERVAL_MS", "500")?,
            qos,
            command_topic: text("MQTT_COMMAND_TOPIC", "esp32/led"),
            telemetry_topic: text("MQTT_TELEMETRY_TOPIC", "esp32/sensors"),
            status_topic: lookup("MQTT_STATUS_TOPIC").filter(|topic| !topic.is_empty()),
        };

        let database = DatabaseConfig {
            name: text("DB_NAME", "sensor_data"),
            user: text("DB_USER", "postgres"),
            password: text("DB_PASSWORD", ""),
            host: text("DB_HOST", "db"),
            port: parse("DB_PORT", &text("DB_PORT", "5432"))?,
            pool_size: parse("DB_POOL_SIZE", &text("DB_POOL_SIZE", "4"))?,
            query_timeout: millis("DB_QUERY_TIMEOUT_MS", "5000")?,
        };

        let api = ApiConfig {
            address: text("API_ADDRESS", "0.0.0.0"),
            port: parse("API_PORT", &text("API_PORT", "8000"))?,
        };

        let sensor_fields = text("TELEMETRY_SENSOR_FIELDS", "sensor_id,idSensor,light")
            .split(',')
            .map(str::trim)
            .filter(|field| !field.is_empty())
            .map(str::to_string)
            .collect();

        let config = Self {
            broker,
            database,
            api,
            brightness_max: parse("COMMAND_BRIGHTNESS_MAX", &text("COMMAND_BRIGHTNESS_MAX", "100"))?,
            sensor_fields,
            log_level: parse("LOG_LEVEL", &text("LOG_LEVEL", "info"))?,
        };

        config.validate()?;

        Ok(config)
    }
}

fn parse<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| ConfigError::ParsingError(format!("{} has an invalid value", key)))
}
