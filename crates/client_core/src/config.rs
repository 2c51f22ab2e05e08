use std::{fs, path::Path, str::FromStr, time::Duration};

use serde::Deserialize;

use crate::{error::ConfigError, retry::RetryConfig};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_url: String,
    pub database_url: String,
    /// Capacity of the envelope and failure broadcast channels.
    pub event_buffer: usize,
    pub connection: ConnectionConfig,
    pub reconnect: RetryConfig,
    pub queue: QueueConfig,
    pub recovery: RecoveryConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            database_url: "sqlite://./data/client.db".into(),
            event_buffer: 256,
            connection: ConnectionConfig::default(),
            reconnect: RetryConfig::default(),
            queue: QueueConfig::default(),
            recovery: RecoveryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    #[serde(rename = "heartbeat_interval_ms", with = "duration_ms")]
    pub heartbeat_interval: Duration,
    /// Longest silence tolerated before the connection is considered dead.
    #[serde(rename = "ack_window_ms", with = "duration_ms")]
    pub ack_window: Duration,
    #[serde(rename = "connection_id_timeout_ms", with = "duration_ms")]
    pub connection_id_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(25),
            ack_window: Duration::from_secs(50),
            connection_id_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    #[serde(rename = "max_age_secs", with = "duration_secs")]
    pub max_age: Duration,
    pub max_attempts: u32,
    #[serde(rename = "ack_timeout_ms", with = "duration_ms")]
    pub ack_timeout: Duration,
    #[serde(rename = "sweep_interval_secs", with = "duration_secs")]
    pub sweep_interval: Duration,
    pub retry: RetryConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(12 * 60 * 60),
            max_attempts: 5,
            ack_timeout: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(60),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub stays_connected_in_background: bool,
    #[serde(rename = "sync_cooldown_ms", with = "duration_ms")]
    pub sync_cooldown: Duration,
    pub sync_retries: u32,
    pub max_refresh_attempts: u32,
    #[serde(rename = "token_wait_ms", with = "duration_ms")]
    pub token_wait: Duration,
    pub refresh_retry: RetryConfig,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            stays_connected_in_background: false,
            sync_cooldown: Duration::from_secs(6),
            sync_retries: 2,
            max_refresh_attempts: 3,
            token_wait: Duration::from_secs(10),
            refresh_retry: RetryConfig {
                initial_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(10),
                ..RetryConfig::default()
            },
        }
    }
}

impl ClientConfig {
    /// Defaults, then the optional TOML file, then `APP__*` environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml(&raw)?
            }
            None => Self::default(),
        };
        config.apply_overrides(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn apply_overrides<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix("APP__") else {
                continue;
            };
            match name {
                "SERVER_URL" => self.server_url = value,
                "DATABASE_URL" => self.database_url = value,
                "EVENT_BUFFER" => self.event_buffer = parse(&key, &value)?,
                "HEARTBEAT_INTERVAL_MS" => {
                    self.connection.heartbeat_interval =
                        Duration::from_millis(parse(&key, &value)?)
                }
                "ACK_WINDOW_MS" => {
                    self.connection.ack_window = Duration::from_millis(parse(&key, &value)?)
                }
                "QUEUE_MAX_AGE_SECS" => {
                    self.queue.max_age = Duration::from_secs(parse(&key, &value)?)
                }
                "QUEUE_MAX_ATTEMPTS" => self.queue.max_attempts = parse(&key, &value)?,
                "STAYS_CONNECTED_IN_BACKGROUND" => {
                    self.recovery.stays_connected_in_background = parse(&key, &value)?
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let scheme_ok = ["http://", "https://", "ws://", "wss://"]
            .iter()
            .any(|prefix| self.server_url.starts_with(prefix));
        if !scheme_ok {
            return Err(ConfigError::Invalid(format!(
                "server_url must use an http, https, ws or wss scheme (got '{}')",
                self.server_url
            )));
        }
        if self.event_buffer == 0 {
            return Err(ConfigError::Invalid("event_buffer must be positive".into()));
        }
        if self.connection.heartbeat_interval.is_zero()
            || self.connection.heartbeat_interval >= self.connection.ack_window
        {
            return Err(ConfigError::Invalid(
                "heartbeat_interval must be positive and shorter than ack_window".into(),
            ));
        }
        for (name, duration) in [
            ("connection.connection_id_timeout", self.connection.connection_id_timeout),
            ("queue.max_age", self.queue.max_age),
            ("queue.ack_timeout", self.queue.ack_timeout),
            ("queue.sweep_interval", self.queue.sweep_interval),
            ("recovery.token_wait", self.recovery.token_wait),
        ] {
            if duration.is_zero() {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }
        if self.queue.max_attempts == 0 {
            return Err(ConfigError::Invalid("queue.max_attempts must be at least 1".into()));
        }
        if self.recovery.max_refresh_attempts == 0 {
            return Err(ConfigError::Invalid(
                "recovery.max_refresh_attempts must be at least 1".into(),
            ));
        }
        for (name, retry) in [
            ("reconnect", &self.reconnect),
            ("queue.retry", &self.queue.retry),
            ("recovery.refresh_retry", &self.recovery.refresh_retry),
        ] {
            if retry.multiplier < 1.0 || !(0.0..=1.0).contains(&retry.jitter) {
                return Err(ConfigError::Invalid(format!(
                    "{name}: multiplier must be >= 1 and jitter within [0, 1]"
                )));
            }
        }
        Ok(())
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidOverride {
            key: key.to_string(),
            value: value.to_string(),
        })
}

pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
