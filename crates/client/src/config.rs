//! Connection configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_URL: &str = "ws://localhost:8080/api/realtime";
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 100;
pub const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_RATE_LIMIT_PER_SECOND: u32 = 10;

/// Settings for one [`ConnectionManager`](crate::ConnectionManager).
///
/// A manager copies its config at construction and never changes it; build a
/// new manager to apply different settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionConfig {
    /// Realtime endpoint (`ws://` or `wss://`).
    pub url: String,
    /// Identity attached to every outbound envelope.
    pub client_id: String,
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval_ms: u64,
    /// How long a PING may go unanswered before the connection is treated as
    /// dead. `0` disables the watchdog.
    pub heartbeat_timeout_ms: u64,
    pub max_queue_size: usize,
    pub connection_timeout_ms: u64,
    pub rate_limit_per_second: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            client_id: uuid::Uuid::new_v4().to_string(),
            auto_reconnect: true,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            heartbeat_timeout_ms: DEFAULT_HEARTBEAT_TIMEOUT_MS,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            connection_timeout_ms: DEFAULT_CONNECTION_TIMEOUT_MS,
            rate_limit_per_second: DEFAULT_RATE_LIMIT_PER_SECOND,
        }
    }
}

impl ConnectionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Read configuration from environment variables, falling back to defaults.
    ///
    /// Environment variables:
    /// - `LIVECHAT_URL`: realtime endpoint (default: `ws://localhost:8080/api/realtime`)
    /// - `LIVECHAT_CLIENT_ID`: client identity (default: random UUID)
    /// - `LIVECHAT_AUTO_RECONNECT`: `true` | `false` (default: `true`)
    /// - `LIVECHAT_MAX_RECONNECT_ATTEMPTS` (default: 10)
    /// - `LIVECHAT_HEARTBEAT_INTERVAL_MS` (default: 30000)
    /// - `LIVECHAT_HEARTBEAT_TIMEOUT_MS` (default: 5000, `0` disables)
    /// - `LIVECHAT_MAX_QUEUE_SIZE` (default: 100)
    /// - `LIVECHAT_CONNECTION_TIMEOUT_MS` (default: 10000)
    /// - `LIVECHAT_RATE_LIMIT_PER_SECOND` (default: 10)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            url: std::env::var("LIVECHAT_URL").unwrap_or(defaults.url),
            client_id: std::env::var("LIVECHAT_CLIENT_ID").unwrap_or(defaults.client_id),
            auto_reconnect: env_parse("LIVECHAT_AUTO_RECONNECT", defaults.auto_reconnect)?,
            max_reconnect_attempts: env_parse(
                "LIVECHAT_MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
            )?,
            heartbeat_interval_ms: env_parse(
                "LIVECHAT_HEARTBEAT_INTERVAL_MS",
                defaults.heartbeat_interval_ms,
            )?,
            heartbeat_timeout_ms: env_parse(
                "LIVECHAT_HEARTBEAT_TIMEOUT_MS",
                defaults.heartbeat_timeout_ms,
            )?,
            max_queue_size: env_parse("LIVECHAT_MAX_QUEUE_SIZE", defaults.max_queue_size)?,
            connection_timeout_ms: env_parse(
                "LIVECHAT_CONNECTION_TIMEOUT_MS",
                defaults.connection_timeout_ms,
            )?,
            rate_limit_per_second: env_parse(
                "LIVECHAT_RATE_LIMIT_PER_SECOND",
                defaults.rate_limit_per_second,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the connection manager cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = url::Url::parse(&self.url).map_err(|e| ConfigError::InvalidUrl {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ConfigError::InvalidUrl {
                url: self.url.clone(),
                reason: format!("unsupported scheme '{}'", url.scheme()),
            });
        }
        if self.client_id.trim().is_empty() {
            return Err(ConfigError::Invalid("client_id must not be empty".into()));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat_interval_ms must be positive".into(),
            ));
        }
        if self.connection_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "connection_timeout_ms must be positive".into(),
            ));
        }
        if self.rate_limit_per_second == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit_per_second must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// `None` when the heartbeat watchdog is disabled.
    pub fn heartbeat_timeout(&self) -> Option<Duration> {
        (self.heartbeat_timeout_ms > 0).then(|| Duration::from_millis(self.heartbeat_timeout_ms))
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Messages allowed per 60-second rate window.
    pub fn rate_budget(&self) -> u32 {
        self.rate_limit_per_second.saturating_mul(60)
    }
}

fn env_parse<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidVar {
            name,
            value: raw,
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ConnectionConfig::default();
        config.validate().unwrap();
        assert!(config.auto_reconnect);
        assert_eq!(config.rate_budget(), 600);
        assert_eq!(config.heartbeat_timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn each_default_gets_its_own_client_id() {
        assert_ne!(
            ConnectionConfig::default().client_id,
            ConnectionConfig::default().client_id
        );
    }

    #[test]
    fn rejects_non_websocket_urls() {
        let err = ConnectionConfig::new("http://example.com").validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidUrl { .. }));
        assert!(ConnectionConfig::new("not a url").validate().is_err());
    }

    #[test]
    fn rejects_zero_rate_limit() {
        let config = ConnectionConfig {
            rate_limit_per_second: 0,
            ..ConnectionConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_timeout_disables_watchdog() {
        let config = ConnectionConfig {
            heartbeat_timeout_ms: 0,
            ..ConnectionConfig::default()
        };
        assert_eq!(config.heartbeat_timeout(), None);
    }

    #[test]
    fn deserializes_partial_camel_case() {
        let config: ConnectionConfig =
            serde_json::from_str(r#"{"url":"wss://chat.example.com/rt","maxQueueSize":5}"#).unwrap();
        assert_eq!(config.url, "wss://chat.example.com/rt");
        assert_eq!(config.max_queue_size, 5);
        assert_eq!(config.max_reconnect_attempts, DEFAULT_MAX_RECONNECT_ATTEMPTS);
    }
}
