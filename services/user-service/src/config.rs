//! Configuration for the user service.

use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors reading configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required variable is unset
    #[error("Missing environment variable {0}")]
    Missing(String),

    /// A variable is set but does not parse
    #[error("Invalid value for {key}: '{value}'")]
    Invalid {
        /// Variable name
        key: String,
        /// Offending value
        value: String,
    },
}

/// Service configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Default tracing filter when `RUST_LOG` is unset
    pub log_level: String,
    /// Bind host
    pub http_host: String,
    /// Bind port
    pub http_port: u16,
    /// How long in-flight requests get after shutdown starts
    pub http_shutdown_grace: Duration,
    /// Database URL
    pub database_url: String,
    /// Pool size ceiling
    pub database_max_connections: u32,
    /// Connections older than this are recycled
    pub database_max_lifetime: Duration,
    /// Idle connections older than this are closed
    pub database_idle_timeout: Duration,
    /// Comma-separated broker addresses
    pub log_brokers: String,
    /// Stream the outbox publishes into
    pub stream_name: String,
    /// Relay wait when the outbox is drained
    pub outbox_poll_interval: Duration,
    /// Relay batch size
    pub outbox_batch_size: u32,
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `DATABASE_URL` is unset or a value does
    /// not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from `lookup`.
    ///
    /// # Errors
    ///
    /// See [`Config::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse = |key: &str, default: u64| -> Result<u64, ConfigError> { parse_var(&lookup, key, default) };

        Ok(Self {
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info,user_service=debug,listings=debug,sqlx=warn".to_string()),
            http_host: lookup("HTTP_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            http_port: parse_var(&lookup, "HTTP_PORT", 8080)?,
            http_shutdown_grace: Duration::from_secs(parse("HTTP_SHUTDOWN_GRACE_SECS", 10)?),
            database_url: lookup("DATABASE_URL").ok_or_else(|| ConfigError::Missing("DATABASE_URL".to_string()))?,
            database_max_connections: parse_var(&lookup, "DATABASE_MAX_CONNECTIONS", 10)?,
            database_max_lifetime: Duration::from_secs(parse("DATABASE_MAX_LIFETIME_SECS", 1800)?),
            database_idle_timeout: Duration::from_secs(parse("DATABASE_IDLE_TIMEOUT_SECS", 600)?),
            log_brokers: lookup("LOG_BROKERS").unwrap_or_else(|| "localhost:9092".to_string()),
            stream_name: lookup("STREAM_NAME").unwrap_or_else(|| "listing_view_event".to_string()),
            outbox_poll_interval: Duration::from_millis(parse("OUTBOX_POLL_INTERVAL_MS", 500)?),
            outbox_batch_size: parse_var(&lookup, "OUTBOX_BATCH_SIZE", 100)?,
        })
    }

    /// `host:port` to bind the HTTP server to.
    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.http_host, self.http_port)
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            value,
        }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;

    #[test]
    fn outbox_settings_default_and_override() {
        let defaults = Config::from_lookup(|key| (key == "DATABASE_URL").then(|| "postgres://db/users".to_string())).unwrap();
        assert_eq!(defaults.outbox_poll_interval, Duration::from_millis(500));
        assert_eq!(defaults.outbox_batch_size, 100);
        assert_eq!(defaults.bind_address(), "0.0.0.0:8080");

        let tuned = Config::from_lookup(|key| match key {
            "DATABASE_URL" => Some("postgres://db/users".to_string()),
            "OUTBOX_POLL_INTERVAL_MS" => Some("50".to_string()),
            "OUTBOX_BATCH_SIZE" => Some("10".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(tuned.outbox_poll_interval, Duration::from_millis(50));
        assert_eq!(tuned.outbox_batch_size, 10);
    }

    #[test]
    fn database_url_is_required() {
        assert_eq!(
            Config::from_lookup(|_| None),
            Err(ConfigError::Missing("DATABASE_URL".to_string()))
        );
    }
}
