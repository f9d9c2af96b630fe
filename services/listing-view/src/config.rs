//! Configuration for the listing view service.
//!
//! Loaded from environment variables (after `.env`, if present) with
//! defaults for everything except `DATABASE_URL`.

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
    /// HTTP server
    pub http: HttpConfig,
    /// Read-model database
    pub database: DatabaseConfig,
    /// Durable log connection and consumer policy
    pub log: LogConfig,
    /// Subscription worker limits
    pub subscription: SubscriptionSettings,
}

/// HTTP server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpConfig {
    /// Bind host
    pub host: String,
    /// Bind port
    pub port: u16,
    /// How long in-flight requests get after shutdown starts
    pub shutdown_grace: Duration,
}

/// `PostgreSQL` pool configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// Connection URL
    pub url: String,
    /// Pool size ceiling
    pub max_connections: u32,
    /// Connections older than this are recycled
    pub max_lifetime: Duration,
    /// Idle connections older than this are closed
    pub idle_timeout: Duration,
}

/// Durable log configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Comma-separated broker addresses
    pub brokers: String,
    /// First reconnect wait
    pub reconnect_backoff: Duration,
    /// Reconnect wait ceiling
    pub reconnect_backoff_max: Duration,
    /// Stream binding both event subjects
    pub stream_name: String,
    /// Delivery attempts per message
    pub max_deliver: u32,
    /// Route exhausted messages to `<stream>.dead_letter`
    pub dead_letter_enabled: bool,
}

/// Subscription worker limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionSettings {
    /// Concurrent handler invocations per subscription
    pub max_in_flight: usize,
    /// Upper bound on draining in-flight handlers at shutdown
    pub drain_timeout: Duration,
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
        let env = Lookup(lookup);

        Ok(Self {
            log_level: env.string("LOG_LEVEL", "info,listings=debug,listing_view_service=debug,sqlx=warn"),
            http: HttpConfig {
                host: env.string("HTTP_HOST", "0.0.0.0"),
                port: env.parse("HTTP_PORT", 8080)?,
                shutdown_grace: Duration::from_secs(env.parse("HTTP_SHUTDOWN_GRACE_SECS", 10)?),
            },
            database: DatabaseConfig {
                url: env.required("DATABASE_URL")?,
                max_connections: env.parse("DATABASE_MAX_CONNECTIONS", 10)?,
                max_lifetime: Duration::from_secs(env.parse("DATABASE_MAX_LIFETIME_SECS", 1800)?),
                idle_timeout: Duration::from_secs(env.parse("DATABASE_IDLE_TIMEOUT_SECS", 600)?),
            },
            log: LogConfig {
                brokers: env.string("LOG_BROKERS", "localhost:9092"),
                reconnect_backoff: Duration::from_millis(env.parse("LOG_RECONNECT_BACKOFF_MS", 100)?),
                reconnect_backoff_max: Duration::from_millis(env.parse("LOG_RECONNECT_BACKOFF_MAX_MS", 10_000)?),
                stream_name: env.string("STREAM_NAME", "listing_view_event"),
                max_deliver: env.parse("MAX_DELIVER", 1)?,
                dead_letter_enabled: env.parse("DEAD_LETTER_ENABLED", true)?,
            },
            subscription: SubscriptionSettings {
                max_in_flight: env.parse("MAX_IN_FLIGHT", 64)?,
                drain_timeout: Duration::from_secs(env.parse("DRAIN_TIMEOUT_SECS", 10)?),
            },
        })
    }

    /// `host:port` to bind the HTTP server to.
    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.http.host, self.http.port)
    }
}

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str, default: &str) -> String {
        (self.0)(key).unwrap_or_else(|| default.to_string())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        (self.0)(key).ok_or_else(|| ConfigError::Missing(key.to_string()))
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match (self.0)(key) {
            None => Ok(default),
            Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
                key: key.to_string(),
                value,
            }),
        }
    }
}
