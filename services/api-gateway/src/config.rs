//! Configuration for the API gateway.

use listings_rpc::RpcClientConfig;
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Errors reading configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable is set but does not parse
    #[error("Invalid value for {key}: '{value}'")]
    Invalid {
        /// Variable name
        key: String,
        /// Offending value
        value: String,
    },

    /// A dependency's client settings are missing or invalid
    #[error(transparent)]
    Client(#[from] listings_rpc::ConfigError),
}

/// Gateway configuration.
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
    /// Upper bound on one public request, across all RPC attempts
    pub request_timeout: Duration,
    /// CORS origins; `*` allows any
    pub allowed_origins: Vec<String>,
    /// User service client
    pub user_service: RpcClientConfig,
    /// Listing service client
    pub listing_service: RpcClientConfig,
    /// Listing view service client
    pub listing_view_service: RpcClientConfig,
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a dependency URL is unset or a value does
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
        let number = |key: &str, default: u64| -> Result<u64, ConfigError> {
            lookup(key).map_or(Ok(default), |value| {
                value.trim().parse().map_err(|_| ConfigError::Invalid {
                    key: key.to_string(),
                    value,
                })
            })
        };
        let http_port = number("HTTP_PORT", 8000)?;

        Ok(Self {
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info,api_gateway=debug,listings_rpc=debug".to_string()),
            http_host: lookup("HTTP_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            http_port: u16::try_from(http_port).map_err(|_| ConfigError::Invalid {
                key: "HTTP_PORT".to_string(),
                value: http_port.to_string(),
            })?,
            http_shutdown_grace: Duration::from_secs(number("HTTP_SHUTDOWN_GRACE_SECS", 10)?),
            request_timeout: Duration::from_millis(number("REQUEST_TIMEOUT_MS", 30_000)?),
            allowed_origins: lookup("ALLOWED_ORIGIN").map_or_else(
                || vec!["*".to_string()],
                |value| {
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|origin| !origin.is_empty())
                        .map(str::to_string)
                        .collect()
                },
            ),
            user_service: RpcClientConfig::from_lookup("USER_SERVICE", &lookup)?,
            listing_service: RpcClientConfig::from_lookup("LISTING_SERVICE", &lookup)?,
            listing_view_service: RpcClientConfig::from_lookup("LISTING_VIEW_SERVICE", &lookup)?,
        })
    }

    /// `host:port` to bind the HTTP server to.
    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.http_host, self.http_port)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;

    fn env(key: &str) -> Option<String> {
        match key {
            "USER_SERVICE_URL" => Some("http://users:8080".to_string()),
            "LISTING_SERVICE_URL" => Some("http://listings:6000".to_string()),
            "LISTING_VIEW_SERVICE_URL" => Some("http://view:8081".to_string()),
            "USER_SERVICE_MAX_RETRY" => Some("5".to_string()),
            _ => None,
        }
    }

    #[test]
    fn reads_one_client_per_dependency() {
        let config = Config::from_lookup(env).unwrap();

        assert_eq!(config.user_service.base_url, "http://users:8080");
        assert_eq!(config.user_service.max_retries, 5);
        assert_eq!(config.listing_service.max_retries, 3);
        assert_eq!(config.listing_view_service.timeout, Duration::from_secs(5));
        assert_eq!(config.bind_address(), "0.0.0.0:8000");
        assert_eq!(config.allowed_origins, vec!["*".to_string()]);
    }

    #[test]
    fn allowed_origins_are_comma_separated() {
        let config = Config::from_lookup(|key| {
            if key == "ALLOWED_ORIGIN" {
                Some("https://a.example, https://b.example,".to_string())
            } else {
                env(key)
            }
        })
        .unwrap();

        assert_eq!(config.allowed_origins, vec!["https://a.example", "https://b.example"]);
    }

    #[test]
    fn missing_dependency_url_is_reported() {
        let result = Config::from_lookup(|key| (key != "LISTING_SERVICE_URL").then(|| env(key)).flatten());

        assert_eq!(
            result,
            Err(ConfigError::Client(listings_rpc::ConfigError::Missing(
                "LISTING_SERVICE_URL".to_string()
            )))
        );
    }

    #[test]
    fn out_of_range_port_is_invalid() {
        let result = Config::from_lookup(|key| {
            if key == "HTTP_PORT" {
                Some("70000".to_string())
            } else {
                env(key)
            }
        });

        assert!(matches!(result, Err(ConfigError::Invalid { key, .. }) if key == "HTTP_PORT"));
    }
}
