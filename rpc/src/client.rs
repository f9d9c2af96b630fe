//! The retrying RPC client.
//!
//! # Call algorithm
//!
//! ```text
//!   attempt ──► transport error? ──yes──► context done? ──yes──► Cancelled / DeadlineExceeded
//!      ▲              │                        │ no
//!      │              │ no                     ▼
//!      │              ▼                  attempts left? ──no──► MaxRetriesExceeded
//!      │        status >= 400? ──yes──► classifier(response)     │ yes
//!      │              │ no                                       ▼
//!      │              ▼                                  sleep backoff (interruptible)
//!      │           Ok(response)                                  │
//!      └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Application responses are never retried: a 4xx or 5xx is the dependency's
//! answer, and repeating the request would not change it.

use crate::classify::Classifier;
use crate::context::CallContext;
use crate::error::RpcError;
use crate::retry::RetryPolicy;
use crate::transport::{ReqwestTransport, RpcRequest, RpcResponse, Transport};
use metrics::counter;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors reading client configuration.
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

/// Connection settings for one dependency.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcClientConfig {
    /// Base URL, e.g. `http://user-service:8080`
    pub base_url: String,
    /// Per-attempt timeout
    pub timeout: Duration,
    /// Total attempts per call
    pub max_retries: u32,
}

impl RpcClientConfig {
    /// Settings with a 5s timeout and 3 attempts.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(5),
            max_retries: 3,
        }
    }

    /// Read `<PREFIX>_URL`, `<PREFIX>_MAX_RETRY` and `<PREFIX>_TIMEOUT_MS`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] if the URL is unset, or
    /// [`ConfigError::Invalid`] if a number does not parse.
    pub fn from_env_prefix(prefix: &str) -> Result<Self, ConfigError> {
        Self::from_lookup(prefix, |key| env::var(key).ok())
    }

    /// [`from_env_prefix`](Self::from_env_prefix) over an arbitrary lookup.
    ///
    /// # Errors
    ///
    /// See [`from_env_prefix`](Self::from_env_prefix).
    pub fn from_lookup<F>(prefix: &str, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let url_key = format!("{prefix}_URL");
        let base_url = lookup(&url_key).ok_or(ConfigError::Missing(url_key))?;
        let mut config = Self::new(base_url);

        let retry_key = format!("{prefix}_MAX_RETRY");
        if let Some(value) = lookup(&retry_key) {
            config.max_retries = value
                .parse()
                .map_err(|_| ConfigError::Invalid { key: retry_key, value })?;
        }

        let timeout_key = format!("{prefix}_TIMEOUT_MS");
        if let Some(value) = lookup(&timeout_key) {
            let millis: u64 = value
                .parse()
                .map_err(|_| ConfigError::Invalid { key: timeout_key, value })?;
            config.timeout = Duration::from_millis(millis);
        }

        Ok(config)
    }

    /// Retry policy for these settings: `max_retries` attempts, backoff
    /// starting at 100ms and doubling.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::builder().max_attempts(self.max_retries).build()
    }
}

/// Retrying client for one dependency.
#[derive(Clone)]
pub struct RpcClient {
    base_url: String,
    policy: RetryPolicy,
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("base_url", &self.base_url)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl RpcClient {
    /// Client over HTTP with `config`'s timeout and retry ceiling.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::InvalidRequest`] if the HTTP client cannot be
    /// built.
    pub fn new(config: &RpcClientConfig) -> Result<Self, RpcError> {
        let transport = ReqwestTransport::new(config.timeout)?;
        Ok(Self::with_transport(&config.base_url, config.retry_policy(), Arc::new(transport)))
    }

    /// Client over any transport.
    #[must_use]
    pub fn with_transport(base_url: impl Into<String>, policy: RetryPolicy, transport: Arc<dyn Transport>) -> Self {
        Self {
            base_url: base_url.into(),
            policy,
            transport,
        }
    }

    /// Base URL requests are sent to.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send `request`, retrying transport failures with backoff.
    ///
    /// # Errors
    ///
    /// - [`RpcError::Cancelled`] / [`RpcError::DeadlineExceeded`] when `ctx`
    ///   ends the call, including mid-backoff
    /// - [`RpcError::MaxRetriesExceeded`] when every attempt failed to get a
    ///   response
    /// - whatever `classify` returns for a status >= 400
    /// - [`RpcError::InvalidRequest`] if the request cannot be sent at all
    pub async fn call(
        &self,
        ctx: &CallContext,
        request: &RpcRequest,
        classify: Classifier,
    ) -> Result<RpcResponse, RpcError> {
        let mut attempt = 0;

        loop {
            ctx.check()?;
            attempt += 1;

            let outcome = tokio::select! {
                biased;
                reason = ctx.done() => return Err(reason),
                outcome = self.transport.send(&self.base_url, request) => outcome,
            };

            let error = match outcome {
                Ok(response) if response.is_success() => return Ok(response),
                Ok(response) => return Err(classify(&response)),
                Err(e) if !e.is_retryable() => return Err(RpcError::InvalidRequest(e.to_string())),
                Err(e) => e,
            };

            ctx.check()?;

            if !self.policy.has_attempts_after(attempt) {
                tracing::error!(
                    base_url = %self.base_url,
                    path = %request.path,
                    attempts = attempt,
                    error = %error,
                    "Call failed after max retries"
                );
                return Err(RpcError::MaxRetriesExceeded { attempts: attempt });
            }

            let delay = self.policy.delay_for_attempt(attempt);
            counter!("listings_rpc_retries_total", "base_url" => self.base_url.clone()).increment(1);
            tracing::warn!(
                base_url = %self.base_url,
                path = %request.path,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "Call failed, retrying"
            );

            tokio::select! {
                biased;
                reason = ctx.done() => return Err(reason),
                () = tokio::time::sleep(delay) => {},
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use crate::classify::single_error;
    use crate::transport::{SendFuture, TransportError};
    use listings_runtime::shutdown_channel;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    /// Plays back scripted outcomes, then keeps failing to connect.
    #[derive(Default)]
    struct ScriptedTransport {
        script: Mutex<VecDeque<Result<RpcResponse, TransportError>>>,
        attempts: AtomicU32,
        sent_at: Mutex<Vec<Instant>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<RpcResponse, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                ..Self::default()
            })
        }

        fn attempts(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    impl Transport for ScriptedTransport {
        fn send<'a>(&'a self, _base_url: &'a str, _request: &'a RpcRequest) -> SendFuture<'a> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.sent_at.lock().unwrap().push(Instant::now());
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Connect("connection refused".to_string())));
            Box::pin(async move { next })
        }
    }

    fn ok(status: u16, body: &str) -> Result<RpcResponse, TransportError> {
        Ok(RpcResponse {
            status,
            service: "user-service".to_string(),
            body: body.as_bytes().to_vec(),
        })
    }

    fn client(transport: Arc<ScriptedTransport>, attempts: u32) -> RpcClient {
        let policy = RetryPolicy::builder()
            .max_attempts(attempts)
            .initial_backoff(Duration::from_millis(100))
            .multiplier(2.0)
            .build();
        RpcClient::with_transport("http://user-service:8080", policy, transport)
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_transport_failures_back_off_then_give_up() {
        let transport = ScriptedTransport::new(vec![]);
        let client = client(Arc::clone(&transport), 3);
        let started = Instant::now();

        let result = client
            .call(&CallContext::background(), &RpcRequest::get("/users/1"), single_error)
            .await;

        assert_eq!(result, Err(RpcError::MaxRetriesExceeded { attempts: 3 }));
        assert_eq!(transport.attempts(), 3);

        let sent_at = transport.sent_at.lock().unwrap().clone();
        assert_eq!(sent_at[1] - sent_at[0], Duration::from_millis(100));
        assert_eq!(sent_at[2] - sent_at[1], Duration::from_millis(200));
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failure() {
        let transport = ScriptedTransport::new(vec![Err(TransportError::Timeout), ok(200, r#"{"ok":true}"#)]);
        let client = client(Arc::clone(&transport), 3);

        let response = client
            .call(&CallContext::background(), &RpcRequest::get("/users/1"), single_error)
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(transport.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn application_errors_are_not_retried() {
        let transport = ScriptedTransport::new(vec![ok(500, r#"{"error":"boom"}"#)]);
        let client = client(Arc::clone(&transport), 5);

        let error = client
            .call(&CallContext::background(), &RpcRequest::get("/users/1"), single_error)
            .await
            .unwrap_err();

        assert!(matches!(error, RpcError::Internal { status: 500, .. }));
        assert!(!error.to_string().contains("boom"));
        assert_eq!(transport.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff_aborts_the_call() {
        let transport = ScriptedTransport::new(vec![]);
        let policy = RetryPolicy::builder()
            .max_attempts(5)
            .initial_backoff(Duration::from_secs(10))
            .build();
        let client = RpcClient::with_transport("http://user-service:8080", policy, Arc::clone(&transport) as _);
        let (trigger, shutdown) = shutdown_channel();
        let ctx = CallContext::background().with_cancellation(shutdown);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.trigger();
        });
        let started = Instant::now();

        let result = client.call(&ctx, &RpcRequest::get("/users/1"), single_error).await;

        assert_eq!(result, Err(RpcError::Cancelled));
        assert_eq!(transport.attempts(), 1);
        assert_eq!(started.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_cuts_backoff_short() {
        let transport = ScriptedTransport::new(vec![]);
        let client = client(Arc::clone(&transport), 5);
        let ctx = CallContext::background().with_timeout(Duration::from_millis(150));

        let result = client.call(&ctx, &RpcRequest::get("/users/1"), single_error).await;

        assert_eq!(result, Err(RpcError::DeadlineExceeded));
        assert_eq!(transport.attempts(), 2);
    }

    #[tokio::test]
    async fn already_cancelled_context_sends_nothing() {
        let transport = ScriptedTransport::new(vec![ok(200, "{}")]);
        let client = client(Arc::clone(&transport), 3);
        let (trigger, shutdown) = shutdown_channel();
        trigger.trigger();

        let result = client
            .call(
                &CallContext::background().with_cancellation(shutdown),
                &RpcRequest::get("/users/1"),
                single_error,
            )
            .await;

        assert_eq!(result, Err(RpcError::Cancelled));
        assert_eq!(transport.attempts(), 0);
    }

    #[test]
    fn config_reads_prefixed_variables() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("USER_SERVICE_URL", "http://user-service:8080"),
            ("USER_SERVICE_MAX_RETRY", "4"),
            ("USER_SERVICE_TIMEOUT_MS", "2500"),
        ]);

        let config = RpcClientConfig::from_lookup("USER_SERVICE", |key| vars.get(key).map(ToString::to_string)).unwrap();

        assert_eq!(config.base_url, "http://user-service:8080");
        assert_eq!(config.max_retries, 4);
        assert_eq!(config.timeout, Duration::from_millis(2500));
        assert_eq!(config.retry_policy().max_attempts(), 4);
    }

    #[test]
    fn config_rejects_missing_url_and_bad_numbers() {
        let missing = RpcClientConfig::from_lookup("LISTING_SERVICE", |_| None);
        assert_eq!(missing, Err(ConfigError::Missing("LISTING_SERVICE_URL".to_string())));

        let bad = RpcClientConfig::from_lookup("LISTING_SERVICE", |key| match key {
            "LISTING_SERVICE_URL" => Some("http://listing-service".to_string()),
            "LISTING_SERVICE_MAX_RETRY" => Some("many".to_string()),
            _ => None,
        });
        assert!(matches!(bad, Err(ConfigError::Invalid { key, .. }) if key == "LISTING_SERVICE_MAX_RETRY"));
    }
}
