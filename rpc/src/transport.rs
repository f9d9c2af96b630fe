//! Request/response types and the HTTP transport seam.
//!
//! [`Transport`] performs exactly one HTTP exchange. Retrying, backoff and
//! error classification live in [`RpcClient`](crate::RpcClient), so tests
//! can script transport outcomes without a network.

use crate::error::RpcError;
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

pub use reqwest::Method;

/// Body of an outgoing request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum RequestBody {
    /// No body
    #[default]
    Empty,
    /// Encoded JSON document
    Json(Vec<u8>),
    /// `application/x-www-form-urlencoded` fields, in order
    Form(Vec<(String, String)>),
}

/// One call to a dependency, relative to the client's base URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcRequest {
    /// HTTP method
    pub method: Method,
    /// Path below the base URL, starting with `/`
    pub path: String,
    /// Query parameters, in order
    pub query: Vec<(String, String)>,
    /// Request body
    pub body: RequestBody,
}

impl RpcRequest {
    /// A request with no query and no body.
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    /// `GET path`.
    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// `POST path`.
    #[must_use]
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    /// Append a query parameter.
    #[must_use]
    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    /// Append a form field; switches the body to form encoding.
    #[must_use]
    pub fn form_field(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        let field = (key.into(), value.to_string());
        match &mut self.body {
            RequestBody::Form(fields) => fields.push(field),
            body => *body = RequestBody::Form(vec![field]),
        }
        self
    }

    /// Use `value` as a JSON body.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::InvalidRequest`] if `value` cannot be serialized.
    pub fn json<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self, RpcError> {
        let encoded = serde_json::to_vec(value).map_err(|e| RpcError::InvalidRequest(e.to_string()))?;
        self.body = RequestBody::Json(encoded);
        Ok(self)
    }
}

/// A response with a status the client has not classified yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcResponse {
    /// HTTP status
    pub status: u16,
    /// Responding host, without port
    pub service: String,
    /// Raw body
    pub body: Vec<u8>,
}

impl RpcResponse {
    /// Whether the status is below 400.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status < 400
    }

    /// Decode the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Decode`] if the body does not match `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, RpcError> {
        serde_json::from_slice(&self.body).map_err(|e| RpcError::Decode {
            service: self.service.clone(),
            reason: e.to_string(),
        })
    }
}

/// Failure below HTTP: nothing usable came back.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Could not connect
    #[error("Connection failed: {0}")]
    Connect(String),

    /// The per-request timeout elapsed
    #[error("Request timed out")]
    Timeout,

    /// The connection broke mid-exchange
    #[error("Request failed: {0}")]
    Io(String),

    /// The request itself is malformed
    #[error("Invalid request: {0}")]
    Invalid(String),
}

impl TransportError {
    /// Whether another attempt might succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::Invalid(_))
    }
}

/// Boxed future returned by [`Transport::send`].
pub type SendFuture<'a> = Pin<Box<dyn Future<Output = Result<RpcResponse, TransportError>> + Send + 'a>>;

/// Performs a single HTTP exchange.
pub trait Transport: Send + Sync {
    /// Send `request` to `base_url` + `request.path`.
    fn send<'a>(&'a self, base_url: &'a str, request: &'a RpcRequest) -> SendFuture<'a>;
}

/// [`Transport`] over a pooled `reqwest` client.
#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Build a client whose every request times out after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::InvalidRequest`] if the TLS backend cannot be
    /// initialized.
    pub fn new(timeout: Duration) -> Result<Self, RpcError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RpcError::InvalidRequest(e.to_string()))?;
        Ok(Self { client })
    }

    async fn exchange(&self, base_url: &str, request: &RpcRequest) -> Result<RpcResponse, TransportError> {
        let url = format!("{}{}", base_url.trim_end_matches('/'), request.path);
        let mut builder = self.client.request(request.method.clone(), url);

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(bytes) => builder
                .header(CONTENT_TYPE, "application/json")
                .body(bytes.clone()),
            RequestBody::Form(fields) => builder.form(fields),
        };

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let service = response.url().host_str().unwrap_or_default().to_string();
        let body = response.bytes().await.map_err(map_reqwest_error)?;

        Ok(RpcResponse {
            status,
            service,
            body: body.to_vec(),
        })
    }
}

impl Transport for ReqwestTransport {
    fn send<'a>(&'a self, base_url: &'a str, request: &'a RpcRequest) -> SendFuture<'a> {
        Box::pin(self.exchange(base_url, request))
    }
}

fn map_reqwest_error(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout
    } else if error.is_connect() {
        TransportError::Connect(error.to_string())
    } else if error.is_builder() {
        TransportError::Invalid(error.to_string())
    } else {
        TransportError::Io(error.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;

    #[test]
    fn form_fields_accumulate_in_order() {
        let request = RpcRequest::post("/listings")
            .form_field("price", 1000)
            .form_field("user_id", 1)
            .form_field("listing_type", "rent");

        assert_eq!(
            request.body,
            RequestBody::Form(vec![
                ("price".to_string(), "1000".to_string()),
                ("user_id".to_string(), "1".to_string()),
                ("listing_type".to_string(), "rent".to_string()),
            ])
        );
    }

    #[test]
    fn json_body_is_encoded_once() {
        let request = RpcRequest::post("/users").json(&serde_json::json!({"name": "John Doe"})).unwrap();

        assert_eq!(request.body, RequestBody::Json(br#"{"name":"John Doe"}"#.to_vec()));
    }

    #[test]
    fn only_malformed_requests_are_final() {
        assert!(TransportError::Timeout.is_retryable());
        assert!(TransportError::Connect("refused".to_string()).is_retryable());
        assert!(!TransportError::Invalid("bad url".to_string()).is_retryable());
    }
}
