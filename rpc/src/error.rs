//! Errors returned by RPC calls.

use thiserror::Error;

/// Outcome of a failed call. Each call ends in exactly one of these.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// Every attempt failed at the transport level
    #[error("Max retries exceeded after {attempts} attempts")]
    MaxRetriesExceeded {
        /// Attempts made
        attempts: u32,
    },

    /// The caller cancelled the call
    #[error("Call cancelled")]
    Cancelled,

    /// The caller's deadline passed
    #[error("Call deadline exceeded")]
    DeadlineExceeded,

    /// The dependency failed with a 5xx status. Its body is not kept.
    #[error("Service '{service}' returned status code {status}")]
    Internal {
        /// Responding host
        service: String,
        /// HTTP status
        status: u16,
    },

    /// The dependency rejected the request with a 4xx status
    #[error("Bad request from service {service}: {message}")]
    Rejected {
        /// Responding host, without port
        service: String,
        /// HTTP status
        status: u16,
        /// Error message from the response body
        message: String,
    },

    /// A response body could not be decoded
    #[error("Failed to decode response from service {service}: {reason}")]
    Decode {
        /// Responding host
        service: String,
        /// Decoder message
        reason: String,
    },

    /// The request could not be built or sent, and retrying will not help
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl RpcError {
    /// HTTP status a server should answer with when this error ends a
    /// request it was handling.
    #[must_use]
    pub const fn status_hint(&self) -> u16 {
        match self {
            Self::Rejected { status, .. } => *status,
            Self::MaxRetriesExceeded { .. } => 503,
            Self::DeadlineExceeded => 504,
            Self::Decode { .. } => 502,
            Self::Cancelled | Self::Internal { .. } | Self::InvalidRequest(_) => 500,
        }
    }
}
