//! Turning error responses into [`RpcError`]s.
//!
//! Dependencies report failures in one of two body shapes:
//!
//! | Shape                       | Classifier       |
//! |-----------------------------|------------------|
//! | `{"error": "..."}`          | [`single_error`] |
//! | `{"errors": ["...", ...]}`  | [`multi_error`]  |
//!
//! Both apply the same rule: a 5xx status becomes a generic
//! [`RpcError::Internal`] and the body is discarded, so upstream internals
//! never reach the caller's clients. A 4xx status becomes
//! [`RpcError::Rejected`] attributed to the responding host.

use crate::error::RpcError;
use crate::transport::RpcResponse;
use serde::Deserialize;

/// Maps a response with status >= 400 to the call's error.
pub type Classifier = fn(&RpcResponse) -> RpcError;

#[derive(Deserialize)]
struct SingleErrorBody {
    error: String,
}

#[derive(Deserialize)]
struct MultiErrorBody {
    errors: Vec<String>,
}

/// Classifier for `{"error": "..."}` bodies.
#[must_use]
pub fn single_error(response: &RpcResponse) -> RpcError {
    classify_with(response, |body| {
        serde_json::from_slice::<SingleErrorBody>(body).map(|parsed| parsed.error)
    })
}

/// Classifier for `{"errors": [...]}` bodies; messages are joined with `", "`.
#[must_use]
pub fn multi_error(response: &RpcResponse) -> RpcError {
    classify_with(response, |body| {
        serde_json::from_slice::<MultiErrorBody>(body).map(|parsed| parsed.errors.join(", "))
    })
}

fn classify_with<F>(response: &RpcResponse, message: F) -> RpcError
where
    F: FnOnce(&[u8]) -> Result<String, serde_json::Error>,
{
    if response.status >= 500 {
        tracing::warn!(
            service = %response.service,
            status = response.status,
            "Dependency failed with a server error"
        );
        return RpcError::Internal {
            service: response.service.clone(),
            status: response.status,
        };
    }

    match message(&response.body) {
        Ok(message) => RpcError::Rejected {
            service: response.service.clone(),
            status: response.status,
            message,
        },
        Err(e) => RpcError::Decode {
            service: response.service.clone(),
            reason: format!("error response: {e}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16, body: &str) -> RpcResponse {
        RpcResponse {
            status,
            service: "user-service".to_string(),
            body: body.as_bytes().to_vec(),
        }
    }

    #[test]
    fn server_error_body_is_never_forwarded() {
        let error = single_error(&response(500, r#"{"error":"boom"}"#));

        assert_eq!(
            error,
            RpcError::Internal {
                service: "user-service".to_string(),
                status: 500
            }
        );
        assert!(!error.to_string().contains("boom"));
    }

    #[test]
    fn server_error_with_garbage_body_is_still_internal() {
        let error = multi_error(&response(503, "<html>unavailable</html>"));

        assert!(matches!(error, RpcError::Internal { status: 503, .. }));
    }

    #[test]
    fn client_error_is_attributed_to_service() {
        let error = single_error(&response(404, r#"{"error":"user not found"}"#));

        assert_eq!(
            error,
            RpcError::Rejected {
                service: "user-service".to_string(),
                status: 404,
                message: "user not found".to_string(),
            }
        );
    }

    #[test]
    fn multiple_errors_are_joined() {
        let error = multi_error(&response(
            422,
            r#"{"errors":["price must be positive","listing_type is invalid"]}"#,
        ));

        assert!(matches!(
            error,
            RpcError::Rejected { ref message, .. } if message == "price must be positive, listing_type is invalid"
        ));
    }

    #[test]
    fn undecodable_client_error_is_a_decode_error() {
        let error = single_error(&response(400, "not json"));

        assert!(matches!(error, RpcError::Decode { .. }));
    }
}
