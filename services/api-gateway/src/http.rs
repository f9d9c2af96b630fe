//! Public HTTP API.
//!
//! | Route                    | Forwards to                              |
//! |--------------------------|------------------------------------------|
//! | `POST /public/listings`  | user service, then listing service       |
//! | `GET /public/listings`   | listing view service                     |
//! | `POST /public/users`     | user service                             |
//! | `GET /health`            | answered locally with `204`              |
//!
//! Dependency failures are translated with [`RpcError::status_hint`].
//! Rejections keep the dependency's status and message; every other
//! failure gets a generic message so upstream internals never reach the
//! public caller.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use listings_rpc::dto::{
    CreateListingRequest, CreateUserRequest, GetAllListingsRequest, GetAllListingsResponse, ListingEnvelope,
    UserEnvelope,
};
use listings_rpc::{CallContext, ListingGateway, RpcError};
use listings_runtime::metrics::MetricsRecorder;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// Listing and user flows
    pub gateway: ListingGateway,
    /// Deadline given to every public request
    pub request_timeout: Duration,
    /// Installed Prometheus recorder, if metrics are enabled
    pub metrics: Option<MetricsRecorder>,
}

impl AppState {
    fn call_context(&self) -> CallContext {
        CallContext::background().with_timeout(self.request_timeout)
    }
}

/// Build the router. `allowed_origins` configures CORS; `*` allows any.
pub fn router(state: AppState, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/public/listings", post(create_listing).get(get_all_listings))
        .route("/public/users", post(create_user))
        .route("/health", get(|| async { StatusCode::NO_CONTENT }))
        .route("/metrics", get(metrics))
        .layer(cors_layer(allowed_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    if allowed_origins.iter().any(|origin| origin == "*") {
        return cors.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring unparsable CORS origin");
                None
            },
        })
        .collect();
    cors.allow_origin(origins)
}

async fn create_listing(
    State(state): State<AppState>,
    body: Result<Json<CreateListingRequest>, JsonRejection>,
) -> Result<Json<ListingEnvelope>, ApiError> {
    let Json(request) = body.map_err(ApiError::from_rejection)?;
    request.validate().map_err(ApiError::bad_request)?;

    let listing = state.gateway.create_listing(&state.call_context(), &request).await?;
    Ok(Json(ListingEnvelope { listing }))
}

/// `GET /public/listings` query string.
#[derive(Debug, Default, Deserialize)]
pub struct ListingParams {
    page_num: Option<String>,
    page_size: Option<String>,
    user_id: Option<String>,
}

impl ListingParams {
    fn into_request(self) -> Result<GetAllListingsRequest, ApiError> {
        let defaults = GetAllListingsRequest::default();
        let user_id: i64 = parse_or(self.user_id, 0, "invalid user id")?;

        Ok(GetAllListingsRequest {
            page_number: parse_or(self.page_num, defaults.page_number, "invalid page number")?,
            page_size: parse_or(self.page_size, defaults.page_size, "invalid page size")?,
            user_id: (user_id != 0).then_some(user_id),
        })
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T, message: &str) -> Result<T, ApiError> {
    match value.as_deref().map(str::trim) {
        None | Some("") => Ok(default),
        Some(raw) => raw.parse().map_err(|_| ApiError::bad_request(format!("{message}: '{raw}'"))),
    }
}

async fn get_all_listings(
    State(state): State<AppState>,
    Query(params): Query<ListingParams>,
) -> Result<Json<GetAllListingsResponse>, ApiError> {
    let request = params.into_request()?;
    let response = state.gateway.get_all_listings(&state.call_context(), &request).await?;
    Ok(Json(response))
}

async fn create_user(
    State(state): State<AppState>,
    body: Result<Json<CreateUserRequest>, JsonRejection>,
) -> Result<Json<UserEnvelope>, ApiError> {
    let Json(request) = body.map_err(ApiError::from_rejection)?;
    if request.name.trim().is_empty() {
        return Err(ApiError::bad_request("name is required"));
    }

    let user = state.gateway.users().create_user(&state.call_context(), &request).await?;
    Ok(Json(UserEnvelope { user }))
}

async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics {
        Some(recorder) => recorder.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// Error returned by handlers, rendered as `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    /// A 400 with `message`.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn from_rejection(rejection: JsonRejection) -> Self {
        Self::bad_request(format!("invalid request: {}", rejection.body_text()))
    }
}

impl From<RpcError> for ApiError {
    fn from(error: RpcError) -> Self {
        let status = StatusCode::from_u16(error.status_hint()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let message = match &error {
            RpcError::Rejected { .. } | RpcError::MaxRetriesExceeded { .. } => error.to_string(),
            RpcError::DeadlineExceeded => "request timed out".to_string(),
            RpcError::Decode { .. } => "bad gateway".to_string(),
            RpcError::Cancelled | RpcError::Internal { .. } | RpcError::InvalidRequest(_) => {
                "internal server error".to_string()
            },
        };

        if status.is_server_error() {
            tracing::error!(error = %error, status = status.as_u16(), "Dependency call failed");
        } else {
            tracing::debug!(error = %error, status = status.as_u16(), "Dependency rejected request");
        }
        Self { status, message }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_keeps_upstream_status_and_message() {
        let error = ApiError::from(RpcError::Rejected {
            service: "user-service".to_string(),
            status: 404,
            message: "user not found".to_string(),
        });

        assert_eq!(error.status, StatusCode::NOT_FOUND);
        assert_eq!(error.message, "Bad request from service user-service: user not found");
    }

    #[test]
    fn upstream_failures_are_generic() {
        let internal = ApiError::from(RpcError::Internal {
            service: "listing-service".to_string(),
            status: 500,
        });
        assert_eq!(internal.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(internal.message, "internal server error");

        let exhausted = ApiError::from(RpcError::MaxRetriesExceeded { attempts: 3 });
        assert_eq!(exhausted.status, StatusCode::SERVICE_UNAVAILABLE);

        let timeout = ApiError::from(RpcError::DeadlineExceeded);
        assert_eq!(timeout.status, StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn zero_user_id_means_all_users() {
        let params = ListingParams {
            page_num: Some("2".to_string()),
            page_size: None,
            user_id: Some("0".to_string()),
        };

        let request = params.into_request().map_err(|e| e.message);

        assert_eq!(
            request,
            Ok(GetAllListingsRequest {
                page_number: 2,
                page_size: 10,
                user_id: None,
            })
        );
    }

    #[test]
    fn non_numeric_page_is_rejected() {
        let params = ListingParams {
            page_num: Some("two".to_string()),
            ..ListingParams::default()
        };

        let error = params.into_request().err().map(|e| (e.status, e.message));

        assert_eq!(
            error,
            Some((StatusCode::BAD_REQUEST, "invalid page number: 'two'".to_string()))
        );
    }
}
