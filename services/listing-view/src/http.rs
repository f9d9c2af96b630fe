//! HTTP read endpoint for the listing view.
//!
//! | Route            | Response                                  |
//! |------------------|-------------------------------------------|
//! | `GET /listings`  | `{"result": true, "listings": [...]}`     |
//! | `GET /health`    | `204 No Content`                          |
//! | `GET /metrics`   | Prometheus text format                    |
//!
//! Errors are returned as `{"error": "..."}`.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use listings_core::projection::{DEFAULT_PAGE_SIZE, ListingQuery, ProjectionError, ProjectionStore};
use listings_projections::{ListingViewService, ListingsResponse};
use listings_runtime::metrics::MetricsRecorder;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

/// Shared handler state.
pub struct AppState<S> {
    /// The listing query
    pub listings: ListingViewService<S>,
    /// Installed Prometheus recorder, if metrics are enabled
    pub metrics: Option<MetricsRecorder>,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            listings: self.listings.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

/// Build the router.
pub fn router<S: ProjectionStore + 'static>(state: AppState<S>) -> Router {
    Router::new()
        .route("/listings", get(get_all_listings::<S>))
        .route("/health", get(health))
        .route("/metrics", get(metrics::<S>))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `GET /listings` query string. Values are parsed by hand so a bad number
/// gets a JSON error body.
#[derive(Debug, Default, Deserialize)]
pub struct ListingParams {
    page_num: Option<String>,
    page_size: Option<String>,
    user_id: Option<String>,
}

impl ListingParams {
    fn into_query(self) -> Result<ListingQuery, ApiError> {
        let page_number = parse_or(self.page_num, 1, "invalid page number")?;
        let page_size = parse_or(self.page_size, DEFAULT_PAGE_SIZE, "invalid page size")?;
        let mut query = ListingQuery::new(page_number, page_size);

        // 0 and empty mean "all users".
        let user_id: i64 = parse_or(self.user_id, 0, "invalid user id")?;
        if user_id != 0 {
            query = query.for_user(user_id);
        }

        Ok(query)
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T, message: &str) -> Result<T, ApiError> {
    match value.as_deref().map(str::trim) {
        None | Some("") => Ok(default),
        Some(raw) => raw.parse().map_err(|_| ApiError::bad_request(format!("{message}: '{raw}'"))),
    }
}

async fn get_all_listings<S: ProjectionStore + 'static>(
    State(state): State<AppState<S>>,
    Query(params): Query<ListingParams>,
) -> Result<Json<ListingsResponse>, ApiError> {
    let query = params.into_query()?;
    let response = state.listings.get_all_listings(&query).await?;
    Ok(Json(response))
}

async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn metrics<S: ProjectionStore + 'static>(State(state): State<AppState<S>>) -> Response {
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

    /// A 500 whose message reveals nothing.
    #[must_use]
    pub fn internal() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "internal server error".to_string(),
        }
    }
}

impl From<ProjectionError> for ApiError {
    fn from(error: ProjectionError) -> Self {
        match error {
            ProjectionError::InvalidQuery(message) => Self::bad_request(message),
            other => {
                tracing::error!(error = %other, "Listing query failed");
                Self::internal()
            },
        }
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

    fn params(page_num: Option<&str>, page_size: Option<&str>, user_id: Option<&str>) -> ListingParams {
        ListingParams {
            page_num: page_num.map(ToString::to_string),
            page_size: page_size.map(ToString::to_string),
            user_id: user_id.map(ToString::to_string),
        }
    }

    #[test]
    fn defaults_to_first_page_of_ten() {
        let query = ListingParams::default().into_query();

        assert_eq!(query.ok(), Some(ListingQuery::new(1, 10)));
    }

    #[test]
    fn zero_user_id_means_all_users() {
        let query = params(Some("2"), Some("5"), Some("0")).into_query();

        assert_eq!(query.ok(), Some(ListingQuery::new(2, 5)));
    }

    #[test]
    fn user_filter_is_applied() {
        let query = params(None, None, Some("7")).into_query();

        assert_eq!(query.ok(), Some(ListingQuery::new(1, 10).for_user(7)));
    }

    #[test]
    fn garbage_page_is_a_bad_request() {
        let error = params(Some("two"), None, None).into_query().err();

        assert!(matches!(error, Some(ApiError { status: StatusCode::BAD_REQUEST, .. })));
    }
}
