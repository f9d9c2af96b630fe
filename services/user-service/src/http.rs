//! HTTP API of the user service.
//!
//! - `POST /users` (form `name=...`) → `201 {"result": true, "user": {...}}`
//! - `GET /users?page_num=&page_size=` → `200 {"result": true, "users": [...]}`,
//!   newest first
//! - `GET /users/:id` → `200 {"result": true, "user": {...}}` or
//!   `404 {"error": "user not found"}`
//! - `GET /health` → `204`

use crate::store::{User, UserStore, UserStoreError};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use listings_core::projection::{DEFAULT_PAGE_SIZE, ListingQuery};
use listings_runtime::metrics::MetricsRecorder;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Shared handler state.
pub struct AppState<S> {
    /// User persistence
    pub store: Arc<S>,
    /// Installed Prometheus recorder, if metrics are enabled
    pub metrics: Option<MetricsRecorder>,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            metrics: self.metrics.clone(),
        }
    }
}

/// Build the router.
pub fn router<S: UserStore + 'static>(state: AppState<S>) -> Router {
    Router::new()
        .route("/users", post(create_user::<S>).get(list_users::<S>))
        .route("/users/:id", get(get_user::<S>))
        .route("/health", get(|| async { StatusCode::NO_CONTENT }))
        .route("/metrics", get(metrics::<S>))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Form body of `POST /users`.
#[derive(Debug, Deserialize)]
pub struct CreateUserForm {
    /// Display name
    #[serde(default)]
    pub name: String,
}

/// `{"result": true, "user": {...}}`
#[derive(Debug, Serialize, Deserialize)]
pub struct UserBody {
    /// Always `true`
    pub result: bool,
    /// The user
    pub user: User,
}

async fn create_user<S: UserStore + 'static>(
    State(state): State<AppState<S>>,
    Form(form): Form<CreateUserForm>,
) -> Result<(StatusCode, Json<UserBody>), ApiError> {
    let name = form.name.trim();
    if name.is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "name is required"));
    }

    let user = state.store.create_user(name, listings_core::now_micros()).await?;
    Ok((StatusCode::CREATED, Json(UserBody { result: true, user })))
}

/// `GET /users` query string.
#[derive(Debug, Default, Deserialize)]
pub struct PageParams {
    page_num: Option<String>,
    page_size: Option<String>,
}

/// `{"result": true, "users": [...]}`
#[derive(Debug, Serialize, Deserialize)]
pub struct UsersBody {
    /// Always `true`
    pub result: bool,
    /// Users on the requested page
    pub users: Vec<User>,
}

fn parse_or(value: Option<String>, default: u32, message: &str) -> Result<u32, ApiError> {
    match value.as_deref().map(str::trim) {
        None | Some("") => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, format!("{message}: '{raw}'"))),
    }
}

async fn list_users<S: UserStore + 'static>(
    State(state): State<AppState<S>>,
    Query(params): Query<PageParams>,
) -> Result<Json<UsersBody>, ApiError> {
    let page = ListingQuery::new(
        parse_or(params.page_num, 1, "invalid page number")?,
        parse_or(params.page_size, DEFAULT_PAGE_SIZE, "invalid page size")?,
    );
    page.validate()
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.to_string()))?;

    let users = state.store.list_users(page.page_number, page.page_size).await?;
    Ok(Json(UsersBody { result: true, users }))
}

async fn get_user<S: UserStore + 'static>(
    State(state): State<AppState<S>>,
    Path(id): Path<String>,
) -> Result<Json<UserBody>, ApiError> {
    let id: i64 = id
        .parse()
        .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, format!("invalid user id: '{id}'")))?;

    match state.store.get_user(id).await? {
        Some(user) => Ok(Json(UserBody { result: true, user })),
        None => Err(ApiError::new(StatusCode::NOT_FOUND, "user not found")),
    }
}

async fn metrics<S: UserStore + 'static>(State(state): State<AppState<S>>) -> Response {
    match state.metrics {
        Some(recorder) => recorder.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Error returned by handlers, rendered as `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    /// An error with `status` and a client-facing `message`.
    #[must_use]
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<UserStoreError> for ApiError {
    fn from(error: UserStoreError) -> Self {
        tracing::error!(error = %error, "User store failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}
