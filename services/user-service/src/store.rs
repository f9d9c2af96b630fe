//! User persistence.
//!
//! Creating a user and recording its `user.created` event happen in one
//! database transaction: either both the row and the outbox entry exist, or
//! neither does. The outbox relay publishes the event afterwards.

use listings_core::event::UserCreated;
use listings_core::projection::ListingQuery;
use listings_postgres::{OutboxError, OutboxWriter};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::future::Future;
use thiserror::Error;

/// Errors from the user store.
#[derive(Error, Debug)]
pub enum UserStoreError {
    /// The database failed
    #[error("Database error: {0}")]
    Database(String),

    /// The event could not be staged
    #[error(transparent)]
    Outbox(#[from] OutboxError),
}

/// A stored user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    /// User id
    pub id: i64,
    /// Display name
    pub name: String,
    /// Contact email
    #[serde(skip)]
    pub email: String,
    /// Creation time (unix micros)
    pub created_at: i64,
    /// Last update time (unix micros)
    pub updated_at: i64,
}

impl User {
    /// The event announcing this user.
    #[must_use]
    pub fn created_event(&self) -> UserCreated {
        UserCreated {
            id: self.id,
            name: self.name.clone(),
            email: self.email.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// User persistence used by the HTTP handlers.
pub trait UserStore: Send + Sync {
    /// Insert a user and stage its `user.created` event atomically.
    ///
    /// # Errors
    ///
    /// Returns [`UserStoreError`] if either write fails; nothing is kept.
    fn create_user(&self, name: &str, created_at: i64) -> impl Future<Output = Result<User, UserStoreError>> + Send;

    /// Fetch a user by id.
    ///
    /// # Errors
    ///
    /// Returns [`UserStoreError::Database`] if the query fails.
    fn get_user(&self, id: i64) -> impl Future<Output = Result<Option<User>, UserStoreError>> + Send;

    /// One page of users, newest first. A page past the end is empty.
    ///
    /// Callers validate the page bounds first.
    ///
    /// # Errors
    ///
    /// Returns [`UserStoreError::Database`] if the query fails.
    fn list_users(
        &self,
        page_number: u32,
        page_size: u32,
    ) -> impl Future<Output = Result<Vec<User>, UserStoreError>> + Send;
}

/// `PostgreSQL` [`UserStore`].
#[derive(Clone, Debug)]
pub struct PostgresUserStore {
    pool: PgPool,
}

impl PostgresUserStore {
    /// Create a store over `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the `users` and `outbox_events` tables if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns [`UserStoreError`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), UserStoreError> {
        let mut migrator = sqlx::migrate!("./migrations");
        migrator.set_ignore_missing(true);
        migrator
            .run(&self.pool)
            .await
            .map_err(|e| UserStoreError::Database(format!("Migration failed: {e}")))?;

        listings_postgres::migrate(&self.pool).await?;
        Ok(())
    }
}

fn database(context: &str) -> impl FnOnce(sqlx::Error) -> UserStoreError + '_ {
    move |e| UserStoreError::Database(format!("{context}: {e}"))
}

impl UserStore for PostgresUserStore {
    async fn create_user(&self, name: &str, created_at: i64) -> Result<User, UserStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(database("Failed to start transaction"))?;

        let user: User = sqlx::query_as(
            "INSERT INTO users (name, created_at, updated_at)
             VALUES ($1, $2, $2)
             RETURNING id, name, email, created_at, updated_at",
        )
        .bind(name)
        .bind(created_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(database("Failed to insert user"))?;

        let outbox_id = OutboxWriter::stage_event(&mut *tx, &user.created_event()).await?;

        tx.commit().await.map_err(database("Failed to commit user"))?;

        tracing::info!(user_id = user.id, outbox_id, "User created");
        Ok(user)
    }

    async fn get_user(&self, id: i64) -> Result<Option<User>, UserStoreError> {
        sqlx::query_as("SELECT id, name, email, created_at, updated_at FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(database("Failed to fetch user"))
    }

    async fn list_users(&self, page_number: u32, page_size: u32) -> Result<Vec<User>, UserStoreError> {
        let offset = ListingQuery::new(page_number, page_size).offset();

        sqlx::query_as(
            "SELECT id, name, email, created_at, updated_at FROM users
             ORDER BY created_at DESC, id DESC
             LIMIT $1 OFFSET $2",
        )
        .bind(i64::from(page_size))
        .bind(i64::try_from(offset).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(database("Failed to list users"))
    }
}
