//! `PostgreSQL` projection store.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE users (
//!     id BIGINT PRIMARY KEY,
//!     name TEXT NOT NULL,
//!     created_at BIGINT NOT NULL,
//!     updated_at BIGINT NOT NULL
//! );
//!
//! CREATE TABLE listings (
//!     id BIGINT PRIMARY KEY,
//!     user_id BIGINT NOT NULL,
//!     listing_type TEXT NOT NULL,
//!     price BIGINT NOT NULL,
//!     created_at BIGINT NOT NULL,
//!     updated_at BIGINT NOT NULL,
//!     user_detail JSONB NOT NULL
//! );
//! ```
//!
//! The owner snapshot lives in `user_detail` so the read path never joins.
//!
//! # Example
//!
//! ```ignore
//! use listings_projections::postgres::PostgresProjectionStore;
//!
//! let store = PostgresProjectionStore::connect("postgres://localhost/listing_view", 10).await?;
//! store.migrate().await?;
//! ```

use listings_core::projection::{
    ListingPage, ListingProjection, ListingQuery, ProjectionError, ProjectionStore, Result,
    UserProjection, UserSnapshot,
};
use sqlx::postgres::{PgPool, PgPoolOptions};

/// PostgreSQL-backed read model.
#[derive(Clone)]
pub struct PostgresProjectionStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: i64,
    name: String,
    created_at: i64,
    updated_at: i64,
}

impl From<UserRow> for UserProjection {
    fn from(row: UserRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ListingRow {
    id: i64,
    user_id: i64,
    listing_type: String,
    price: i64,
    created_at: i64,
    updated_at: i64,
    user_detail: serde_json::Value,
}

impl TryFrom<ListingRow> for ListingProjection {
    type Error = ProjectionError;

    fn try_from(row: ListingRow) -> Result<Self> {
        Ok(Self {
            user: decode_snapshot(row.id, row.user_detail)?,
            id: row.id,
            user_id: row.user_id,
            listing_type: row.listing_type,
            price: row.price,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn encode_snapshot(listing_id: i64, snapshot: &UserSnapshot) -> Result<serde_json::Value> {
    serde_json::to_value(snapshot).map_err(|e| {
        ProjectionError::Serialization(format!("Failed to encode owner of listing {listing_id}: {e}"))
    })
}

fn decode_snapshot(listing_id: i64, value: serde_json::Value) -> Result<UserSnapshot> {
    serde_json::from_value(value).map_err(|e| {
        ProjectionError::Serialization(format!("Failed to decode owner of listing {listing_id}: {e}"))
    })
}

impl PostgresProjectionStore {
    /// Create a store over an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect with a dedicated pool.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if connection fails.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| ProjectionError::Storage(format!("Failed to connect: {e}")))?;

        Ok(Self::new(pool))
    }

    /// Create the read-model tables if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if migration fails.
    pub async fn migrate(&self) -> Result<()> {
        let mut migrator = sqlx::migrate!("./migrations");
        // The pool may be shared with services that run their own migrations.
        migrator.set_ignore_missing(true);
        migrator
            .run(&self.pool)
            .await
            .map_err(|e| ProjectionError::Storage(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn to_i64(value: u64, what: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| ProjectionError::InvalidQuery(format!("{what} out of range: {value}")))
}

impl ProjectionStore for PostgresProjectionStore {
    async fn get_user(&self, id: i64) -> Result<Option<UserProjection>> {
        let row: Option<UserRow> = sqlx::query_as(
            "SELECT id, name, created_at, updated_at FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ProjectionError::Storage(format!("Failed to get user: {e}")))?;

        Ok(row.map(UserProjection::from))
    }

    async fn upsert_user(&self, user: &UserProjection) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ProjectionError::Storage(format!("Failed to start transaction: {e}")))?;

        // created_at is kept from the first insert
        sqlx::query(
            "INSERT INTO users (id, name, created_at, updated_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (id) DO UPDATE
             SET name = EXCLUDED.name, updated_at = EXCLUDED.updated_at",
        )
        .bind(user.id)
        .bind(&user.name)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| ProjectionError::Storage(format!("Failed to upsert user: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| ProjectionError::Storage(format!("Failed to commit transaction: {e}")))?;

        Ok(())
    }

    async fn insert_listing(&self, listing: &ListingProjection) -> Result<()> {
        let user_detail = encode_snapshot(listing.id, &listing.user)?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ProjectionError::Storage(format!("Failed to start transaction: {e}")))?;

        sqlx::query(
            "INSERT INTO listings (id, user_id, listing_type, price, created_at, updated_at, user_detail)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(listing.id)
        .bind(listing.user_id)
        .bind(&listing.listing_type)
        .bind(listing.price)
        .bind(listing.created_at)
        .bind(listing.updated_at)
        .bind(user_detail)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(db_err) = &e {
                if db_err.is_unique_violation() {
                    return ProjectionError::Conflict(format!("Listing {} already exists", listing.id));
                }
            }
            ProjectionError::Storage(format!("Failed to insert listing: {e}"))
        })?;

        tx.commit()
            .await
            .map_err(|e| ProjectionError::Storage(format!("Failed to commit transaction: {e}")))?;

        Ok(())
    }

    async fn list_listings(&self, query: &ListingQuery) -> Result<ListingPage> {
        query.validate()?;
        let limit = i64::from(query.page_size);
        let offset = to_i64(query.offset(), "offset")?;

        let rows: Vec<ListingRow> = sqlx::query_as(
            "SELECT id, user_id, listing_type, price, created_at, updated_at, user_detail
             FROM listings
             WHERE ($1::BIGINT IS NULL OR user_id = $1)
             ORDER BY created_at DESC, id DESC
             LIMIT $2 OFFSET $3",
        )
        .bind(query.user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ProjectionError::Storage(format!("Failed to list listings: {e}")))?;

        let (total,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM listings WHERE ($1::BIGINT IS NULL OR user_id = $1)",
        )
        .bind(query.user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| ProjectionError::Storage(format!("Failed to count listings: {e}")))?;

        Ok(ListingPage {
            listings: rows
                .into_iter()
                .map(ListingProjection::try_from)
                .collect::<Result<_>>()?,
            total: u64::try_from(total).unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(user_detail: serde_json::Value) -> ListingRow {
        ListingRow {
            id: 5,
            user_id: 1,
            listing_type: "rent".to_string(),
            price: 1000,
            created_at: 2,
            updated_at: 2,
            user_detail,
        }
    }

    #[test]
    fn stored_snapshot_becomes_embedded_user() {
        let snapshot = UserSnapshot {
            id: 1,
            name: "John Doe".to_string(),
            created_at: 1,
            updated_at: 1,
        };
        let stored = encode_snapshot(5, &snapshot).map_err(|e| e.to_string());

        let listing = stored.and_then(|value| ListingProjection::try_from(row(value)).map_err(|e| e.to_string()));

        assert_eq!(listing.map(|l| l.user), Ok(snapshot));
    }

    #[test]
    fn malformed_snapshot_is_a_serialization_error() {
        let result = ListingProjection::try_from(row(json!({"id": "one"})));

        assert!(matches!(result, Err(ProjectionError::Serialization(ref message)) if message.contains("listing 5")));
        assert!(!ProjectionError::Serialization(String::new()).is_retryable());
    }
}
