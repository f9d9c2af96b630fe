//! Outbox staging and relay.
//!
//! ```text
//!  service tx ──► outbox_events (published_at NULL)
//!                        │  claim: claimed_at = now(), committed
//!                        ▼
//!                  OutboxRelay ──► Publisher ──► DurableLog
//!                        │
//!                        └──► published_at = now(), failed rows unclaimed
//! ```
//!
//! No row lock is held while publishing. Claiming and settling are two
//! short statements; a claim left behind by a crashed relay expires after
//! [`RelayConfig::claim_timeout`].
//!
//! Delivery from the outbox is at-least-once: a relay that publishes and
//! then fails to commit will publish the same rows again. Consumers are
//! idempotent or reject duplicates.

use listings_core::event::Event;
use listings_runtime::lifecycle::Shutdown;
use listings_runtime::metrics::PublishMetrics;
use listings_runtime::publisher::{PublishError, Publisher};
use serde::Serialize;
use sqlx::{PgConnection, PgPool};
use std::time::Duration;
use thiserror::Error;

/// Errors from staging or relaying outbox rows.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// The event could not be serialized
    #[error("Failed to encode outbox event for '{subject}': {reason}")]
    Encode {
        /// Target subject
        subject: String,
        /// Serializer message
        reason: String,
    },

    /// Database operation failed
    #[error("Outbox database error: {0}")]
    Database(String),

    /// Publishing a staged row failed
    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// Create the `outbox_events` table if it does not exist.
///
/// # Errors
///
/// Returns [`OutboxError::Database`] if migration fails.
pub async fn migrate(pool: &PgPool) -> Result<(), OutboxError> {
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator
        .run(pool)
        .await
        .map_err(|e| OutboxError::Database(format!("Migration failed: {e}")))
}

/// Stages events inside a caller-owned transaction.
pub struct OutboxWriter;

impl OutboxWriter {
    /// Insert `event` for `subject` on `conn`, usually `&mut *tx`.
    ///
    /// Returns the outbox row id.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Encode`] if serialization fails, or
    /// [`OutboxError::Database`] if the insert fails.
    pub async fn stage<T>(conn: &mut PgConnection, subject: &str, event: &T) -> Result<i64, OutboxError>
    where
        T: Serialize + ?Sized + Sync,
    {
        let payload = serde_json::to_vec(event).map_err(|e| OutboxError::Encode {
            subject: subject.to_string(),
            reason: e.to_string(),
        })?;

        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO outbox_events (subject, payload) VALUES ($1, $2) RETURNING id",
        )
        .bind(subject)
        .bind(payload)
        .fetch_one(conn)
        .await
        .map_err(|e| OutboxError::Database(format!("Failed to stage event: {e}")))?;

        tracing::debug!(subject = %subject, outbox_id = id, "Event staged in outbox");
        Ok(id)
    }

    /// Stage a typed event under its own subject.
    ///
    /// # Errors
    ///
    /// See [`OutboxWriter::stage`].
    pub async fn stage_event<E: Event>(conn: &mut PgConnection, event: &E) -> Result<i64, OutboxError> {
        Self::stage(conn, E::SUBJECT, event).await
    }
}

/// Relay tuning.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RelayConfig {
    /// Wait between polls when the outbox is drained
    pub poll_interval: Duration,
    /// Maximum rows claimed per batch
    pub batch_size: u32,
    /// Age after which another relay may take over a claimed row
    pub claim_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            batch_size: 100,
            claim_timeout: Duration::from_secs(60),
        }
    }
}

/// Publishes staged outbox rows in order.
pub struct OutboxRelay {
    pool: PgPool,
    publisher: Publisher,
    config: RelayConfig,
}

impl OutboxRelay {
    /// Create a relay.
    #[must_use]
    pub const fn new(pool: PgPool, publisher: Publisher, config: RelayConfig) -> Self {
        Self {
            pool,
            publisher,
            config,
        }
    }

    /// Claim up to `batch_size` unpublished rows, publish them in id order
    /// and mark the published ones.
    ///
    /// Stops at the first publish failure so later rows never overtake an
    /// earlier one; the failed row and everything after it are released for
    /// the next poll. Returns the number of rows published.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Database`] if claiming or settling rows fails.
    pub async fn relay_batch(&self) -> Result<usize, OutboxError> {
        let rows = self.claim().await?;
        if rows.is_empty() {
            return Ok(0);
        }

        let mut published = Vec::with_capacity(rows.len());
        let mut released = Vec::new();
        for (id, subject, payload) in rows {
            if !released.is_empty() {
                released.push(id);
                continue;
            }
            match self.publisher.publish_raw(&subject, &payload).await {
                Ok(_) => published.push(id),
                Err(e) => {
                    tracing::warn!(
                        outbox_id = id,
                        subject = %subject,
                        error = %e,
                        "Outbox publish failed, retrying on next poll"
                    );
                    released.push(id);
                },
            }
        }

        self.settle(&published, &released).await?;

        if !published.is_empty() {
            PublishMetrics::record_relayed(published.len());
            tracing::debug!(count = published.len(), "Outbox rows relayed");
        }
        Ok(published.len())
    }

    async fn claim(&self) -> Result<Vec<(i64, String, Vec<u8>)>, OutboxError> {
        let claim_timeout_ms = i64::try_from(self.config.claim_timeout.as_millis()).unwrap_or(i64::MAX);

        let mut rows: Vec<(i64, String, Vec<u8>)> = sqlx::query_as(
            "UPDATE outbox_events SET claimed_at = now()
             WHERE id IN (
                 SELECT id FROM outbox_events
                 WHERE published_at IS NULL
                   AND (claimed_at IS NULL OR claimed_at < now() - $2 * INTERVAL '1 millisecond')
                 ORDER BY id
                 LIMIT $1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING id, subject, payload",
        )
        .bind(i64::from(self.config.batch_size))
        .bind(claim_timeout_ms)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| OutboxError::Database(format!("Failed to claim outbox rows: {e}")))?;

        rows.sort_unstable_by_key(|(id, _, _)| *id);
        Ok(rows)
    }

    async fn settle(&self, published: &[i64], released: &[i64]) -> Result<(), OutboxError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| OutboxError::Database(format!("Failed to start transaction: {e}")))?;

        if !published.is_empty() {
            sqlx::query("UPDATE outbox_events SET published_at = now(), claimed_at = NULL WHERE id = ANY($1)")
                .bind(published)
                .execute(&mut *tx)
                .await
                .map_err(|e| OutboxError::Database(format!("Failed to mark rows published: {e}")))?;
        }
        if !released.is_empty() {
            sqlx::query("UPDATE outbox_events SET claimed_at = NULL WHERE id = ANY($1)")
                .bind(released)
                .execute(&mut *tx)
                .await
                .map_err(|e| OutboxError::Database(format!("Failed to release rows: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| OutboxError::Database(format!("Failed to commit transaction: {e}")))
    }

    /// Relay until `shutdown` fires.
    ///
    /// A full batch is followed immediately by the next one; otherwise the
    /// relay sleeps for `poll_interval`. Database errors are logged and
    /// retried on the next poll.
    pub async fn run(self, mut shutdown: Shutdown) {
        tracing::info!(
            poll_interval = ?self.config.poll_interval,
            batch_size = self.config.batch_size,
            "Outbox relay started"
        );

        let batch_size = usize::try_from(self.config.batch_size).unwrap_or(usize::MAX);
        while !shutdown.is_triggered() {
            let full = match self.relay_batch().await {
                Ok(count) => count >= batch_size,
                Err(e) => {
                    tracing::error!(error = %e, "Outbox relay batch failed");
                    false
                },
            };

            if full {
                continue;
            }

            tokio::select! {
                () = shutdown.wait() => break,
                () = tokio::time::sleep(self.config.poll_interval) => {},
            }
        }

        tracing::info!("Outbox relay stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_polls_twice_a_second() {
        let config = RelayConfig::default();
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.claim_timeout, Duration::from_secs(60));
    }

    #[test]
    fn publish_errors_keep_their_message() {
        let error = OutboxError::from(PublishError::Encode {
            subject: "user.created".to_string(),
            reason: "bad".to_string(),
        });
        assert!(error.to_string().contains("user.created"));
    }
}
