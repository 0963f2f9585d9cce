//! PostgreSQL implementation of the [`crate::outbox`] traits.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE relay_outbox (
//!     id              UUID PRIMARY KEY,
//!     entity_id       UUID NOT NULL,
//!     event_type      TEXT NOT NULL,
//!     payload         JSONB NOT NULL,
//!     correlation_id  UUID,
//!     created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     published_at    TIMESTAMPTZ
//! );
//! CREATE INDEX relay_outbox_unpublished
//!     ON relay_outbox (entity_id, id)
//!     WHERE published_at IS NULL;
//! ```
//!
//! `entity_id` groups rows that must dispatch in commit order (e.g. all
//! outbox rows for one `uploaded_artifact_id`); rows for distinct entities
//! carry no ordering guarantee relative to each other.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::outbox::{CorrelationId, OutboxEntry, OutboxEvent, OutboxReader, OutboxWriter};

/// Writes outbox rows within a caller-supplied transaction, so the business
/// write and the outbox write commit or roll back together.
pub struct PgOutboxWriter<'a> {
    tx: &'a mut Transaction<'static, Postgres>,
    entity_id: Uuid,
}

impl<'a> PgOutboxWriter<'a> {
    pub fn new(tx: &'a mut Transaction<'static, Postgres>, entity_id: Uuid) -> Self {
        Self { tx, entity_id }
    }
}

#[async_trait]
impl OutboxWriter for PgOutboxWriter<'_> {
    async fn write_event<E: OutboxEvent + Send + Sync>(
        &mut self,
        event: &E,
        correlation_id: CorrelationId,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let payload = serde_json::to_value(event).context("failed to serialize outbox event")?;
        let cid: Option<Uuid> = correlation_id.is_some().then(|| correlation_id.into_inner());

        sqlx::query(
            r#"INSERT INTO relay_outbox (id, entity_id, event_type, payload, correlation_id)
               VALUES ($1, $2, $3, $4, $5)"#,
        )
        .bind(id)
        .bind(self.entity_id)
        .bind(E::event_type())
        .bind(&payload)
        .bind(cid)
        .execute(&mut **self.tx)
        .await
        .context("failed to write outbox row")?;

        Ok(id)
    }
}

/// Generic helper for writing any [`Serialize`] payload to the outbox without
/// requiring the type to implement [`OutboxEvent`] — used for the job-style
/// relay dispatch where the caller already knows the versioned `event_type`.
pub async fn write_outbox_row(
    tx: &mut Transaction<'static, Postgres>,
    entity_id: Uuid,
    event_type: &str,
    payload: &impl Serialize,
    correlation_id: CorrelationId,
) -> Result<Uuid> {
    let id = Uuid::new_v4();
    let payload = serde_json::to_value(payload).context("failed to serialize outbox payload")?;
    let cid: Option<Uuid> = correlation_id.is_some().then(|| correlation_id.into_inner());

    sqlx::query(
        r#"INSERT INTO relay_outbox (id, entity_id, event_type, payload, correlation_id)
           VALUES ($1, $2, $3, $4, $5)"#,
    )
    .bind(id)
    .bind(entity_id)
    .bind(event_type)
    .bind(&payload)
    .bind(cid)
    .execute(&mut **tx)
    .await
    .context("failed to write outbox row")?;

    Ok(id)
}

/// Claims and dispatches unpublished outbox rows; a queue processor on the
/// `outbox-relay` queue drives this (§4.E: "a separate relay polls outbox
/// rows in commit order").
pub struct PgOutboxReader {
    pool: PgPool,
}

impl PgOutboxReader {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OutboxReader for PgOutboxReader {
    async fn claim_unpublished(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        let rows = sqlx::query(
            r#"SELECT id, event_type, payload, correlation_id, created_at, published_at
               FROM relay_outbox
               WHERE published_at IS NULL
               ORDER BY entity_id, id
               LIMIT $1
               FOR UPDATE SKIP LOCKED"#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("failed to claim outbox rows")?;

        Ok(rows
            .into_iter()
            .map(|r| {
                let cid: Option<Uuid> = r.get("correlation_id");
                OutboxEntry {
                    id: r.get("id"),
                    event_type: r.get("event_type"),
                    payload: r.get("payload"),
                    correlation_id: cid.map(CorrelationId::from).unwrap_or(CorrelationId::NONE),
                    created_at: r.get("created_at"),
                    published_at: r.get("published_at"),
                }
            })
            .collect())
    }

    async fn mark_published(&self, ids: &[Uuid]) -> Result<()> {
        sqlx::query(r#"UPDATE relay_outbox SET published_at = now() WHERE id = ANY($1)"#)
            .bind(ids)
            .execute(&self.pool)
            .await
            .context("failed to mark outbox rows published")?;
        Ok(())
    }

    async fn cleanup_published(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"DELETE FROM relay_outbox WHERE published_at IS NOT NULL AND published_at < $1"#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await
        .context("failed to clean up published outbox rows")?;
        Ok(result.rows_affected())
    }
}
