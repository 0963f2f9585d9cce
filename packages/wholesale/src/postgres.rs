//! Concrete Postgres-backed implementations of the [`crate::repository`]
//! traits (§3): one struct per aggregate, plain `sqlx::query`/`Row::get`
//! (no compile-time `query!`, since there's no `DATABASE_URL` available at
//! build time here), JSON columns carrying an explicit `{"v":1,...}` version
//! header so a future schema change can dispatch on it instead of silently
//! misreading old rows.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::config::MetricsWeights;
use crate::domain::{
    ArtifactStatus, AttemptCounts, BroadcastStatus, CanonicalUnit, ExtractedItem, LogLevel,
    MatchKind, NormalizedItem, Product, ProcessingLogEntry, RFQBroadcast, UploadedArtifact,
    Vendor, VendorLifecycleEvent, VendorMetrics, VendorMetricsHistoryEntry, VendorProduct,
    WebhookDedupeEntry, WorkingHours,
};
use crate::error::StoreError;
use crate::metrics as metrics_logic;
use crate::repository::{
    ArtifactRepository, BroadcastLog, DedupeOutcome, ProductCatalog, SafeModeGate, VendorCatalog,
    VendorMetricsStore, WebhookDedupeRepository,
};

const CURRENT_JSON_VERSION: i64 = 1;

fn wrap_v1<T: Serialize>(value: &T) -> serde_json::Value {
    json!({ "v": CURRENT_JSON_VERSION, "data": value })
}

fn unwrap_v1<T: DeserializeOwned>(value: serde_json::Value, entity: &'static str) -> Result<T, StoreError> {
    let version = value.get("v").and_then(|v| v.as_i64()).unwrap_or(0);
    if version != CURRENT_JSON_VERSION {
        return Err(StoreError::UnsupportedVersion {
            entity,
            version: version as i32,
        });
    }
    let data = value.get("data").cloned().unwrap_or(serde_json::Value::Null);
    serde_json::from_value(data).map_err(|e| StoreError::Backend(e.into()))
}

fn status_to_str(status: ArtifactStatus) -> &'static str {
    match status {
        ArtifactStatus::Received => "RECEIVED",
        ArtifactStatus::OcrDone => "OCR_DONE",
        ArtifactStatus::Extracted => "EXTRACTED",
        ArtifactStatus::Normalized => "NORMALIZED",
        ArtifactStatus::Broadcast => "BROADCAST",
        ArtifactStatus::Completed => "COMPLETED",
        ArtifactStatus::PendingReview => "PENDING_REVIEW",
        ArtifactStatus::Failed => "FAILED",
    }
}

fn status_from_str(s: &str) -> Result<ArtifactStatus, StoreError> {
    Ok(match s {
        "RECEIVED" => ArtifactStatus::Received,
        "OCR_DONE" => ArtifactStatus::OcrDone,
        "EXTRACTED" => ArtifactStatus::Extracted,
        "NORMALIZED" => ArtifactStatus::Normalized,
        "BROADCAST" => ArtifactStatus::Broadcast,
        "COMPLETED" => ArtifactStatus::Completed,
        "PENDING_REVIEW" => ArtifactStatus::PendingReview,
        "FAILED" => ArtifactStatus::Failed,
        other => {
            return Err(StoreError::Backend(anyhow::anyhow!(
                "unknown artifact status {other}"
            )))
        }
    })
}

fn unit_to_str(unit: CanonicalUnit) -> &'static str {
    match unit {
        CanonicalUnit::Kg => "kg",
        CanonicalUnit::G => "g",
        CanonicalUnit::L => "l",
        CanonicalUnit::Ml => "ml",
        CanonicalUnit::Piece => "piece",
        CanonicalUnit::Packet => "packet",
        CanonicalUnit::Dozen => "dozen",
        CanonicalUnit::Bottle => "bottle",
        CanonicalUnit::Box => "box",
    }
}

fn unit_from_str(s: &str) -> Result<CanonicalUnit, StoreError> {
    Ok(match s {
        "kg" => CanonicalUnit::Kg,
        "g" => CanonicalUnit::G,
        "l" => CanonicalUnit::L,
        "ml" => CanonicalUnit::Ml,
        "piece" => CanonicalUnit::Piece,
        "packet" => CanonicalUnit::Packet,
        "dozen" => CanonicalUnit::Dozen,
        "bottle" => CanonicalUnit::Bottle,
        "box" => CanonicalUnit::Box,
        other => return Err(StoreError::Backend(anyhow::anyhow!("unknown unit {other}"))),
    })
}

fn broadcast_status_to_str(status: BroadcastStatus) -> &'static str {
    match status {
        BroadcastStatus::Sent => "SENT",
        BroadcastStatus::Responded => "RESPONDED",
        BroadcastStatus::Accepted => "ACCEPTED",
        BroadcastStatus::Rejected => "REJECTED",
        BroadcastStatus::Expired => "EXPIRED",
    }
}

fn broadcast_status_from_str(s: &str) -> Result<BroadcastStatus, StoreError> {
    Ok(match s {
        "SENT" => BroadcastStatus::Sent,
        "RESPONDED" => BroadcastStatus::Responded,
        "ACCEPTED" => BroadcastStatus::Accepted,
        "REJECTED" => BroadcastStatus::Rejected,
        "EXPIRED" => BroadcastStatus::Expired,
        other => {
            return Err(StoreError::Backend(anyhow::anyhow!(
                "unknown broadcast status {other}"
            )))
        }
    })
}

fn log_level_to_str(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    }
}

fn log_level_from_str(s: &str) -> Result<LogLevel, StoreError> {
    Ok(match s {
        "info" => LogLevel::Info,
        "warn" => LogLevel::Warn,
        "error" => LogLevel::Error,
        other => {
            return Err(StoreError::Backend(anyhow::anyhow!(
                "unknown log level {other}"
            )))
        }
    })
}

/// `uploaded_artifacts` + `processing_log` (§3 UploadedArtifact).
pub struct PostgresArtifactRepository {
    pool: PgPool,
}

impl PostgresArtifactRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ArtifactRepository for PostgresArtifactRepository {
    async fn insert(&self, artifact: &UploadedArtifact) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO uploaded_artifacts (
                id, retailer_id, blob_ref, status, raw_text,
                extracted_items, normalized_items, last_error, attempt_counts,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(artifact.id)
        .bind(artifact.retailer_id)
        .bind(&artifact.blob_ref)
        .bind(status_to_str(artifact.status))
        .bind(&artifact.raw_text)
        .bind(wrap_v1(&artifact.extracted_items))
        .bind(wrap_v1(&artifact.normalized_items))
        .bind(&artifact.last_error)
        .bind(wrap_v1(&artifact.attempt_counts))
        .bind(artifact.created_at)
        .bind(artifact.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<UploadedArtifact>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, retailer_id, blob_ref, status, raw_text,
                   extracted_items, normalized_items, last_error, attempt_counts,
                   created_at, updated_at
            FROM uploaded_artifacts
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;

        let Some(row) = row else { return Ok(None) };
        Ok(Some(UploadedArtifact {
            id: row.get("id"),
            retailer_id: row.get("retailer_id"),
            blob_ref: row.get("blob_ref"),
            status: status_from_str(row.get::<String, _>("status").as_str())?,
            raw_text: row.get("raw_text"),
            extracted_items: unwrap_v1::<Vec<ExtractedItem>>(
                row.get("extracted_items"),
                "UploadedArtifact.extracted_items",
            )?,
            normalized_items: unwrap_v1::<Vec<NormalizedItem>>(
                row.get("normalized_items"),
                "UploadedArtifact.normalized_items",
            )?,
            last_error: row.get("last_error"),
            attempt_counts: unwrap_v1::<AttemptCounts>(
                row.get("attempt_counts"),
                "UploadedArtifact.attempt_counts",
            )?,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }))
    }

    async fn compare_and_update(
        &self,
        artifact: &UploadedArtifact,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE uploaded_artifacts
            SET status = $1, raw_text = $2, extracted_items = $3, normalized_items = $4,
                last_error = $5, attempt_counts = $6, updated_at = $7
            WHERE id = $8 AND updated_at = $9
            "#,
        )
        .bind(status_to_str(artifact.status))
        .bind(&artifact.raw_text)
        .bind(wrap_v1(&artifact.extracted_items))
        .bind(wrap_v1(&artifact.normalized_items))
        .bind(&artifact.last_error)
        .bind(wrap_v1(&artifact.attempt_counts))
        .bind(artifact.updated_at)
        .bind(artifact.id)
        .bind(expected_updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::StaleWrite {
                entity: "UploadedArtifact",
                id: artifact.id.to_string(),
            });
        }
        Ok(())
    }

    async fn append_log(&self, entry: &ProcessingLogEntry) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Backend(e.into()))?;

        let next_seq: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM processing_log WHERE artifact_id = $1 FOR UPDATE",
        )
        .bind(entry.artifact_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;

        sqlx::query(
            r#"
            INSERT INTO processing_log (artifact_id, seq, stage, level, message, details, at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(entry.artifact_id)
        .bind(next_seq)
        .bind(&entry.stage)
        .bind(log_level_to_str(entry.level))
        .bind(&entry.message)
        .bind(&entry.details)
        .bind(entry.at)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;

        tx.commit().await.map_err(|e| StoreError::Backend(e.into()))?;
        Ok(())
    }

    async fn cleanup_stale_logs(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM processing_log WHERE at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(result.rows_affected())
    }
}

/// Read-only `products` catalog (§3 Product).
pub struct PostgresProductCatalog {
    pool: PgPool,
}

impl PostgresProductCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn product_from_row(row: &sqlx::postgres::PgRow) -> Result<Product, StoreError> {
    Ok(Product {
        id: row.get("id"),
        canonical_name: row.get("canonical_name"),
        aliases: unwrap_v1::<Vec<String>>(row.get("aliases"), "Product.aliases")?,
        unit: row
            .get::<Option<String>, _>("unit")
            .map(|s| unit_from_str(&s))
            .transpose()?,
        category: row.get("category"),
        search_vector: row.get("search_vector"),
    })
}

#[async_trait]
impl ProductCatalog for PostgresProductCatalog {
    async fn get(&self, id: Uuid) -> Result<Option<Product>, StoreError> {
        let row = sqlx::query(
            "SELECT id, canonical_name, aliases, unit, category, search_vector FROM products WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;

        row.as_ref().map(product_from_row).transpose()
    }

    async fn find_by_name_like(&self, needle: &str) -> Result<Vec<Product>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, canonical_name, aliases, unit, category, search_vector
            FROM products
            WHERE lower(canonical_name) LIKE '%' || $1 || '%'
               OR $1 LIKE '%' || lower(canonical_name) || '%'
               OR aliases::text ILIKE '%' || $1 || '%'
            "#,
        )
        .bind(needle)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;

        rows.iter().map(product_from_row).collect()
    }

    async fn find_by_trigram_similarity(
        &self,
        needle: &str,
        limit: usize,
    ) -> Result<Vec<(Product, f64)>, StoreError> {
        // Requires the `pg_trgm` extension (enabled in the wholesale
        // migrations) for the `%` operator and `similarity()` function.
        let rows = sqlx::query(
            r#"
            SELECT id, canonical_name, aliases, unit, category, search_vector,
                   similarity(search_vector, $1) AS sim
            FROM products
            WHERE search_vector % $1
            ORDER BY sim DESC
            LIMIT $2
            "#,
        )
        .bind(needle)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;

        rows.iter()
            .map(|row| {
                let product = product_from_row(row)?;
                let sim: f64 = row.get("sim");
                Ok((product, sim))
            })
            .collect()
    }
}

/// Read-only `vendors` + `vendor_products` (§3 Vendor, VendorProduct).
pub struct PostgresVendorCatalog {
    pool: PgPool,
}

impl PostgresVendorCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn vendor_from_row(row: &sqlx::postgres::PgRow) -> Result<Vendor, StoreError> {
    let working_hours: Option<serde_json::Value> = row.get("working_hours");
    Ok(Vendor {
        id: row.get("id"),
        active: row.get("active"),
        working_hours: working_hours
            .map(|v| unwrap_v1::<WorkingHours>(v, "Vendor.working_hours"))
            .transpose()?,
        service_radius_km: row.get("service_radius_km"),
        location: match (
            row.get::<Option<f64>, _>("location_lat"),
            row.get::<Option<f64>, _>("location_lng"),
        ) {
            (Some(lat), Some(lng)) => Some((lat, lng)),
            _ => None,
        },
    })
}

fn vendor_product_from_row(row: &sqlx::postgres::PgRow) -> VendorProduct {
    VendorProduct {
        vendor_id: row.get("vendor_id"),
        product_id: row.get("product_id"),
        price: row.get("price"),
        stock: row.get("stock"),
        available: row.get("available"),
        last_restocked_at: row.get("last_restocked_at"),
    }
}

#[async_trait]
impl VendorCatalog for PostgresVendorCatalog {
    async fn get_vendor(&self, id: Uuid) -> Result<Option<Vendor>, StoreError> {
        let row = sqlx::query(
            "SELECT id, active, working_hours, service_radius_km, location_lat, location_lng FROM vendors WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;

        row.as_ref().map(vendor_from_row).transpose()
    }

    async fn eligible_offers(&self, product_id: Uuid) -> Result<Vec<(Vendor, VendorProduct)>, StoreError> {
        // Deliberately not filtered on `v.active`/`vp.available` here: the
        // selector's `filter_eligible` is what decides and logs eligibility
        // (§4.C "Decision logging"), so an inactive vendor or an unavailable
        // offer still needs to come back as a candidate for the exclusion to
        // be recorded, rather than silently vanishing before scoring.
        let rows = sqlx::query(
            r#"
            SELECT v.id, v.active, v.working_hours, v.service_radius_km, v.location_lat, v.location_lng,
                   vp.vendor_id, vp.product_id, vp.price, vp.stock, vp.available, vp.last_restocked_at
            FROM vendor_products vp
            JOIN vendors v ON v.id = vp.vendor_id
            WHERE vp.product_id = $1
            "#,
        )
        .bind(product_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;

        rows.iter()
            .map(|row| Ok((vendor_from_row(row)?, vendor_product_from_row(row))))
            .collect()
    }
}

/// `vendor_metrics` (§4.D), with `applied_vendor_events` as its event-id
/// idempotence ledger — the metrics row itself only carries aggregates, so
/// a separate table is what makes `apply_event` safe to replay.
pub struct PostgresVendorMetricsStore {
    pool: PgPool,
    weights: MetricsWeights,
    seed_samples: u64,
}

impl PostgresVendorMetricsStore {
    pub fn new(pool: PgPool, weights: MetricsWeights, seed_samples: u64) -> Self {
        Self {
            pool,
            weights,
            seed_samples,
        }
    }
}

fn metrics_from_row(row: &sqlx::postgres::PgRow) -> VendorMetrics {
    VendorMetrics {
        vendor_id: row.get("vendor_id"),
        reliability_score: row.get("reliability_score"),
        acceptance_rate: row.get("acceptance_rate"),
        delivery_success_rate: row.get("delivery_success_rate"),
        avg_response_time_seconds: row.get("avg_response_time_seconds"),
        cancellation_rate: row.get("cancellation_rate"),
        price_vs_market_percent: row.get::<Option<f64>, _>("price_vs_market_percent"),
        samples_n: row.get::<i64, _>("samples_n") as u64,
        last_updated: row.get("last_updated"),
        assigned_n: row.get::<i64, _>("assigned_n") as u64,
        responded_n: row.get::<i64, _>("responded_n") as u64,
        accepted_n: row.get::<i64, _>("accepted_n") as u64,
        delivered_n: row.get::<i64, _>("delivered_n") as u64,
        delivered_ok_n: row.get::<i64, _>("delivered_ok_n") as u64,
        cancelled_by_vendor_n: row.get::<i64, _>("cancelled_by_vendor_n") as u64,
        response_time_sum_seconds: row.get("response_time_sum_seconds"),
    }
}

async fn upsert_metrics(tx: &mut sqlx::Transaction<'_, sqlx::Postgres>, metrics: &VendorMetrics) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO vendor_metrics (
            vendor_id, reliability_score, acceptance_rate, delivery_success_rate,
            avg_response_time_seconds, cancellation_rate, price_vs_market_percent,
            samples_n, last_updated, assigned_n, responded_n, accepted_n,
            delivered_n, delivered_ok_n, cancelled_by_vendor_n, response_time_sum_seconds
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        ON CONFLICT (vendor_id) DO UPDATE SET
            reliability_score = EXCLUDED.reliability_score,
            acceptance_rate = EXCLUDED.acceptance_rate,
            delivery_success_rate = EXCLUDED.delivery_success_rate,
            avg_response_time_seconds = EXCLUDED.avg_response_time_seconds,
            cancellation_rate = EXCLUDED.cancellation_rate,
            price_vs_market_percent = EXCLUDED.price_vs_market_percent,
            samples_n = EXCLUDED.samples_n,
            last_updated = EXCLUDED.last_updated,
            assigned_n = EXCLUDED.assigned_n,
            responded_n = EXCLUDED.responded_n,
            accepted_n = EXCLUDED.accepted_n,
            delivered_n = EXCLUDED.delivered_n,
            delivered_ok_n = EXCLUDED.delivered_ok_n,
            cancelled_by_vendor_n = EXCLUDED.cancelled_by_vendor_n,
            response_time_sum_seconds = EXCLUDED.response_time_sum_seconds
        "#,
    )
    .bind(metrics.vendor_id)
    .bind(metrics.reliability_score)
    .bind(metrics.acceptance_rate)
    .bind(metrics.delivery_success_rate)
    .bind(metrics.avg_response_time_seconds)
    .bind(metrics.cancellation_rate)
    .bind(metrics.price_vs_market_percent)
    .bind(metrics.samples_n as i64)
    .bind(metrics.last_updated)
    .bind(metrics.assigned_n as i64)
    .bind(metrics.responded_n as i64)
    .bind(metrics.accepted_n as i64)
    .bind(metrics.delivered_n as i64)
    .bind(metrics.delivered_ok_n as i64)
    .bind(metrics.cancelled_by_vendor_n as i64)
    .bind(metrics.response_time_sum_seconds)
    .execute(&mut *tx)
    .await
    .map_err(|e| StoreError::Backend(e.into()))?;
    Ok(())
}

#[async_trait]
impl VendorMetricsStore for PostgresVendorMetricsStore {
    async fn get_metrics(&self, vendor_id: Uuid) -> Result<VendorMetrics, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT vendor_id, reliability_score, acceptance_rate, delivery_success_rate,
                   avg_response_time_seconds, cancellation_rate, price_vs_market_percent,
                   samples_n, last_updated, assigned_n, responded_n, accepted_n,
                   delivered_n, delivered_ok_n, cancelled_by_vendor_n, response_time_sum_seconds
            FROM vendor_metrics
            WHERE vendor_id = $1
            "#,
        )
        .bind(vendor_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;

        // A vendor with no row yet is a vendor with no observed events:
        // the seed row (§3 VendorMetrics invariant), not a missing entity.
        Ok(row.as_ref().map(metrics_from_row).unwrap_or_else(|| VendorMetrics::seed(vendor_id)))
    }

    async fn apply_event(&self, event: &VendorLifecycleEvent) -> Result<VendorMetrics, StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Backend(e.into()))?;

        let already_applied: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM applied_vendor_events WHERE event_id = $1)",
        )
        .bind(event.event_id())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;

        let current_row = sqlx::query(
            r#"
            SELECT vendor_id, reliability_score, acceptance_rate, delivery_success_rate,
                   avg_response_time_seconds, cancellation_rate, price_vs_market_percent,
                   samples_n, last_updated, assigned_n, responded_n, accepted_n,
                   delivered_n, delivered_ok_n, cancelled_by_vendor_n, response_time_sum_seconds
            FROM vendor_metrics
            WHERE vendor_id = $1
            FOR UPDATE
            "#,
        )
        .bind(event.vendor_id())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        let current = current_row
            .as_ref()
            .map(metrics_from_row)
            .unwrap_or_else(|| VendorMetrics::seed(event.vendor_id()));

        if already_applied {
            tx.commit().await.map_err(|e| StoreError::Backend(e.into()))?;
            return Ok(current);
        }

        match event {
            VendorLifecycleEvent::Assigned { vendor_id, order_id, at, .. } => {
                sqlx::query(
                    r#"
                    INSERT INTO vendor_order_assignments (vendor_id, order_id, assigned_at)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (vendor_id, order_id) DO NOTHING
                    "#,
                )
                .bind(vendor_id)
                .bind(order_id)
                .bind(at)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Backend(e.into()))?;
            }
            _ => {}
        }

        // The response time for a `responded` event is derived from the
        // matching `assigned` event's timestamp, since the event itself only
        // carries the response outcome (§4.D avg_response_time_seconds).
        let response_time_seconds = if let VendorLifecycleEvent::Responded { vendor_id, order_id, at, .. } = event {
            sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
                "SELECT assigned_at FROM vendor_order_assignments WHERE vendor_id = $1 AND order_id = $2",
            )
            .bind(vendor_id)
            .bind(order_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?
            .flatten()
            .map(|assigned_at| (*at - assigned_at).num_milliseconds() as f64 / 1000.0)
        } else {
            None
        };

        // `VendorLifecycleEvent` carries no product/price context, so the
        // market-price percentile term is left unset here (§9 Open
        // Question): it's only ever populated by a future event type that
        // knows the product being priced.
        let updated = metrics_logic::apply_and_score(
            current,
            event,
            &self.weights,
            self.seed_samples,
            None,
            response_time_seconds,
        );

        upsert_metrics(&mut tx, &updated).await?;
        sqlx::query(
            "INSERT INTO applied_vendor_events (event_id, vendor_id, applied_at) VALUES ($1, $2, $3)",
        )
        .bind(event.event_id())
        .bind(event.vendor_id())
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;

        // Every composite change is appended to the bounded-retention
        // history table in the same transaction as the metrics upsert
        // (§4.D "History"); `(vendor_id, at)` is the natural key so a
        // replayed event (already handled above) never double-appends.
        let snapshot = VendorMetricsHistoryEntry::snapshot(&updated);
        sqlx::query(
            r#"
            INSERT INTO vendor_metrics_history (
                vendor_id, at, reliability_score, acceptance_rate,
                delivery_success_rate, avg_response_time_seconds,
                cancellation_rate, samples_n
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (vendor_id, at) DO NOTHING
            "#,
        )
        .bind(snapshot.vendor_id)
        .bind(snapshot.at)
        .bind(snapshot.reliability_score)
        .bind(snapshot.acceptance_rate)
        .bind(snapshot.delivery_success_rate)
        .bind(snapshot.avg_response_time_seconds)
        .bind(snapshot.cancellation_rate)
        .bind(snapshot.samples_n as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;

        tx.commit().await.map_err(|e| StoreError::Backend(e.into()))?;
        Ok(updated)
    }

    async fn has_applied(&self, event_id: Uuid) -> Result<bool, StoreError> {
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM applied_vendor_events WHERE event_id = $1)")
            .bind(event_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))
    }

    async fn history(&self, vendor_id: Uuid) -> Result<Vec<VendorMetricsHistoryEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT vendor_id, at, reliability_score, acceptance_rate,
                   delivery_success_rate, avg_response_time_seconds,
                   cancellation_rate, samples_n
            FROM vendor_metrics_history
            WHERE vendor_id = $1
            ORDER BY at ASC
            "#,
        )
        .bind(vendor_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;

        Ok(rows
            .iter()
            .map(|row| VendorMetricsHistoryEntry {
                vendor_id: row.get("vendor_id"),
                at: row.get("at"),
                reliability_score: row.get("reliability_score"),
                acceptance_rate: row.get("acceptance_rate"),
                delivery_success_rate: row.get("delivery_success_rate"),
                avg_response_time_seconds: row.get("avg_response_time_seconds"),
                cancellation_rate: row.get("cancellation_rate"),
                samples_n: row.get::<i64, _>("samples_n") as u64,
            })
            .collect())
    }

    async fn cleanup_history_older_than(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM vendor_metrics_history WHERE at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(result.rows_affected())
    }
}

/// Append-only `rfq_broadcasts` (§3 RFQBroadcast, §4.B BROADCAST).
pub struct PostgresBroadcastLog {
    pool: PgPool,
}

impl PostgresBroadcastLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn rfq_from_row(row: &sqlx::postgres::PgRow) -> Result<RFQBroadcast, StoreError> {
    Ok(RFQBroadcast {
        id: row.get("id"),
        uploaded_artifact_id: row.get("uploaded_artifact_id"),
        retailer_id: row.get("retailer_id"),
        product_id: row.get("product_id"),
        vendor_id: row.get("vendor_id"),
        requested_qty: row.get("requested_qty"),
        unit: row
            .get::<Option<String>, _>("unit")
            .map(|s| unit_from_str(&s))
            .transpose()?,
        status: broadcast_status_from_str(row.get::<String, _>("status").as_str())?,
        vendor_rank: row.get::<i32, _>("vendor_rank") as u32,
        score_snapshot: row.get("score_snapshot"),
        created_at: row.get("created_at"),
        responded_at: row.get("responded_at"),
    })
}

#[async_trait]
impl BroadcastLog for PostgresBroadcastLog {
    async fn existing_for_item(
        &self,
        artifact_id: Uuid,
        product_id: Uuid,
    ) -> Result<Vec<RFQBroadcast>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, uploaded_artifact_id, retailer_id, product_id, vendor_id,
                   requested_qty, unit, status, vendor_rank, score_snapshot,
                   created_at, responded_at
            FROM rfq_broadcasts
            WHERE uploaded_artifact_id = $1 AND product_id = $2
            "#,
        )
        .bind(artifact_id)
        .bind(product_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;

        rows.iter().map(rfq_from_row).collect()
    }

    async fn insert_all(
        &self,
        tx: &mut sqlx::Transaction<'static, sqlx::Postgres>,
        rows: &[RFQBroadcast],
    ) -> Result<(), StoreError> {
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO rfq_broadcasts (
                    id, uploaded_artifact_id, retailer_id, product_id, vendor_id,
                    requested_qty, unit, status, vendor_rank, score_snapshot,
                    created_at, responded_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                "#,
            )
            .bind(row.id)
            .bind(row.uploaded_artifact_id)
            .bind(row.retailer_id)
            .bind(row.product_id)
            .bind(row.vendor_id)
            .bind(row.requested_qty)
            .bind(row.unit.map(unit_to_str))
            .bind(broadcast_status_to_str(row.status))
            .bind(row.vendor_rank as i32)
            .bind(row.score_snapshot)
            .bind(row.created_at)
            .bind(row.responded_at)
            .execute(&mut **tx)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        }
        Ok(())
    }
}

/// `webhook_dedupe` (§4.E).
pub struct PostgresWebhookDedupeRepository {
    pool: PgPool,
}

impl PostgresWebhookDedupeRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WebhookDedupeRepository for PostgresWebhookDedupeRepository {
    async fn try_insert(&self, entry: &WebhookDedupeEntry) -> Result<DedupeOutcome, StoreError> {
        // `DO UPDATE SET source = EXCLUDED.source` is a no-op write that
        // still lets `RETURNING (xmax = 0)` tell a fresh insert from a
        // conflict that hit the existing row, so a duplicate can report
        // which artifact_id it was already recorded against in one
        // round-trip instead of insert-then-select.
        let row = sqlx::query(
            r#"
            INSERT INTO webhook_dedupe (source, external_id, artifact_id, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (source, external_id) DO UPDATE SET source = EXCLUDED.source
            RETURNING artifact_id, (xmax = 0) AS inserted
            "#,
        )
        .bind(&entry.source)
        .bind(&entry.external_id)
        .bind(entry.artifact_id)
        .bind(entry.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;

        let inserted: bool = row.get("inserted");
        if inserted {
            Ok(DedupeOutcome::Inserted)
        } else {
            Ok(DedupeOutcome::Duplicate {
                artifact_id: row.get("artifact_id"),
            })
        }
    }

    async fn cleanup_older_than(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM webhook_dedupe WHERE created_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(result.rows_affected())
    }
}

/// `safe_mode_gate` (§5 "Safe-mode gate"): the single row every process
/// reads to decide whether new ingestion is suspended.
pub struct PostgresSafeModeGate {
    pool: PgPool,
}

impl PostgresSafeModeGate {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SafeModeGate for PostgresSafeModeGate {
    async fn is_engaged(&self) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT engaged FROM safe_mode_gate WHERE id = true")
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(row.map(|r| r.get::<bool, _>("engaged")).unwrap_or(false))
    }

    async fn set_engaged(&self, engaged: bool) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO safe_mode_gate (id, engaged) VALUES (true, $1)
            ON CONFLICT (id) DO UPDATE SET engaged = EXCLUDED.engaged
            "#,
        )
        .bind(engaged)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(())
    }
}
