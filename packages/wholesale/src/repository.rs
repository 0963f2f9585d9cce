//! Repository traits for the wholesale domain's persisted state (§3).
//!
//! One trait per aggregate rather than a single god-trait: each aggregate
//! has its own lifecycle and its own concrete Postgres implementation in
//! [`crate::postgres`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{
    ProcessingLogEntry, Product, RFQBroadcast, UploadedArtifact, Vendor, VendorMetrics,
    VendorMetricsHistoryEntry, VendorProduct, WebhookDedupeEntry,
};
use crate::error::StoreError;

/// Durable home for [`UploadedArtifact`] and its append-only processing log.
#[async_trait]
pub trait ArtifactRepository: Send + Sync {
    async fn insert(&self, artifact: &UploadedArtifact) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<UploadedArtifact>, StoreError>;

    /// Persists the new state of `artifact`, rejecting the write if the
    /// stored `updated_at` has moved on since the handler read it (§5
    /// "optimistic-concurrency check on `updated_at`").
    async fn compare_and_update(
        &self,
        artifact: &UploadedArtifact,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn append_log(&self, entry: &ProcessingLogEntry) -> Result<(), StoreError>;

    async fn cleanup_stale_logs(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Read-only catalog access (§3 Product).
#[async_trait]
pub trait ProductCatalog: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<Product>, StoreError>;

    /// Candidates for EXACT/PATTERN matching: products whose name or alias
    /// case-insensitively contains or equals `needle`.
    async fn find_by_name_like(&self, needle: &str) -> Result<Vec<Product>, StoreError>;

    /// Candidates for FUZZY matching via trigram similarity on
    /// `search_vector`, paired with their similarity score.
    async fn find_by_trigram_similarity(
        &self,
        needle: &str,
        limit: usize,
    ) -> Result<Vec<(Product, f64)>, StoreError>;
}

/// Read-only vendor + offer access (§3 Vendor, VendorProduct).
#[async_trait]
pub trait VendorCatalog: Send + Sync {
    async fn get_vendor(&self, id: Uuid) -> Result<Option<Vendor>, StoreError>;

    /// All `(vendor, vendor_product)` pairs offering `product_id`.
    async fn eligible_offers(
        &self,
        product_id: Uuid,
    ) -> Result<Vec<(Vendor, VendorProduct)>, StoreError>;
}

/// Read/write access to [`VendorMetrics`] (§4.D).
#[async_trait]
pub trait VendorMetricsStore: Send + Sync {
    /// Always returns the *stored* value — §9 Open Question pins
    /// `reliability_score` to on-write computation, reads never recompute.
    async fn get_metrics(&self, vendor_id: Uuid) -> Result<VendorMetrics, StoreError>;

    /// Apply a lifecycle event, idempotent on `event_id` (§4.D, §8 idempotence
    /// law). Implementations take a row lock on the vendor's metrics row for
    /// the duration of the update (§4.D "Concurrency").
    async fn apply_event(
        &self,
        event: &crate::domain::VendorLifecycleEvent,
    ) -> Result<VendorMetrics, StoreError>;

    /// Whether `event_id` has already been applied (used by tests and by
    /// implementations that want an explicit pre-check).
    async fn has_applied(&self, event_id: Uuid) -> Result<bool, StoreError>;

    /// Ordered (oldest first) history of composite-score changes for
    /// `vendor_id` (§4.D "History").
    async fn history(&self, vendor_id: Uuid) -> Result<Vec<VendorMetricsHistoryEntry>, StoreError>;

    /// Prunes history rows older than `older_than`, returning the count
    /// removed (§4.D "bounded-retention history table").
    async fn cleanup_history_older_than(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Append-only [`RFQBroadcast`] log (§3, §4.B BROADCAST).
#[async_trait]
pub trait BroadcastLog: Send + Sync {
    /// Existing broadcast rows for `(artifact_id, product_id)`, used by the
    /// BROADCAST stage to avoid re-issuing RFQs on resumption (§4.B
    /// "Partial-broadcast resumption").
    async fn existing_for_item(
        &self,
        artifact_id: Uuid,
        product_id: Uuid,
    ) -> Result<Vec<RFQBroadcast>, StoreError>;

    /// Inserts every row in `rows` within the caller's open transaction, so
    /// the RFQ rows and the outbox notification rows each item's broadcast
    /// writes alongside commit or roll back together — all K rows for an
    /// item and their notifications, or none (§4.B "Broadcast is atomic at
    /// the item level", together with the outbox rows per §4.B BROADCAST's
    /// "within a single serializable transaction together with outbox
    /// rows"). The caller commits; this method never does.
    async fn insert_all(
        &self,
        tx: &mut sqlx::Transaction<'static, sqlx::Postgres>,
        rows: &[RFQBroadcast],
    ) -> Result<(), StoreError>;
}

/// Outcome of a webhook dedupe insertion attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupeOutcome {
    /// First time this `(source, external_id)` has been seen.
    Inserted,
    /// Already registered against `artifact_id` — the caller MUST NOT
    /// create a second `UploadedArtifact` for this message (§4.E).
    Duplicate { artifact_id: Uuid },
}

/// Webhook dedupe guard (§4.E).
#[async_trait]
pub trait WebhookDedupeRepository: Send + Sync {
    /// Atomically records `(source, external_id) -> artifact_id` or reports
    /// the `artifact_id` it was already recorded against.
    async fn try_insert(&self, entry: &WebhookDedupeEntry) -> Result<DedupeOutcome, StoreError>;

    async fn cleanup_older_than(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Single-row global ingestion gate (§5 "Safe-mode gate"). Readers are
/// expected to cache the value for ≤ 5s rather than hit the store on every
/// `ingest` call — see [`crate::worker::SafeModeCache`].
#[async_trait]
pub trait SafeModeGate: Send + Sync {
    async fn is_engaged(&self) -> Result<bool, StoreError>;

    /// Admin operation: flips the single gate row.
    async fn set_engaged(&self, engaged: bool) -> Result<(), StoreError>;
}
