//! Entity types for the wholesale order-processing core (§3).
//!
//! These are plain data structs; persistence lives in [`crate::repository`].

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Monotonically advancing status of an [`UploadedArtifact`].
///
/// Advances RECEIVED → OCR_DONE → EXTRACTED → NORMALIZED → BROADCAST →
/// COMPLETED, with PENDING_REVIEW and FAILED reachable from any stage and
/// terminal except for an operator-triggered retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactStatus {
    Received,
    OcrDone,
    Extracted,
    Normalized,
    Broadcast,
    Completed,
    PendingReview,
    Failed,
}

impl ArtifactStatus {
    /// Terminal statuses only change again via an explicit operator retry.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::PendingReview | Self::Failed)
    }
}

/// A single line item as returned by the extraction collaborator, after
/// cleaning (§4.B "Cleaning rules").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedItem {
    pub raw_name: String,
    /// Canonical quantity, already unit-converted (e.g. 500 g -> 0.5 kg).
    pub quantity: Decimal,
    pub unit: Option<CanonicalUnit>,
    pub confidence: f64,
}

/// How a [`NormalizedItem`] was matched to the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MatchKind {
    Exact,
    Pattern,
    Fuzzy,
    None,
}

/// An [`ExtractedItem`] after catalog normalization (§4.B NORMALIZE).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedItem {
    pub extracted: ExtractedItem,
    pub product_id: Option<Uuid>,
    pub match_kind: MatchKind,
    pub match_confidence: f64,
    pub needs_review: bool,
}

/// Fixed unit vocabulary produced by the unit alias map (GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CanonicalUnit {
    Kg,
    G,
    L,
    Ml,
    Piece,
    Packet,
    Dozen,
    Bottle,
    Box,
}

/// Read-only catalog entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: Uuid,
    pub canonical_name: String,
    pub aliases: Vec<String>,
    pub unit: Option<CanonicalUnit>,
    pub category: String,
    /// Precomputed lower-cased + folded form used for trigram similarity.
    pub search_vector: String,
}

/// Read-only vendor entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vendor {
    pub id: Uuid,
    pub active: bool,
    pub working_hours: Option<WorkingHours>,
    pub service_radius_km: Option<f64>,
    pub location: Option<(f64, f64)>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WorkingHours {
    pub start_minute_of_day: u16,
    pub end_minute_of_day: u16,
}

impl WorkingHours {
    pub fn contains(&self, minute_of_day: u16) -> bool {
        if self.start_minute_of_day <= self.end_minute_of_day {
            (self.start_minute_of_day..self.end_minute_of_day).contains(&minute_of_day)
        } else {
            // wraps past midnight
            minute_of_day >= self.start_minute_of_day || minute_of_day < self.end_minute_of_day
        }
    }
}

/// Read-only `(vendor_id, product_id)` offer row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorProduct {
    pub vendor_id: Uuid,
    pub product_id: Uuid,
    pub price: Decimal,
    pub stock: Decimal,
    pub available: bool,
    pub last_restocked_at: Option<DateTime<Utc>>,
}

/// Derived, write-maintained vendor reputation row (§4.D).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorMetrics {
    pub vendor_id: Uuid,
    pub reliability_score: f64,
    pub acceptance_rate: f64,
    pub delivery_success_rate: f64,
    pub avg_response_time_seconds: f64,
    pub cancellation_rate: f64,
    /// `None` until a lifecycle event carrying product/price context has been
    /// applied (§4.D price-percentile term: "0 if unknown" — a real absence,
    /// not a `0.0` reading, since 0.0 is also the cheapest-possible reading).
    pub price_vs_market_percent: Option<f64>,
    pub samples_n: u64,
    pub last_updated: DateTime<Utc>,

    // Raw counters the rates above are derived from (§4.D "Update rules").
    pub assigned_n: u64,
    pub responded_n: u64,
    pub accepted_n: u64,
    pub delivered_n: u64,
    pub delivered_ok_n: u64,
    pub cancelled_by_vendor_n: u64,
    pub response_time_sum_seconds: f64,
}

impl VendorMetrics {
    /// A freshly-seeded row for a vendor with zero observed events; every
    /// component defaults to its neutral prior (§3 VendorMetrics invariant).
    pub fn seed(vendor_id: Uuid) -> Self {
        Self {
            vendor_id,
            reliability_score: 75.0,
            acceptance_rate: 0.0,
            delivery_success_rate: 0.0,
            avg_response_time_seconds: 0.0,
            cancellation_rate: 0.0,
            price_vs_market_percent: None,
            samples_n: 0,
            last_updated: Utc::now(),
            assigned_n: 0,
            responded_n: 0,
            accepted_n: 0,
            delivered_n: 0,
            delivered_ok_n: 0,
            cancelled_by_vendor_n: 0,
            response_time_sum_seconds: 0.0,
        }
    }
}

/// One row of a vendor's `reliability_score` history (§4.D "History").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorMetricsHistoryEntry {
    pub vendor_id: Uuid,
    pub at: DateTime<Utc>,
    pub reliability_score: f64,
    pub acceptance_rate: f64,
    pub delivery_success_rate: f64,
    pub avg_response_time_seconds: f64,
    pub cancellation_rate: f64,
    pub samples_n: u64,
}

impl VendorMetricsHistoryEntry {
    pub fn snapshot(metrics: &VendorMetrics) -> Self {
        Self {
            vendor_id: metrics.vendor_id,
            at: metrics.last_updated,
            reliability_score: metrics.reliability_score,
            acceptance_rate: metrics.acceptance_rate,
            delivery_success_rate: metrics.delivery_success_rate,
            avg_response_time_seconds: metrics.avg_response_time_seconds,
            cancellation_rate: metrics.cancellation_rate,
            samples_n: metrics.samples_n,
        }
    }
}

/// Status of an [`RFQBroadcast`] row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BroadcastStatus {
    Sent,
    Responded,
    Accepted,
    Rejected,
    Expired,
}

/// Append-only broadcast decision row (§3 RFQBroadcast).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RFQBroadcast {
    pub id: Uuid,
    pub uploaded_artifact_id: Uuid,
    pub retailer_id: Uuid,
    pub product_id: Uuid,
    pub vendor_id: Uuid,
    pub requested_qty: Decimal,
    pub unit: Option<CanonicalUnit>,
    pub status: BroadcastStatus,
    pub vendor_rank: u32,
    pub score_snapshot: f64,
    pub created_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
}

/// A durable record of one ingestion attempt (§3 UploadedArtifact).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadedArtifact {
    pub id: Uuid,
    pub retailer_id: Uuid,
    pub blob_ref: String,
    pub status: ArtifactStatus,
    pub raw_text: Option<String>,
    pub extracted_items: Vec<ExtractedItem>,
    pub normalized_items: Vec<NormalizedItem>,
    pub last_error: Option<String>,
    pub attempt_counts: AttemptCounts,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-stage attempt counter, keyed by the stage name (§3 `attempt_counts`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttemptCounts {
    pub ocr: i32,
    pub extract: i32,
    pub normalize: i32,
    pub broadcast: i32,
    pub finalize: i32,
}

impl UploadedArtifact {
    pub fn new(retailer_id: Uuid, blob_ref: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            retailer_id,
            blob_ref,
            status: ArtifactStatus::Received,
            raw_text: None,
            extracted_items: Vec::new(),
            normalized_items: Vec::new(),
            last_error: None,
            attempt_counts: AttemptCounts::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Severity of a [`ProcessingLogEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// One append-only row in an artifact's processing log (§3, §4.E).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingLogEntry {
    pub artifact_id: Uuid,
    pub seq: i64,
    pub stage: String,
    pub level: LogLevel,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub at: DateTime<Utc>,
}

/// Dedupe guard against re-ingesting the same inbound webhook (§4.E).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDedupeEntry {
    pub source: String,
    pub external_id: String,
    pub artifact_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// The four order-lifecycle events §4.D feeds into the metrics store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum VendorLifecycleEvent {
    Assigned {
        event_id: Uuid,
        vendor_id: Uuid,
        order_id: Uuid,
        at: DateTime<Utc>,
    },
    Responded {
        event_id: Uuid,
        vendor_id: Uuid,
        order_id: Uuid,
        at: DateTime<Utc>,
        response: VendorResponse,
    },
    Delivered {
        event_id: Uuid,
        vendor_id: Uuid,
        order_id: Uuid,
        at: DateTime<Utc>,
        success: bool,
    },
    Cancelled {
        event_id: Uuid,
        vendor_id: Uuid,
        order_id: Uuid,
        at: DateTime<Utc>,
        by_vendor: bool,
    },
}

impl VendorLifecycleEvent {
    pub fn event_id(&self) -> Uuid {
        match self {
            Self::Assigned { event_id, .. }
            | Self::Responded { event_id, .. }
            | Self::Delivered { event_id, .. }
            | Self::Cancelled { event_id, .. } => *event_id,
        }
    }

    pub fn vendor_id(&self) -> Uuid {
        match self {
            Self::Assigned { vendor_id, .. }
            | Self::Responded { vendor_id, .. }
            | Self::Delivered { vendor_id, .. }
            | Self::Cancelled { vendor_id, .. } => *vendor_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VendorResponse {
    Accept,
    Reject,
}
