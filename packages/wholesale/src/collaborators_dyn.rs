//! Object-safe adapters over the generic-error collaborator traits
//! (§6), so [`crate::worker`] can hold `Arc<dyn ...>` collaborators instead
//! of threading five generic parameters through every job handler. Errors
//! are erased to `anyhow::Error` at this boundary — exactly the seam §7
//! calls the "substrate-internal" line, since a collaborator transport
//! failure that isn't one of the documented `ErrorKind`s is a bug in the
//! adapter, not a stage outcome.

use async_trait::async_trait;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::collaborators::{
    BlobError, BlobStore, CreditDecision, CreditGate, ExtractionError, ExtractionProvider,
    OcrError, OcrOutput, OcrProvider, Notifier, RawExtractedRecord,
};

/// Outcome of a dynamically-dispatched blob fetch — `NotFound` is kept
/// distinct from other provider errors because it maps to a different
/// [`crate::error::StageError`] variant (hard-fail, not transient).
pub enum DynBlobResult {
    Found(Vec<u8>),
    NotFound,
    Err(anyhow::Error),
}

#[async_trait]
pub trait DynBlobStore: Send + Sync {
    async fn get(&self, blob_ref: &str) -> DynBlobResult;
}

#[async_trait]
impl<T: BlobStore> DynBlobStore for T {
    async fn get(&self, blob_ref: &str) -> DynBlobResult {
        match BlobStore::get(self, blob_ref).await {
            Ok(bytes) => DynBlobResult::Found(bytes),
            Err(BlobError::NotFound(_)) => DynBlobResult::NotFound,
            Err(BlobError::Provider(e)) => DynBlobResult::Err(e.into()),
        }
    }
}

pub enum DynOcrResult {
    Ok(OcrOutput),
    Unreadable,
    Unavailable,
    Err(anyhow::Error),
}

#[async_trait]
pub trait DynOcrProvider: Send + Sync {
    async fn extract_text(&self, bytes: &[u8]) -> DynOcrResult;
}

#[async_trait]
impl<T: OcrProvider> DynOcrProvider for T {
    async fn extract_text(&self, bytes: &[u8]) -> DynOcrResult {
        match OcrProvider::extract_text(self, bytes).await {
            Ok(output) => DynOcrResult::Ok(output),
            Err(OcrError::UnreadableImage) => DynOcrResult::Unreadable,
            Err(OcrError::ProviderUnavailable) => DynOcrResult::Unavailable,
            Err(OcrError::Provider(e)) => DynOcrResult::Err(e.into()),
        }
    }
}

pub enum DynExtractionResult {
    Ok(Vec<RawExtractedRecord>),
    Malformed,
    Unavailable,
    Err(anyhow::Error),
}

#[async_trait]
pub trait DynExtractionProvider: Send + Sync {
    async fn extract_items(&self, text: &str) -> DynExtractionResult;
}

#[async_trait]
impl<T: ExtractionProvider> DynExtractionProvider for T {
    async fn extract_items(&self, text: &str) -> DynExtractionResult {
        match ExtractionProvider::extract_items(self, text).await {
            Ok(records) => DynExtractionResult::Ok(records),
            Err(ExtractionError::MalformedStructuredOutput) => DynExtractionResult::Malformed,
            Err(ExtractionError::ProviderUnavailable) => DynExtractionResult::Unavailable,
            Err(ExtractionError::Provider(e)) => DynExtractionResult::Err(e.into()),
        }
    }
}

#[async_trait]
pub trait DynNotifier: Send + Sync {
    async fn send(&self, target: &str, payload: &serde_json::Value) -> anyhow::Result<()>;
}

#[async_trait]
impl<T: Notifier> DynNotifier for T {
    async fn send(&self, target: &str, payload: &serde_json::Value) -> anyhow::Result<()> {
        Notifier::send(self, target, payload)
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))
    }
}

#[async_trait]
pub trait DynCreditGate: Send + Sync {
    async fn check_and_reserve(&self, retailer_id: Uuid, amount: Decimal) -> anyhow::Result<CreditDecision>;
}

#[async_trait]
impl<T: CreditGate> DynCreditGate for T {
    async fn check_and_reserve(&self, retailer_id: Uuid, amount: Decimal) -> anyhow::Result<CreditDecision> {
        CreditGate::check_and_reserve(self, retailer_id, amount)
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))
    }
}
