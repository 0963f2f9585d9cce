//! Error taxonomy for the ingestion pipeline (§7).
//!
//! Mirrors `relay`'s Error Boundary Rule: no bare `anyhow::Error` crosses
//! from a stage handler into the worker loop. Every stage handler returns
//! `Result<StageOutcome, StageError>`; the worker loop matches each variant
//! against the queue-level action §7 prescribes instead of string-sniffing
//! a message.

use std::borrow::Cow;

use relay::{Categorizable, SafeErrorCategory};
use thiserror::Error;

/// Failure kind for errors that should be retried with backoff (§7 *Transient*).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    OcrProviderUnavailable,
    ExtractionProviderUnavailable,
    StorageContention,
    LockContention,
    /// The provider's token bucket is empty (§5 "per-provider rate
    /// limits"); retried through the ordinary backoff path like any other
    /// transient failure, not a dedicated delay channel.
    RateLimited,
}

/// Failure kind for errors that park the artifact in FAILED (§7 *Stage-hard*).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardFailKind {
    BlobNotFound,
    UnreadableImage,
    MalformedStoredState,
    BudgetExhausted,
}

/// The four-way split §9 "Exceptions as control flow" demands every stage
/// handler return instead of throwing.
#[derive(Debug, Error)]
pub enum StageError {
    /// Retry with backoff; the job is re-enqueued, `attempt` unchanged by us
    /// (the queue substrate owns the counter).
    #[error("transient failure: {kind:?}: {detail}")]
    Transient { kind: TransientKind, detail: String },

    /// Advance the artifact to PENDING_REVIEW; modeled as a *successful*
    /// job completion from the queue's perspective (§7 "Propagation policy").
    #[error("stage-soft failure: {reason}")]
    StageSoft { reason: String },

    /// Advance the artifact to FAILED; terminal until an operator retries.
    #[error("stage-hard failure: {kind:?}: {detail}")]
    StageHard { kind: HardFailKind, detail: String },

    /// A single record violated the extraction contract after cleaning;
    /// the record is dropped, the artifact is otherwise unaffected (§7
    /// *Contract violation* is scoped to the offending record, not the
    /// artifact).
    #[error("contract violation, record dropped: {detail}")]
    ContractViolation { detail: String },

    /// Storage outage inside the substrate itself; fails loudly, no silent
    /// drops (§7 *Substrate-internal*).
    #[error(transparent)]
    Substrate(#[from] anyhow::Error),
}

impl Categorizable for StageError {
    fn category(&self) -> SafeErrorCategory {
        match self {
            StageError::Transient { .. } => SafeErrorCategory::ExternalService,
            StageError::StageSoft { .. } => SafeErrorCategory::Validation,
            StageError::StageHard { .. } => SafeErrorCategory::Validation,
            StageError::ContractViolation { .. } => SafeErrorCategory::Validation,
            StageError::Substrate(_) => SafeErrorCategory::InternalError,
        }
    }

    fn safe_message(&self) -> Cow<'static, str> {
        match self {
            StageError::StageSoft { reason } => reason.clone().into(),
            StageError::StageHard { kind, .. } => format!("{kind:?}").into(),
            StageError::ContractViolation { .. } => "record dropped: contract violation".into(),
            _ => "An internal error occurred".into(),
        }
    }
}

/// Errors surfaced by repository implementations (§3 persisted state).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unsupported schema version {version} for {entity}")]
    UnsupportedVersion { entity: &'static str, version: i32 },

    #[error("optimistic concurrency check failed: {entity} {id} was updated concurrently")]
    StaleWrite { entity: &'static str, id: String },

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}
