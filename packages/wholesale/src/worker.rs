//! Orchestration for the ingestion pipeline (§4.B) on top of `relay`'s job
//! queue and outbox (§4.A, §4.E).
//!
//! Background processing maps to an explicit `enqueue(next_stage)` call;
//! there is no in-memory chain from one stage straight into the next. Each stage is a
//! job on the `ingestion` queue; a stage handler persists its work product,
//! then enqueues the next stage's job. A crash between those two writes is
//! recovered by re-running the stage, which short-circuits once it sees the
//! artifact has already advanced (§4.B "Resumption").

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Timelike, Utc};
use relay::job::{FailureKind, JobStore};
use relay::pg_queue::{EnqueueOptions, PgJobStore};
use relay::pg_outbox::{write_outbox_row, PgOutboxReader};
use relay::outbox::{CorrelationId, OutboxPublisherConfig, OutboxReader};
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::{Mutex, Semaphore};
use uuid::Uuid;

use crate::collaborators::CreditDecision;
use crate::collaborators_dyn::{
    DynBlobResult, DynBlobStore, DynCreditGate, DynExtractionProvider, DynExtractionResult,
    DynNotifier, DynOcrProvider, DynOcrResult,
};
use crate::config::Config;
use crate::domain::{
    ArtifactStatus, BroadcastStatus, ExtractedItem, LogLevel, NormalizedItem, ProcessingLogEntry,
    RFQBroadcast, UploadedArtifact, VendorLifecycleEvent, VendorMetrics, WebhookDedupeEntry,
};
use crate::error::{HardFailKind, StageError, TransientKind};
use crate::ingestion::cleaning::{clean_record, merge_duplicates};
use crate::ingestion::stage::{
    check_extract_input, decide_after_broadcast, decide_after_extract, decide_after_finalize,
    decide_after_normalize, normalize_item, StageOutcome,
};
use crate::repository::{
    ArtifactRepository, BroadcastLog, DedupeOutcome, ProductCatalog, SafeModeGate,
    VendorCatalog, VendorMetricsStore, WebhookDedupeRepository,
};
use crate::selector::{select_top_k, Candidate};

pub const INGESTION_QUEUE: &str = "ingestion";
pub const DEFERRED_QUEUE: &str = "deferred";
pub const OUTBOX_RELAY_QUEUE: &str = "outbox-relay";
pub const MAINTENANCE_QUEUE: &str = "maintenance";
pub const VENDOR_EVENTS_QUEUE: &str = "vendor-events";

const JOB_DEFERRED_ENTRY: &str = "ingestion:deferred_entry";

/// TTL-cached read of the [`SafeModeGate`] row (§5 "readers cache it for
/// ≤ 5s"). A process-wide mutable variable won't do here — DESIGN.md's
/// "global flags and singletons" note maps this to a polled table row
/// instead, so every process sees the same state within the TTL window.
pub struct SafeModeCache {
    gate: Arc<dyn SafeModeGate>,
    ttl: Duration,
    cached: Mutex<Option<(bool, Instant)>>,
}

impl SafeModeCache {
    pub fn new(gate: Arc<dyn SafeModeGate>) -> Self {
        Self {
            gate,
            ttl: Duration::from_secs(5),
            cached: Mutex::new(None),
        }
    }

    pub async fn is_engaged(&self) -> anyhow::Result<bool> {
        let mut cached = self.cached.lock().await;
        if let Some((engaged, at)) = *cached {
            if at.elapsed() < self.ttl {
                return Ok(engaged);
            }
        }
        let engaged = self.gate.is_engaged().await?;
        *cached = Some((engaged, Instant::now()));
        Ok(engaged)
    }
}

const JOB_OCR: &str = "ingestion:ocr";
const JOB_EXTRACT: &str = "ingestion:extract";
const JOB_NORMALIZE: &str = "ingestion:normalize";
const JOB_BROADCAST: &str = "ingestion:broadcast";
const JOB_FINALIZE: &str = "ingestion:finalize";
const JOB_VENDOR_EVENT: &str = "vendor:lifecycle_event";

/// Payload shared by every ingestion-queue job: the only thing a stage
/// needs to resume is the artifact id (§4.B "each stage only advances
/// `status` once its output is durably written").
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StageJob {
    pub artifact_id: Uuid,
}

/// Collaborators + repositories the worker needs, collected behind `Arc` so
/// a single `Deps` can be shared across however many concurrent stage
/// executions a queue's `concurrency` slot pool allows.
pub struct Deps {
    pub pool: PgPool,
    pub jobs: Arc<PgJobStore>,
    pub artifacts: Arc<dyn ArtifactRepository>,
    pub catalog: Arc<dyn ProductCatalog>,
    pub vendors: Arc<dyn VendorCatalog>,
    pub vendor_metrics: Arc<dyn VendorMetricsStore>,
    pub broadcasts: Arc<dyn BroadcastLog>,
    pub blob_store: Arc<dyn crate::collaborators_dyn::DynBlobStore>,
    pub ocr: Arc<dyn crate::collaborators_dyn::DynOcrProvider>,
    pub extractor: Arc<dyn crate::collaborators_dyn::DynExtractionProvider>,
    pub notifier: Arc<dyn DynNotifier>,
    pub credit: Option<Arc<dyn DynCreditGate>>,
    pub webhook_dedupe: Arc<dyn WebhookDedupeRepository>,
    pub safe_mode: Arc<SafeModeCache>,
    pub rate_limiters: Arc<crate::ratelimit::RateLimiters>,
    pub config: Config,
}

/// The ingestion worker: polls `ingestion`, dispatches each job to its
/// stage handler, and owns the reaper sweep (§4.A `reaper`).
///
/// Holds no state beyond the shared `Arc<Deps>`, so each polling loop can
/// cheaply clone its own handle rather than share one across tasks.
#[derive(Clone)]
pub struct IngestionWorker {
    deps: Arc<Deps>,
}

impl IngestionWorker {
    pub fn new(deps: Arc<Deps>) -> Self {
        Self { deps }
    }

    /// Create the artifact (RECEIVED) and enqueue the first stage (§6
    /// "Inbound to the core" `ingest`).
    ///
    /// `source_message_id` dedupes via [`WebhookDedupeRepository`]: a
    /// second delivery of the same external message returns the
    /// already-created artifact id rather than creating a second
    /// `UploadedArtifact` (§4.E "Webhook dedupe"). The dedupe row is
    /// written *before* the artifact, so a duplicate never produces a
    /// throwaway artifact row.
    ///
    /// If the safe-mode gate is engaged (§5), the artifact is still
    /// created but its first stage job is parked on [`DEFERRED_QUEUE`]
    /// instead of [`INGESTION_QUEUE`]; [`Self::resume_deferred_once`]
    /// drains that queue once the gate clears.
    pub async fn ingest(
        &self,
        retailer_id: Uuid,
        blob_ref: String,
        source_message_id: Option<(String, String)>,
    ) -> anyhow::Result<Uuid> {
        let artifact = UploadedArtifact::new(retailer_id, blob_ref);
        let id = artifact.id;

        if let Some((source, external_id)) = source_message_id {
            let entry = WebhookDedupeEntry {
                source,
                external_id,
                artifact_id: id,
                created_at: Utc::now(),
            };
            match self.deps.webhook_dedupe.try_insert(&entry).await? {
                DedupeOutcome::Duplicate { artifact_id } => return Ok(artifact_id),
                DedupeOutcome::Inserted => {}
            }
        }

        self.deps.artifacts.insert(&artifact).await?;

        if self.deps.safe_mode.is_engaged().await? {
            self.enqueue_deferred(id).await?;
        } else {
            self.enqueue_stage(JOB_OCR, id, None).await?;
        }
        Ok(id)
    }

    async fn enqueue_deferred(&self, artifact_id: Uuid) -> anyhow::Result<Uuid> {
        let payload = serde_json::to_value(StageJob { artifact_id })?;
        self.deps
            .jobs
            .enqueue(
                DEFERRED_QUEUE,
                JOB_DEFERRED_ENTRY,
                payload,
                EnqueueOptions {
                    idempotency_key: Some(format!("{artifact_id}:deferred")),
                    delay: None,
                    max_attempts: Some(1),
                    priority: None,
                },
            )
            .await
    }

    /// Drains [`DEFERRED_QUEUE`] while the safe-mode gate is clear,
    /// re-enqueueing each parked artifact's OCR stage onto
    /// [`INGESTION_QUEUE`] (§5 "the substrate resumes when the flag
    /// clears"). A no-op while the gate stays engaged.
    pub async fn resume_deferred_once(&self, worker_id: &str) -> anyhow::Result<usize> {
        if self.deps.safe_mode.is_engaged().await? {
            return Ok(0);
        }

        let mut resumed = 0usize;
        while let Some(job) = self
            .deps
            .jobs
            .claim_next(DEFERRED_QUEUE, worker_id, Duration::from_secs(30))
            .await?
        {
            let payload: StageJob = serde_json::from_value(job.payload.clone())?;
            self.enqueue_stage(JOB_OCR, payload.artifact_id, None).await?;
            self.deps.jobs.mark_succeeded(job.id).await?;
            resumed += 1;
        }
        Ok(resumed)
    }

    async fn enqueue_stage(
        &self,
        job_type: &str,
        artifact_id: Uuid,
        delay: Option<Duration>,
    ) -> anyhow::Result<Uuid> {
        let payload = serde_json::to_value(StageJob { artifact_id })?;
        // Idempotency key scoped to (artifact, stage): re-running a stage
        // handler after a crash re-issues the same enqueue, which is a
        // no-op against any still-pending job for that stage (§4.A
        // `enqueue` idempotency contract).
        let key = format!("{artifact_id}:{job_type}");
        self.deps
            .jobs
            .enqueue(
                INGESTION_QUEUE,
                job_type,
                payload,
                EnqueueOptions {
                    idempotency_key: Some(key),
                    delay,
                    max_attempts: Some(self.deps.config.ingestion_queue.max_attempts),
                    priority: None,
                },
            )
            .await
    }

    /// One polling iteration: claim up to `concurrency` jobs and run them
    /// concurrently, bounded by a semaphore (§4.A "concurrency model").
    pub async fn poll_once(&self, worker_id: &str) -> anyhow::Result<usize> {
        let semaphore = Arc::new(Semaphore::new(self.deps.config.ingestion_queue.concurrency));
        let mut claimed = 0usize;

        loop {
            let permit = match semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let job = self
                .deps
                .jobs
                .claim_next(
                    INGESTION_QUEUE,
                    worker_id,
                    self.deps.config.ingestion_queue.job_timeout,
                )
                .await?;

            let Some(job) = job else {
                drop(permit);
                break;
            };
            claimed += 1;

            let deps = self.deps.clone();
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(err) = execute_stage_job(&deps, &job).await {
                    tracing::error!(job_id = %job.id, error = %err, "stage job execution failed");
                }
            });
        }

        Ok(claimed)
    }

    /// Background sweep recovering jobs whose lease expired (§4.A `reaper`).
    pub async fn reap(&self) -> anyhow::Result<u64> {
        self.deps.jobs.reap_expired(Utc::now()).await
    }

    /// Entry point for an inbound order-lifecycle webhook (§4.D): the event
    /// itself is the job payload, durably queued on its own lane so a
    /// metrics-store outage retries the event rather than dropping it.
    /// `event_id` is the idempotency key, matching the store's own
    /// per-`event_id` dedupe (§8 idempotence law) one layer further out.
    pub async fn record_vendor_event(&self, event: VendorLifecycleEvent) -> anyhow::Result<Uuid> {
        let payload = serde_json::to_value(&event)?;
        self.deps
            .jobs
            .enqueue(
                VENDOR_EVENTS_QUEUE,
                JOB_VENDOR_EVENT,
                payload,
                EnqueueOptions {
                    idempotency_key: Some(event.event_id().to_string()),
                    delay: None,
                    max_attempts: Some(self.deps.config.ingestion_queue.max_attempts),
                    priority: None,
                },
            )
            .await
    }

    /// One polling iteration over [`VENDOR_EVENTS_QUEUE`] (§4.D).
    pub async fn poll_vendor_events_once(&self, worker_id: &str) -> anyhow::Result<usize> {
        let mut claimed = 0usize;
        while let Some(job) = self
            .deps
            .jobs
            .claim_next(
                VENDOR_EVENTS_QUEUE,
                worker_id,
                self.deps.config.ingestion_queue.job_timeout,
            )
            .await?
        {
            claimed += 1;
            if let Err(err) = execute_vendor_event_job(&self.deps, &job).await {
                tracing::error!(job_id = %job.id, error = %err, "vendor lifecycle event job failed");
            }
        }
        Ok(claimed)
    }
}

/// Applies one [`VendorLifecycleEvent`] to the vendor metrics store. The
/// store itself is the source of idempotency truth (`apply_event` is
/// documented idempotent on `event_id`) — this handler just maps storage
/// failures onto the job's retry budget.
async fn execute_vendor_event_job(deps: &Deps, job: &relay::job::ClaimedJob) -> anyhow::Result<()> {
    let event: VendorLifecycleEvent = serde_json::from_value(job.payload.clone())?;

    match deps.vendor_metrics.apply_event(&event).await {
        Ok(VendorMetrics { vendor_id, reliability_score, .. }) => {
            tracing::event!(
                target: "wholesale::metrics",
                tracing::Level::INFO,
                vendor_id = %vendor_id,
                event_id = %event.event_id(),
                reliability_score,
                "applied vendor lifecycle event",
            );
            deps.jobs.mark_succeeded(job.id).await?;
        }
        Err(err) => {
            tracing::warn!(event_id = %event.event_id(), error = %err, "failed to apply vendor lifecycle event");
            deps.jobs
                .mark_failed(job.id, &err.to_string(), FailureKind::Retryable)
                .await?;
        }
    }
    Ok(())
}

async fn execute_stage_job(deps: &Deps, job: &relay::job::ClaimedJob) -> anyhow::Result<()> {
    let payload: StageJob = serde_json::from_value(job.payload.clone())?;
    let artifact_id = payload.artifact_id;

    let Some(mut artifact) = deps.artifacts.get(artifact_id).await? else {
        // Artifact vanished (should never happen — never deleted per §3);
        // this is a contract violation of our own storage, dead-letter it.
        deps.jobs
            .mark_failed(job.id, "artifact not found", FailureKind::NonRetryable)
            .await?;
        return Ok(());
    };
    let expected_updated_at = artifact.updated_at;

    let stage_name = job.job_type.as_str();
    let outcome = run_stage(deps, stage_name, &mut artifact, job.attempt).await;

    match outcome {
        Ok(StageOutcome::Advanced(next_status)) => {
            artifact.status = next_status;
            artifact.updated_at = Utc::now();
            deps.artifacts
                .compare_and_update(&artifact, expected_updated_at)
                .await?;
            log_transition(deps, artifact_id, stage_name, LogLevel::Info, "advanced").await;

            if let Some(next_job) = next_job_type(stage_name, next_status) {
                enqueue_next(deps, next_job, artifact_id).await?;
            }
            deps.jobs.mark_succeeded(job.id).await?;
        }
        Err(StageError::StageSoft { reason }) => {
            // Stage-soft outcomes are successful job completions that
            // advance the artifact to PENDING_REVIEW (§7 "Propagation
            // policy") — not a queue-level failure.
            artifact.status = ArtifactStatus::PendingReview;
            artifact.last_error = Some(reason.clone());
            artifact.updated_at = Utc::now();
            deps.artifacts
                .compare_and_update(&artifact, expected_updated_at)
                .await?;
            log_transition(deps, artifact_id, stage_name, LogLevel::Warn, &reason).await;
            deps.jobs.mark_succeeded(job.id).await?;
        }
        Err(StageError::StageHard { kind, detail }) => {
            artifact.status = ArtifactStatus::Failed;
            artifact.last_error = Some(format!("{kind:?}: {detail}"));
            artifact.updated_at = Utc::now();
            deps.artifacts
                .compare_and_update(&artifact, expected_updated_at)
                .await?;
            log_transition(deps, artifact_id, stage_name, LogLevel::Error, &detail).await;
            deps.jobs
                .mark_failed(job.id, &detail, FailureKind::NonRetryable)
                .await?;
        }
        Err(StageError::Transient { kind, detail }) => {
            let last_attempt = job.attempt >= job.max_attempts;
            log_transition(
                deps,
                artifact_id,
                stage_name,
                LogLevel::Warn,
                &format!("transient {kind:?}: {detail}"),
            )
            .await;

            if last_attempt {
                // §4.B "budget exhausted after MAX_ATTEMPTS of a transient
                // class -> FAILED" — the job's own retry budget is spent.
                artifact.status = ArtifactStatus::Failed;
                artifact.last_error = Some(format!("budget exhausted: {detail}"));
            } else {
                artifact.last_error = Some(detail.clone());
            }
            artifact.updated_at = Utc::now();
            deps.artifacts
                .compare_and_update(&artifact, expected_updated_at)
                .await?;

            deps.jobs
                .mark_failed(job.id, &detail, FailureKind::Retryable)
                .await?;
        }
        Err(StageError::ContractViolation { detail }) => {
            // Scoped to the offending record, not the artifact (§7); a
            // stage should never surface this at the top level — treat it
            // defensively as a logged no-op retry.
            log_transition(deps, artifact_id, stage_name, LogLevel::Warn, &detail).await;
            deps.jobs
                .mark_failed(job.id, &detail, FailureKind::Retryable)
                .await?;
        }
        Err(StageError::Substrate(err)) => {
            // Storage outage inside the substrate itself — fails loudly,
            // no silent drops (§7 "Substrate-internal").
            tracing::error!(artifact_id = %artifact_id, error = %err, "substrate error in stage handler");
            deps.jobs
                .mark_failed(job.id, &err.to_string(), FailureKind::Retryable)
                .await?;
        }
    }

    Ok(())
}

async fn enqueue_next(deps: &Deps, job_type: &'static str, artifact_id: Uuid) -> anyhow::Result<()> {
    let payload = serde_json::to_value(StageJob { artifact_id })?;
    let key = format!("{artifact_id}:{job_type}");
    deps.jobs
        .enqueue(
            INGESTION_QUEUE,
            job_type,
            payload,
            EnqueueOptions {
                idempotency_key: Some(key),
                delay: None,
                max_attempts: Some(deps.config.ingestion_queue.max_attempts),
                priority: None,
            },
        )
        .await?;
    Ok(())
}

fn next_job_type(current: &str, next_status: ArtifactStatus) -> Option<&'static str> {
    if next_status.is_terminal() {
        return None;
    }
    match current {
        JOB_OCR => Some(JOB_EXTRACT),
        JOB_EXTRACT => Some(JOB_NORMALIZE),
        JOB_NORMALIZE => Some(JOB_BROADCAST),
        JOB_BROADCAST => Some(JOB_FINALIZE),
        _ => None,
    }
}

async fn log_transition(deps: &Deps, artifact_id: Uuid, stage: &str, level: LogLevel, message: &str) {
    let level_name = match level {
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    };
    tracing::event!(
        target: "wholesale::ingestion",
        tracing::Level::INFO,
        artifact_id = %artifact_id,
        stage,
        level = level_name,
        message,
    );
    let entry = ProcessingLogEntry {
        artifact_id,
        seq: 0, // assigned by the repository at append time
        stage: stage.to_string(),
        level,
        message: message.to_string(),
        details: None,
        at: Utc::now(),
    };
    if let Err(err) = deps.artifacts.append_log(&entry).await {
        tracing::warn!(artifact_id = %artifact_id, error = %err, "failed to append processing log entry");
    }
}

async fn run_stage(
    deps: &Deps,
    stage_name: &str,
    artifact: &mut UploadedArtifact,
    attempt: i32,
) -> Result<StageOutcome, StageError> {
    match stage_name {
        JOB_OCR => {
            artifact.attempt_counts.ocr = attempt;
            run_ocr(deps, artifact).await
        }
        JOB_EXTRACT => {
            artifact.attempt_counts.extract = attempt;
            run_extract(deps, artifact).await
        }
        JOB_NORMALIZE => {
            artifact.attempt_counts.normalize = attempt;
            run_normalize(deps, artifact).await
        }
        JOB_BROADCAST => {
            artifact.attempt_counts.broadcast = attempt;
            run_broadcast(deps, artifact).await
        }
        JOB_FINALIZE => {
            artifact.attempt_counts.finalize = attempt;
            run_finalize(deps, artifact).await
        }
        other => Err(StageError::Substrate(anyhow::anyhow!(
            "unknown ingestion job type: {other}"
        ))),
    }
}

/// §4.B stage 1: OCR. Short-circuits if the artifact already moved past
/// RECEIVED (resumption after a crash).
async fn run_ocr(deps: &Deps, artifact: &mut UploadedArtifact) -> Result<StageOutcome, StageError> {
    if artifact.status != ArtifactStatus::Received {
        return Ok(StageOutcome::Advanced(artifact.status));
    }

    if !deps.rate_limiters.ocr.try_acquire() {
        return Err(StageError::Transient {
            kind: TransientKind::RateLimited,
            detail: "OCR provider rate limit exhausted".into(),
        });
    }

    match deps.blob_store.get(&artifact.blob_ref).await {
        DynBlobResult::NotFound => Err(StageError::StageHard {
            kind: HardFailKind::BlobNotFound,
            detail: format!("blob_ref {} not found", artifact.blob_ref),
        }),
        DynBlobResult::Err(err) => Err(StageError::Transient {
            kind: TransientKind::OcrProviderUnavailable,
            detail: err.to_string(),
        }),
        DynBlobResult::Found(bytes) => match deps.ocr.extract_text(&bytes).await {
            crate::collaborators_dyn::DynOcrResult::Ok(output) => {
                artifact.raw_text = Some(output.text);
                Ok(StageOutcome::Advanced(ArtifactStatus::OcrDone))
            }
            crate::collaborators_dyn::DynOcrResult::Unreadable => Err(StageError::StageHard {
                kind: HardFailKind::UnreadableImage,
                detail: "OCR provider reported an unreadable image".into(),
            }),
            crate::collaborators_dyn::DynOcrResult::Unavailable => Err(StageError::Transient {
                kind: TransientKind::OcrProviderUnavailable,
                detail: "OCR provider unavailable".into(),
            }),
            crate::collaborators_dyn::DynOcrResult::Err(err) => Err(StageError::Transient {
                kind: TransientKind::OcrProviderUnavailable,
                detail: err.to_string(),
            }),
        },
    }
}

/// §4.B stage 2: EXTRACT + cleaning. Contract-violating records are dropped
/// individually (§7 "Contract violation" is scoped to the record), not
/// propagated as a stage failure.
async fn run_extract(deps: &Deps, artifact: &mut UploadedArtifact) -> Result<StageOutcome, StageError> {
    if artifact.status != ArtifactStatus::OcrDone {
        return Ok(StageOutcome::Advanced(artifact.status));
    }

    let raw_text = artifact.raw_text.clone().unwrap_or_default();
    check_extract_input(&raw_text)?;

    if !deps.rate_limiters.extraction.try_acquire() {
        return Err(StageError::Transient {
            kind: TransientKind::RateLimited,
            detail: "extraction provider rate limit exhausted".into(),
        });
    }

    let records = match deps.extractor.extract_items(&raw_text).await {
        DynExtractionResult::Ok(records) => records,
        DynExtractionResult::Malformed => {
            return Err(StageError::Transient {
                kind: TransientKind::ExtractionProviderUnavailable,
                detail: "extractor returned malformed structured output".into(),
            })
        }
        DynExtractionResult::Unavailable => {
            return Err(StageError::Transient {
                kind: TransientKind::ExtractionProviderUnavailable,
                detail: "extraction provider unavailable".into(),
            })
        }
        DynExtractionResult::Err(err) => {
            return Err(StageError::Transient {
                kind: TransientKind::ExtractionProviderUnavailable,
                detail: err.to_string(),
            })
        }
    };

    let mut items: Vec<ExtractedItem> = Vec::new();
    for record in &records {
        match clean_record(record, deps.config.max_quantity) {
            Ok(item) => items.push(item),
            Err(StageError::ContractViolation { detail }) => {
                log_transition(deps, artifact.id, JOB_EXTRACT, LogLevel::Warn, &detail).await;
            }
            Err(other) => return Err(other),
        }
    }

    let items = merge_duplicates(items);
    artifact.extracted_items = items.clone();
    Ok(decide_after_extract(&items))
}

/// §4.B stage 3: NORMALIZE against the catalog.
async fn run_normalize(deps: &Deps, artifact: &mut UploadedArtifact) -> Result<StageOutcome, StageError> {
    if artifact.status != ArtifactStatus::Extracted {
        return Ok(StageOutcome::Advanced(artifact.status));
    }

    let mut normalized: Vec<NormalizedItem> = Vec::with_capacity(artifact.extracted_items.len());
    for item in artifact.extracted_items.clone() {
        let result = normalize_item(item, deps.catalog.as_ref(), deps.config.match_threshold)
            .await
            .map_err(|e| StageError::Transient {
                kind: TransientKind::StorageContention,
                detail: e.to_string(),
            })?;
        normalized.push(result);
    }

    artifact.normalized_items = normalized.clone();
    Ok(decide_after_normalize(&normalized, deps.config.review_fraction_threshold))
}

/// §4.B stage 4: BROADCAST. Consults the vendor selector per confidently
/// matched item, writes RFQ rows + outbox notifications atomically per item.
async fn run_broadcast(deps: &Deps, artifact: &mut UploadedArtifact) -> Result<StageOutcome, StageError> {
    if artifact.status != ArtifactStatus::Normalized {
        return Ok(StageOutcome::Advanced(artifact.status));
    }

    let now = Utc::now();
    let minute_of_day = (now.hour() * 60 + now.minute()) as u16;

    let eligible_items: Vec<&NormalizedItem> = artifact
        .normalized_items
        .iter()
        .filter(|i| !i.needs_review && i.product_id.is_some())
        .collect();

    let mut rfq_counts_per_item = Vec::with_capacity(eligible_items.len());

    for item in eligible_items {
        let product_id = item.product_id.expect("filtered above");

        // §4.B "Partial-broadcast resumption": read existing RFQBroadcast
        // rows for this item before writing, so a re-run after a crash
        // doesn't duplicate RFQs.
        let existing = deps
            .broadcasts
            .existing_for_item(artifact.id, product_id)
            .await
            .map_err(|e| StageError::Transient {
                kind: TransientKind::StorageContention,
                detail: e.to_string(),
            })?;
        if !existing.is_empty() {
            rfq_counts_per_item.push(existing.len());
            continue;
        }

        let offers = deps
            .vendors
            .eligible_offers(product_id)
            .await
            .map_err(|e| StageError::Transient {
                kind: TransientKind::StorageContention,
                detail: e.to_string(),
            })?;

        if let Some(credit) = &deps.credit {
            // §6 "Called before BROADCAST when the pipeline is configured
            // to honor credit gates" — gated per item on the cheapest
            // eligible offer, since that's the only price known before the
            // selector has ranked the full candidate set.
            let cheapest = offers.iter().map(|(_, o)| o.price).min();
            if let Some(price) = cheapest {
                let amount = price * item.extracted.quantity;
                match credit
                    .check_and_reserve(artifact.retailer_id, amount)
                    .await
                    .map_err(|e| StageError::Transient {
                        kind: TransientKind::StorageContention,
                        detail: e.to_string(),
                    })? {
                    CreditDecision::Ok => {}
                    CreditDecision::Rejected { reason } => {
                        log_transition(
                            deps,
                            artifact.id,
                            JOB_BROADCAST,
                            LogLevel::Warn,
                            &format!("credit gate rejected product {product_id}: {reason}"),
                        )
                        .await;
                        rfq_counts_per_item.push(0);
                        continue;
                    }
                }
            }
        }

        let mut candidates = Vec::with_capacity(offers.len());
        for (vendor, offer) in offers {
            let metrics = deps
                .vendor_metrics
                .get_metrics(vendor.id)
                .await
                .map_err(|e| StageError::Transient {
                    kind: TransientKind::StorageContention,
                    detail: e.to_string(),
                })?;
            candidates.push(Candidate {
                vendor,
                offer,
                metrics,
            });
        }

        let decision = select_top_k(
            product_id,
            candidates,
            item.extracted.quantity,
            minute_of_day,
            deps.config.top_k_vendors,
            deps.config.min_reliability,
            deps.config.seed_samples,
            &deps.config.selector_weights,
        );

        if decision.chosen.is_empty() {
            // §4.B "NO_VENDORS_FOUND for item -> item is skipped and
            // flagged in the processing log" — not a stage failure.
            log_transition(
                deps,
                artifact.id,
                JOB_BROADCAST,
                LogLevel::Warn,
                &format!("no eligible vendors for product {product_id}"),
            )
            .await;
            rfq_counts_per_item.push(0);
            continue;
        }

        let rows: Vec<RFQBroadcast> = decision
            .ranked
            .iter()
            .filter(|r| decision.chosen.contains(&r.vendor_id))
            .map(|r| RFQBroadcast {
                id: Uuid::new_v4(),
                uploaded_artifact_id: artifact.id,
                retailer_id: artifact.retailer_id,
                product_id,
                vendor_id: r.vendor_id,
                requested_qty: item.extracted.quantity,
                unit: item.extracted.unit,
                status: BroadcastStatus::Sent,
                vendor_rank: r.rank,
                score_snapshot: r.score,
                created_at: now,
                responded_at: None,
            })
            .collect();

        // RFQ rows and their outbox notifications commit together in one
        // transaction (§4.B "within a single serializable transaction
        // together with outbox rows"): a crash between the two would
        // otherwise leave `existing_for_item` seeing the RFQ rows on the
        // next resumption and skipping the item without ever re-sending
        // its notifications — a permanent loss, not a resumable gap.
        let mut tx = deps
            .pool
            .begin()
            .await
            .map_err(|e| StageError::Substrate(e.into()))?;

        deps.broadcasts
            .insert_all(&mut tx, &rows)
            .await
            .map_err(|e| StageError::Transient {
                kind: TransientKind::StorageContention,
                detail: e.to_string(),
            })?;

        // One outbox row per RFQ, grouped under the artifact's entity id so
        // dispatch stays in (artifact_id, id) order (§5 "Outbox dispatch").
        for row in &rows {
            let notification = RfqNotification {
                broadcast_id: row.id,
                artifact_id: artifact.id,
                retailer_id: artifact.retailer_id,
                vendor_id: row.vendor_id,
                product_id: row.product_id,
                requested_qty: row.requested_qty.to_f64().unwrap_or(0.0),
                vendor_rank: row.vendor_rank,
            };
            write_outbox_row(
                &mut tx,
                artifact.id,
                "wholesale.rfq_broadcast.v1",
                &notification,
                CorrelationId::from(artifact.id),
            )
            .await
            .map_err(|e| StageError::Substrate(e))?;
        }
        tx.commit().await.map_err(|e| StageError::Substrate(e.into()))?;

        rfq_counts_per_item.push(rows.len());
    }

    Ok(decide_after_broadcast(&rfq_counts_per_item))
}

/// §4.B stage 5: FINALIZE. Purely a status commit — no external side
/// effects.
async fn run_finalize(deps: &Deps, artifact: &mut UploadedArtifact) -> Result<StageOutcome, StageError> {
    if artifact.status != ArtifactStatus::Broadcast {
        return Ok(StageOutcome::Advanced(artifact.status));
    }

    let eligible_items: Vec<&NormalizedItem> = artifact
        .normalized_items
        .iter()
        .filter(|i| !i.needs_review && i.product_id.is_some())
        .collect();

    let mut counts = Vec::with_capacity(eligible_items.len());
    for item in eligible_items {
        let product_id = item.product_id.expect("filtered above");
        let existing = deps
            .broadcasts
            .existing_for_item(artifact.id, product_id)
            .await
            .map_err(|e| StageError::Transient {
                kind: TransientKind::StorageContention,
                detail: e.to_string(),
            })?;
        counts.push(existing.len());
    }

    Ok(decide_after_finalize(&counts))
}

/// Notification payload written to the outbox for each RFQ broadcast
/// (§6 `notifier.send(target, payload)`), dispatched by the outbox relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RfqNotification {
    broadcast_id: Uuid,
    artifact_id: Uuid,
    retailer_id: Uuid,
    vendor_id: Uuid,
    product_id: Uuid,
    requested_qty: f64,
    vendor_rank: u32,
}

/// Outbox relay: a queue processor (§4.A) in its own right, with its own
/// idempotency via `outbox.id` (§4.E). Claims unpublished rows in commit
/// order and hands them to the notifier.
pub struct OutboxRelay {
    reader: PgOutboxReader,
    notifier: Arc<dyn DynNotifier>,
    batch_size: usize,
}

impl OutboxRelay {
    pub fn new(pool: PgPool, notifier: Arc<dyn DynNotifier>, batch_size: usize) -> Self {
        Self {
            reader: PgOutboxReader::new(pool),
            notifier,
            batch_size,
        }
    }

    /// One relay sweep: claim a batch, dispatch each in order, mark the
    /// ones that succeeded as published. A row whose dispatch fails is left
    /// unpublished for the next sweep — "the relay retries indefinitely on
    /// transient dispatch errors" (§4.E).
    pub async fn relay_once(&self) -> anyhow::Result<usize> {
        let rows = self.reader.claim_unpublished(self.batch_size).await?;
        let mut published = Vec::with_capacity(rows.len());

        for row in rows {
            let target = row.event_type.clone();
            match self.notifier.send(&target, &row.payload).await {
                Ok(()) => published.push(row.id),
                Err(err) => {
                    tracing::warn!(outbox_id = %row.id, error = %err, "outbox dispatch failed, will retry");
                }
            }
        }

        let count = published.len();
        if !published.is_empty() {
            self.reader.mark_published(&published).await?;
        }
        Ok(count)
    }
}

/// Maintenance job payloads (§4.E "cleanup_stale" invoked by a scheduled
/// job on a `maintenance` queue, not a shelled-out cron).
pub async fn run_maintenance_sweep(deps: &Deps) -> anyhow::Result<HashMap<&'static str, u64>> {
    let mut results = HashMap::new();
    let log_cutoff = Utc::now() - chrono::Duration::days(90);
    results.insert("processing_log", deps.artifacts.cleanup_stale_logs(log_cutoff).await?);
    let dedupe_cutoff = Utc::now() - chrono::Duration::days(30);
    results.insert(
        "webhook_dedupe",
        deps.webhook_dedupe.cleanup_older_than(dedupe_cutoff).await?,
    );
    let history_cutoff = Utc::now() - chrono::Duration::days(90);
    results.insert(
        "vendor_metrics_history",
        deps.vendor_metrics.cleanup_history_older_than(history_cutoff).await?,
    );

    // Same relay/outbox retention the dispatch side ships (§4.E); wholesale
    // just supplies the periodic trigger via this sweep rather than running
    // its own timer.
    let outbox_retention = chrono::Duration::from_std(OutboxPublisherConfig::default().retention)
        .unwrap_or_else(|_| chrono::Duration::days(7));
    let outbox_cutoff = Utc::now() - outbox_retention;
    results.insert(
        "outbox",
        PgOutboxReader::new(deps.pool.clone())
            .cleanup_published(outbox_cutoff)
            .await?,
    );

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FlippingGate {
        engaged: AtomicBool,
        reads: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl SafeModeGate for FlippingGate {
        async fn is_engaged(&self) -> Result<bool, StoreError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(self.engaged.load(Ordering::SeqCst))
        }

        async fn set_engaged(&self, engaged: bool) -> Result<(), StoreError> {
            self.engaged.store(engaged, Ordering::SeqCst);
            Ok(())
        }
    }

    /// §5 "readers cache it for ≤ 5s": a flip at the store isn't observed
    /// until the cached value's TTL expires.
    #[tokio::test]
    async fn safe_mode_cache_holds_stale_value_within_ttl() {
        let gate = Arc::new(FlippingGate {
            engaged: AtomicBool::new(false),
            reads: AtomicUsize::new(0),
        });
        let cache = SafeModeCache {
            gate: gate.clone(),
            ttl: Duration::from_millis(30),
            cached: Mutex::new(None),
        };

        assert!(!cache.is_engaged().await.unwrap());
        gate.set_engaged(true).await.unwrap();
        // Still within the TTL window: the cache hasn't gone back to the
        // store yet, so it reports the stale "clear" value.
        assert!(!cache.is_engaged().await.unwrap());
        assert_eq!(gate.reads.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cache.is_engaged().await.unwrap());
        assert_eq!(gate.reads.load(Ordering::SeqCst), 2);
    }
}
