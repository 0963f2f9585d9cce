//! B2B wholesale order-processing core (spec §1–§9): the OCR ingestion
//! pipeline, vendor selector, and vendor performance store built on top of
//! `relay`'s job queue and transactional outbox.
//!
//! This crate owns policy — retailers, catalogs, vendors, RFQs — and has no
//! opinion on how jobs are claimed or outbox rows are dispatched; that
//! mechanism lives in `relay` (`packages/queue`). See [`worker`] for how the
//! two are wired together.

pub mod collaborators;
pub mod collaborators_dyn;
pub mod config;
pub mod domain;
pub mod error;
pub mod ingestion;
pub mod metrics;
pub mod postgres;
pub mod ratelimit;
pub mod repository;
pub mod selector;
pub mod worker;

pub use config::Config;
pub use domain::{
    ArtifactStatus, ExtractedItem, MatchKind, NormalizedItem, Product, RFQBroadcast,
    UploadedArtifact, Vendor, VendorMetrics, VendorProduct,
};
pub use error::StageError;
