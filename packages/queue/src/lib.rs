//! # Relay
//!
//! The durable job queue and transactional outbox substrate (spec §4.A,
//! §4.E): at-least-once job delivery with exponential-backoff retry and a
//! dead-letter queue, plus a same-transaction outbox for side effects that
//! must commit atomically with the state change that produced them.
//!
//! ## Core concepts
//!
//! - [`job::JobStore`] — claim/ack/nack/heartbeat against a durable queue.
//!   Policy-light: relay owns the interface, the consuming worker owns
//!   polling cadence, backoff curve, and concurrency limits.
//! - [`outbox::OutboxWriter`] / [`outbox::OutboxReader`] — write a row in the
//!   same transaction as a business write, then claim and dispatch it
//!   at-least-once from a separate relay loop.
//! - [`pg_queue::PgJobStore`] / [`pg_outbox::PgOutboxWriter`] — the one
//!   concrete PostgreSQL backend this crate ships, built on
//!   `SELECT ... FOR UPDATE SKIP LOCKED`.
//!
//! ## Guarantees
//!
//! - **At-least-once delivery** for both jobs and outbox rows: a crash
//!   between claim and ack/mark-published re-delivers the work.
//! - **Exactly-one worker holds a job's lock at a time**, enforced by a
//!   database row lock, not an in-process mutex.
//! - **Same-transaction durability** for the outbox: a row is visible iff
//!   the business write that produced it committed.

mod core;
mod error;

// Job interfaces (policy-light)
pub mod job;

// Outbox module for durable event persistence
pub mod outbox;

// Concrete PostgreSQL-backed job store and outbox (the `postgres` feature).
#[cfg(feature = "postgres")]
pub mod pg_outbox;
#[cfg(feature = "postgres")]
pub mod pg_queue;

// Re-export core types
pub use crate::core::{CorrelationId, Event};

// Re-export error types
pub use crate::error::{Categorizable, SafeErrorCategory};

// Re-export job types (policy-light interfaces)
pub use job::{ClaimedJob, FailureKind, JobStore};

// Re-export concrete Postgres backends (feature-gated)
#[cfg(feature = "postgres")]
pub use pg_outbox::{write_outbox_row, PgOutboxReader, PgOutboxWriter};
#[cfg(feature = "postgres")]
pub use pg_queue::{BackoffPolicy, EnqueueOptions, PgJobStore};

// Re-export commonly used external types
pub use async_trait::async_trait;
