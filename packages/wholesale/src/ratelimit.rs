//! Per-provider token buckets for the OCR and extraction collaborators
//! (§5 "External RPC clients ... per-provider rate limits are enforced by
//! a token bucket whose tokens are held in the queue substrate").
//!
//! Unlike `RateLimitedCrawler`'s `until_ready().await` (the pattern this is
//! grounded on), a stage handler must never block in-process waiting for a
//! token — a job holding a worker slot while parked on a rate limit starves
//! the rest of that queue's concurrency budget. Instead `check` is
//! non-blocking: an empty bucket turns into a [`crate::error::StageError::Transient`]
//! with `TransientKind::RateLimited`, and the job goes back to WAITING
//! through the ordinary nack/backoff path — "the job sits in WAITING an
//! extra delay" without needing a bespoke delay channel through `relay`.

use std::num::NonZeroU32;

use governor::{Quota, RateLimiter as GovernorLimiter};

type DirectLimiter =
    GovernorLimiter<governor::state::NotKeyed, governor::state::InMemoryState, governor::clock::DefaultClock>;

/// One named provider's bucket (`"ocr"`, `"extraction"`, ...).
pub struct ProviderLimiter {
    limiter: DirectLimiter,
}

impl ProviderLimiter {
    pub fn per_minute(requests_per_minute: u32) -> Self {
        let quota = Quota::per_minute(
            NonZeroU32::new(requests_per_minute.max(1)).expect("requests_per_minute must be > 0"),
        );
        Self {
            limiter: GovernorLimiter::direct(quota),
        }
    }

    /// `true` if a token was available and consumed; `false` if the caller
    /// should back off rather than call the provider now.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

/// The two provider buckets §4.B's OCR and EXTRACT stages consult before
/// making a collaborator call.
pub struct RateLimiters {
    pub ocr: ProviderLimiter,
    pub extraction: ProviderLimiter,
}

impl RateLimiters {
    pub fn new(ocr_requests_per_minute: u32, extraction_requests_per_minute: u32) -> Self {
        Self {
            ocr: ProviderLimiter::per_minute(ocr_requests_per_minute),
            extraction: ProviderLimiter::per_minute(extraction_requests_per_minute),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_bucket_refuses_further_acquires() {
        let limiter = ProviderLimiter::per_minute(1);
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }
}
