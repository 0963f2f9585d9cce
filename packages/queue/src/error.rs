//! Structured, pattern-matchable error categorization for relay consumers.
//!
//! `Categorizable` lets a domain error type declare a [`SafeErrorCategory`] and
//! a sanitized message, so callers crossing a trust boundary (logs, API
//! responses, job `last_error` columns) never leak internal error detail.

use std::borrow::Cow;
use std::fmt;

/// Error category for sanitized failure reporting.
///
/// Internal error details are never exposed outside the boundary — only
/// the category and a `safe_message`.
///
/// - `Validation`, `NotFound`, `RateLimited`: safe to expose details.
/// - `Unauthorized`, `InternalError`, `ExternalService`: generic messages only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafeErrorCategory {
    /// User input validation errors - safe to expose details.
    Validation,
    /// Resource not found - safe to expose.
    NotFound,
    /// Authentication/authorization failure - never expose details.
    Unauthorized,
    /// Rate limit exceeded - safe to expose.
    RateLimited,
    /// Internal server error - never expose details.
    InternalError,
    /// External service failure - never expose details.
    ExternalService,
}

impl fmt::Display for SafeErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SafeErrorCategory::Validation => write!(f, "validation_error"),
            SafeErrorCategory::NotFound => write!(f, "not_found"),
            SafeErrorCategory::Unauthorized => write!(f, "unauthorized"),
            SafeErrorCategory::RateLimited => write!(f, "rate_limited"),
            SafeErrorCategory::InternalError => write!(f, "internal_error"),
            SafeErrorCategory::ExternalService => write!(f, "external_service_error"),
        }
    }
}

/// Trait for errors that can be categorized for safe external exposure.
///
/// Implement this on domain error types (e.g. `wholesale::error::StageError`)
/// so callers crossing a trust boundary get a category plus a sanitized
/// message instead of a raw `Display` string.
pub trait Categorizable: std::error::Error {
    /// Return the safe category for this error.
    fn category(&self) -> SafeErrorCategory;

    /// Return a sanitized, user-safe message.
    ///
    /// Only `Validation`, `NotFound`, and `RateLimited` errors may expose
    /// specific details. All other categories must return generic messages.
    fn safe_message(&self) -> Cow<'static, str>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct BoomError;

    impl Categorizable for BoomError {
        fn category(&self) -> SafeErrorCategory {
            SafeErrorCategory::InternalError
        }

        fn safe_message(&self) -> Cow<'static, str> {
            "An internal error occurred".into()
        }
    }

    #[test]
    fn display_matches_category_name() {
        assert_eq!(SafeErrorCategory::Validation.to_string(), "validation_error");
        assert_eq!(SafeErrorCategory::NotFound.to_string(), "not_found");
        assert_eq!(SafeErrorCategory::RateLimited.to_string(), "rate_limited");
    }

    #[test]
    fn categorizable_hides_internal_detail() {
        let err = BoomError;
        assert_eq!(err.category(), SafeErrorCategory::InternalError);
        assert_eq!(err.safe_message(), "An internal error occurred");
    }
}
