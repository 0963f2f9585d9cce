//! Core types shared by the job queue and outbox modules.
//!
//! # Correlation
//!
//! Jobs and outbox rows can be tagged with a [`CorrelationId`] to track
//! related work across an artifact's stage pipeline, without threading an
//! extra parameter through every store call.

use std::fmt;

use uuid::Uuid;

/// Correlation ID for tracking related jobs and outbox rows.
///
/// Use `CorrelationId::NONE` for uncorrelated work, or `CorrelationId::new()`
/// to generate a fresh ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Sentinel value for uncorrelated work (nil UUID).
    pub const NONE: Self = Self(Uuid::nil());

    /// Create a new random correlation ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Check if this is the NONE sentinel value.
    pub fn is_none(&self) -> bool {
        self.0.is_nil()
    }

    /// Check if this is a real correlation ID (not NONE).
    pub fn is_some(&self) -> bool {
        !self.is_none()
    }

    /// Get the inner UUID value.
    pub fn into_inner(self) -> Uuid {
        self.0
    }

    /// Get a reference to the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for CorrelationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<CorrelationId> for Uuid {
    fn from(cid: CorrelationId) -> Uuid {
        cid.0
    }
}

impl From<Option<Uuid>> for CorrelationId {
    fn from(opt: Option<Uuid>) -> Self {
        match opt {
            Some(uuid) => Self(uuid),
            None => Self::NONE,
        }
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "NONE")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// A fact — something that happened, with no IO and no side effects.
///
/// Automatically implemented for any type that is `Clone + Send + Sync +
/// 'static`; domain event enums don't need to implement this by hand.
pub trait Event: std::any::Any + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Event for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_id_none_is_nil() {
        let cid = CorrelationId::NONE;
        assert!(cid.is_none());
        assert!(!cid.is_some());
        assert_eq!(cid.into_inner(), Uuid::nil());
    }

    #[test]
    fn correlation_id_new_is_some() {
        let cid1 = CorrelationId::new();
        let cid2 = CorrelationId::new();
        assert!(cid1.is_some());
        assert_ne!(cid1, cid2);
    }

    #[test]
    fn correlation_id_from_uuid_round_trips() {
        let uuid = Uuid::new_v4();
        let cid = CorrelationId::from(uuid);
        assert_eq!(cid.into_inner(), uuid);
        let back: Uuid = cid.into();
        assert_eq!(back, uuid);
    }

    #[test]
    fn correlation_id_from_option_none_is_sentinel() {
        let cid = CorrelationId::from(None::<Uuid>);
        assert_eq!(cid, CorrelationId::NONE);
    }

    #[test]
    fn correlation_id_display() {
        assert_eq!(CorrelationId::NONE.to_string(), "NONE");
        let uuid = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(CorrelationId::from(uuid).to_string(), uuid.to_string());
    }

    #[test]
    fn correlation_id_ordering() {
        let a = CorrelationId::from(Uuid::parse_str("00000000-0000-0000-0000-000000000001").unwrap());
        let b = CorrelationId::from(Uuid::parse_str("00000000-0000-0000-0000-000000000002").unwrap());
        assert!(a < b);
    }

    #[test]
    fn event_blanket_impl_covers_plain_structs() {
        #[derive(Debug, Clone)]
        struct Occurred {
            value: i32,
        }
        fn assert_event<T: Event>() {}
        assert_event::<Occurred>();
        let _ = Occurred { value: 1 };
    }
}
