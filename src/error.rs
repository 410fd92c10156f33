//! Typed errors at each collaborator boundary.

use thiserror::Error;
use uuid::Uuid;

use crate::models::booking::BookingStatus;

/// A stored text column held a value outside its closed set.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown {kind} `{value}`")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    pub fn new(kind: &'static str, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Rule definitions the engine refuses to run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("malformed rule data: {0}")]
    Malformed(String),

    #[error("rule has no actions")]
    NoActions,

    #[error("condition tree deeper than {max} levels")]
    ConditionTooDeep { max: usize },

    #[error("condition tree has more than {max} nodes")]
    ConditionTooLarge { max: usize },

    #[error("branch actions nested deeper than {max} levels")]
    BranchTooDeep { max: usize },

    #[error("rule has more than {max} actions")]
    TooManyActions { max: usize },
}

#[derive(Debug, Error)]
pub enum BookingError {
    #[error("booking request {0} not found")]
    NotFound(Uuid),

    #[error("cannot move booking request from {from:?} to {to:?}")]
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },

    #[error("validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_variant_display() {
        let err = UnknownVariant::new("booking status", "archived");
        assert_eq!(err.to_string(), "unknown booking status `archived`");
    }

    #[test]
    fn invalid_transition_display() {
        let err = BookingError::InvalidTransition {
            from: BookingStatus::Confirmed,
            to: BookingStatus::Confirmed,
        };
        assert_eq!(
            err.to_string(),
            "cannot move booking request from Confirmed to Confirmed"
        );
    }

    #[test]
    fn store_error_from_sqlx() {
        let err: StoreError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, StoreError::Database(_)));
    }
}
