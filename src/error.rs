//! Error types for quota decisions.
//!
//! Only [`ValidationError`] ever becomes a decision; every other kind surfaces as a
//! request failure so callers never confuse "storage is down" with "you are limited".
use std::fmt;

/// Why a decision request was rejected before any storage access.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("key must not be empty")]
    EmptyKey,
    #[error("max_amount must be at least 1")]
    ZeroCapacity,
    #[error("refill duration must be at least one second")]
    ZeroRefillInterval,
    #[error("refill_amount {refill_amount} exceeds max_amount {capacity}")]
    RefillExceedsCapacity { refill_amount: u32, capacity: u32 },
}

/// Persisted bytes that were not produced by the bucket state codec.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("bucket record is {actual} bytes, expected {expected}")]
    Length { expected: usize, actual: usize },
    #[error("bucket record has an invalid {field} timestamp")]
    Timestamp { field: &'static str },
}

/// Failures reported by a [`Store`](crate::rate_limit::store::Store) backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backend cannot serve requests (closed, poisoned, shutting down).
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The backend hit an I/O error reading or persisting data.
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Request failures from the service facade. None of these are rate-limit decisions.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The request failed validation. Only reads report this; decisions turn it
    /// into [`Decision::Rejected`](crate::rate_limit::Decision::Rejected).
    #[error("invalid request: {0}")]
    Invalid(#[source] ValidationError),
    /// The record under `key` could not be decoded; the store is corrupt, not empty.
    #[error("corrupt bucket record under {key}: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: DecodeError,
    },
}

impl ServiceError {
    /// Check if this error comes from stored data failing to decode.
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }

    /// The validation failure, if the request itself was at fault.
    pub fn as_invalid(&self) -> Option<&ValidationError> {
        match self {
            Self::Invalid(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Errors produced by [`QuotaLayer`](crate::rate_limit::middleware::QuotaLayer).
#[derive(Debug)]
pub enum QuotaError<E> {
    /// The caller's bucket is empty.
    Exhausted { key: String },
    /// The quota parameters configured on the layer are invalid.
    Misconfigured(ValidationError),
    /// The quota could not be evaluated (store down, corrupt record).
    Infrastructure(ServiceError),
    /// The wrapped service failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for QuotaError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted { key } => write!(f, "quota exhausted for {}", key),
            Self::Misconfigured(e) => write!(f, "quota misconfigured: {}", e),
            Self::Infrastructure(e) => write!(f, "quota unavailable: {}", e),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for QuotaError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Infrastructure(e) => Some(e),
            Self::Misconfigured(e) => Some(e),
            Self::Exhausted { .. } => None,
        }
    }
}

impl<E> QuotaError<E> {
    /// Check if this error is a quota denial.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }

    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}
