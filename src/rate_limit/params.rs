//! Decision requests and their validation into [`BucketParams`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ValidationError;

/// A raw decision request as it arrives from a transport.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReduceRequest {
    /// Logical bucket identity.
    pub key: String,
    /// Bucket capacity.
    pub max_amount: u32,
    /// Tokens added per refill interval; `0` means `max_amount`.
    #[serde(default)]
    pub refill_amount: u32,
    /// Refill interval in whole seconds.
    #[serde(alias = "refill_duration_seconds")]
    pub refill_duration_sec: u32,
}

impl ReduceRequest {
    pub fn new(key: impl Into<String>, max_amount: u32, refill_amount: u32, refill_duration_sec: u32) -> Self {
        Self { key: key.into(), max_amount, refill_amount, refill_duration_sec }
    }
}

/// Validated bucket parameters for one request, with `now` captured once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketParams {
    pub key: String,
    pub capacity: u32,
    pub refill_amount: u32,
    pub refill_interval: Duration,
    pub now: DateTime<Utc>,
}

impl BucketParams {
    /// Validate `request`, defaulting a zero refill amount to the capacity.
    ///
    /// Rules are checked in order: non-empty key, capacity ≥ 1, interval ≥ 1s,
    /// refill amount ≤ capacity.
    pub fn from_request(request: &ReduceRequest, now: DateTime<Utc>) -> Result<Self, ValidationError> {
        let refill_amount =
            if request.refill_amount == 0 { request.max_amount } else { request.refill_amount };

        if request.key.is_empty() {
            return Err(ValidationError::EmptyKey);
        }
        if request.max_amount < 1 {
            return Err(ValidationError::ZeroCapacity);
        }
        if request.refill_duration_sec < 1 {
            return Err(ValidationError::ZeroRefillInterval);
        }
        if refill_amount > request.max_amount {
            return Err(ValidationError::RefillExceedsCapacity {
                refill_amount,
                capacity: request.max_amount,
            });
        }

        Ok(Self {
            key: request.key.clone(),
            capacity: request.max_amount,
            refill_amount,
            refill_interval: Duration::from_secs(u64::from(request.refill_duration_sec)),
            now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH
    }

    #[test]
    fn zero_refill_amount_defaults_to_capacity() {
        let params = BucketParams::from_request(&ReduceRequest::new("sms:543", 3, 0, 60), now()).unwrap();
        assert_eq!(params.refill_amount, 3);
        assert_eq!(params.capacity, 3);
        assert_eq!(params.refill_interval, Duration::from_secs(60));
    }

    #[test]
    fn rejects_each_invalid_field() {
        let cases = [
            (ReduceRequest::new("", 3, 1, 60), ValidationError::EmptyKey),
            (ReduceRequest::new("k", 0, 0, 60), ValidationError::ZeroCapacity),
            (ReduceRequest::new("k", 3, 1, 0), ValidationError::ZeroRefillInterval),
            (
                ReduceRequest::new("k", 3, 4, 60),
                ValidationError::RefillExceedsCapacity { refill_amount: 4, capacity: 3 },
            ),
        ];
        for (request, expected) in cases {
            assert_eq!(BucketParams::from_request(&request, now()), Err(expected));
        }
    }

    #[test]
    fn empty_key_is_reported_before_other_faults() {
        let request = ReduceRequest::new("", 0, 9, 0);
        assert_eq!(BucketParams::from_request(&request, now()), Err(ValidationError::EmptyKey));
    }

    #[test]
    fn request_deserializes_without_refill_amount() {
        let request: ReduceRequest =
            serde_json::from_str(r#"{"key":"a","max_amount":5,"refill_duration_sec":10}"#).unwrap();
        assert_eq!(request.refill_amount, 0);
    }

    #[test]
    fn long_duration_field_name_is_accepted() {
        let request: ReduceRequest =
            serde_json::from_str(r#"{"key":"a","max_amount":5,"refill_duration_seconds":10}"#)
                .unwrap();
        assert_eq!(request.refill_duration_sec, 10);
    }
}
