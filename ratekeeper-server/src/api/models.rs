//! Request and response bodies that exist only on the HTTP surface.
//!
//! Decision requests and responses reuse [`ratekeeper::ReduceRequest`] and
//! [`ratekeeper::ReduceResponse`] directly.

use ratekeeper::{BucketState, ReduceRequest};
use serde::{Deserialize, Serialize};

/// Query string of `GET /v1/debug/bucket`.
#[derive(Debug, Clone, Deserialize)]
pub struct BucketQuery {
    pub key: String,
    pub max_amount: u32,
    #[serde(default)]
    pub refill_amount: u32,
    pub refill_duration_sec: u32,
}

impl From<BucketQuery> for ReduceRequest {
    fn from(q: BucketQuery) -> Self {
        ReduceRequest::new(q.key, q.max_amount, q.refill_amount, q.refill_duration_sec)
    }
}

/// Committed state of one bucket, timestamps in RFC 3339.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketStateView {
    pub remaining: u32,
    pub last_refilled_at: String,
    pub last_reduced_at: String,
}

impl From<BucketState> for BucketStateView {
    fn from(state: BucketState) -> Self {
        Self {
            remaining: state.remaining,
            last_refilled_at: state.last_refilled_at.to_rfc3339(),
            last_reduced_at: state.last_reduced_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketView {
    pub storage_key: String,
    pub state: Option<BucketStateView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}
