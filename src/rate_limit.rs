//! Token-bucket quota decisions.
//!
//! This module provides the building blocks for a quota service:
//! - [`params`]: request validation into [`BucketParams`].
//! - [`key`]: the parameter-inclusive [`StorageKey`] a bucket is persisted under.
//! - [`codec`]: the fixed binary layout of [`BucketState`].
//! - [`strategies`]: the token-bucket refill and decide math.
//! - [`store`]: the transactional store contract plus an in-memory backend.
//! - [`service`]: the facade that runs one decision inside one transaction.
//! - [`middleware`]: a tower layer that enforces a quota in front of a service.
//!
//! # Architecture
//!
//! - **Logic**: [`strategies::decide`] is pure. It takes the params, the stored state
//!   and nothing else, so time is injected through `BucketParams::now`.
//! - **Storage**: a [`store::Store`] hands out transactions; a key touched inside a
//!   transaction stays locked until commit or abort.
//! - **Facade**: [`service::RateLimitService`] glues the two together and owns the
//!   transaction lifecycle.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ValidationError;

pub mod codec;
pub mod key;
pub mod middleware;
pub mod params;
pub mod service;
pub mod store;
pub mod strategies;

pub use codec::BucketState;
pub use key::StorageKey;
pub use middleware::{QuotaLayer, QuotaService};
pub use params::{BucketParams, ReduceRequest};
pub use service::RateLimitService;

/// The outcome of one decision request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// One token was consumed.
    Allowed {
        /// Tokens left after this acquisition.
        remaining: u32,
    },
    /// The bucket was empty; nothing was consumed.
    Denied {
        /// Always zero; kept so callers can read `remaining` uniformly.
        remaining: u32,
    },
    /// The request was malformed. No bucket was read or written.
    Rejected(ValidationError),
}

impl Decision {
    /// Helper to check if allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    /// Tokens left after the decision; zero for rejected requests.
    pub fn remaining(&self) -> u32 {
        match self {
            Decision::Allowed { remaining } | Decision::Denied { remaining } => *remaining,
            Decision::Rejected(_) => 0,
        }
    }

    pub fn status(&self) -> Status {
        match self {
            Decision::Allowed { .. } => Status::Ok,
            Decision::Denied { .. } => Status::Ng,
            Decision::Rejected(_) => Status::Error,
        }
    }
}

/// Wire status of a decision response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    #[serde(rename = "OK")]
    Ok,
    /// Not granted.
    #[serde(rename = "NG")]
    Ng,
    /// The request failed validation.
    #[serde(rename = "ERROR")]
    Error,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Ok => write!(f, "OK"),
            Status::Ng => write!(f, "NG"),
            Status::Error => write!(f, "ERROR"),
        }
    }
}

/// Decision response as exposed to transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReduceResponse {
    pub status: Status,
    /// Tokens left after the decision. Zero when `status` is `ERROR`.
    pub remaining: u32,
}

impl From<&Decision> for ReduceResponse {
    fn from(decision: &Decision) -> Self {
        Self { status: decision.status(), remaining: decision.remaining() }
    }
}

impl From<Decision> for ReduceResponse {
    fn from(decision: Decision) -> Self {
        ReduceResponse::from(&decision)
    }
}
