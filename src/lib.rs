#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # ratekeeper
//!
//! Token-bucket quota decisions over a transactional key-value store.
//!
//! A caller asks "may I consume one unit under limit X"; the service answers
//! allowed or denied and persists the refilled, decremented bucket in the same
//! transaction it read it from.
//!
//! ## Features
//!
//! - **Lazy refill**: no timers; whole elapsed intervals are credited at decision time
//! - **Parameter-inclusive keys**: changing a limit starts a fresh bucket
//! - **Per-key transactions**: concurrent requests on one key never share a token
//! - **Pluggable stores**: in-memory here, a write-ahead-log store in `ratekeeper-wal`
//! - **tower integration**: the facade is a `Service`, and `QuotaLayer` meters any service
//!
//! ## Quick Start
//!
//! ```rust
//! use ratekeeper::{InMemoryStore, RateLimitService, ReduceRequest, Status};
//!
//! #[tokio::main]
//! async fn main() {
//!     let service = RateLimitService::new(InMemoryStore::new());
//!     let request = ReduceRequest::new("sms:543", 3, 1, 60);
//!
//!     let response = service.reduce(&request).await.expect("store available");
//!     assert_eq!(response.status, Status::Ok);
//!     assert_eq!(response.remaining, 2);
//! }
//! ```

pub mod clock;
pub mod error;
pub mod prelude;
pub mod rate_limit;
pub mod telemetry;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DecodeError, QuotaError, ServiceError, StoreError, ValidationError};
pub use rate_limit::middleware::QuotaLimits;
pub use rate_limit::store::{
    InMemoryStore, KeyGuard, KeyLocks, ScopedTransaction, Store, Transaction,
};
pub use rate_limit::{
    BucketParams, BucketState, Decision, QuotaLayer, QuotaService, RateLimitService,
    ReduceRequest, ReduceResponse, Status, StorageKey,
};
pub use telemetry::{DecisionEvent, LogSink, MemorySink, NullSink, TelemetrySink};
