//! Convenient re-exports for common ratekeeper types.
pub use crate::{
    clock::{Clock, ManualClock, SystemClock},
    error::{QuotaError, ServiceError, StoreError, ValidationError},
    rate_limit::{
        middleware::{QuotaLayer, QuotaLimits},
        store::{InMemoryStore, ScopedTransaction, Store, Transaction},
        Decision, RateLimitService, ReduceRequest, ReduceResponse, Status,
    },
    telemetry::{LogSink, MemorySink, NullSink, TelemetrySink},
};
