//! Decision telemetry.
//!
//! [`RateLimitService`](crate::RateLimitService) reports every request it handles as
//! a [`DecisionEvent`]. Sinks are plain `tower` services over those events, so any
//! service with `Response = ()` can receive them.
//!
//! ```rust
//! use ratekeeper::telemetry::{DecisionEvent, MemorySink};
//! use tower::Service;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut sink = MemorySink::new();
//! let event = DecisionEvent::Allowed { key: "sms:543.max=3.rd=60.ra=1".into(), remaining: 2 };
//! sink.call(event.clone()).await.unwrap();
//! assert_eq!(sink.events(), vec![event]);
//! # }
//! ```

use std::collections::VecDeque;
use std::convert::Infallible;
use std::fmt;
use std::future::{ready, Ready};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;
use tower::Service;

/// Receiver of [`DecisionEvent`]s.
pub trait TelemetrySink:
    Service<DecisionEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    type SinkError: std::error::Error + Send + 'static;
}

/// Deliver `event` if the sink becomes ready; drop it otherwise.
///
/// Sink errors are discarded. A decision never fails because telemetry did.
pub async fn emit_best_effort<S>(sink: S, event: DecisionEvent)
where
    S: Service<DecisionEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    match sink.ready_oneshot().await {
        Ok(mut sink) => {
            if let Err(e) = sink.call(event).await {
                tracing::trace!(error = %e, "telemetry sink dropped an event");
            }
        }
        Err(e) => tracing::trace!(error = %e, "telemetry sink not ready"),
    }
}

/// One observation from the service facade. `key` is always the storage key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecisionEvent {
    Allowed { key: String, remaining: u32 },
    Denied { key: String },
    /// Validation failed before any storage access.
    Rejected { reason: String },
    /// `now` was earlier than the stored refill time by `behind`.
    ClockRegression { key: String, behind: Duration },
    /// Store or decode failure; the request failed.
    StoreFailure { key: String, error: String },
}

impl DecisionEvent {
    /// Short stable name, suitable as a metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Allowed { .. } => "allowed",
            Self::Denied { .. } => "denied",
            Self::Rejected { .. } => "rejected",
            Self::ClockRegression { .. } => "clock_regression",
            Self::StoreFailure { .. } => "store_failure",
        }
    }
}

impl fmt::Display for DecisionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allowed { key, remaining } => write!(f, "allowed {} remaining={}", key, remaining),
            Self::Denied { key } => write!(f, "denied {}", key),
            Self::Rejected { reason } => write!(f, "rejected: {}", reason),
            Self::ClockRegression { key, behind } => {
                write!(f, "clock regression on {} by {:?}", key, behind)
            }
            Self::StoreFailure { key, error } => write!(f, "store failure on {}: {}", key, error),
        }
    }
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl Service<DecisionEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: DecisionEvent) -> Self::Future {
        ready(Ok(()))
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// Writes events through `tracing`: regressions at WARN, store failures at ERROR,
/// everything else at DEBUG.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl Service<DecisionEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: DecisionEvent) -> Self::Future {
        let kind = event.kind();
        match &event {
            DecisionEvent::ClockRegression { .. } => tracing::warn!(kind, %event),
            DecisionEvent::StoreFailure { .. } => tracing::error!(kind, %event),
            _ => tracing::debug!(kind, %event),
        }
        ready(Ok(()))
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// Keeps the most recent events in a shared ring buffer. Clones share the buffer.
#[derive(Clone, Debug)]
pub struct MemorySink {
    ring: Arc<Mutex<Ring>>,
}

#[derive(Debug)]
struct Ring {
    events: VecDeque<DecisionEvent>,
    limit: usize,
    dropped: u64,
}

impl MemorySink {
    pub const DEFAULT_LIMIT: usize = 4096;

    pub fn new() -> Self {
        Self::bounded(Self::DEFAULT_LIMIT)
    }

    /// Keep at most `limit` events (minimum one).
    pub fn bounded(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            ring: Arc::new(Mutex::new(Ring {
                events: VecDeque::with_capacity(limit.min(64)),
                limit,
                dropped: 0,
            })),
        }
    }

    /// Oldest first.
    pub fn events(&self) -> Vec<DecisionEvent> {
        self.ring().events.iter().cloned().collect()
    }

    /// Count of retained events of the given [`kind`](DecisionEvent::kind).
    pub fn count(&self, kind: &str) -> usize {
        self.ring().events.iter().filter(|e| e.kind() == kind).count()
    }

    /// Events pushed out by newer ones.
    pub fn dropped(&self) -> u64 {
        self.ring().dropped
    }

    pub fn len(&self) -> usize {
        self.ring().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring().events.is_empty()
    }

    pub fn clear(&self) {
        let mut ring = self.ring();
        ring.events.clear();
        ring.dropped = 0;
    }

    fn ring(&self) -> MutexGuard<'_, Ring> {
        // A panic while holding the lock cannot leave the ring inconsistent.
        self.ring.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<DecisionEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: DecisionEvent) -> Self::Future {
        let mut ring = self.ring();
        if ring.events.len() == ring.limit {
            ring.events.pop_front();
            ring.dropped += 1;
        }
        ring.events.push_back(event);
        ready(Ok(()))
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}
