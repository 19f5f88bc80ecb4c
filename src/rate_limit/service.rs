//! The service facade: one decision, one transaction.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::clock::{regression_delta, Clock, SystemClock};
use crate::error::ServiceError;
use crate::rate_limit::codec::BucketState;
use crate::rate_limit::key::StorageKey;
use crate::rate_limit::params::{BucketParams, ReduceRequest};
use crate::rate_limit::store::{ScopedTransaction, Store};
use crate::rate_limit::{strategies, Decision, ReduceResponse};
use crate::telemetry::{emit_best_effort, DecisionEvent, NullSink, TelemetrySink};

/// Runs quota decisions against an injected [`Store`].
///
/// Every request reads, decides and writes inside one transaction: validate,
/// derive the storage key, begin, get, decode, decide, encode, set, commit. Invalid
/// requests never reach the store. Store failures are returned as errors and never
/// retried, since a retried read-modify-write could consume a token twice.
///
/// Cheap to clone; clones share the store, clock and sink.
pub struct RateLimitService<S, C = SystemClock, T = NullSink> {
    store: Arc<S>,
    clock: Arc<C>,
    sink: T,
}

impl<S, C, T: Clone> Clone for RateLimitService<S, C, T> {
    fn clone(&self) -> Self {
        Self { store: self.store.clone(), clock: self.clock.clone(), sink: self.sink.clone() }
    }
}

impl<S> RateLimitService<S, SystemClock, NullSink>
where
    S: Store,
{
    /// Create a service backed by `store` using the system clock.
    pub fn new(store: S) -> Self {
        Self { store: Arc::new(store), clock: Arc::new(SystemClock), sink: NullSink }
    }
}

impl<S, C, T> RateLimitService<S, C, T>
where
    S: Store,
    C: Clock + 'static,
    T: TelemetrySink,
    T::Future: Send + 'static,
{
    /// Replace the clock (tests inject a `ManualClock`).
    pub fn with_clock<C2: Clock + 'static>(self, clock: C2) -> RateLimitService<S, C2, T> {
        RateLimitService { store: self.store, clock: Arc::new(clock), sink: self.sink }
    }

    /// Attach a telemetry sink.
    pub fn with_sink<T2: TelemetrySink>(self, sink: T2) -> RateLimitService<S, C, T2> {
        RateLimitService { store: self.store, clock: self.clock, sink }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Make one decision. `Ok(Decision::Rejected)` for invalid requests; `Err` only
    /// for store or decode failures.
    pub async fn decide(&self, request: &ReduceRequest) -> Result<Decision, ServiceError> {
        let now = self.clock.now();
        let params = match BucketParams::from_request(request, now) {
            Ok(params) => params,
            Err(reason) => {
                tracing::debug!(key = %request.key, %reason, "rejected decision request");
                self.emit(DecisionEvent::Rejected { reason: reason.to_string() }).await;
                return Ok(Decision::Rejected(reason));
            }
        };
        let key = StorageKey::from(&params);

        match self.decide_in_transaction(&params, &key).await {
            Ok(decision) => {
                tracing::debug!(
                    key = %key,
                    max = params.capacity,
                    refill_amount = params.refill_amount,
                    refill_secs = params.refill_interval.as_secs(),
                    status = %decision.status(),
                    remaining = decision.remaining(),
                    "decision"
                );
                let event = match decision {
                    Decision::Allowed { remaining } => {
                        DecisionEvent::Allowed { key: key.into_string(), remaining }
                    }
                    _ => DecisionEvent::Denied { key: key.into_string() },
                };
                self.emit(event).await;
                Ok(decision)
            }
            Err(err) => {
                tracing::error!(key = %key, error = %err, "decision failed");
                self.emit(DecisionEvent::StoreFailure {
                    key: key.into_string(),
                    error: err.to_string(),
                })
                .await;
                Err(err)
            }
        }
    }

    /// Make one decision and map it to the wire response.
    pub async fn reduce(&self, request: &ReduceRequest) -> Result<ReduceResponse, ServiceError> {
        self.decide(request).await.map(ReduceResponse::from)
    }

    /// Read the committed state of the bucket `request` addresses, without changing it.
    ///
    /// Unlike [`decide`](Self::decide), an invalid request is an error here
    /// ([`ServiceError::Invalid`]). `None` means the bucket has never been touched.
    pub async fn inspect(
        &self,
        request: &ReduceRequest,
    ) -> Result<(StorageKey, Option<BucketState>), ServiceError> {
        let params =
            BucketParams::from_request(request, self.clock.now()).map_err(ServiceError::Invalid)?;
        let key = StorageKey::from(&params);
        let state = match self.store.read(key.as_str()).await? {
            Some(bytes) => Some(decode(&key, &bytes)?),
            None => None,
        };
        Ok((key, state))
    }

    async fn decide_in_transaction(
        &self,
        params: &BucketParams,
        key: &StorageKey,
    ) -> Result<Decision, ServiceError> {
        let mut tx = ScopedTransaction::new(self.store.begin().await?);
        let existing = match tx.get(key.as_str()).await? {
            Some(bytes) => Some(decode(key, &bytes)?),
            None => None,
        };

        let eval = strategies::decide(params, existing);
        tx.set(key.as_str(), eval.state.encode()).await?;
        tx.commit().await?;

        // Reported only once the key lock is released; a slow sink must not stall the bucket.
        if let Some(behind) = eval.clock_behind_nanos {
            let behind = regression_delta(behind);
            tracing::warn!(key = %key, ?behind, "clock is behind stored refill time; no tokens credited");
            self.emit(DecisionEvent::ClockRegression { key: key.to_string(), behind }).await;
        }
        Ok(eval.decision)
    }

    async fn emit(&self, event: DecisionEvent) {
        emit_best_effort(self.sink.clone(), event).await;
    }
}

fn decode(key: &StorageKey, bytes: &[u8]) -> Result<BucketState, ServiceError> {
    BucketState::decode(bytes)
        .map_err(|source| ServiceError::Corrupt { key: key.to_string(), source })
}

impl<S, C, T> tower_service::Service<ReduceRequest> for RateLimitService<S, C, T>
where
    S: Store,
    C: Clock + 'static,
    T: TelemetrySink + Sync,
    T::Future: Send + 'static,
{
    type Response = ReduceResponse;
    type Error = ServiceError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: ReduceRequest) -> Self::Future {
        let service = self.clone();
        Box::pin(async move { service.reduce(&request).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ValidationError;
    use crate::rate_limit::store::InMemoryStore;
    use crate::rate_limit::Status;
    use crate::telemetry::MemorySink;
    use chrono::{DateTime, TimeDelta, Utc};

    fn service() -> (RateLimitService<InMemoryStore, ManualClock, MemorySink>, ManualClock, MemorySink)
    {
        let clock = ManualClock::new(DateTime::from_timestamp(1_700_000_000, 0).unwrap());
        let sink = MemorySink::new();
        let svc = RateLimitService::new(InMemoryStore::new())
            .with_clock(clock.clone())
            .with_sink(sink.clone());
        (svc, clock, sink)
    }

    #[tokio::test]
    async fn first_request_is_allowed_and_persisted() {
        let (svc, _clock, sink) = service();
        let request = ReduceRequest::new("sms:543", 3, 1, 60);
        let resp = svc.reduce(&request).await.unwrap();
        assert_eq!(resp, ReduceResponse { status: Status::Ok, remaining: 2 });
        assert_eq!(svc.store().len(), 1);
        let bytes = svc.store().read("sms:543.max=3.rd=60.ra=1").await.unwrap().unwrap();
        assert_eq!(BucketState::decode(&bytes).unwrap().remaining, 2);
        assert_eq!(
            sink.events(),
            vec![DecisionEvent::Allowed { key: "sms:543.max=3.rd=60.ra=1".into(), remaining: 2 }]
        );
    }

    #[tokio::test]
    async fn rejected_request_never_touches_store() {
        let (svc, _clock, _sink) = service();
        let decision = svc.decide(&ReduceRequest::new("k", 1, 2, 60)).await.unwrap();
        assert_eq!(
            decision,
            Decision::Rejected(ValidationError::RefillExceedsCapacity { refill_amount: 2, capacity: 1 })
        );
        assert!(svc.store().is_empty());
    }

    #[tokio::test]
    async fn corrupt_record_is_an_error_not_a_fresh_bucket() {
        let (svc, _clock, sink) = service();
        svc.store().insert_raw("k.max=2.rd=1.ra=2", vec![1, 2, 3]);
        let err = svc.decide(&ReduceRequest::new("k", 2, 0, 1)).await.unwrap_err();
        assert!(err.is_corrupt());
        assert_eq!(svc.store().read("k.max=2.rd=1.ra=2").await.unwrap(), Some(vec![1, 2, 3]));
        assert!(matches!(sink.events()[0], DecisionEvent::StoreFailure { .. }));
    }

    #[tokio::test]
    async fn clock_regression_is_reported_and_tolerated() {
        let (svc, clock, sink) = service();
        let request = ReduceRequest::new("k", 2, 1, 10);
        svc.decide(&request).await.unwrap();
        clock.advance(TimeDelta::seconds(-5));
        let decision = svc.decide(&request).await.unwrap();
        assert_eq!(decision, Decision::Allowed { remaining: 0 });
        assert!(sink
            .events()
            .iter()
            .any(|e| matches!(e, DecisionEvent::ClockRegression { behind, .. } if behind.as_secs() == 5)));
    }

    #[tokio::test]
    async fn clock_regression_is_emitted_after_the_lock_is_released() {
        #[derive(Clone)]
        struct LockWatch {
            store: InMemoryStore,
            seen: Arc<std::sync::Mutex<Vec<usize>>>,
        }

        impl tower::Service<DecisionEvent> for LockWatch {
            type Response = ();
            type Error = std::convert::Infallible;
            type Future = std::future::Ready<Result<(), Self::Error>>;

            fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
                Poll::Ready(Ok(()))
            }

            fn call(&mut self, event: DecisionEvent) -> Self::Future {
                if let DecisionEvent::ClockRegression { .. } = event {
                    self.seen.lock().unwrap().push(self.store.locked_keys());
                }
                std::future::ready(Ok(()))
            }
        }

        impl TelemetrySink for LockWatch {
            type SinkError = std::convert::Infallible;
        }

        let clock = ManualClock::new(DateTime::from_timestamp(1_700_000_000, 0).unwrap());
        let store = InMemoryStore::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let svc = RateLimitService::new(store.clone())
            .with_clock(clock.clone())
            .with_sink(LockWatch { store, seen: seen.clone() });

        let request = ReduceRequest::new("k", 2, 1, 10);
        svc.decide(&request).await.unwrap();
        clock.advance(TimeDelta::seconds(-5));
        svc.decide(&request).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn inspect_reads_without_consuming() {
        let (svc, _clock, _sink) = service();
        let request = ReduceRequest::new("k", 5, 0, 10);
        let (key, state) = svc.inspect(&request).await.unwrap();
        assert_eq!(key.as_str(), "k.max=5.rd=10.ra=5");
        assert!(state.is_none());

        svc.decide(&request).await.unwrap();
        let (_, state) = svc.inspect(&request).await.unwrap();
        assert_eq!(state.unwrap().remaining, 4);
        let (_, state) = svc.inspect(&request).await.unwrap();
        assert_eq!(state.unwrap().remaining, 4);

        let err = svc.inspect(&ReduceRequest::new("", 5, 0, 10)).await.unwrap_err();
        assert_eq!(err.as_invalid(), Some(&ValidationError::EmptyKey));
    }

    #[tokio::test]
    async fn works_as_tower_service() {
        use tower::ServiceExt;
        let (svc, _clock, _sink) = service();
        let resp = svc.oneshot(ReduceRequest::new("k", 1, 0, 1)).await.unwrap();
        assert_eq!(resp.status, Status::Ok);
    }
}
