use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

use crate::clock::Clock;
use crate::error::QuotaError;
use crate::rate_limit::params::ReduceRequest;
use crate::rate_limit::service::RateLimitService;
use crate::rate_limit::store::Store;
use crate::rate_limit::Decision;
use crate::telemetry::TelemetrySink;

/// Fixed bucket limits applied by a [`QuotaLayer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaLimits {
    pub max_amount: u32,
    /// `0` means `max_amount`.
    pub refill_amount: u32,
    pub refill_duration_sec: u32,
}

/// A layer that charges one token per request against a [`RateLimitService`].
///
/// The bucket key is derived from each request by `key_fn`, so one layer can meter
/// many callers under the same limits.
pub struct QuotaLayer<S, C, T, F> {
    limiter: RateLimitService<S, C, T>,
    limits: QuotaLimits,
    key_fn: Arc<F>,
}

impl<S, C, T: Clone, F> Clone for QuotaLayer<S, C, T, F> {
    fn clone(&self) -> Self {
        Self { limiter: self.limiter.clone(), limits: self.limits, key_fn: self.key_fn.clone() }
    }
}

impl<S, C, T, F> QuotaLayer<S, C, T, F> {
    /// Create a new quota layer.
    pub fn new(limiter: RateLimitService<S, C, T>, limits: QuotaLimits, key_fn: F) -> Self {
        Self { limiter, limits, key_fn: Arc::new(key_fn) }
    }
}

impl<Inner, S, C, T: Clone, F> Layer<Inner> for QuotaLayer<S, C, T, F> {
    type Service = QuotaService<Inner, S, C, T, F>;

    fn layer(&self, service: Inner) -> Self::Service {
        QuotaService {
            inner: service,
            limiter: self.limiter.clone(),
            limits: self.limits,
            key_fn: self.key_fn.clone(),
        }
    }
}

/// Middleware service that enforces a quota before calling `inner`.
pub struct QuotaService<Inner, S, C, T, F> {
    inner: Inner,
    limiter: RateLimitService<S, C, T>,
    limits: QuotaLimits,
    key_fn: Arc<F>,
}

impl<Inner: Clone, S, C, T: Clone, F> Clone for QuotaService<Inner, S, C, T, F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: self.limiter.clone(),
            limits: self.limits,
            key_fn: self.key_fn.clone(),
        }
    }
}

impl<Inner, S, C, T, F, Req> Service<Req> for QuotaService<Inner, S, C, T, F>
where
    Inner: Service<Req> + Clone + Send + 'static,
    Inner::Future: Send + 'static,
    S: Store,
    C: Clock + 'static,
    T: TelemetrySink + Sync,
    T::Future: Send + 'static,
    F: Fn(&Req) -> String + Send + Sync + 'static,
    Req: Send + 'static,
{
    type Response = Inner::Response;
    type Error = QuotaError<Inner::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(QuotaError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let limiter = self.limiter.clone();
        // Take the service that was driven to readiness; leave a clone in its place.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let request = ReduceRequest::new(
            (self.key_fn)(&req),
            self.limits.max_amount,
            self.limits.refill_amount,
            self.limits.refill_duration_sec,
        );

        Box::pin(async move {
            match limiter.decide(&request).await {
                Ok(Decision::Allowed { .. }) => inner.call(req).await.map_err(QuotaError::Inner),
                Ok(Decision::Denied { .. }) => Err(QuotaError::Exhausted { key: request.key }),
                Ok(Decision::Rejected(reason)) => Err(QuotaError::Misconfigured(reason)),
                Err(e) => Err(QuotaError::Infrastructure(e)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::store::InMemoryStore;
    use std::convert::Infallible;
    use tower::{service_fn, ServiceBuilder, ServiceExt};

    fn limiter() -> RateLimitService<InMemoryStore> {
        RateLimitService::new(InMemoryStore::new())
    }

    #[tokio::test]
    async fn charges_per_extracted_key() {
        let layer = QuotaLayer::new(
            limiter(),
            QuotaLimits { max_amount: 1, refill_amount: 0, refill_duration_sec: 3600 },
            |req: &(&'static str, u32)| req.0.to_string(),
        );
        let svc = ServiceBuilder::new()
            .layer(layer)
            .service(service_fn(|req: (&'static str, u32)| async move { Ok::<_, Infallible>(req.1) }));

        assert_eq!(svc.clone().oneshot(("alice", 1)).await.unwrap(), 1);
        assert_eq!(svc.clone().oneshot(("bob", 2)).await.unwrap(), 2);
        let err = svc.clone().oneshot(("alice", 3)).await.unwrap_err();
        assert!(err.is_exhausted());
        assert!(err.to_string().contains("alice"));
    }

    #[tokio::test]
    async fn invalid_limits_are_reported_not_denied() {
        let layer = QuotaLayer::new(
            limiter(),
            QuotaLimits { max_amount: 0, refill_amount: 0, refill_duration_sec: 1 },
            |_: &()| "any".to_string(),
        );
        let svc = layer.layer(service_fn(|_: ()| async { Ok::<_, Infallible>(()) }));
        let err = svc.oneshot(()).await.unwrap_err();
        assert!(matches!(err, QuotaError::Misconfigured(_)));
    }
}
