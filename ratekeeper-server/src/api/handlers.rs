use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::Json;
use ratekeeper::{LogSink, RateLimitService, ReduceRequest, ReduceResponse, Store, SystemClock};
use std::time::Duration;

use super::errors::ApiError;
use super::models::{BucketQuery, BucketView, HealthResponse};

/// The decision service as the server runs it.
pub type Limiter<S> = RateLimitService<S, SystemClock, LogSink>;

/// Shared handler state.
pub struct AppState<S> {
    pub limiter: Limiter<S>,
    pub request_timeout: Duration,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self { limiter: self.limiter.clone(), request_timeout: self.request_timeout }
    }
}

impl<S: Store> AppState<S> {
    pub fn new(store: S, request_timeout: Duration) -> Self {
        Self { limiter: RateLimitService::new(store).with_sink(LogSink), request_timeout }
    }
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// `POST /v1/reduce`. Validation failures are `200` with status `ERROR`.
pub async fn reduce<S: Store>(
    State(state): State<AppState<S>>,
    payload: Result<Json<ReduceRequest>, JsonRejection>,
) -> Result<Json<ReduceResponse>, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    // Dropping the decision future on timeout aborts its transaction.
    let response = tokio::time::timeout(state.request_timeout, state.limiter.reduce(&request))
        .await
        .map_err(|_| {
            tracing::warn!(key = %request.key, "decision timed out");
            ApiError::Timeout(state.request_timeout.as_millis() as u64)
        })??;
    Ok(Json(response))
}

/// `GET /v1/debug/bucket`. Read-only.
pub async fn debug_bucket<S: Store>(
    State(state): State<AppState<S>>,
    query: Result<Query<BucketQuery>, QueryRejection>,
) -> Result<Json<BucketView>, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let request = ReduceRequest::from(query);
    let (key, state) = state.limiter.inspect(&request).await?;
    Ok(Json(BucketView { storage_key: key.into_string(), state: state.map(Into::into) }))
}
