//! API error types mapped to HTTP status codes.
//!
//! Every variant produces a JSON body `{"error": "message"}`. Rate-limit
//! decisions are never errors; they are `200` responses carrying a status.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use ratekeeper::ServiceError;
use serde_json::json;

/// Request failures, distinct from quota decisions.
///
/// - `BadRequest` → 400
/// - `Internal` → 500
/// - `ServiceUnavailable` → 503
/// - `Timeout` → 504
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    /// The store holds a record that cannot be decoded.
    #[error("{0}")]
    Internal(String),
    #[error("{0}")]
    ServiceUnavailable(String),
    #[error("request timed out after {0} ms")]
    Timeout(u64),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        if let Some(reason) = err.as_invalid() {
            ApiError::BadRequest(reason.to_string())
        } else if err.is_corrupt() {
            ApiError::Internal(err.to_string())
        } else {
            ApiError::ServiceUnavailable(err.to_string())
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = axum::Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ratekeeper::{DecodeError, StoreError, ValidationError};

    #[test]
    fn store_faults_map_to_unavailable() {
        let err: ApiError = ServiceError::Store(StoreError::Unavailable("down".into())).into();
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn corrupt_records_map_to_internal() {
        let err: ApiError = ServiceError::Corrupt {
            key: "k.max=1.rd=1.ra=1".into(),
            source: DecodeError::Length { expected: 28, actual: 3 },
        }
        .into();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.to_string().contains("k.max=1.rd=1.ra=1"));
    }

    #[test]
    fn invalid_requests_map_to_bad_request() {
        let err: ApiError = ServiceError::Invalid(ValidationError::ZeroCapacity).into();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.to_string(), "max_amount must be at least 1");
    }

    #[test]
    fn timeout_maps_to_gateway_timeout() {
        assert_eq!(ApiError::Timeout(50).status(), StatusCode::GATEWAY_TIMEOUT);
    }
}
