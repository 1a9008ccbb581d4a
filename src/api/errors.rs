//! API Error Handling
//!
//! Structured error responses with proper HTTP status codes and request tracking.

use crate::errors::{BetError, PaymentError, SettlementError, StoreError};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Top-level API error response with request tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub request_id: String,
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// NOT_FOUND, BAD_REQUEST, UNAUTHORIZED, CONFLICT, INTERNAL_ERROR, SERVICE_UNAVAILABLE
    pub code: String,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub request_id: String,
}

#[derive(Debug)]
pub enum ApiErrorKind {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Conflict(String),
    InternalError(String),
    ServiceUnavailable(String),
}

impl ApiError {
    pub fn not_found(request_id: String, message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::NotFound(message.into()),
            request_id,
        }
    }

    pub fn bad_request(request_id: String, message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::BadRequest(message.into()),
            request_id,
        }
    }

    pub fn unauthorized(request_id: String, message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::Unauthorized(message.into()),
            request_id,
        }
    }

    pub fn conflict(request_id: String, message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::Conflict(message.into()),
            request_id,
        }
    }

    pub fn internal_error(request_id: String, message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::InternalError(message.into()),
            request_id,
        }
    }

    pub fn service_unavailable(request_id: String, message: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::ServiceUnavailable(message.into()),
            request_id,
        }
    }

    pub fn from_store(request_id: String, err: StoreError) -> Self {
        Self::internal_error(request_id, err.to_string())
    }

    pub fn from_payment(request_id: String, err: PaymentError) -> Self {
        match err {
            PaymentError::InvalidNotification(msg) => Self::bad_request(request_id, msg),
            other => Self::service_unavailable(request_id, other.to_string()),
        }
    }

    pub fn from_bet(request_id: String, err: BetError) -> Self {
        Self::conflict(request_id, err.to_string())
    }

    pub fn from_settlement(request_id: String, err: SettlementError) -> Self {
        match err {
            SettlementError::NotHalted => Self::conflict(request_id, err.to_string()),
            other => Self::service_unavailable(request_id, other.to_string()),
        }
    }

    fn parts(&self) -> (StatusCode, &'static str, &str) {
        match &self.kind {
            ApiErrorKind::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiErrorKind::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiErrorKind::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg),
            ApiErrorKind::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
            ApiErrorKind::InternalError(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg)
            }
            ApiErrorKind::ServiceUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", msg)
            }
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (_, code, message) = self.parts();
        write!(f, "[{}] {}: {}", self.request_id, code, message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        let body = Json(ErrorResponse {
            request_id: self.request_id.clone(),
            error: ErrorBody {
                code: code.to_string(),
                message: message.to_string(),
            },
        });

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let err = ApiError::not_found("req-1".to_string(), "Round 9 not found");
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);

        let err = ApiError::from_payment(
            "req-2".to_string(),
            PaymentError::InvalidNotification("bad".to_string()),
        );
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);

        let err = ApiError::from_settlement("req-3".to_string(), SettlementError::NotHalted);
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_display_includes_request_id() {
        let err = ApiError::unauthorized("abc".to_string(), "missing key");
        assert_eq!(err.to_string(), "[abc] UNAUTHORIZED: missing key");
    }
}
