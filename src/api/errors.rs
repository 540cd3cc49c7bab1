//! API Error Handling
//!
//! Structured error responses with proper HTTP status codes and request tracking.

use crate::errors::{AdmitError, Rejection, SpinwheelError, StorageError};
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
    /// NOT_FOUND, BAD_REQUEST, a rejection code such as BETTING_CLOSED, ...
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
    Rejected(Rejection),
    InternalError(String),
    ServiceUnavailable(String),
}

impl ApiError {
    pub fn not_found(request_id: String, message: String) -> Self {
        Self {
            kind: ApiErrorKind::NotFound(message),
            request_id,
        }
    }

    pub fn bad_request(request_id: String, message: String) -> Self {
        Self {
            kind: ApiErrorKind::BadRequest(message),
            request_id,
        }
    }

    pub fn rejected(request_id: String, rejection: Rejection) -> Self {
        Self {
            kind: ApiErrorKind::Rejected(rejection),
            request_id,
        }
    }

    pub fn internal_error(request_id: String, message: String) -> Self {
        Self {
            kind: ApiErrorKind::InternalError(message),
            request_id,
        }
    }

    pub fn service_unavailable(request_id: String, message: String) -> Self {
        Self {
            kind: ApiErrorKind::ServiceUnavailable(message),
            request_id,
        }
    }

    pub fn from_admit(request_id: String, err: AdmitError) -> Self {
        match err {
            AdmitError::Rejected(rejection) => Self::rejected(request_id, rejection),
            AdmitError::Internal(SpinwheelError::Engine(e)) => {
                Self::service_unavailable(request_id, e.to_string())
            }
            AdmitError::Internal(e) => Self::internal_error(request_id, e.to_string()),
        }
    }

    pub fn from_internal(request_id: String, err: SpinwheelError) -> Self {
        match err {
            SpinwheelError::Engine(e) => Self::service_unavailable(request_id, e.to_string()),
            SpinwheelError::Storage(e @ StorageError::InvalidCursor(_))
            | SpinwheelError::Storage(e @ StorageError::KeyTooLong(_)) => {
                Self::bad_request(request_id, e.to_string())
            }
            e => Self::internal_error(request_id, e.to_string()),
        }
    }
}

/// Status for a wager rejection: the request was well formed but conflicts
/// with round state (409) or with the betting rules (422)
fn rejection_status(rejection: Rejection) -> StatusCode {
    match rejection {
        Rejection::BettingClosed | Rejection::MaxBetsExceeded => StatusCode::CONFLICT,
        Rejection::InvalidBetKind
        | Rejection::AmountOutOfRange
        | Rejection::InsufficientBalance => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ApiErrorKind::NotFound(msg) => write!(f, "[{}] Not Found: {}", self.request_id, msg),
            ApiErrorKind::BadRequest(msg) => write!(f, "[{}] Bad Request: {}", self.request_id, msg),
            ApiErrorKind::Rejected(r) => write!(f, "[{}] Rejected: {}", self.request_id, r.code()),
            ApiErrorKind::InternalError(msg) => write!(f, "[{}] Internal Error: {}", self.request_id, msg),
            ApiErrorKind::ServiceUnavailable(msg) => {
                write!(f, "[{}] Service Unavailable: {}", self.request_id, msg)
            }
        }
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self.kind {
            ApiErrorKind::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            ApiErrorKind::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            ApiErrorKind::Rejected(r) => (rejection_status(*r), r.code(), r.to_string()),
            ApiErrorKind::InternalError(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg.clone())
            }
            ApiErrorKind::ServiceUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", msg.clone())
            }
        };

        let body = Json(ErrorResponse {
            request_id: self.request_id,
            error: ErrorBody {
                code: code.to_string(),
                message,
            },
        });

        (status, body).into_response()
    }
}
