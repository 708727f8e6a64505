//! API error envelope and status mapping.
//!
//! Success bodies are `{"success": true, "data": ...}`; failures are
//! `{"success": false, "error": {"code", "message", "details?"}}`.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use quay_auth::{AuthError, AuthErrorKind};
use quay_security::{SecurityError, SecurityErrorKind};
use quay_supervisor::{SupervisorError, SupervisorErrorKind};
use serde::Serialize;
use serde_json::{json, Value};

#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
    /// Populated for blocked/degraded responses.
    pub retry_after_secs: Option<i64>,
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: None,
            retry_after_secs: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_retry_after(mut self, secs: i64) -> Self {
        self.retry_after_secs = Some(secs);
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", message)
    }

    pub fn blocked(retry_after_secs: i64) -> Self {
        Self::new(
            StatusCode::FORBIDDEN,
            "blocked",
            "Too many failed attempts from this address",
        )
        .with_retry_after(retry_after_secs)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "conflict", message)
    }

    pub fn downstream(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "downstream", message)
    }

    pub fn internal() -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal",
            "Internal server error",
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut error = json!({
            "code": self.code,
            "message": self.message,
        });
        if let Some(details) = self.details {
            error["details"] = details;
        }
        if let Some(secs) = self.retry_after_secs {
            error["retryAfterSecs"] = json!(secs);
        }
        let body = Json(json!({ "success": false, "error": error }));
        let mut response = (self.status, body).into_response();
        if let Some(secs) = self.retry_after_secs {
            // i64::MAX marks a permanent block; clamp the header.
            let capped = secs.clamp(0, 86_400 * 365);
            if let Ok(value) = HeaderValue::from_str(&capped.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Success envelope.
pub fn ok<T: Serialize>(data: T) -> Json<Value> {
    Json(json!({ "success": true, "data": data }))
}

pub fn created<T: Serialize>(data: T) -> (StatusCode, Json<Value>) {
    (StatusCode::CREATED, ok(data))
}

pub fn accepted<T: Serialize>(data: T) -> (StatusCode, Json<Value>) {
    (StatusCode::ACCEPTED, ok(data))
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e.kind {
            // Authentication failures stay opaque towards the client.
            AuthErrorKind::Unauthorized => Self::unauthorized("Authentication failed"),
            AuthErrorKind::NotFound => Self::not_found(e.message),
            AuthErrorKind::Conflict => Self::conflict(e.message),
            AuthErrorKind::Validation => Self::bad_request(e.message),
            AuthErrorKind::Directory => Self::downstream("Directory service unavailable"),
            AuthErrorKind::Database | AuthErrorKind::Crypto => {
                log::error!("[gateway] internal auth error: {}", e);
                Self::internal()
            }
        }
    }
}

impl From<SecurityError> for ApiError {
    fn from(e: SecurityError) -> Self {
        match e.kind {
            SecurityErrorKind::NotFound => Self::not_found(e.message),
            SecurityErrorKind::Database => {
                log::error!("[gateway] internal security error: {}", e);
                Self::internal()
            }
        }
    }
}

impl From<SupervisorError> for ApiError {
    fn from(e: SupervisorError) -> Self {
        match e.kind {
            SupervisorErrorKind::Validation => Self::bad_request(e.message),
            SupervisorErrorKind::NotFound => Self::not_found(e.message),
            SupervisorErrorKind::Conflict | SupervisorErrorKind::NotRunning => {
                Self::conflict(e.message)
            }
            SupervisorErrorKind::Unsupported => Self::bad_request(e.message),
            SupervisorErrorKind::Timeout
            | SupervisorErrorKind::Io
            | SupervisorErrorKind::Protocol
            | SupervisorErrorKind::Downstream => {
                let mut out = Self::downstream(e.message);
                if let Some(detail) = e.detail {
                    out = out.with_details(json!({ "detail": detail }));
                }
                out
            }
        }
    }
}

impl From<quay_audit::AuditError> for ApiError {
    fn from(e: quay_audit::AuditError) -> Self {
        log::error!("[gateway] audit store error: {}", e);
        Self::internal()
    }
}
