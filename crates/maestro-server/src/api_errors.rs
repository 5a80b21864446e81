//! HTTP error mapping for control-plane handlers.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use maestro_runtime::RuntimeError;
use serde::Serialize;
use serde_json::Value;

#[derive(Clone, Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(ErrorState),
    Forbidden(ErrorState),
    NotFound(ErrorState),
    Conflict(ErrorState),
    /// Approval/quota admission denial; `code` carries the reason.
    Denied(&'static str, ErrorState),
    TooManyRequests(ErrorState),
    ServiceUnavailable(ErrorState),
    Internal(ErrorState),
}

#[derive(Clone, Debug)]
pub struct ErrorState {
    pub message: String,
    pub request_id: Option<String>,
    pub details: Option<Value>,
}

impl ErrorState {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            request_id: None,
            details: None,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
struct ErrorEnvelope {
    request_id: String,
    error: ErrorBody,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(ErrorState::new(message))
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(ErrorState::new(message))
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(ErrorState::new(message))
    }

    pub fn too_many_requests(message: impl Into<String>) -> Self {
        Self::TooManyRequests(ErrorState::new(message))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(ErrorState::new(message))
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        let request_id = Some(request_id.into());
        self.state_mut().request_id = request_id;
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.state_mut().details = Some(details);
        self
    }

    fn state_mut(&mut self) -> &mut ErrorState {
        match self {
            Self::BadRequest(s)
            | Self::Forbidden(s)
            | Self::NotFound(s)
            | Self::Conflict(s)
            | Self::Denied(_, s)
            | Self::TooManyRequests(s)
            | Self::ServiceUnavailable(s)
            | Self::Internal(s) => s,
        }
    }
}

impl From<RuntimeError> for ApiError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Validation(message) => Self::BadRequest(ErrorState::new(message)),
            RuntimeError::Conflict(message) => Self::Conflict(ErrorState::new(message)),
            RuntimeError::NotFound(message) => Self::NotFound(ErrorState::new(message)),
            RuntimeError::Denied { reason, message } => {
                Self::Denied(reason, ErrorState::new(message))
            }
            RuntimeError::Transient(message) => Self::ServiceUnavailable(ErrorState::new(message)),
            RuntimeError::Internal(message) => Self::Internal(ErrorState::new(message)),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, state) = match self {
            Self::BadRequest(s) => (StatusCode::BAD_REQUEST, "invalid_argument", s),
            Self::Forbidden(s) => (StatusCode::FORBIDDEN, "forbidden", s),
            Self::NotFound(s) => (StatusCode::NOT_FOUND, "not_found", s),
            Self::Conflict(s) => (StatusCode::CONFLICT, "conflict", s),
            Self::Denied(reason, s) => (StatusCode::CONFLICT, reason, s),
            Self::TooManyRequests(s) => (StatusCode::TOO_MANY_REQUESTS, "rate_limited", s),
            Self::ServiceUnavailable(s) => (StatusCode::SERVICE_UNAVAILABLE, "transient", s),
            Self::Internal(s) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", s),
        };
        let request_id = state
            .request_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let body = ErrorEnvelope {
            request_id,
            error: ErrorBody {
                code,
                message: state.message,
                details: state.details,
            },
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denial_maps_to_conflict_with_reason_code() {
        let err: ApiError =
            RuntimeError::denied("approval_required", "work item 3 is not approved").into();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn transient_maps_to_service_unavailable() {
        let err: ApiError = RuntimeError::Transient("database is locked".into()).into();
        assert_eq!(
            err.into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn request_id_is_preserved_in_the_envelope() {
        let err = ApiError::not_found("run 9 not found").with_request_id("req-42");
        match &err {
            ApiError::NotFound(state) => {
                assert_eq!(state.request_id.as_deref(), Some("req-42"))
            }
            _ => panic!("unexpected variant"),
        }
    }
}
