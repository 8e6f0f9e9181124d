//! HTTP error mapping
//!
//! Every handler error becomes `{"error", "code"}` with the matching status.
//! Queue errors also carry their wire `type` code; throttling adds a
//! `Retry-After` header.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::gateway::GatewayError;
use crate::pubsub::PubSubError;
use crate::queue::QueueError;

/// Error body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub error_type: Option<&'static str>,
}

/// Handler error
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
    retry_after_secs: Option<u64>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorResponse {
                error: message.into(),
                code: status.as_u16(),
                error_type: None,
            },
            retry_after_secs: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn from_code(code: u16, message: String) -> Self {
        Self::new(
            StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            message,
        )
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        let mut error = Self::from_code(e.status_code(), e.to_string());
        error.body.error_type = Some(e.code());
        error
    }
}

impl From<PubSubError> for ApiError {
    fn from(e: PubSubError) -> Self {
        Self::from_code(e.status_code(), e.to_string())
    }
}

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        let mut error = Self::from_code(e.status_code(), e.to_string());
        error.retry_after_secs = e.retry_after_secs();
        error
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.body)).into_response();
        if let Some(secs) = self.retry_after_secs {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

/// Result type for handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttling_sets_retry_after() {
        let response = ApiError::from(GatewayError::RateLimited { retry_after_ms: 1_500 }).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "2");
    }

    #[test]
    fn test_queue_error_keeps_wire_code() {
        let error = ApiError::from(QueueError::EmptyBatchRequest);
        assert_eq!(error.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error.body.error_type, Some("AWS.SimpleQueueService.EmptyBatchRequest"));
    }
}
