//! Stable error taxonomy shared by every transport (socket frames, SSE, HTTP).
//!
//! `GatewayError` is the single type handlers and the conversation broker
//! return; its `code()` is what clients key their retry/UX logic off of, so
//! once a variant ships its wire string never changes.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum GatewayError {
    Unauthorized,
    ResumeFailed,
    Forbidden,
    InvalidRequest { message: String },
    NotFound,
    RateLimited { retry_after_s: u64 },
    UnsupportedVersion,
    ReplayWindowExceeded { earliest_seq: u64, latest_seq: u64 },
    Blocked,
    InternalError,
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Unauthorized => "unauthorized",
            GatewayError::ResumeFailed => "resume_failed",
            GatewayError::Forbidden => "forbidden",
            GatewayError::InvalidRequest { .. } => "invalid_request",
            GatewayError::NotFound => "not_found",
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::UnsupportedVersion => "unsupported_version",
            GatewayError::ReplayWindowExceeded { .. } => "replay_window_exceeded",
            GatewayError::Blocked => "blocked",
            GatewayError::InternalError => "internal_error",
        }
    }

    pub fn message(&self) -> String {
        match self {
            GatewayError::Unauthorized => "authentication required or invalid".to_string(),
            GatewayError::ResumeFailed => "resume token invalid or expired".to_string(),
            GatewayError::Forbidden => "not a member of this conversation".to_string(),
            GatewayError::InvalidRequest { message } => message.clone(),
            GatewayError::NotFound => "resource not found".to_string(),
            GatewayError::RateLimited { retry_after_s } => {
                format!("rate limit exceeded, retry after {retry_after_s}s")
            }
            GatewayError::UnsupportedVersion => "unsupported frame version".to_string(),
            GatewayError::ReplayWindowExceeded { .. } => {
                "requested replay start is older than the retained window".to_string()
            }
            GatewayError::Blocked => "recipient has blocked this sender".to_string(),
            GatewayError::InternalError => "internal error".to_string(),
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::ResumeFailed => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden | GatewayError::Blocked => StatusCode::FORBIDDEN,
            GatewayError::InvalidRequest { .. } | GatewayError::UnsupportedVersion => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::NotFound => StatusCode::NOT_FOUND,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::ReplayWindowExceeded { .. } => StatusCode::GONE,
            GatewayError::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Render as the body of an `error` frame per the wire protocol.
    pub fn to_frame_body(&self) -> serde_json::Value {
        let mut body = serde_json::json!({
            "code": self.code(),
            "message": self.message(),
        });
        match self {
            GatewayError::RateLimited { retry_after_s } => {
                body["retry_after_s"] = serde_json::json!(retry_after_s);
            }
            GatewayError::ReplayWindowExceeded {
                earliest_seq,
                latest_seq,
            } => {
                body["earliest_seq"] = serde_json::json!(earliest_seq);
                body["latest_seq"] = serde_json::json!(latest_seq);
            }
            _ => {}
        }
        body
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code(), self.message())
    }
}

impl std::error::Error for GatewayError {}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut response = (status, axum::Json(self.to_frame_body())).into_response();

        if matches!(self, GatewayError::Unauthorized | GatewayError::ResumeFailed) {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        if matches!(
            self,
            GatewayError::Unauthorized | GatewayError::ResumeFailed | GatewayError::Blocked
        ) {
            response
                .headers_mut()
                .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        }
        if let GatewayError::RateLimited { retry_after_s } = &self {
            if let Ok(value) = HeaderValue::from_str(&retry_after_s.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}

impl From<sqlx::Error> for GatewayError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!(error = %err, "storage error");
        GatewayError::InternalError
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!(error = %err, "storage error");
        GatewayError::InternalError
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_frame_carries_retry_after() {
        let err = GatewayError::RateLimited { retry_after_s: 7 };
        let body = err.to_frame_body();
        assert_eq!(body["retry_after_s"], 7);
        assert_eq!(body["code"], "rate_limited");
    }

    #[test]
    fn replay_window_exceeded_carries_bounds() {
        let err = GatewayError::ReplayWindowExceeded {
            earliest_seq: 42,
            latest_seq: 99,
        };
        let body = err.to_frame_body();
        assert_eq!(body["earliest_seq"], 42);
        assert_eq!(body["latest_seq"], 99);
    }
}
