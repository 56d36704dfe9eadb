use axum::{
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Application-wide error types
///
/// Every rejection produced by a policy is one of these variants; the
/// variant carries everything the response rendering needs (status class,
/// machine-readable code, extra headers). `Cancelled` is control flow, not
/// a rejection: only the timeout policy may convert it, everything else
/// must let it propagate.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("rate limit exceeded for key '{key}'")]
    RateLimited {
        key: String,
        limit: u64,
        reset_at: u64,
        retry_after: u64,
    },

    #[error("circuit open for '{key}'")]
    CircuitOpen { key: String, retry_after: u64 },

    #[error("upstream did not respond within {timeout_ms}ms")]
    UpstreamTimeout { timeout_ms: u64, status: u16 },

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("upstream configuration error: {0}")]
    UpstreamConfig(String),

    #[error("no healthy upstream available: {0}")]
    ServiceUnavailable(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal gateway error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamTimeout { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::GATEWAY_TIMEOUT)
            }
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamConfig(_) => StatusCode::BAD_GATEWAY,
            GatewayError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Cancelled => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            GatewayError::RateLimited { .. } => "RATE_LIMITED",
            GatewayError::CircuitOpen { .. } => "CIRCUIT_OPEN",
            GatewayError::UpstreamTimeout { .. } => "UPSTREAM_TIMEOUT",
            GatewayError::Upstream(_) => "UPSTREAM_ERROR",
            GatewayError::UpstreamConfig(_) => "UPSTREAM_CONFIG_ERROR",
            GatewayError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            GatewayError::Cancelled => "REQUEST_CANCELLED",
            GatewayError::BadRequest(_) => "BAD_REQUEST",
            GatewayError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, GatewayError::Cancelled)
    }

    /// Extra headers the rejection carries onto the wire.
    pub fn response_headers(&self) -> Vec<(HeaderName, HeaderValue)> {
        let mut headers = Vec::new();
        match self {
            GatewayError::RateLimited {
                limit,
                reset_at,
                retry_after,
                ..
            } => {
                headers.push((
                    HeaderName::from_static("retry-after"),
                    HeaderValue::from(*retry_after),
                ));
                headers.push((
                    HeaderName::from_static("x-ratelimit-limit"),
                    HeaderValue::from(*limit),
                ));
                headers.push((
                    HeaderName::from_static("x-ratelimit-remaining"),
                    HeaderValue::from_static("0"),
                ));
                headers.push((
                    HeaderName::from_static("x-ratelimit-reset"),
                    HeaderValue::from(*reset_at),
                ));
            }
            GatewayError::CircuitOpen { retry_after, .. } => {
                headers.push((
                    HeaderName::from_static("retry-after"),
                    HeaderValue::from(*retry_after),
                ));
            }
            _ => {}
        }
        headers
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();

        // Internal details never reach the caller; the full message is
        // logged server-side and the body carries a fixed generic string.
        let message = match &self {
            GatewayError::Internal(detail) => {
                error!(detail = %detail, "internal gateway error");
                "internal gateway error".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
                "status": status.as_u16(),
            }
        }));

        let mut response = (status, body).into_response();
        for (name, value) in self.response_headers() {
            response.headers_mut().insert(name, value);
        }
        response
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
