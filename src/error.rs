// Error handling module
// Defines error kinds and the Claude-shaped HTTP/SSE error surface

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Classified error kinds, derived from upstream HTTP status.
///
/// The wire name of each kind (`authentication_error`, `rate_limit_error`, …)
/// is what callers see in the Claude-shaped error body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Authentication,
    Permission,
    RateLimit,
    Server,
    Timeout,
    InvalidRequest,
    Network,
}

impl ErrorKind {
    /// Classify an upstream HTTP status code.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => Self::Authentication,
            403 => Self::Permission,
            429 => Self::RateLimit,
            400 => Self::InvalidRequest,
            504 => Self::Timeout,
            _ => Self::Server,
        }
    }

    /// Wire name used in the error payload.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authentication => "authentication_error",
            Self::Permission => "permission_error",
            Self::RateLimit => "rate_limit_error",
            Self::Server => "server_error",
            Self::Timeout => "timeout_error",
            Self::InvalidRequest => "invalid_request_error",
            Self::Network => "network_error",
        }
    }

    /// Status code to answer the gateway's own caller with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Authentication => StatusCode::UNAUTHORIZED,
            Self::Permission => StatusCode::FORBIDDEN,
            Self::RateLimit => StatusCode::TOO_MANY_REQUESTS,
            Self::Server => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::InvalidRequest => StatusCode::BAD_REQUEST,
            Self::Network => StatusCode::BAD_GATEWAY,
        }
    }

    /// Whether a request failing with this kind should be retried locally.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimit | Self::Server | Self::Timeout | Self::Network
        )
    }
}

/// API errors that can occur during request processing
#[derive(Error, Debug)]
pub enum ApiError {
    /// Gateway caller presented a missing or wrong shared key
    #[error("Authentication failed: {0}")]
    AuthError(String),

    /// Account has no refresh token to rotate with
    #[error("No refresh token available for account")]
    NoRefreshToken,

    /// Token endpoint rejected the refresh
    #[error("Token refresh rejected: {0}")]
    RefreshRejected(String),

    /// Account adapter was used before credentials were loaded
    #[error("Account not initialized: {0}")]
    NotInitialized(String),

    /// Error from the upstream Kiro API
    #[error("Kiro API error: {status} - {message}")]
    UpstreamError { status: u16, message: String },

    /// No healthy account remained after the fallback chain
    #[error("No healthy providers available")]
    NoHealthyProviders,

    /// Request validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Connect/TLS failure talking upstream
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Local or upstream deadline exceeded
    #[error("Timeout: {0}")]
    TimeoutError(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    /// The classified kind reported on the wire.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::AuthError(_)
            | ApiError::NoRefreshToken
            | ApiError::RefreshRejected(_)
            | ApiError::NotInitialized(_) => ErrorKind::Authentication,
            ApiError::UpstreamError { status, .. } => ErrorKind::from_status(*status),
            ApiError::NoHealthyProviders => ErrorKind::Server,
            ApiError::ValidationError(_) => ErrorKind::InvalidRequest,
            ApiError::NetworkError(_) => ErrorKind::Network,
            ApiError::TimeoutError(_) => ErrorKind::Timeout,
            ApiError::Internal(_) => ErrorKind::Server,
        }
    }

    /// Whether the owning account should be marked unhealthy for this error.
    /// Caller mistakes (400) are not the account's fault.
    pub fn marks_unhealthy(&self) -> bool {
        !matches!(
            self,
            ApiError::ValidationError(_) | ApiError::NoHealthyProviders
        ) && self.kind() != ErrorKind::InvalidRequest
    }

    /// Claude-shaped error body: `{"type":"error","error":{...}}`.
    pub fn to_wire_json(&self) -> serde_json::Value {
        let message = match self {
            ApiError::Internal(err) => {
                tracing::error!("Internal error: {:?}", err);
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        json!({
            "type": "error",
            "error": {
                "type": self.kind().as_str(),
                "message": message,
            }
        })
    }

    /// Single SSE frame carrying the error, for failures mid-stream.
    pub fn to_sse_frame(&self) -> String {
        format!(
            "event: error\ndata: {}\n\n",
            serde_json::to_string(&self.to_wire_json()).unwrap_or_else(|_| "{}".to_string())
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NoHealthyProviders => StatusCode::SERVICE_UNAVAILABLE,
            other => other.kind().status_code(),
        };
        let body = Json(self.to_wire_json());
        (status, body).into_response()
    }
}

/// Result type alias for API operations
pub type Result<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_status() {
        assert_eq!(ErrorKind::from_status(401), ErrorKind::Authentication);
        assert_eq!(ErrorKind::from_status(403), ErrorKind::Permission);
        assert_eq!(ErrorKind::from_status(429), ErrorKind::RateLimit);
        assert_eq!(ErrorKind::from_status(400), ErrorKind::InvalidRequest);
        assert_eq!(ErrorKind::from_status(504), ErrorKind::Timeout);
        assert_eq!(ErrorKind::from_status(500), ErrorKind::Server);
        assert_eq!(ErrorKind::from_status(502), ErrorKind::Server);
        assert_eq!(ErrorKind::from_status(503), ErrorKind::Server);
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::RateLimit.is_retryable());
        assert!(ErrorKind::Server.is_retryable());
        assert!(ErrorKind::Network.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(!ErrorKind::InvalidRequest.is_retryable());
        assert!(!ErrorKind::Permission.is_retryable());
        assert!(!ErrorKind::Authentication.is_retryable());
    }

    #[test]
    fn test_invalid_request_does_not_mark_unhealthy() {
        let err = ApiError::ValidationError("bad body".to_string());
        assert!(!err.marks_unhealthy());

        let err = ApiError::UpstreamError {
            status: 400,
            message: "Improperly formed request".to_string(),
        };
        assert!(!err.marks_unhealthy());

        let err = ApiError::UpstreamError {
            status: 500,
            message: "boom".to_string(),
        };
        assert!(err.marks_unhealthy());
    }

    #[test]
    fn test_wire_shape() {
        let err = ApiError::UpstreamError {
            status: 429,
            message: "Rate limit exceeded".to_string(),
        };
        let body = err.to_wire_json();
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "rate_limit_error");
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("Rate limit exceeded"));
    }

    #[test]
    fn test_sse_frame_shape() {
        let err = ApiError::TimeoutError("first token".to_string());
        let frame = err.to_sse_frame();
        assert!(frame.starts_with("event: error\ndata: "));
        assert!(frame.ends_with("\n\n"));
        assert!(frame.contains("timeout_error"));
    }

    #[tokio::test]
    async fn test_error_response_conversion() {
        let err = ApiError::AuthError("Invalid key".to_string());
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let err = ApiError::ValidationError("messages cannot be empty".to_string());
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let err = ApiError::NoHealthyProviders;
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let err = ApiError::UpstreamError {
            status: 429,
            message: "Rate limit".to_string(),
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
