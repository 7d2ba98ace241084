// Shared-key authentication and CORS middleware

use axum::{body::Body, extract::State, http::Request, middleware::Next, response::Response};
use tower_http::cors::{Any, CorsLayer};

use crate::error::ApiError;
use crate::routes::AppState;

/// Gateway caller authentication.
///
/// The shared key is accepted via any of `Authorization: Bearer <key>`,
/// `x-api-key: <key>`, `x-goog-api-key: <key>`, or a `?key=<key>` query
/// parameter.
pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let expected = state.config.required_api_key.as_str();

    if let Some(value) = header_str(&request, "authorization") {
        if value == format!("Bearer {}", expected) {
            return Ok(next.run(request).await);
        }
    }
    for header in ["x-api-key", "x-goog-api-key"] {
        if header_str(&request, header) == Some(expected) {
            return Ok(next.run(request).await);
        }
    }
    if let Some(query) = request.uri().query() {
        if query.split('&').any(|pair| {
            pair.strip_prefix("key=")
                .is_some_and(|candidate| candidate == expected)
        }) {
            return Ok(next.run(request).await);
        }
    }

    tracing::warn!(
        "Rejected request with invalid or missing API key: {} {}",
        request.method(),
        request.uri().path()
    );
    Err(ApiError::AuthError(
        "Invalid or missing API key".to_string(),
    ))
}

fn header_str<'a>(request: &'a Request<Body>, name: &str) -> Option<&'a str> {
    request.headers().get(name).and_then(|v| v.to_str().ok())
}

/// CORS: allow all origins, methods, and headers.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}
