// HTTP surface: the /v1/messages pipeline, token counting, and health
// endpoints

use axum::{
    body::Body,
    extract::{Query, State},
    middleware::{self as axum_middleware},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::adapter::AdapterRegistry;
use crate::auth::device::DeviceFlowManager;
use crate::config::Config;
use crate::error::ApiError;
use crate::middleware;
use crate::models::claude::MessagesRequest;
use crate::pool::PoolManager;
use crate::prompt_log;
use crate::streaming::{sse_with_error_frames, stream_kiro_to_claude};
use crate::tokenizer::{count_request_tokens, CLAUDE_TOOL_OVERHEAD};

/// Bound on fallback re-selections per user request.
const FALLBACK_CHAIN_LIMIT: usize = 3;

/// Request body cap: 10 MiB.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: Arc<PoolManager>,
    pub registry: Arc<AdapterRegistry>,
    pub device_flows: Arc<DeviceFlowManager>,
}

/// Health routes (no authentication, for load balancers)
pub fn health_routes() -> Router {
    Router::new().route("/health", get(health_handler))
}

/// API routes (require the shared key)
pub fn api_routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/messages", post(messages_handler))
        .route("/count_tokens", post(count_tokens_handler))
        .route("/v1/messages/count_tokens", post(count_tokens_handler))
        .route("/provider_health", get(provider_health_handler))
        .route("/v1/usage", get(usage_handler))
        .route("/auth/device/start", post(device_start_handler))
        .route("/auth/device/cancel", post(device_cancel_handler))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ))
        .layer(axum::extract::DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

/// GET /health
async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "provider": "kiro",
    }))
}

/// GET /provider_health?unhealthRatioThreshold=<f>
async fn provider_health_handler(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    let threshold = params
        .get("unhealthRatioThreshold")
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(0.5);
    Json(state.pool.summary(threshold).await)
}

/// POST /count_tokens (and /v1/messages/count_tokens)
async fn count_tokens_handler(
    State(_state): State<AppState>,
    Json(request): Json<MessagesRequest>,
) -> Result<Json<Value>, ApiError> {
    let mut input_tokens = count_request_tokens(
        &request.messages,
        request.system.as_ref(),
        request.tools.as_ref(),
    );

    if let Some(tools) = &request.tools {
        if !tools.is_empty() && request.model.starts_with("claude") {
            input_tokens += CLAUDE_TOOL_OVERHEAD;
        }
    }

    Ok(Json(json!({ "input_tokens": input_tokens })))
}

/// GET /v1/usage?uuid=<account>
///
/// Usage limits as reported by the upstream, for one account or for every
/// enabled account when no uuid is given. Per-account failures are reported
/// inline so one bad account does not hide the rest.
async fn usage_handler(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    if let Some(uuid) = params.get("uuid") {
        let account = state
            .pool
            .get(uuid)
            .await
            .ok_or_else(|| ApiError::ValidationError(format!("unknown account: {}", uuid)))?;
        let adapter = state
            .registry
            .get_or_create(&account)
            .map_err(ApiError::Internal)?;
        let usage = adapter.get_usage().await?;
        return Ok(Json(json!({"uuid": account.uuid, "usage": usage})));
    }

    let mut entries = Vec::new();
    for account in state.pool.accounts().await {
        if account.is_disabled {
            continue;
        }
        let entry = match state.registry.get_or_create(&account) {
            Ok(adapter) => match adapter.get_usage().await {
                Ok(usage) => json!({"uuid": account.uuid, "usage": usage}),
                Err(e) => json!({"uuid": account.uuid, "error": e.to_string()}),
            },
            Err(e) => json!({"uuid": account.uuid, "error": e.to_string()}),
        };
        entries.push(entry);
    }
    Ok(Json(json!({"accounts": entries})))
}

/// POST /auth/device/start
///
/// Kicks off a device-code flow for a new Builder-ID account. The returned
/// verification URI is presented to the user; a background task polls for
/// approval and appends the account to the pool on success.
async fn device_start_handler(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let region = body
        .get("region")
        .and_then(|v| v.as_str())
        .unwrap_or("us-east-1")
        .to_string();
    let start_url = body
        .get("startUrl")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let name = body
        .get("name")
        .and_then(|v| v.as_str())
        .unwrap_or("builder-id")
        .to_string();
    let task_id = body
        .get("taskId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let pending = state
        .device_flows
        .start(&task_id, &region, start_url.as_deref())
        .await?;

    let response = json!({
        "taskId": pending.task_id,
        "userCode": pending.user_code,
        "verificationUriComplete": pending.verification_uri_complete,
    });

    let flows = state.device_flows.clone();
    let pool = state.pool.clone();
    tokio::spawn(async move {
        match flows.poll(pending, &pool, &name).await {
            Ok(account) => tracing::info!("Device flow added account {}", account.uuid),
            Err(e) => tracing::warn!("Device flow ended without an account: {}", e),
        }
    });

    Ok(Json(response))
}

/// POST /auth/device/cancel
async fn device_cancel_handler(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let task_id = body
        .get("taskId")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ApiError::ValidationError("taskId is required".to_string()))?;
    state.device_flows.cancel(task_id);
    Ok(Json(json!({"cancelled": task_id})))
}

fn validate(request: &MessagesRequest) -> Result<(), ApiError> {
    if request.model.trim().is_empty() {
        return Err(ApiError::ValidationError("model is required".to_string()));
    }
    if request.messages.is_empty() {
        return Err(ApiError::ValidationError(
            "messages cannot be empty".to_string(),
        ));
    }
    if request.max_tokens <= 0 {
        return Err(ApiError::ValidationError(
            "max_tokens must be positive".to_string(),
        ));
    }
    for message in &request.messages {
        if message.role != "user" && message.role != "assistant" {
            return Err(ApiError::ValidationError(format!(
                "unsupported role: {}",
                message.role
            )));
        }
    }
    Ok(())
}

/// POST /v1/messages
///
/// Pipeline: validate, select an account (with model affinity), overlay the
/// file-backed system prompt, build the envelope, dispatch, translate, and
/// mark the account's outcome. A failed account is excluded and selection
/// re-entered, up to the fallback chain bound.
async fn messages_handler(
    State(state): State<AppState>,
    Json(request): Json<MessagesRequest>,
) -> Result<Response, ApiError> {
    tracing::info!(
        "Request to /v1/messages: model={}, stream={}, messages={}",
        request.model,
        request.stream,
        request.messages.len()
    );
    validate(&request)?;

    let overlay = prompt_log::apply_system_overlay(&state.config, request.system.as_ref());
    prompt_log::mirror_input_system_prompt(overlay.file_text.as_deref());
    prompt_log::mirror_effective_system(overlay.effective.as_ref());
    prompt_log::log_outbound_prompt(&state.config, &request.model, &request.messages);

    let mut effective_request = request.clone();
    effective_request.system = overlay.effective;

    let input_tokens = count_request_tokens(
        &effective_request.messages,
        effective_request.system.as_ref(),
        effective_request.tools.as_ref(),
    );

    let mut exclude: HashSet<String> = HashSet::new();
    let mut last_error: Option<ApiError> = None;

    for attempt in 0..FALLBACK_CHAIN_LIMIT {
        // Re-selects after a failure skip usage accounting so LRU charges
        // once per user request
        let Some(account) = state
            .pool
            .select(Some(&request.model), attempt > 0, &exclude)
            .await
        else {
            break;
        };

        tracing::debug!(
            "Selected account {} (attempt {})",
            account.uuid,
            attempt + 1
        );

        let adapter = match state.registry.get_or_create(&account) {
            Ok(adapter) => adapter,
            Err(e) => {
                state
                    .pool
                    .mark_unhealthy(&account.uuid, &e.to_string())
                    .await;
                exclude.insert(account.uuid.clone());
                last_error = Some(ApiError::Internal(e));
                continue;
            }
        };

        let outcome = if effective_request.stream {
            dispatch_stream(&state, &account.uuid, &adapter, &effective_request, input_tokens).await
        } else {
            dispatch_unary(&state, &account.uuid, &adapter, &effective_request).await
        };

        match outcome {
            Ok(response) => return Ok(response),
            Err(e) if e.marks_unhealthy() => {
                state
                    .pool
                    .mark_unhealthy(&account.uuid, &e.to_string())
                    .await;
                exclude.insert(account.uuid.clone());
                last_error = Some(e);
            }
            // Caller mistakes surface immediately and spend no error budget
            Err(e) => return Err(e),
        }
    }

    Err(last_error.unwrap_or(ApiError::NoHealthyProviders))
}

async fn dispatch_unary(
    state: &AppState,
    account_uuid: &str,
    adapter: &Arc<crate::adapter::ServiceAdapter>,
    request: &MessagesRequest,
) -> Result<Response, ApiError> {
    let response = adapter.generate_content(request).await?;
    state.pool.mark_healthy(account_uuid).await;
    Ok(Json(response).into_response())
}

async fn dispatch_stream(
    state: &AppState,
    account_uuid: &str,
    adapter: &Arc<crate::adapter::ServiceAdapter>,
    request: &MessagesRequest,
    input_tokens: i32,
) -> Result<Response, ApiError> {
    let payload = adapter.build_payload(request).await?;
    let upstream = adapter.generate_content_stream(&payload).await?;

    // The upstream accepted the request: count this as a healthy use. A
    // client-side disconnect later must not be charged to the account.
    state.pool.mark_healthy(account_uuid).await;

    let claude_stream = stream_kiro_to_claude(upstream, &request.model, input_tokens);

    // Upstream failures mid-stream still count against the account
    let pool = state.pool.clone();
    let uuid = account_uuid.to_string();
    let marked = claude_stream.map(move |item| {
        if let Err(e) = &item {
            if e.marks_unhealthy() {
                let pool = pool.clone();
                let uuid = uuid.clone();
                let message = e.to_string();
                tokio::spawn(async move {
                    pool.mark_unhealthy(&uuid, &message).await;
                });
            }
        }
        item
    });

    let body = Body::from_stream(sse_with_error_frames(marked.boxed()));
    Response::builder()
        .status(200)
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .header("Connection", "keep-alive")
        .body(body)
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("Failed to build response: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterConfig;
    use crate::config::CliArgs;
    use crate::pool::PoolConfig;
    use axum::http::{Request as HttpRequest, StatusCode};
    use tower::util::ServiceExt;

    fn create_test_state(name: &str) -> AppState {
        std::env::set_var("REQUIRED_API_KEY", "test-key-123");
        let config = Config::load_with_args(CliArgs {
            host: None,
            port: None,
            config: None,
            log_level: None,
        })
        .unwrap();

        let pool_path = std::env::temp_dir()
            .join(format!("kiro-relay-routes-{}", std::process::id()))
            .join(format!("{}.json", name));
        std::fs::create_dir_all(pool_path.parent().unwrap()).unwrap();
        std::fs::remove_file(&pool_path).ok();
        let pool = PoolManager::load(pool_path, PoolConfig::default()).unwrap();

        AppState {
            config: Arc::new(config),
            pool,
            registry: Arc::new(AdapterRegistry::new(AdapterConfig::default())),
            device_flows: Arc::new(DeviceFlowManager::new(std::env::temp_dir())),
        }
    }

    fn messages_body() -> String {
        json!({
            "model": "claude-haiku-4-5",
            "messages": [{"role": "user", "content": "Hi"}],
            "max_tokens": 16
        })
        .to_string()
    }

    #[test]
    fn test_validate_rules() {
        let ok: MessagesRequest = serde_json::from_str(&messages_body()).unwrap();
        assert!(validate(&ok).is_ok());

        let mut bad = ok.clone();
        bad.model = "".to_string();
        assert!(validate(&bad).is_err());

        let mut bad = ok.clone();
        bad.messages.clear();
        assert!(validate(&bad).is_err());

        let mut bad = ok.clone();
        bad.messages[0].role = "system".to_string();
        assert!(validate(&bad).is_err());

        let mut bad = ok;
        bad.max_tokens = 0;
        assert!(validate(&bad).is_err());
    }

    #[tokio::test]
    async fn test_health_handler_shape() {
        let value = health_handler().await.0;
        assert_eq!(value["status"], "healthy");
        assert_eq!(value["provider"], "kiro");
        assert!(value["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_messages_without_accounts_is_503() {
        let state = create_test_state("no_accounts");
        let app = api_routes(state);

        let request = HttpRequest::builder()
            .method("POST")
            .uri("/v1/messages")
            .header("x-api-key", "test-key-123")
            .header("content-type", "application/json")
            .body(Body::from(messages_body()))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["error"]["type"], "server_error");
    }

    #[tokio::test]
    async fn test_auth_accepted_forms() {
        let state = create_test_state("auth_forms");

        let header_forms = [
            ("authorization", "Bearer test-key-123"),
            ("x-api-key", "test-key-123"),
            ("x-goog-api-key", "test-key-123"),
        ];
        for (name, value) in header_forms {
            let app = api_routes(state.clone());
            let request = HttpRequest::builder()
                .method("GET")
                .uri("/provider_health")
                .header(name, value)
                .body(Body::empty())
                .unwrap();
            let response = app.oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        // Query parameter form
        let app = api_routes(state.clone());
        let request = HttpRequest::builder()
            .method("GET")
            .uri("/provider_health?key=test-key-123")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_auth_rejected() {
        let state = create_test_state("auth_reject");

        let app = api_routes(state.clone());
        let request = HttpRequest::builder()
            .method("GET")
            .uri("/provider_health")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let app = api_routes(state);
        let request = HttpRequest::builder()
            .method("GET")
            .uri("/provider_health")
            .header("x-api-key", "wrong")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_count_tokens_endpoint() {
        let state = create_test_state("count_tokens");
        let app = api_routes(state);

        let body = json!({
            "model": "claude-haiku-4-5",
            "messages": [{"role": "user", "content": "What's the weather?"}],
            "tools": [{
                "name": "get_weather",
                "description": "Get weather",
                "input_schema": {"type": "object"}
            }],
            "max_tokens": 16
        });

        let request = HttpRequest::builder()
            .method("POST")
            .uri("/count_tokens")
            .header("x-api-key", "test-key-123")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        // Tool overhead puts the count well above the bare text estimate
        assert!(value["input_tokens"].as_i64().unwrap() > CLAUDE_TOOL_OVERHEAD as i64);
    }

    #[tokio::test]
    async fn test_provider_health_summary() {
        let state = create_test_state("summary_route");
        let mut account = crate::pool::Account::new("unused".to_string());
        account.uuid = "a".to_string();
        state.pool.add_account(account).await;

        let app = api_routes(state);
        let request = HttpRequest::builder()
            .method("GET")
            .uri("/provider_health?unhealthRatioThreshold=0.9&key=test-key-123")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["total"], 1);
        assert_eq!(value["summaryHealth"], true);
        assert_eq!(value["accounts"][0]["uuid"], "a");
    }

    #[tokio::test]
    async fn test_usage_unknown_account_rejected() {
        let state = create_test_state("usage_unknown");
        let app = api_routes(state);

        let request = HttpRequest::builder()
            .method("GET")
            .uri("/v1/usage?uuid=missing&key=test-key-123")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["error"]["type"], "invalid_request_error");
    }

    #[tokio::test]
    async fn test_usage_empty_pool_is_empty_list() {
        let state = create_test_state("usage_empty");
        let app = api_routes(state);

        let request = HttpRequest::builder()
            .method("GET")
            .uri("/v1/usage")
            .header("x-api-key", "test-key-123")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["accounts"], json!([]));
    }

    #[tokio::test]
    async fn test_invalid_body_rejected() {
        let state = create_test_state("invalid_body");
        let app = api_routes(state);

        let request = HttpRequest::builder()
            .method("POST")
            .uri("/v1/messages")
            .header("x-api-key", "test-key-123")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({
                    "model": "claude-haiku-4-5",
                    "messages": [],
                    "max_tokens": 16
                })
                .to_string(),
            ))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
