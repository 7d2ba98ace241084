// Service adapter: one per account, wrapping its AuthManager and HTTP
// client. Handles lazy credential init, refresh-on-401, and backoff retries.

use dashmap::DashMap;
use reqwest::Client;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::manager::{generate_url, usage_url};
use crate::auth::types::Credentials;
use crate::auth::AuthManager;
use crate::converters::build_kiro_request;
use crate::error::{ApiError, ErrorKind, Result};
use crate::models::claude::{MessagesRequest, MessagesResponse};
use crate::models::kiro::KiroRequest;
use crate::pool::Account;
use crate::streaming::collect_claude_response;
use crate::tokenizer::count_request_tokens;

#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
        }
    }
}

/// Per-account upstream client.
pub struct ServiceAdapter {
    account_uuid: String,
    auth: AuthManager,
    client: Client,
    config: AdapterConfig,
}

impl ServiceAdapter {
    pub fn new(account: &Account, config: AdapterConfig) -> anyhow::Result<Self> {
        let path = PathBuf::from(&account.credentials_path);
        let auth = match AuthManager::new(path.clone(), None) {
            Ok(auth) => auth,
            Err(load_err) => {
                // The pool record itself may carry the tokens for accounts
                // created before their credentials file existed
                if account.refresh_token.is_some() || account.access_token.is_some() {
                    tracing::info!(
                        "Seeding credentials file {} from pool record",
                        path.display()
                    );
                    AuthManager::from_credentials(
                        path,
                        Credentials {
                            access_token: account.access_token.clone(),
                            refresh_token: account.refresh_token.clone(),
                            expires_at: account.expires_at,
                            auth_method: account.auth_method,
                            client_id: account.client_id.clone(),
                            client_secret: account.client_secret.clone(),
                            profile_arn: account.profile_arn.clone(),
                            region: account.region.clone(),
                        },
                    )?
                } else {
                    return Err(load_err);
                }
            }
        };

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(300))
            .build()?;

        Ok(Self {
            account_uuid: account.uuid.clone(),
            auth,
            client,
            config,
        })
    }

    pub fn account_uuid(&self) -> &str {
        &self.account_uuid
    }

    pub fn auth(&self) -> &AuthManager {
        &self.auth
    }

    /// First call on a cold adapter: make sure an access token exists,
    /// refreshing from the stored refresh token when possible.
    async fn ensure_ready(&self) -> Result<String> {
        if let Some(token) = self.auth.access_token().await {
            return Ok(token);
        }
        if self.auth.refresh_token().await.is_some() {
            return self.auth.refresh().await;
        }
        Err(ApiError::NotInitialized(format!(
            "account {} has no access or refresh token",
            self.account_uuid
        )))
    }

    /// POST the envelope to the generate endpoint, with the retry ladder:
    /// one forced refresh on 401, exponential backoff on 429/5xx and
    /// network failures.
    pub async fn post_generate(&self, payload: &KiroRequest) -> Result<reqwest::Response> {
        let mut token = self.ensure_ready().await?;
        let url = generate_url(&self.auth.region().await);

        let mut attempt: u32 = 0;
        let mut refreshed_on_auth = false;

        loop {
            let result = self
                .client
                .post(&url)
                .header("Authorization", format!("Bearer {}", token))
                .header("Content-Type", "application/json")
                .header("User-Agent", "KiroIDE")
                .json(payload)
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status().as_u16();
                    let kind = ErrorKind::from_status(status);

                    if status == 401 && !refreshed_on_auth {
                        tracing::warn!(
                            "Account {}: 401 from upstream, forcing token refresh",
                            self.account_uuid
                        );
                        refreshed_on_auth = true;
                        token = self.auth.refresh().await?;
                        continue;
                    }

                    if kind.is_retryable() && attempt < self.config.max_retries {
                        let delay = self.backoff_delay(attempt);
                        tracing::warn!(
                            "Account {}: upstream {} (attempt {}/{}), retrying in {}ms",
                            self.account_uuid,
                            status,
                            attempt + 1,
                            self.config.max_retries,
                            delay
                        );
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        attempt += 1;
                        continue;
                    }

                    let message = response.text().await.unwrap_or_default();
                    return Err(ApiError::UpstreamError { status, message });
                }
                Err(e) => {
                    if e.is_timeout() {
                        if attempt < self.config.max_retries {
                            attempt += 1;
                            continue;
                        }
                        return Err(ApiError::TimeoutError(e.to_string()));
                    }
                    if attempt < self.config.max_retries {
                        let delay = self.backoff_delay(attempt);
                        tracing::warn!(
                            "Account {}: request failed ({}), retrying in {}ms",
                            self.account_uuid,
                            e,
                            delay
                        );
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(ApiError::NetworkError(e.to_string()));
                }
            }
        }
    }

    /// POST an arbitrary JSON body to the generate endpoint. Used by the
    /// secondary health-probe payload shape.
    pub async fn post_raw_generate(&self, body: &Value) -> Result<()> {
        let token = self.ensure_ready().await?;
        let url = generate_url(&self.auth.region().await);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", token))
            .header("Content-Type", "application/json")
            .header("User-Agent", "KiroIDE")
            .json(body)
            .send()
            .await
            .map_err(|e| ApiError::NetworkError(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let message = response.text().await.unwrap_or_default();
            Err(ApiError::UpstreamError {
                status: status.as_u16(),
                message,
            })
        }
    }

    /// Unary generate: build the envelope, call upstream, collect the
    /// stream into one Messages response.
    pub async fn generate_content(&self, request: &MessagesRequest) -> Result<MessagesResponse> {
        let payload = self.build_payload(request).await?;
        let response = self.post_generate(&payload).await?;
        let input_tokens =
            count_request_tokens(&request.messages, request.system.as_ref(), request.tools.as_ref());
        collect_claude_response(response, &request.model, input_tokens).await
    }

    /// Streaming generate: the raw upstream response, ready for the SSE
    /// translation pipeline.
    pub async fn generate_content_stream(
        &self,
        payload: &KiroRequest,
    ) -> Result<reqwest::Response> {
        self.post_generate(payload).await
    }

    /// Build the upstream envelope for this account (profile ARN attaches
    /// for social-auth accounts).
    pub async fn build_payload(&self, request: &MessagesRequest) -> Result<KiroRequest> {
        let profile_arn = match self.auth.auth_method().await {
            crate::auth::AuthMethod::Social => self.auth.profile_arn().await,
            crate::auth::AuthMethod::BuilderId => None,
        };
        build_kiro_request(request, request.system.as_ref(), profile_arn)
    }

    /// Preemptive refresh, driven by the heartbeat.
    pub async fn refresh_if_near(&self, threshold_minutes: i64) -> Result<bool> {
        self.auth.refresh_if_near(threshold_minutes).await
    }

    /// Usage limits for the account.
    pub async fn get_usage(&self) -> Result<Value> {
        let token = self.ensure_ready().await?;
        let url = usage_url(&self.auth.region().await);

        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", token))
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| ApiError::NetworkError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ApiError::UpstreamError {
                status: status.as_u16(),
                message,
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ApiError::Internal(anyhow::anyhow!("usage response: {}", e)))?;
        Ok(serde_json::json!({
            "used": body.get("used").cloned().unwrap_or(Value::Null),
            "limit": body.get("limit").cloned().unwrap_or(Value::Null),
            "resetsAt": body.get("resetsAt").cloned().unwrap_or(Value::Null),
        }))
    }

    /// Local token estimate; treat as an upper bound.
    pub fn count_tokens(&self, request: &MessagesRequest) -> i32 {
        count_request_tokens(&request.messages, request.system.as_ref(), request.tools.as_ref())
    }

    fn backoff_delay(&self, attempt: u32) -> u64 {
        self.config.base_delay_ms * 2u64.pow(attempt)
    }
}

// ==================================================================================================
// Registry
// ==================================================================================================

/// Per-account adapter singletons, keyed by account uuid.
pub struct AdapterRegistry {
    adapters: DashMap<String, Arc<ServiceAdapter>>,
    config: AdapterConfig,
}

impl AdapterRegistry {
    pub fn new(config: AdapterConfig) -> Self {
        Self {
            adapters: DashMap::new(),
            config,
        }
    }

    pub fn get_or_create(&self, account: &Account) -> anyhow::Result<Arc<ServiceAdapter>> {
        if let Some(existing) = self.adapters.get(&account.uuid) {
            return Ok(existing.clone());
        }
        let adapter = Arc::new(ServiceAdapter::new(account, self.config.clone())?);
        self.adapters.insert(account.uuid.clone(), adapter.clone());
        Ok(adapter)
    }

    /// Drop the cached adapter for a deleted account.
    pub fn evict(&self, uuid: &str) {
        self.adapters.remove(uuid);
    }
}
