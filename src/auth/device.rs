// Device-code acquisition flow (Builder-ID)
//
// One-shot, user-initiated: register an OIDC client, start device
// authorization, then poll the token endpoint until the user approves,
// the code expires, or the poll is cancelled. Success persists a new
// credentials file and appends the account to the pool.

use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ApiError, Result};
use crate::pool::{Account, PoolManager};

use super::credentials;
use super::types::{
    AuthMethod, Credentials, DeviceAuthorizationRequest, DeviceAuthorizationResponse,
    DeviceTokenRequest, DeviceTokenResponse, RegisterClientRequest, RegisterClientResponse,
};

const CLIENT_NAME: &str = "kiro-relay";
const DEFAULT_START_URL: &str = "https://view.awsapps.com/start";
const CODEWHISPERER_SCOPES: &[&str] = &[
    "codewhisperer:completions",
    "codewhisperer:analysis",
    "codewhisperer:conversations",
];

/// Region-templated OIDC endpoints. Kept as a struct so tests can point the
/// flow at a local server.
#[derive(Debug, Clone)]
pub struct OidcEndpoints {
    pub register: String,
    pub device_authorization: String,
    pub token: String,
}

impl OidcEndpoints {
    pub fn for_region(region: &str) -> Self {
        let base = format!("https://oidc.{}.amazonaws.com", region);
        Self {
            register: format!("{}/client/register", base),
            device_authorization: format!("{}/device_authorization", base),
            token: format!("{}/token", base),
        }
    }
}

/// What one token poll told us.
#[derive(Debug, PartialEq)]
enum PollOutcome {
    Done,
    Pending,
    SlowDown,
    Failed(String),
}

fn interpret_token_response(response: &DeviceTokenResponse) -> PollOutcome {
    if response
        .access_token
        .as_deref()
        .is_some_and(|t| !t.is_empty())
    {
        return PollOutcome::Done;
    }
    match response.error.as_deref() {
        Some("authorization_pending") => PollOutcome::Pending,
        Some("slow_down") => PollOutcome::SlowDown,
        Some(other) => PollOutcome::Failed(other.to_string()),
        None => PollOutcome::Failed("token response carried neither token nor error".to_string()),
    }
}

/// A started device authorization, ready to be polled.
pub struct PendingAuthorization {
    pub task_id: String,
    pub user_code: String,
    pub verification_uri_complete: String,
    client_id: String,
    client_secret: String,
    device_code: String,
    interval_secs: u64,
    expires_in_secs: u64,
    region: String,
    endpoints: OidcEndpoints,
}

/// Runs device-code flows; poll tasks are keyed by task id so starting a
/// new flow for the same identity cancels the previous poller.
pub struct DeviceFlowManager {
    pollers: DashMap<String, Arc<AtomicBool>>,
    client: Client,
    credentials_dir: PathBuf,
}

impl DeviceFlowManager {
    pub fn new(credentials_dir: PathBuf) -> Self {
        Self {
            pollers: DashMap::new(),
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            credentials_dir,
        }
    }

    /// REGISTER then AUTHORIZE. Returns the verification URI to present to
    /// the user and the handle for polling.
    pub async fn start(
        &self,
        task_id: &str,
        region: &str,
        start_url: Option<&str>,
    ) -> Result<PendingAuthorization> {
        let endpoints = OidcEndpoints::for_region(region);
        self.start_with_endpoints(task_id, region, start_url, endpoints)
            .await
    }

    pub async fn start_with_endpoints(
        &self,
        task_id: &str,
        region: &str,
        start_url: Option<&str>,
        endpoints: OidcEndpoints,
    ) -> Result<PendingAuthorization> {
        let registration: RegisterClientResponse = self
            .post_json(
                &endpoints.register,
                &RegisterClientRequest {
                    client_name: CLIENT_NAME.to_string(),
                    client_type: "public".to_string(),
                    scopes: CODEWHISPERER_SCOPES.iter().map(|s| s.to_string()).collect(),
                    grant_types: vec![
                        "urn:ietf:params:oauth:grant-type:device_code".to_string(),
                        "refresh_token".to_string(),
                    ],
                },
            )
            .await?;

        let authorization: DeviceAuthorizationResponse = self
            .post_json(
                &endpoints.device_authorization,
                &DeviceAuthorizationRequest {
                    client_id: registration.client_id.clone(),
                    client_secret: registration.client_secret.clone(),
                    start_url: start_url.unwrap_or(DEFAULT_START_URL).to_string(),
                },
            )
            .await?;

        tracing::info!(
            "Device authorization started: code {} via {}",
            authorization.user_code,
            authorization.verification_uri_complete
        );

        Ok(PendingAuthorization {
            task_id: task_id.to_string(),
            user_code: authorization.user_code,
            verification_uri_complete: authorization.verification_uri_complete,
            client_id: registration.client_id,
            client_secret: registration.client_secret,
            device_code: authorization.device_code,
            interval_secs: authorization.interval,
            expires_in_secs: authorization.expires_in,
            region: region.to_string(),
            endpoints,
        })
    }

    /// POLL until DONE / FAILED / EXPIRE / cancelled. On success the new
    /// credentials file is written, the account appended to `pool`, and the
    /// account returned.
    pub async fn poll(
        &self,
        pending: PendingAuthorization,
        pool: &PoolManager,
        account_name: &str,
    ) -> Result<Account> {
        // A fresh poll for the same task id cancels the previous one
        let stop = Arc::new(AtomicBool::new(false));
        if let Some(previous) = self.pollers.insert(pending.task_id.clone(), stop.clone()) {
            previous.store(true, Ordering::Relaxed);
        }

        let deadline = Utc::now() + ChronoDuration::seconds(pending.expires_in_secs as i64);
        let mut interval = pending.interval_secs.max(1);

        let result = loop {
            if stop.load(Ordering::Relaxed) {
                break Err(ApiError::AuthError("device flow cancelled".to_string()));
            }
            if Utc::now() >= deadline {
                break Err(ApiError::AuthError("device code expired".to_string()));
            }

            let response: DeviceTokenResponse = match self
                .post_json(
                    &pending.endpoints.token,
                    &DeviceTokenRequest {
                        client_id: pending.client_id.clone(),
                        client_secret: pending.client_secret.clone(),
                        device_code: pending.device_code.clone(),
                        grant_type: "urn:ietf:params:oauth:grant-type:device_code".to_string(),
                    },
                )
                .await
            {
                Ok(response) => response,
                Err(e) => break Err(e),
            };

            match interpret_token_response(&response) {
                PollOutcome::Done => {
                    break self
                        .adopt_token(&pending, response, pool, account_name)
                        .await;
                }
                PollOutcome::Pending => {}
                PollOutcome::SlowDown => {
                    interval += 5;
                    tracing::debug!("Token endpoint asked to slow down; interval now {}s", interval);
                }
                PollOutcome::Failed(code) => {
                    break Err(ApiError::AuthError(format!("device flow failed: {}", code)));
                }
            }

            tokio::time::sleep(Duration::from_secs(interval)).await;
        };

        self.pollers.remove(&pending.task_id);
        result
    }

    /// Abort a running poll.
    pub fn cancel(&self, task_id: &str) {
        if let Some(stop) = self.pollers.get(task_id) {
            stop.store(true, Ordering::Relaxed);
        }
    }

    async fn adopt_token(
        &self,
        pending: &PendingAuthorization,
        response: DeviceTokenResponse,
        pool: &PoolManager,
        account_name: &str,
    ) -> Result<Account> {
        let creds = Credentials {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            expires_at: response
                .expires_in
                .map(|s| Utc::now() + ChronoDuration::seconds(s as i64)),
            auth_method: AuthMethod::BuilderId,
            client_id: Some(pending.client_id.clone()),
            client_secret: Some(pending.client_secret.clone()),
            profile_arn: None,
            region: pending.region.clone(),
        };

        let path = credentials_file_path(&self.credentials_dir, account_name);
        credentials::merge_save(&path, &creds)
            .map_err(|e| ApiError::Internal(anyhow::anyhow!("persisting credentials: {}", e)))?;

        let mut account = Account::new(path.to_string_lossy().to_string());
        account.auth_method = AuthMethod::BuilderId;
        account.region = pending.region.clone();
        account.client_id = creds.client_id.clone();
        account.client_secret = creds.client_secret.clone();
        account.access_token = creds.access_token.clone();
        account.refresh_token = creds.refresh_token.clone();
        account.expires_at = creds.expires_at;

        pool.add_account(account.clone()).await;
        tracing::info!(
            "Device flow complete: account {} persisted to {}",
            account.uuid,
            path.display()
        );

        Ok(account)
    }

    async fn post_json<B: serde::Serialize, T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<T> {
        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| ApiError::NetworkError(format!("{}: {}", url, e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ApiError::NetworkError(e.to_string()))?;

        // The token endpoint reports pending/slow_down as 4xx with an error
        // body; surface those bodies to the caller instead of failing
        if let Ok(parsed) = serde_json::from_str::<T>(&text) {
            return Ok(parsed);
        }
        if !status.is_success() {
            return Err(ApiError::AuthError(format!("{} - {}", status, text)));
        }
        Err(ApiError::Internal(anyhow::anyhow!(
            "unparseable response from {}: {}",
            url,
            &text[..text.len().min(200)]
        )))
    }
}

/// `<unix-ts>_<name>.json` under the provider credentials directory.
fn credentials_file_path(dir: &Path, name: &str) -> PathBuf {
    let sanitized: String = name
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    dir.join(format!("{}_{}.json", Utc::now().timestamp(), sanitized))
}
