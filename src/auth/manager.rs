// Per-account authentication manager
// Loads credentials, derives region endpoints, decides near-expiry, and runs
// the refresh flow (social vs builder-id), writing rotated tokens back

use chrono::{Duration, Utc};
use reqwest::Client;
use std::path::PathBuf;
use tokio::sync::RwLock;

use crate::error::{ApiError, Result};

use super::credentials;
use super::types::{
    AuthMethod, Credentials, IdcRefreshRequest, RefreshResponse, SocialRefreshRequest, TokenData,
};

/// Social refresh endpoint for a region
pub fn social_refresh_url(region: &str) -> String {
    format!("https://prod.{}.auth.desktop.kiro.dev/refreshToken", region)
}

/// IDC / Builder-ID token endpoint for a region
pub fn idc_token_url(region: &str) -> String {
    format!("https://oidc.{}.amazonaws.com/token", region)
}

/// CodeWhisperer generate endpoint for a region
pub fn generate_url(region: &str) -> String {
    format!(
        "https://codewhisperer.{}.amazonaws.com/generateAssistantResponse",
        region
    )
}

/// Usage-limits endpoint for a region
pub fn usage_url(region: &str) -> String {
    format!("https://q.{}.amazonaws.com/getUsageLimits", region)
}

/// Manages the token lifecycle for one account
pub struct AuthManager {
    credentials: RwLock<Credentials>,
    credentials_path: PathBuf,
    client: Client,
}

impl AuthManager {
    /// Load credentials from the account's file. If the file is absent and a
    /// Base64 blob was supplied at startup, decode and adopt it instead.
    pub fn new(credentials_path: PathBuf, base64_blob: Option<&str>) -> anyhow::Result<Self> {
        let creds = match credentials::load_from_file(&credentials_path) {
            Ok(creds) => creds,
            Err(load_err) => match base64_blob {
                Some(blob) => {
                    tracing::info!(
                        "Credentials file {} unavailable, adopting startup blob",
                        credentials_path.display()
                    );
                    let creds = credentials::load_from_base64(blob)?;
                    credentials::merge_save(&credentials_path, &creds)?;
                    creds
                }
                None => return Err(load_err),
            },
        };

        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        Ok(Self {
            credentials: RwLock::new(creds),
            credentials_path,
            client,
        })
    }

    /// Build from in-memory credentials, e.g. when the pool record carries
    /// tokens for an account whose file does not exist yet. The credentials
    /// are persisted so later refreshes merge into a real file.
    pub fn from_credentials(
        credentials_path: PathBuf,
        creds: Credentials,
    ) -> anyhow::Result<Self> {
        credentials::merge_save(&credentials_path, &creds)?;
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            credentials: RwLock::new(creds),
            credentials_path,
            client,
        })
    }

    #[cfg(any(test, feature = "test-utils"))]
    pub fn for_testing(creds: Credentials, credentials_path: PathBuf) -> Self {
        Self {
            credentials: RwLock::new(creds),
            credentials_path,
            client: Client::new(),
        }
    }

    pub async fn access_token(&self) -> Option<String> {
        self.credentials.read().await.access_token.clone()
    }

    pub async fn refresh_token(&self) -> Option<String> {
        self.credentials.read().await.refresh_token.clone()
    }

    pub async fn region(&self) -> String {
        self.credentials.read().await.region.clone()
    }

    pub async fn auth_method(&self) -> AuthMethod {
        self.credentials.read().await.auth_method
    }

    pub async fn profile_arn(&self) -> Option<String> {
        self.credentials.read().await.profile_arn.clone()
    }

    /// True iff the token expires within `threshold_minutes`.
    pub async fn is_expiry_near(&self, threshold_minutes: i64) -> bool {
        self.credentials.read().await.is_expiry_near(threshold_minutes)
    }

    /// Refresh only when expiry is near. Returns whether a refresh ran.
    pub async fn refresh_if_near(&self, threshold_minutes: i64) -> Result<bool> {
        if !self.is_expiry_near(threshold_minutes).await {
            return Ok(false);
        }
        self.refresh().await?;
        Ok(true)
    }

    /// Run the refresh flow for this account's auth method and persist the
    /// rotated fields into the credentials file.
    pub async fn refresh(&self) -> Result<String> {
        let mut creds = self.credentials.write().await;

        // The file may have been rotated by an external login since load
        if creds.refresh_token.is_none() {
            if let Ok(reloaded) = credentials::load_from_file(&self.credentials_path) {
                if reloaded.refresh_token.is_some() {
                    *creds = reloaded;
                }
            }
        }
        let refresh_token = creds
            .refresh_token
            .clone()
            .ok_or(ApiError::NoRefreshToken)?;

        let token_data = match creds.auth_method {
            AuthMethod::Social => {
                self.refresh_social(&creds.region, &refresh_token).await?
            }
            AuthMethod::BuilderId => {
                let client_id = creds.client_id.clone().ok_or_else(|| {
                    ApiError::RefreshRejected("builder-id account missing clientId".to_string())
                })?;
                let client_secret = creds.client_secret.clone().ok_or_else(|| {
                    ApiError::RefreshRejected("builder-id account missing clientSecret".to_string())
                })?;
                self.refresh_idc(&creds.region, &client_id, &client_secret, &refresh_token)
                    .await?
            }
        };

        creds.access_token = Some(token_data.access_token.clone());
        if let Some(rt) = token_data.refresh_token {
            if !rt.is_empty() {
                creds.refresh_token = Some(rt);
            }
        }
        if let Some(arn) = token_data.profile_arn {
            if !arn.is_empty() {
                creds.profile_arn = Some(arn);
            }
        }
        // Missing expiresIn leaves the previous expiry untouched
        if let Some(expires_at) = token_data.expires_at {
            creds.expires_at = Some(expires_at);
        }

        if let Err(e) = credentials::merge_save(&self.credentials_path, &creds) {
            tracing::warn!(
                "Failed to persist refreshed credentials to {}: {}",
                self.credentials_path.display(),
                e
            );
        }

        tracing::info!(
            "Token refreshed ({:?}), expires: {}",
            creds.auth_method,
            creds
                .expires_at
                .map(|e| e.to_rfc3339())
                .unwrap_or_else(|| "unknown".to_string())
        );

        Ok(token_data.access_token)
    }

    async fn refresh_social(&self, region: &str, refresh_token: &str) -> Result<TokenData> {
        let url = social_refresh_url(region);
        let request = SocialRefreshRequest {
            refresh_token: refresh_token.to_string(),
        };

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| ApiError::NetworkError(format!("social refresh: {}", e)))?;

        Self::parse_refresh_response(response).await
    }

    async fn refresh_idc(
        &self,
        region: &str,
        client_id: &str,
        client_secret: &str,
        refresh_token: &str,
    ) -> Result<TokenData> {
        let url = idc_token_url(region);
        let request = IdcRefreshRequest {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            refresh_token: refresh_token.to_string(),
            grant_type: "refresh_token".to_string(),
        };

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| ApiError::NetworkError(format!("IDC refresh: {}", e)))?;

        Self::parse_refresh_response(response).await
    }

    async fn parse_refresh_response(response: reqwest::Response) -> Result<TokenData> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::RefreshRejected(format!("{} - {}", status, body)));
        }

        let data: RefreshResponse = response
            .json()
            .await
            .map_err(|e| ApiError::RefreshRejected(format!("unparseable response: {}", e)))?;

        if data.access_token.is_empty() {
            return Err(ApiError::RefreshRejected(
                "response does not contain accessToken".to_string(),
            ));
        }

        Ok(TokenData {
            access_token: data.access_token,
            refresh_token: data.refresh_token,
            expires_at: data
                .expires_in
                .map(|s| Utc::now() + Duration::seconds(s as i64)),
            profile_arn: data.profile_arn,
        })
    }
}
