// Authentication types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How an account authenticates against the Kiro backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AuthMethod {
    /// Kiro desktop social login
    /// Refreshes via https://prod.{region}.auth.desktop.kiro.dev/refreshToken
    #[serde(rename = "social")]
    #[default]
    Social,

    /// AWS Builder ID / IDC device registration
    /// Refreshes via https://oidc.{region}.amazonaws.com/token
    #[serde(rename = "builder-id")]
    BuilderId,
}

/// Complete per-account credential set, as persisted in the account's
/// credentials file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub auth_method: AuthMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_arn: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
}

pub fn default_region() -> String {
    "us-east-1".to_string()
}

impl Credentials {
    /// True iff the token expires within `threshold_minutes` from now
    /// (or the expiry is unknown).
    pub fn is_expiry_near(&self, threshold_minutes: i64) -> bool {
        match self.expires_at {
            None => true,
            Some(exp) => exp <= Utc::now() + chrono::Duration::minutes(threshold_minutes),
        }
    }
}

/// Rotated token data extracted from a refresh response.
#[derive(Debug, Clone)]
pub struct TokenData {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub profile_arn: Option<String>,
}

/// Social refresh request body
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SocialRefreshRequest {
    pub refresh_token: String,
}

/// Builder-ID (IDC) refresh request body
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdcRefreshRequest {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    pub grant_type: String,
}

/// Refresh response, shared by both refresh endpoints
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
    pub profile_arn: Option<String>,
}

// ==================================================================================================
// Device-code flow wire types
// ==================================================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterClientRequest {
    pub client_name: String,
    pub client_type: String,
    pub scopes: Vec<String>,
    pub grant_types: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterClientResponse {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAuthorizationRequest {
    pub client_id: String,
    pub client_secret: String,
    pub start_url: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAuthorizationResponse {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri_complete: String,
    #[serde(default = "default_poll_interval")]
    pub interval: u64,
    pub expires_in: u64,
}

fn default_poll_interval() -> u64 {
    5
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceTokenRequest {
    pub client_id: String,
    pub client_secret: String,
    pub device_code: String,
    pub grant_type: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceTokenResponse {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
    pub error: Option<String>,
}
