// Provider pool: the ordered set of Kiro accounts with LRU selection,
// an error-budget health model, and debounced persistence

pub mod probe;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

use crate::auth::types::{default_region, AuthMethod};
use crate::auth::credentials::write_atomic;

pub const DEFAULT_CHECK_MODEL: &str = "claude-haiku-4-5";

// ==================================================================================================
// Account
// ==================================================================================================

/// One OAuth-authenticated Kiro identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub uuid: String,
    pub credentials_path: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub auth_method: AuthMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_arn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "HashSet::is_empty")]
    pub not_supported_models: HashSet<String>,
    #[serde(default)]
    pub check_health: bool,
    #[serde(default = "default_check_model")]
    pub check_model_name: String,

    // Counters
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default)]
    pub error_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_health_check_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_health_check_model: Option<String>,

    // Flags
    #[serde(default = "default_true")]
    pub is_healthy: bool,
    #[serde(default)]
    pub is_disabled: bool,
}

fn default_check_model() -> String {
    DEFAULT_CHECK_MODEL.to_string()
}

fn default_true() -> bool {
    true
}

impl Account {
    pub fn new(credentials_path: String) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            credentials_path,
            region: default_region(),
            auth_method: AuthMethod::default(),
            profile_arn: None,
            client_id: None,
            client_secret: None,
            access_token: None,
            refresh_token: None,
            expires_at: None,
            not_supported_models: HashSet::new(),
            check_health: false,
            check_model_name: default_check_model(),
            usage_count: 0,
            error_count: 0,
            last_used: None,
            last_error_time: None,
            last_error_message: None,
            last_health_check_time: None,
            last_health_check_model: None,
            is_healthy: true,
            is_disabled: false,
        }
    }

    /// Selectable for `requested_model`?
    fn is_candidate(&self, requested_model: Option<&str>, exclude: &HashSet<String>) -> bool {
        if !self.is_healthy || self.is_disabled || exclude.contains(&self.uuid) {
            return false;
        }
        match requested_model {
            Some(model) => !self.not_supported_models.contains(model),
            None => true,
        }
    }

    /// LRU sort key: never-used accounts sort first.
    fn lru_key(&self) -> (DateTime<Utc>, u64) {
        (
            self.last_used.unwrap_or(DateTime::<Utc>::MIN_UTC),
            self.usage_count,
        )
    }
}

// ==================================================================================================
// Pool file shape
// ==================================================================================================

/// The on-disk pool file is either a bare array of accounts or a legacy
/// object keyed by the provider type name. Whichever shape was read is
/// preserved on flush; new files are written as a bare array.
#[derive(Debug, Clone, PartialEq)]
enum PoolFileShape {
    Array,
    KeyedObject(String),
}

// ==================================================================================================
// PoolManager
// ==================================================================================================

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_error_count: u32,
    pub save_debounce_ms: u64,
    pub health_check_interval_secs: i64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_error_count: 3,
            save_debounce_ms: 1000,
            health_check_interval_secs: 600,
        }
    }
}

struct PoolState {
    accounts: Vec<Account>,
    shape: PoolFileShape,
}

pub struct PoolManager {
    state: Mutex<PoolState>,
    file_path: PathBuf,
    config: PoolConfig,
    save_notify: Notify,
}

/// Result of probing one account.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub success: bool,
    pub model_name: String,
    pub error_message: Option<String>,
}

impl PoolManager {
    /// Load the pool from its file; a missing file starts an empty pool.
    pub fn load(file_path: PathBuf, config: PoolConfig) -> anyhow::Result<Arc<Self>> {
        let (accounts, shape) = if file_path.exists() {
            let content = std::fs::read_to_string(&file_path)?;
            parse_pool_file(&content)?
        } else {
            (Vec::new(), PoolFileShape::Array)
        };

        tracing::info!(
            "Loaded provider pool: {} account(s) from {}",
            accounts.len(),
            file_path.display()
        );

        Ok(Arc::new(Self {
            state: Mutex::new(PoolState { accounts, shape }),
            file_path,
            config,
            save_notify: Notify::new(),
        }))
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Spawn the debounce-save task: every mutation wakes it, it sleeps the
    /// debounce window (coalescing further wakes), then flushes once.
    pub fn spawn_save_task(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                pool.save_notify.notified().await;
                tokio::time::sleep(std::time::Duration::from_millis(
                    pool.config.save_debounce_ms,
                ))
                .await;
                if let Err(e) = pool.flush().await {
                    tracing::warn!("Pool persistence flush failed: {}", e);
                }
            }
        });
    }

    fn schedule_save(&self) {
        self.save_notify.notify_one();
    }

    /// Select the least-recently-used healthy account for `requested_model`.
    ///
    /// Selection advances `last_used` and, unless `skip_usage_count`,
    /// increments `usage_count` (fallback re-selects pass true so LRU
    /// accounting charges once per user request).
    pub async fn select(
        &self,
        requested_model: Option<&str>,
        skip_usage_count: bool,
        exclude: &HashSet<String>,
    ) -> Option<Account> {
        let mut state = self.state.lock().await;

        let chosen = state
            .accounts
            .iter_mut()
            .filter(|a| a.is_candidate(requested_model, exclude))
            .min_by_key(|a| a.lru_key())?;

        chosen.last_used = Some(Utc::now());
        if !skip_usage_count {
            chosen.usage_count += 1;
        }
        let selected = chosen.clone();
        drop(state);

        self.schedule_save();
        Some(selected)
    }

    /// Record a successful request against `uuid`: restore health and clear
    /// the error state. Usage was already charged at selection time.
    pub async fn mark_healthy(&self, uuid: &str) {
        let mut state = self.state.lock().await;
        if let Some(account) = state.accounts.iter_mut().find(|a| a.uuid == uuid) {
            account.is_healthy = true;
            account.error_count = 0;
            account.last_error_time = None;
            account.last_error_message = None;
            account.last_used = Some(Utc::now());
        }
        drop(state);
        self.schedule_save();
    }

    /// Record a successful probe: like `mark_healthy` but resets
    /// `usage_count` and stamps the health-check fields.
    pub async fn mark_probe_healthy(&self, uuid: &str, model: &str) {
        let mut state = self.state.lock().await;
        if let Some(account) = state.accounts.iter_mut().find(|a| a.uuid == uuid) {
            account.is_healthy = true;
            account.error_count = 0;
            account.last_error_time = None;
            account.last_error_message = None;
            account.usage_count = 0;
            account.last_health_check_time = Some(Utc::now());
            account.last_health_check_model = Some(model.to_string());
        }
        drop(state);
        self.schedule_save();
    }

    /// Record a failure: spend error budget, bump `last_used` so LRU does
    /// not immediately re-select the same failing account, and trip
    /// `is_healthy` once the budget is exhausted.
    pub async fn mark_unhealthy(&self, uuid: &str, message: &str) {
        let mut state = self.state.lock().await;
        if let Some(account) = state.accounts.iter_mut().find(|a| a.uuid == uuid) {
            account.error_count += 1;
            account.last_error_time = Some(Utc::now());
            account.last_error_message = Some(message.to_string());
            account.last_used = Some(Utc::now());
            if account.error_count >= self.config.max_error_count {
                if account.is_healthy {
                    tracing::warn!(
                        "Account {} tripped error budget ({}/{}): {}",
                        account.uuid,
                        account.error_count,
                        self.config.max_error_count,
                        message
                    );
                }
                account.is_healthy = false;
            }
        }
        drop(state);
        self.schedule_save();
    }

    /// Explicitly clear the error state of one account.
    pub async fn reset(&self, uuid: &str) -> bool {
        let mut state = self.state.lock().await;
        let found = match state.accounts.iter_mut().find(|a| a.uuid == uuid) {
            Some(account) => {
                account.is_healthy = true;
                account.error_count = 0;
                account.last_error_time = None;
                account.last_error_message = None;
                true
            }
            None => false,
        };
        drop(state);
        if found {
            self.schedule_save();
        }
        found
    }

    /// Append an account (device-code flow, UI create).
    pub async fn add_account(&self, account: Account) {
        let mut state = self.state.lock().await;
        state.accounts.push(account);
        drop(state);
        self.schedule_save();
    }

    pub async fn get(&self, uuid: &str) -> Option<Account> {
        let state = self.state.lock().await;
        state.accounts.iter().find(|a| a.uuid == uuid).cloned()
    }

    pub async fn accounts(&self) -> Vec<Account> {
        self.state.lock().await.accounts.clone()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.accounts.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.accounts.is_empty()
    }

    /// Accounts due for a periodic probe: `check_health` on, not disabled,
    /// and no error newer than the probe interval. Force-checks take all
    /// probe-enabled accounts regardless of the budget.
    pub async fn probe_candidates(&self, force: bool) -> Vec<Account> {
        let state = self.state.lock().await;
        let cutoff =
            Utc::now() - chrono::Duration::seconds(self.config.health_check_interval_secs);
        state
            .accounts
            .iter()
            .filter(|a| a.check_health && !a.is_disabled)
            .filter(|a| force || a.last_error_time.map_or(true, |t| t < cutoff))
            .cloned()
            .collect()
    }

    /// Apply a probe outcome.
    pub async fn apply_probe(&self, uuid: &str, result: &ProbeResult) {
        if result.success {
            self.mark_probe_healthy(uuid, &result.model_name).await;
        } else {
            self.mark_unhealthy(
                uuid,
                result
                    .error_message
                    .as_deref()
                    .unwrap_or("health check failed"),
            )
            .await;
        }
    }

    /// Pool summary for the provider-health endpoint. `summary_health` is
    /// true while the unhealthy share of enabled accounts stays below the
    /// given ratio threshold.
    pub async fn summary(&self, unhealthy_ratio_threshold: f64) -> serde_json::Value {
        let state = self.state.lock().await;
        let enabled: Vec<&Account> =
            state.accounts.iter().filter(|a| !a.is_disabled).collect();
        let unhealthy = enabled.iter().filter(|a| !a.is_healthy).count();
        let ratio = if enabled.is_empty() {
            1.0
        } else {
            unhealthy as f64 / enabled.len() as f64
        };

        serde_json::json!({
            "total": state.accounts.len(),
            "enabled": enabled.len(),
            "unhealthy": unhealthy,
            "unhealthyRatio": ratio,
            "summaryHealth": ratio < unhealthy_ratio_threshold,
            "accounts": state.accounts.iter().map(|a| serde_json::json!({
                "uuid": a.uuid,
                "isHealthy": a.is_healthy,
                "isDisabled": a.is_disabled,
                "usageCount": a.usage_count,
                "errorCount": a.error_count,
                "lastUsed": a.last_used,
                "lastErrorMessage": a.last_error_message,
                "lastHealthCheckTime": a.last_health_check_time,
            })).collect::<Vec<_>>(),
        })
    }

    /// Write the pool to disk, preserving the shape the file was read with.
    /// A flush is the only writer of the pool file.
    pub async fn flush(&self) -> anyhow::Result<()> {
        let (accounts, shape) = {
            let state = self.state.lock().await;
            (state.accounts.clone(), state.shape.clone())
        };

        let value = match shape {
            PoolFileShape::Array => serde_json::to_value(&accounts)?,
            PoolFileShape::KeyedObject(key) => {
                // Re-read to keep sibling keys a legacy file may carry
                let mut data: serde_json::Value = if self.file_path.exists() {
                    std::fs::read_to_string(&self.file_path)
                        .ok()
                        .and_then(|s| serde_json::from_str(&s).ok())
                        .unwrap_or_else(|| serde_json::json!({}))
                } else {
                    serde_json::json!({})
                };
                if !data.is_object() {
                    data = serde_json::json!({});
                }
                data[&key] = serde_json::to_value(&accounts)?;
                data
            }
        };

        write_atomic(&self.file_path, &serde_json::to_string_pretty(&value)?)?;
        tracing::debug!(
            "Flushed pool ({} accounts) to {}",
            accounts.len(),
            self.file_path.display()
        );
        Ok(())
    }
}

fn parse_pool_file(content: &str) -> anyhow::Result<(Vec<Account>, PoolFileShape)> {
    let value: serde_json::Value = serde_json::from_str(content)?;
    match value {
        serde_json::Value::Array(_) => {
            let accounts: Vec<Account> = serde_json::from_value(value)?;
            Ok((accounts, PoolFileShape::Array))
        }
        serde_json::Value::Object(ref map) => {
            let key = map
                .iter()
                .find(|(_, v)| v.is_array())
                .map(|(k, _)| k.clone())
                .ok_or_else(|| anyhow::anyhow!("pool object holds no account array"))?;
            let accounts: Vec<Account> = serde_json::from_value(map[&key].clone())?;
            Ok((accounts, PoolFileShape::KeyedObject(key)))
        }
        _ => anyhow::bail!("pool file must be an array or an object"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_pool_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("kiro-relay-pool-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    async fn pool_with_accounts(name: &str, accounts: Vec<Account>) -> Arc<PoolManager> {
        let path = temp_pool_path(name);
        std::fs::remove_file(&path).ok();
        let pool = PoolManager::load(path, PoolConfig::default()).unwrap();
        for account in accounts {
            pool.add_account(account).await;
        }
        pool
    }

    fn account(name: &str) -> Account {
        let mut a = Account::new(format!("/tmp/{}.json", name));
        a.uuid = name.to_string();
        a
    }

    #[tokio::test]
    async fn test_select_prefers_never_used() {
        let mut a = account("a");
        a.last_used = None;
        let mut b = account("b");
        b.last_used = Some(Utc::now());
        b.usage_count = 5;

        let pool = pool_with_accounts("lru_never_used.json", vec![b, a]).await;
        let chosen = pool.select(None, false, &HashSet::new()).await.unwrap();
        assert_eq!(chosen.uuid, "a");
        assert_eq!(chosen.usage_count, 1);
        assert!(chosen.last_used.is_some());
    }

    #[tokio::test]
    async fn test_lru_fairness_over_many_requests() {
        let pool = pool_with_accounts(
            "lru_fair.json",
            vec![account("a"), account("b"), account("c")],
        )
        .await;

        for _ in 0..30 {
            let chosen = pool.select(None, false, &HashSet::new()).await.unwrap();
            pool.mark_healthy(&chosen.uuid).await;
        }

        let counts: Vec<u64> = pool.accounts().await.iter().map(|a| a.usage_count).collect();
        let min = *counts.iter().min().unwrap();
        let max = *counts.iter().max().unwrap();
        assert!(max - min <= 1, "usage counts diverged: {:?}", counts);
    }

    #[tokio::test]
    async fn test_select_filters_unsupported_model() {
        let mut a = account("a");
        a.not_supported_models.insert("claude-opus-4".to_string());
        let b = account("b");

        let pool = pool_with_accounts("model_filter.json", vec![a, b]).await;
        for _ in 0..5 {
            let chosen = pool
                .select(Some("claude-opus-4"), false, &HashSet::new())
                .await
                .unwrap();
            assert_eq!(chosen.uuid, "b");
        }
        // Other models still see account a
        let chosen = pool
            .select(Some("claude-haiku-4-5"), false, &HashSet::new())
            .await
            .unwrap();
        assert_eq!(chosen.uuid, "a");
    }

    #[tokio::test]
    async fn test_select_skips_unhealthy_and_disabled() {
        let mut a = account("a");
        a.is_healthy = false;
        let mut b = account("b");
        b.is_disabled = true;
        let c = account("c");

        let pool = pool_with_accounts("skip_unhealthy.json", vec![a, b, c]).await;
        let chosen = pool.select(None, false, &HashSet::new()).await.unwrap();
        assert_eq!(chosen.uuid, "c");
    }

    #[tokio::test]
    async fn test_select_exclude_set() {
        let pool = pool_with_accounts("exclude.json", vec![account("a"), account("b")]).await;
        let mut exclude = HashSet::new();
        exclude.insert("a".to_string());
        let chosen = pool.select(None, true, &exclude).await.unwrap();
        assert_eq!(chosen.uuid, "b");
        // skip_usage_count leaves the counter untouched
        assert_eq!(chosen.usage_count, 0);
    }

    #[tokio::test]
    async fn test_select_empty_when_all_excluded() {
        let pool = pool_with_accounts("all_excluded.json", vec![account("a")]).await;
        let mut exclude = HashSet::new();
        exclude.insert("a".to_string());
        assert!(pool.select(None, false, &exclude).await.is_none());
    }

    #[tokio::test]
    async fn test_error_budget_trips_health() {
        let pool = pool_with_accounts("budget.json", vec![account("a")]).await;

        pool.mark_unhealthy("a", "500").await;
        pool.mark_unhealthy("a", "500").await;
        assert!(pool.get("a").await.unwrap().is_healthy);

        pool.mark_unhealthy("a", "500").await;
        let a = pool.get("a").await.unwrap();
        assert!(!a.is_healthy);
        assert_eq!(a.error_count, 3);
        assert_eq!(a.last_error_message.as_deref(), Some("500"));
    }

    #[tokio::test]
    async fn test_mark_healthy_restores_and_is_idempotent() {
        let pool = pool_with_accounts("restore.json", vec![account("a")]).await;

        for _ in 0..4 {
            pool.mark_unhealthy("a", "boom").await;
        }
        assert!(!pool.get("a").await.unwrap().is_healthy);

        pool.mark_healthy("a").await;
        let a = pool.get("a").await.unwrap();
        assert!(a.is_healthy);
        assert_eq!(a.error_count, 0);
        assert!(a.last_error_time.is_none());
        assert!(a.last_error_message.is_none());

        // markHealthy twice equals markHealthy once
        pool.mark_healthy("a").await;
        let again = pool.get("a").await.unwrap();
        assert!(again.is_healthy);
        assert_eq!(again.error_count, 0);
    }

    #[tokio::test]
    async fn test_reset_clears_error_state() {
        let pool = pool_with_accounts("reset.json", vec![account("a")]).await;

        for _ in 0..5 {
            pool.mark_unhealthy("a", "boom").await;
        }
        assert!(!pool.get("a").await.unwrap().is_healthy);

        assert!(pool.reset("a").await);
        let a = pool.get("a").await.unwrap();
        assert!(a.is_healthy);
        assert_eq!(a.error_count, 0);

        assert!(!pool.reset("missing").await);
    }

    #[tokio::test]
    async fn test_probe_success_resets_usage() {
        let pool = pool_with_accounts("probe_reset.json", vec![account("a")]).await;
        for _ in 0..3 {
            pool.select(None, false, &HashSet::new()).await;
        }
        assert_eq!(pool.get("a").await.unwrap().usage_count, 3);

        pool.mark_probe_healthy("a", "claude-haiku-4-5").await;
        let a = pool.get("a").await.unwrap();
        assert_eq!(a.usage_count, 0);
        assert_eq!(a.last_health_check_model.as_deref(), Some("claude-haiku-4-5"));
        assert!(a.last_health_check_time.is_some());
    }

    #[tokio::test]
    async fn test_failed_account_not_immediately_reselected() {
        let pool = pool_with_accounts("failover.json", vec![account("a"), account("b")]).await;

        let first = pool.select(None, false, &HashSet::new()).await.unwrap();
        pool.mark_unhealthy(&first.uuid, "timeout").await;

        // The failure bumped last_used, so the peer wins the next select
        let second = pool.select(None, false, &HashSet::new()).await.unwrap();
        assert_ne!(second.uuid, first.uuid);
    }

    #[tokio::test]
    async fn test_probe_candidates_respects_flags_and_recency() {
        let mut a = account("a");
        a.check_health = true;
        let mut b = account("b");
        b.check_health = true;
        b.last_error_time = Some(Utc::now());
        let mut c = account("c");
        c.check_health = true;
        c.is_disabled = true;
        let d = account("d"); // check_health off

        let pool = pool_with_accounts("candidates.json", vec![a, b, c, d]).await;

        let due: Vec<String> = pool
            .probe_candidates(false)
            .await
            .into_iter()
            .map(|a| a.uuid)
            .collect();
        assert_eq!(due, vec!["a".to_string()]);

        // Force ignores the recent-error guard but never probes disabled
        let forced: Vec<String> = pool
            .probe_candidates(true)
            .await
            .into_iter()
            .map(|a| a.uuid)
            .collect();
        assert_eq!(forced, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_flush_preserves_array_shape() {
        let path = temp_pool_path("flush_array.json");
        std::fs::write(&path, "[]").unwrap();
        let pool = PoolManager::load(path.clone(), PoolConfig::default()).unwrap();
        pool.add_account(account("a")).await;
        pool.flush().await.unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(value.is_array());
        assert_eq!(value[0]["uuid"], "a");
        assert_eq!(value[0]["isHealthy"], true);

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_flush_preserves_keyed_object_shape() {
        let path = temp_pool_path("flush_keyed.json");
        std::fs::write(
            &path,
            r#"{"claude-kiro-oauth": [{"uuid":"legacy","credentialsPath":"/tmp/x.json"}]}"#,
        )
        .unwrap();

        let pool = PoolManager::load(path.clone(), PoolConfig::default()).unwrap();
        assert_eq!(pool.len().await, 1);
        pool.add_account(account("fresh")).await;
        pool.flush().await.unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(value.is_object());
        let list = value["claude-kiro-oauth"].as_array().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1]["uuid"], "fresh");

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_flush_round_trips_accounts() {
        let path = temp_pool_path("roundtrip.json");
        std::fs::remove_file(&path).ok();
        let pool = PoolManager::load(path.clone(), PoolConfig::default()).unwrap();

        let mut a = account("a");
        a.usage_count = 7;
        a.last_used = Some(Utc::now());
        pool.add_account(a).await;
        pool.flush().await.unwrap();

        let reloaded = PoolManager::load(path.clone(), PoolConfig::default()).unwrap();
        let accounts = reloaded.accounts().await;
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].usage_count, 7);
        assert!(accounts[0].last_used.is_some());

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_summary_health_threshold() {
        let mut a = account("a");
        a.is_healthy = false;
        let pool = pool_with_accounts("summary.json", vec![a, account("b")]).await;

        let summary = pool.summary(0.6).await;
        assert_eq!(summary["enabled"], 2);
        assert_eq!(summary["unhealthy"], 1);
        assert_eq!(summary["summaryHealth"], true); // 0.5 < 0.6

        let summary = pool.summary(0.4).await;
        assert_eq!(summary["summaryHealth"], false); // 0.5 >= 0.4
    }

    #[test]
    fn test_parse_pool_file_rejects_scalar() {
        assert!(parse_pool_file("42").is_err());
    }
}
