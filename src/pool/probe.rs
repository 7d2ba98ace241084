// Health probes
// A probe is a minimal one-token generate request that verifies an account
// independent of user traffic. On failure it retries once with the
// secondary payload shape some deployments expect.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::adapter::AdapterRegistry;
use crate::models::claude::MessagesRequest;

use super::{Account, PoolManager, ProbeResult};

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Probe one account through its adapter.
pub async fn probe_account(registry: &AdapterRegistry, account: &Account) -> ProbeResult {
    let model = account.check_model_name.clone();

    let adapter = match registry.get_or_create(account) {
        Ok(adapter) => adapter,
        Err(e) => {
            return ProbeResult {
                success: false,
                model_name: model,
                error_message: Some(format!("adapter init failed: {}", e)),
            }
        }
    };

    let request: MessagesRequest = match serde_json::from_value(json!({
        "model": model,
        "messages": [{"role": "user", "content": "Hi"}],
        "max_tokens": 1
    })) {
        Ok(request) => request,
        Err(e) => {
            return ProbeResult {
                success: false,
                model_name: model,
                error_message: Some(e.to_string()),
            }
        }
    };

    let primary = tokio::time::timeout(PROBE_TIMEOUT, adapter.generate_content(&request)).await;
    let primary_err = match primary {
        Ok(Ok(_)) => {
            return ProbeResult {
                success: true,
                model_name: model,
                error_message: None,
            }
        }
        Ok(Err(e)) => e.to_string(),
        Err(_) => "probe timed out".to_string(),
    };

    // Secondary payload shape
    let fallback_body = json!({
        "contents": [{"role": "user", "parts": [{"text": "Hi"}]}],
        "max_tokens": 1
    });
    let secondary =
        tokio::time::timeout(PROBE_TIMEOUT, adapter.post_raw_generate(&fallback_body)).await;
    match secondary {
        Ok(Ok(())) => ProbeResult {
            success: true,
            model_name: model,
            error_message: None,
        },
        Ok(Err(e)) => ProbeResult {
            success: false,
            model_name: model,
            error_message: Some(format!("{}; fallback: {}", primary_err, e)),
        },
        Err(_) => ProbeResult {
            success: false,
            model_name: model,
            error_message: Some(format!("{}; fallback: probe timed out", primary_err)),
        },
    }
}

/// Run probes for every due account. `force` ignores the error-recency
/// guard.
pub async fn run_health_checks(pool: &PoolManager, registry: &AdapterRegistry, force: bool) {
    let candidates = pool.probe_candidates(force).await;
    if candidates.is_empty() {
        return;
    }
    tracing::debug!("Probing {} account(s)", candidates.len());

    for account in candidates {
        let result = probe_account(registry, &account).await;
        if result.success {
            tracing::info!("Probe ok: account {} ({})", account.uuid, result.model_name);
        } else {
            tracing::warn!(
                "Probe failed: account {} ({}): {}",
                account.uuid,
                result.model_name,
                result.error_message.as_deref().unwrap_or("unknown")
            );
        }
        pool.apply_probe(&account.uuid, &result).await;
    }
}

/// Periodic probe loop.
pub fn spawn_probe_task(pool: Arc<PoolManager>, registry: Arc<AdapterRegistry>) {
    let interval_secs = pool.config().health_check_interval_secs.max(1) as u64;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        // The immediate first tick would probe at startup before any
        // traffic has a chance to settle
        ticker.tick().await;
        loop {
            ticker.tick().await;
            run_health_checks(&pool, &registry, false).await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterConfig;
    use crate::pool::PoolConfig;
    use std::collections::HashSet;
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("kiro-relay-probe-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    #[tokio::test]
    async fn test_probe_failure_feeds_error_budget() {
        // An account whose credentials file is missing fails adapter init;
        // the probe result must land in the pool as an unhealthy mark
        let pool_path = temp_path("probe_pool.json");
        std::fs::remove_file(&pool_path).ok();
        let pool = PoolManager::load(pool_path, PoolConfig::default()).unwrap();

        let mut account = Account::new(
            temp_path("nonexistent_creds.json")
                .to_string_lossy()
                .to_string(),
        );
        account.uuid = "probe-fail".to_string();
        account.check_health = true;
        pool.add_account(account).await;

        let registry = AdapterRegistry::new(AdapterConfig::default());
        run_health_checks(&pool, &registry, false).await;

        let account = pool.get("probe-fail").await.unwrap();
        assert_eq!(account.error_count, 1);
        assert!(account
            .last_error_message
            .as_deref()
            .unwrap()
            .contains("adapter init failed"));
        // One failure is under the default budget of three
        assert!(account.is_healthy);
    }

    #[tokio::test]
    async fn test_probe_success_marks_health_fields() {
        let pool_path = temp_path("probe_pool_ok.json");
        std::fs::remove_file(&pool_path).ok();
        let pool = PoolManager::load(pool_path, PoolConfig::default()).unwrap();

        let mut account = Account::new("unused".to_string());
        account.uuid = "probe-ok".to_string();
        account.check_health = true;
        pool.add_account(account).await;

        // Drive the marking path directly with a synthetic success
        let result = ProbeResult {
            success: true,
            model_name: "claude-haiku-4-5".to_string(),
            error_message: None,
        };
        pool.apply_probe("probe-ok", &result).await;

        let account = pool.get("probe-ok").await.unwrap();
        assert!(account.is_healthy);
        assert_eq!(account.usage_count, 0);
        assert_eq!(
            account.last_health_check_model.as_deref(),
            Some("claude-haiku-4-5")
        );
    }

    #[tokio::test]
    async fn test_unhealthy_account_still_selectable_after_probe_recovery() {
        let pool_path = temp_path("probe_recover.json");
        std::fs::remove_file(&pool_path).ok();
        let pool = PoolManager::load(pool_path, PoolConfig::default()).unwrap();

        let mut account = Account::new("unused".to_string());
        account.uuid = "recover".to_string();
        pool.add_account(account).await;

        for _ in 0..3 {
            pool.mark_unhealthy("recover", "503").await;
        }
        assert!(pool.select(None, false, &HashSet::new()).await.is_none());

        let result = ProbeResult {
            success: true,
            model_name: "claude-haiku-4-5".to_string(),
            error_message: None,
        };
        pool.apply_probe("recover", &result).await;
        assert!(pool.select(None, false, &HashSet::new()).await.is_some());
    }
}
