use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

mod adapter;
mod auth;
mod bracket_tools;
mod config;
mod converters;
mod error;
mod middleware;
mod models;
mod pool;
mod prompt_log;
mod resolver;
mod routes;
mod streaming;
mod tokenizer;

use adapter::{AdapterConfig, AdapterRegistry};
use auth::device::DeviceFlowManager;
use pool::{PoolConfig, PoolManager};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::load()?;
    config.validate()?;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.to_lowercase()));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!("Kiro Relay starting...");
    tracing::info!("Server configured: {}:{}", config.host, config.server_port);

    // Provider pool
    let pool = PoolManager::load(
        config.provider_pools_file_path.clone(),
        PoolConfig {
            max_error_count: config.max_error_count,
            ..PoolConfig::default()
        },
    )?;
    pool.spawn_save_task();
    if pool.is_empty().await {
        tracing::warn!(
            "Provider pool is empty; add accounts to {} or run the device flow",
            config.provider_pools_file_path.display()
        );
    }

    // Per-account adapters
    let registry = Arc::new(AdapterRegistry::new(AdapterConfig {
        max_retries: config.request_max_retries,
        base_delay_ms: config.request_base_delay_ms,
    }));

    // Background health probes
    pool::probe::spawn_probe_task(pool.clone(), registry.clone());

    // Preemptive token refresh heartbeat
    if config.cron_refresh_token {
        spawn_refresh_heartbeat(pool.clone(), registry.clone(), config.cron_near_minutes);
    }

    let device_flows = Arc::new(DeviceFlowManager::new(
        config
            .provider_pools_file_path
            .parent()
            .map(|p| p.join("kiro"))
            .unwrap_or_else(|| PathBuf::from("configs/kiro")),
    ));

    let state = routes::AppState {
        config: Arc::new(config.clone()),
        pool: pool.clone(),
        registry,
        device_flows,
    };

    let app = axum::Router::new()
        .merge(routes::health_routes())
        .merge(routes::api_routes(state))
        .layer(middleware::cors_layer());

    let addr = format!("{}:{}", config.host, config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // One last flush so counters mutated in the final debounce window land
    // on disk
    if let Err(e) = pool.flush().await {
        tracing::warn!("Final pool flush failed: {}", e);
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Every `near_minutes` minutes, rotate tokens on accounts whose expiry is
/// near.
fn spawn_refresh_heartbeat(
    pool: Arc<PoolManager>,
    registry: Arc<AdapterRegistry>,
    near_minutes: i64,
) {
    let interval = Duration::from_secs((near_minutes.max(1) as u64) * 60);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            for account in pool.accounts().await {
                if account.is_disabled {
                    continue;
                }
                let adapter = match registry.get_or_create(&account) {
                    Ok(adapter) => adapter,
                    Err(e) => {
                        tracing::debug!(
                            "Heartbeat skipping account {}: {}",
                            account.uuid,
                            e
                        );
                        continue;
                    }
                };
                match adapter.refresh_if_near(near_minutes).await {
                    Ok(true) => {
                        tracing::info!("Heartbeat refreshed token for account {}", account.uuid)
                    }
                    Ok(false) => {}
                    Err(e) => tracing::warn!(
                        "Heartbeat refresh failed for account {}: {}",
                        account.uuid,
                        e
                    ),
                }
            }
        }
    });
}

/// Handle graceful shutdown signal
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown...");
        },
    }
}
