//! Jonche API server binary entrypoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use jonche_common::config::AppConfig;
use jonche_common::db::{create_pool, run_migrations};
use jonche_common::redis_pool::create_redis_pool;
use jonche_ledger::coordinator::LedgerCoordinator;
use jonche_ledger::outbox::{OutboxDispatcher, spawn_sweeper};
use jonche_notifier::enqueuer::TaskEnqueuer;
use jonche_notifier::queue::RedisQueue;

use jonche_api::routes::create_router;
use jonche_api::state::AppState;

/// Callback and operator payloads are small.
const MAX_BODY_BYTES: usize = 64 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("jonche_api=debug,jonche_ledger=debug,jonche_notifier=info,tower_http=debug")
        }))
        .init();

    tracing::info!("Starting Jonche API server...");

    let config = AppConfig::from_env()?;

    let pool = create_pool(&config.database_url, config.db_max_connections).await?;
    run_migrations(&pool).await?;

    let redis = create_redis_pool(&config.redis_url).await?;
    let enqueuer = TaskEnqueuer::new(Arc::new(RedisQueue::new(redis)));

    let dispatcher = Arc::new(OutboxDispatcher::new(pool.clone(), enqueuer));
    let coordinator = Arc::new(
        LedgerCoordinator::new(
            pool.clone(),
            dispatcher.clone(),
            config.overpayment_policy,
            &config.payment_sms_template,
        )
        .map_err(|e| anyhow::anyhow!("PAYMENT_SMS_TEMPLATE is invalid: {}", e))?,
    );

    let sweeper = spawn_sweeper(
        dispatcher,
        Duration::from_secs(config.outbox_sweep_interval_secs),
    );

    let state = AppState::new(pool.clone(), coordinator);

    let app = create_router(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    tracing::info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("HTTP server stopped, stopping outbox sweeper...");
    if tokio::time::timeout(
        Duration::from_secs(config.shutdown_timeout_secs),
        sweeper.stop(),
    )
    .await
    .is_err()
    {
        tracing::warn!("Outbox sweeper did not stop in time");
    }

    pool.close().await;
    tracing::info!("Jonche API server stopped.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("Received shutdown signal, stopping gracefully...");
}
