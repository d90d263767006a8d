use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use jonche_common::config::AppConfig;
use jonche_common::{db, redis_pool};
use jonche_notifier::delivery_log::PgDeliveryLog;
use jonche_notifier::gateway::HttpSmsGateway;
use jonche_notifier::queue::RedisQueue;
use jonche_notifier::worker::{WorkerConfig, WorkerPool};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jonche_notifier=info".into()),
        )
        .json()
        .init();

    tracing::info!("Jonche worker starting...");

    let config = AppConfig::from_env()?;

    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    db::run_migrations(&pool).await?;

    let redis = redis_pool::create_redis_pool(&config.redis_url).await?;
    let queue = Arc::new(RedisQueue::new(redis));

    let gateway_url = config
        .sms_gateway_url
        .clone()
        .ok_or_else(|| anyhow::anyhow!("SMS_GATEWAY_URL environment variable is required"))?;
    let gateway_key = config
        .sms_gateway_api_key
        .clone()
        .ok_or_else(|| anyhow::anyhow!("SMS_GATEWAY_API_KEY environment variable is required"))?;
    let gateway = Arc::new(HttpSmsGateway::new(
        gateway_url,
        gateway_key,
        config.sms_sender_id.clone(),
        Duration::from_secs(config.sms_gateway_timeout_secs),
    )?);

    let workers = WorkerPool::new(
        queue,
        gateway,
        Arc::new(PgDeliveryLog::new(pool.clone())),
        WorkerConfig {
            critical_concurrency: config.queue_concurrency_critical,
            default_concurrency: config.queue_concurrency_default,
            low_concurrency: config.queue_concurrency_low,
            poll_interval: Duration::from_millis(config.queue_poll_interval_ms),
            retry_delay: Duration::from_secs(config.queue_retry_delay_secs),
            recover_inflight: config.queue_recover_inflight,
        },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut run = tokio::spawn(async move { workers.run(shutdown_rx).await });

    tokio::select! {
        result = &mut run => {
            pool.close().await;
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "Worker pool exited with error");
                    Err(e)
                }
                Err(e) => Err(e.into()),
            };
        }
        _ = shutdown_signal() => {
            tracing::info!("Received shutdown signal, draining in-flight tasks...");
        }
    }

    let _ = shutdown_tx.send(true);
    let drain = Duration::from_secs(config.shutdown_timeout_secs);
    match tokio::time::timeout(drain, &mut run).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => tracing::error!(error = %e, "Worker pool exited with error"),
        Ok(Err(e)) => tracing::error!(error = %e, "Worker pool task failed"),
        Err(_) => {
            tracing::warn!(
                timeout_secs = config.shutdown_timeout_secs,
                "Drain timeout elapsed, unfinished tasks will be requeued on next start"
            );
            // Consumers must not touch the pool once it is closing.
            run.abort();
            let _ = run.await;
        }
    }

    pool.close().await;
    tracing::info!("Jonche worker stopped.");
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
}
