use std::sync::Arc;

use hookline_common::config::AppConfig;
use hookline_common::{db, redis_pool};
use hookline_engine::advisory::{AdvisoryStore, InMemoryAdvisoryStore, RedisAdvisoryStore};
use hookline_engine::circuit::CircuitBreaker;
use hookline_engine::queue::DeliveryQueue;
use hookline_notifier::executor::DeliveryExecutor;
use hookline_worker::drainer::QueueDrainer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "hookline_worker=info,hookline_engine=info,hookline_notifier=info".into()
            }),
        )
        .json()
        .init();

    tracing::info!("Hookline delivery worker starting...");

    let config = AppConfig::from_env()?;

    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    db::run_migrations(&pool).await?;

    // Circuit state lives in Redis when configured; otherwise per process
    let store: Arc<dyn AdvisoryStore> = match &config.redis_url {
        Some(url) => match redis_pool::create_redis_pool(url).await {
            Ok(conn) => Arc::new(RedisAdvisoryStore::new(conn)),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "Redis unavailable, circuit breaker falling back to in-memory state"
                );
                Arc::new(InMemoryAdvisoryStore::new())
            }
        },
        None => {
            tracing::info!("REDIS_URL not set, circuit breaker using in-memory state");
            Arc::new(InMemoryAdvisoryStore::new())
        }
    };

    let breaker = CircuitBreaker::new(Some(store), &config.delivery);
    let executor = DeliveryExecutor::new(pool.clone(), breaker, &config.delivery)?;
    let queue = DeliveryQueue::new(pool, config.delivery.clone(), Arc::new(executor));
    let drainer = QueueDrainer::new(
        queue,
        config.drain_interval(),
        config.delivery.drain_batch_size,
    );

    // Run until Ctrl+C; the in-flight drain completes first
    drainer
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            tracing::info!("Received shutdown signal, stopping gracefully...");
        })
        .await;

    tracing::info!("Hookline delivery worker stopped.");
    Ok(())
}
