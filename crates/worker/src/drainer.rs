//! Fixed-interval queue drain loop.

use std::future::Future;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use hookline_engine::queue::DeliveryQueue;

pub struct QueueDrainer {
    queue: DeliveryQueue,
    interval: Duration,
    batch_size: u32,
}

impl QueueDrainer {
    pub fn new(queue: DeliveryQueue, interval: Duration, batch_size: u32) -> Self {
        Self {
            queue,
            interval,
            batch_size: batch_size.max(1),
        }
    }

    /// Drain on every tick until `shutdown` resolves. A drain in progress is
    /// always finished before returning. Drain errors are logged and the loop
    /// keeps going.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        tracing::info!(
            interval_ms = self.interval.as_millis() as u64,
            batch_size = self.batch_size,
            "Queue drainer started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = &mut shutdown => break,
            }

            match self.queue.process_queue(self.batch_size).await {
                Ok(report) if report.claimed > 0 => {
                    tracing::debug!(
                        claimed = report.claimed,
                        completed = report.completed,
                        failed = report.failed,
                        superseded = report.superseded,
                        errors = report.errors,
                        "Drain tick finished"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(error = %e, "Queue drain failed");
                }
            }
        }

        tracing::info!("Queue drainer stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use sqlx::postgres::PgPoolOptions;

    use hookline_common::config::DeliveryConfig;
    use hookline_common::error::AppError;
    use hookline_common::types::DeliveryStatus;
    use hookline_engine::queue::{ClaimedDelivery, DeliveryHandler};

    use super::*;

    struct NeverCalled;

    #[async_trait]
    impl DeliveryHandler for NeverCalled {
        async fn deliver(&self, _: &ClaimedDelivery) -> Result<DeliveryStatus, AppError> {
            panic!("no row can be claimed without a database");
        }
    }

    #[tokio::test]
    async fn test_drain_errors_do_not_stop_the_loop() {
        // Nothing listens on port 1, so every drain fails fast
        let pool = PgPoolOptions::new()
            .acquire_timeout(Duration::from_millis(50))
            .connect_lazy("postgres://hookline@127.0.0.1:1/hookline")
            .unwrap();
        let queue = DeliveryQueue::new(pool, DeliveryConfig::default(), Arc::new(NeverCalled));
        let drainer = QueueDrainer::new(queue, Duration::from_millis(10), 10);

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            drainer.run(tokio::time::sleep(Duration::from_millis(200))),
        )
        .await;

        assert!(result.is_ok(), "Drainer must stop once shutdown resolves");
    }
}
