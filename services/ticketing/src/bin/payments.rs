//! Payments service.
//!
//! Replicates orders so payments can be validated locally.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin payments-service
//! ```

use replica_core::event_bus::EventBus;
use replica_postgres::{DeadLetterQueue, PostgresReplicaStore, connect, migrate};
use replica_redpanda::RedpandaEventBus;
use std::sync::Arc;
use ticketing::app::payments_router;
use ticketing::metrics::init as init_metrics;
use ticketing::payments::ReplicatedOrder;
use ticketing::runtime::Application;
use ticketing::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,ticketing=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env("payments")?;
    tracing::info!(
        redpanda = %config.redpanda.brokers,
        queue_group = %config.redpanda.queue_group,
        workers = config.consumer.workers,
        "Configuration loaded"
    );

    init_metrics(config.metrics_port)?;

    let pool = connect(
        &config.database.url,
        config.database.max_connections,
        config.connect_timeout(),
    )
    .await?;
    migrate(&pool).await?;

    let bus: Arc<dyn EventBus> = Arc::new(RedpandaEventBus::new(&config.redpanda.brokers)?);
    let router = payments_router(
        PostgresReplicaStore::<ReplicatedOrder>::new(pool.clone()),
        config.redelivery_policy(),
    )
    .with_dead_letters(Arc::new(DeadLetterQueue::new(pool)));

    tracing::info!("Payments service running; press Ctrl+C to stop");
    Application::new("payments", bus, Arc::new(router), config.redpanda.queue_group.as_str())
        .with_workers(config.consumer.workers)
        .run()
        .await?;
    Ok(())
}
