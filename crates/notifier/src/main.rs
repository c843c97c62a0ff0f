use std::process::ExitCode;
use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use lyceum_dispatch::retry::RetryPolicy;
use lyceum_infra::{DispatchConfig, PostgresOutboxStore, RedisStreamsQueue, SmtpDeliveryClient};
use lyceum_notifier::{
    Consumer, DrainOutcome, Notifier, NotifierSettings, ShutdownCoordinator, TracingSink,
    wait_for_signals,
};
use lyceum_observability::DispatchMetrics;

#[tokio::main]
async fn main() -> ExitCode {
    lyceum_observability::init();

    let config = DispatchConfig::from_env();
    match run(config).await {
        Ok(outcome) => {
            match outcome {
                DrainOutcome::Clean => info!("notifier exited cleanly"),
                DrainOutcome::Forced { in_flight } => {
                    warn!(in_flight, "notifier exited with deliveries still in flight")
                }
            }
            ExitCode::from(outcome.exit_code())
        }
        Err(e) => {
            tracing::error!(error = %e, "notifier failed");
            ExitCode::from(2)
        }
    }
}

async fn run(config: DispatchConfig) -> anyhow::Result<DrainOutcome> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;
    let store = Arc::new(PostgresOutboxStore::new(pool.clone()));

    let consumer_name = format!("notifier-{}", std::process::id());
    let queue = Arc::new(
        RedisStreamsQueue::connect(
            &config.redis_url,
            config.queue_key.clone(),
            "notifier",
            consumer_name,
        )
        .await?,
    );

    let delivery_client = Arc::new(SmtpDeliveryClient::new(&config.smtp)?);
    let metrics = Arc::new(DispatchMetrics::new());
    let sink = Arc::new(TracingSink::new(metrics.clone()));

    let coordinator = Arc::new(ShutdownCoordinator::new());
    tokio::spawn(wait_for_signals(coordinator.clone()));

    let policy = RetryPolicy::exponential(config.max_attempts, config.base_delay, config.max_delay);
    let consumer = Consumer::new(
        store.clone(),
        queue.clone(),
        delivery_client,
        sink.clone(),
        policy,
    );
    let notifier = Notifier::new(
        consumer,
        store,
        queue,
        sink,
        coordinator,
        NotifierSettings {
            concurrency: config.concurrency,
            shutdown_deadline: config.shutdown_deadline,
            ..NotifierSettings::default()
        },
    );

    let outcome = notifier.run().await;

    info!(metrics = ?metrics.snapshot(), "final counters");
    pool.close().await;
    Ok(outcome)
}
