use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::db::prelude::*;
use crate::queue::QueueError;
use crate::queue::consumer::{BatchConsumer, ConsumerConfig};
use crate::queue::handler::IngestHandler;
use crate::queue::streams::RedisStream;
use crate::scheduler::{SchedulerConfig, SnapshotScheduler};
use crate::scoring::{EventRecorder, ScoringConfig, ScoringError, ScoringService};
use crate::util::env::{self, Env, EnvErr, RecordMode};
use crate::util::telemetry;

mod db;
mod queue;
mod scheduler;
mod scoring;
mod util;

#[cfg(test)]
mod testing;

#[derive(Debug, Error)]
enum RunnerErr {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Std(#[from] Box<dyn std::error::Error>),

    #[error(transparent)]
    Env(#[from] EnvErr),

    #[error(transparent)]
    Pg(#[from] PgErr),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Scoring(#[from] ScoringError),
}

type Result<T> = core::result::Result<T, RunnerErr>;

#[tokio::main]
async fn main() -> Result<()> {
    let env = env::env().await?;
    let telemetry_registry = telemetry::Telemetry::new(env)?.register();
    tracing::info!(service = %telemetry_registry.service_name, "starting");

    let result = run(env).await;
    if let Err(e) = &result {
        tracing::error!(error = %e, "service exited with error");
    }

    telemetry_registry.shutdown();
    result
}

async fn run(env: &'static Env) -> Result<()> {
    env.check()?;

    let pool = db_pool().await?;
    db::pg::migrate(pool).await?;
    let manager = redis_pool().await?.manager.clone();

    let op_timeout = Duration::from_millis(env.store_op_timeout_ms);
    let processed_ttl = Duration::from_secs(env.processed_ttl_secs);
    let ack_wait = Duration::from_secs(env.ack_wait_secs);
    let lock_ttl = Duration::from_secs(env.lock_ttl_secs);
    let grace = Duration::from_secs(env.shutdown_grace_secs);

    let persistence: Arc<dyn EventPersistence> = Arc::new(PgPersistence::new(
        pool,
        RetryPolicy {
            max_retries: env.persist_max_retries,
            base_delay: Duration::from_millis(env.persist_retry_delay_ms),
            deadline: Duration::from_secs(env.persist_timeout_secs),
        },
    ));

    let gate = IdempotencyGate::new(
        Arc::new(RedisIdempotencyStore::new(manager.clone(), op_timeout)),
        GateConfig {
            lock_ttl,
            processed_ttl,
        },
    );
    let store = Arc::new(RedisLeaderboardStore::new(
        manager.clone(),
        processed_ttl,
        op_timeout,
    ));
    let registry = Arc::new(RedisProjectRegistry::new(manager.clone(), op_timeout));

    let score_stream = Arc::new(
        RedisStream::connect(
            manager.clone(),
            &env.score_stream,
            &env.consumer_group,
            &env.consumer_name,
            ack_wait,
            op_timeout,
        )
        .await?
        .with_redelivery_delay(lock_ttl),
    );
    let ingest_stream = Arc::new(
        RedisStream::connect(
            manager.clone(),
            &env.ingest_stream,
            &env.consumer_group,
            &env.consumer_name,
            ack_wait,
            op_timeout,
        )
        .await?
        .with_redelivery_delay(lock_ttl),
    );

    let recorder = match env.record_mode {
        RecordMode::Queue => EventRecorder::Queue(score_stream.clone()),
        RecordMode::Direct => EventRecorder::Direct(persistence.clone()),
    };
    tracing::info!(record_mode = ?env.record_mode, "scored events recorder selected");

    let cancel = CancellationToken::new();
    let config = ScoringConfig::from_table_override(env.scoring_table.as_deref())?;
    let service = Arc::new(
        ScoringService::new(gate, store, registry, recorder, persistence.clone(), config)
            .with_cancel(cancel.child_token()),
    );

    match service.restore_leaderboard_from_snapshot(&cancel).await {
        Ok(report) => tracing::info!(?report, "startup restore finished"),
        Err(e) => tracing::warn!(error = %e, "startup restore failed; serving live data only"),
    }

    let consumer_config = ConsumerConfig::new(
        env.fetch_interval_secs,
        env.metrics_interval_secs,
        env.fetch_batch_size,
    );
    let ingest = Arc::new(IngestHandler::new(
        ingest_stream,
        service.clone(),
        consumer_config.fetch_interval,
        consumer_config.batch_size,
    ));
    let batch_consumer = Arc::new(BatchConsumer::new(
        score_stream,
        persistence,
        consumer_config,
    ));
    let scheduler = Arc::new(SnapshotScheduler::new(
        service,
        SchedulerConfig {
            interval: Duration::from_secs(env.snapshot_interval_secs),
            timeout: Duration::from_secs(env.snapshot_timeout_secs),
            grace,
        },
    ));

    let handles: Vec<JoinHandle<()>> = vec![
        tokio::spawn({
            let ingest = ingest.clone();
            let cancel = cancel.clone();
            async move { ingest.run(cancel).await }
        }),
        tokio::spawn({
            let batch_consumer = batch_consumer.clone();
            let cancel = cancel.clone();
            async move { batch_consumer.run(cancel).await }
        }),
        tokio::spawn({
            let cancel = cancel.clone();
            async move { scheduler.run(cancel).await }
        }),
    ];

    shutdown_signal().await?;
    tracing::info!(?grace, "shutdown requested");
    cancel.cancel();

    match tokio::time::timeout(grace, join_all(handles)).await {
        Ok(results) => {
            for res in results.into_iter().filter_map(|res| res.err()) {
                tracing::error!(error = %res, "worker task panicked");
            }
        }
        Err(_) => tracing::warn!(?grace, "workers did not stop in time"),
    }

    ingest.close().await;
    batch_consumer.close().await;
    tracing::info!("shutdown complete");

    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
