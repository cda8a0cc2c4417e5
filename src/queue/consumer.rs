use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::{QueueConsumer, QueueMessage, QueueResult};
use crate::db::models::event::ScoreEvent;
use crate::db::models::record::ProcessedScoreEvent;
use crate::db::pg::persistence::EventPersistence;

pub const DEFAULT_FETCH_INTERVAL: Duration = Duration::from_secs(20);
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(30);

/// Converts a configured interval in seconds, falling back to `default` when it is not
/// positive.
pub fn normalize_interval(name: &'static str, secs: i64, default: Duration) -> Duration {
    if secs <= 0 {
        tracing::warn!(
            name,
            configured = secs,
            default_secs = default.as_secs(),
            "non-positive interval; using default"
        );
        return default;
    }

    Duration::from_secs(secs as u64)
}

#[derive(Debug, Clone, Copy)]
pub struct ConsumerConfig {
    pub fetch_interval: Duration,
    pub metrics_interval: Duration,
    pub batch_size: usize,
}

impl ConsumerConfig {
    pub fn new(fetch_interval_secs: i64, metrics_interval_secs: i64, batch_size: usize) -> Self {
        Self {
            fetch_interval: normalize_interval(
                "fetch_interval",
                fetch_interval_secs,
                DEFAULT_FETCH_INTERVAL,
            ),
            metrics_interval: normalize_interval(
                "metrics_interval",
                metrics_interval_secs,
                DEFAULT_METRICS_INTERVAL,
            ),
            batch_size: batch_size.max(1),
        }
    }
}

/// What one fetch tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub fetched: usize,
    pub persisted: usize,
    pub terminated: usize,
    pub naked: usize,
}

/// Drains scored events from the queue into the audit log, one batch per fetch tick.
pub struct BatchConsumer {
    queue: Arc<dyn QueueConsumer>,
    persistence: Arc<dyn EventPersistence>,
    config: ConsumerConfig,
}

impl BatchConsumer {
    pub fn new(
        queue: Arc<dyn QueueConsumer>,
        persistence: Arc<dyn EventPersistence>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            queue,
            persistence,
            config,
        }
    }

    /// Runs both tickers until `cancel` fires. A tick in progress finishes first.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut fetch_tick = tokio::time::interval(self.config.fetch_interval);
        let mut metrics_tick = tokio::time::interval(self.config.metrics_interval);
        fetch_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        metrics_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            fetch_interval = ?self.config.fetch_interval,
            metrics_interval = ?self.config.metrics_interval,
            batch_size = self.config.batch_size,
            "batch consumer started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                _ = fetch_tick.tick() => {
                    if let Err(e) = self.process_batch(&cancel).await {
                        tracing::error!(error = ?e, "batch fetch failure");
                    }
                }

                _ = metrics_tick.tick() => self.report_metrics().await,
            }
        }

        tracing::info!("batch consumer stopped");
    }

    /// One fetch: dead-letter malformed messages, persist the rest as a single batch, then ack
    /// them all on success or nak them all on failure.
    #[instrument(skip(self, cancel))]
    pub async fn process_batch(&self, cancel: &CancellationToken) -> QueueResult<BatchReport> {
        let messages = self.queue.fetch(self.config.batch_size).await?;
        if messages.is_empty() {
            return Ok(BatchReport::default());
        }

        let mut report = BatchReport {
            fetched: messages.len(),
            ..Default::default()
        };

        let mut valid: Vec<QueueMessage> = Vec::with_capacity(messages.len());
        let mut rows: Vec<ProcessedScoreEvent> = Vec::with_capacity(messages.len());

        for message in messages {
            match serde_json::from_str::<ScoreEvent>(&message.payload) {
                Ok(event) => {
                    rows.push(ProcessedScoreEvent::from(event));
                    valid.push(message);
                }
                Err(e) => {
                    tracing::warn!(id = %message.id, error = %e, "malformed score event");
                    report.terminated += 1;
                    if let Err(e) = self.queue.term(&message, &e.to_string()).await {
                        tracing::error!(id = %message.id, error = ?e, "failed to terminate message");
                    }
                }
            }
        }

        if valid.is_empty() {
            return Ok(report);
        }

        match self
            .persistence
            .add_processed_score_events(cancel, &rows)
            .await
        {
            Ok(()) => {
                for message in &valid {
                    if let Err(e) = self.queue.ack(message).await {
                        tracing::error!(id = %message.id, error = ?e, "ack failure");
                    }
                }
                report.persisted = valid.len();
                tracing::info!(count = valid.len(), "persisted score event batch");
            }
            Err(e) => {
                tracing::error!(count = valid.len(), error = %e, "batch persistence failed; requeueing");
                for message in &valid {
                    if let Err(e) = self.queue.nak(message).await {
                        tracing::error!(id = %message.id, error = ?e, "nak failure");
                    }
                }
                report.naked = valid.len();
            }
        }

        Ok(report)
    }

    async fn report_metrics(&self) {
        match self.queue.info().await {
            Ok(info) => tracing::info!(
                pending = info.pending,
                ack_pending = info.ack_pending,
                redelivered = info.redelivered,
                waiting = info.waiting,
                "consumer metrics"
            ),
            Err(e) => tracing::warn!(error = ?e, "failed to read consumer info"),
        }
    }

    pub async fn close(&self) {
        self.queue.close().await;
    }
}
