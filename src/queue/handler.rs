use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::{QueueConsumer, QueueMessage, QueueResult};
use crate::db::models::event::ContributionEvent;
use crate::scoring::{ScoringError, ScoringService};

/// What the handler decided for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Nak,
    Term,
}

/// Live-scoring path: pulls contribution events and runs each through the scoring service.
pub struct IngestHandler {
    queue: Arc<dyn QueueConsumer>,
    service: Arc<ScoringService>,
    fetch_interval: Duration,
    batch_size: usize,
}

impl IngestHandler {
    pub fn new(
        queue: Arc<dyn QueueConsumer>,
        service: Arc<ScoringService>,
        fetch_interval: Duration,
        batch_size: usize,
    ) -> Self {
        Self {
            queue,
            service,
            fetch_interval,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.fetch_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(fetch_interval = ?self.fetch_interval, "ingest handler started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                _ = tick.tick() => {
                    if let Err(e) = self.drain_once().await {
                        tracing::error!(error = ?e, "ingest fetch failure");
                    }
                }
            }
        }

        tracing::info!("ingest handler stopped");
    }

    /// Handles one fetched batch, returning how many messages were acked.
    #[instrument(skip(self))]
    pub async fn drain_once(&self) -> QueueResult<usize> {
        let messages = self.queue.fetch(self.batch_size).await?;
        let mut acked = 0;

        for message in &messages {
            let (disposition, reason) = self.handle(message).await;
            let settled = match disposition {
                Disposition::Ack => {
                    acked += 1;
                    self.queue.ack(message).await
                }
                Disposition::Nak => self.queue.nak(message).await,
                Disposition::Term => self.queue.term(message, &reason).await,
            };

            if let Err(e) = settled {
                tracing::error!(id = %message.id, ?disposition, error = ?e, "failed to settle message");
            }
        }

        Ok(acked)
    }

    async fn handle(&self, message: &QueueMessage) -> (Disposition, String) {
        let event: ContributionEvent = match serde_json::from_str(&message.payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(id = %message.id, error = %e, "malformed contribution event");
                return (Disposition::Term, format!("malformed payload: {e}"));
            }
        };

        match self.service.process_score_event(&event).await {
            Ok(outcome) => {
                tracing::debug!(id = %message.id, ?outcome, "contribution event settled");
                (Disposition::Ack, String::new())
            }
            Err(ScoringError::Validation(e)) => (Disposition::Term, e.to_string()),
            Err(e @ ScoringError::CriticalMarkingFailure { .. }) => {
                // increments are guarded by the scored-marker and audit rows dedupe on event id
                tracing::error!(critical = true, id = %message.id, error = %e, "redelivering after marking failure");
                (Disposition::Nak, e.to_string())
            }
            Err(e) => {
                tracing::warn!(
                    id = %message.id,
                    deliveries = message.deliveries,
                    error = %e,
                    "contribution event failed; will retry"
                );
                (Disposition::Nak, e.to_string())
            }
        }
    }

    pub async fn close(&self) {
        self.queue.close().await;
    }
}

#[cfg(test)]
mod test {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::db::redis::idempotency::{GateConfig, IdempotencyGate};
    use crate::scoring::{EventRecorder, ScoringConfig};
    use crate::testing::{MemoryKv, MemoryLeaderboard, MemoryPersistence, MemoryQueue, MemoryRegistry};

    fn fixed_now() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 16, 12, 0, 0).unwrap()
    }

    struct Harness {
        queue: Arc<MemoryQueue>,
        kv: Arc<MemoryKv>,
        board: Arc<MemoryLeaderboard>,
        persistence: Arc<MemoryPersistence>,
        handler: IngestHandler,
    }

    fn harness() -> Harness {
        let queue = Arc::new(MemoryQueue::default());
        let kv = Arc::new(MemoryKv::default());
        let board = Arc::new(MemoryLeaderboard::default());
        let persistence = Arc::new(MemoryPersistence::default());

        let service = ScoringService::new(
            IdempotencyGate::new(kv.clone(), GateConfig::default()),
            board.clone(),
            Arc::new(MemoryRegistry::default()),
            EventRecorder::Direct(persistence.clone()),
            persistence.clone(),
            ScoringConfig::default(),
        )
        .with_clock(fixed_now);

        let handler = IngestHandler::new(
            queue.clone(),
            Arc::new(service),
            Duration::from_secs(1),
            10,
        );

        Harness {
            queue,
            kv,
            board,
            persistence,
            handler,
        }
    }

    fn payload(id: &str, kind: &str) -> String {
        serde_json::json!({
            "id": id,
            "eventKind": kind,
            "repositoryID": 1001,
            "repositoryName": "acme/widgets",
            "contributorID": "U",
            "timestamp": "2024-07-16T10:00:00Z",
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_messages_are_segregated() {
        let h = harness();
        let good = h
            .queue
            .push(&payload("0a7e3c1e-5d7b-4b8e-8a51-3f0f6a2b9c10", "issue_opened"));
        let unknown_kind = h
            .queue
            .push(&payload("0a7e3c1e-5d7b-4b8e-8a51-3f0f6a2b9c11", "deploy"));
        let garbage = h.queue.push("not json at all");

        let acked = h.handler.drain_once().await.unwrap();

        assert_eq!(acked, 1);
        assert_eq!(h.queue.acked(), vec![good]);
        assert_eq!(h.queue.termed(), vec![unknown_kind, garbage]);
        assert!(h.queue.naked().is_empty());
        assert_eq!(h.board.score("leaderboard:1001:all_time", "U"), Some(4));
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_acked_without_rescoring() {
        let h = harness();
        let body = payload("0a7e3c1e-5d7b-4b8e-8a51-3f0f6a2b9c12", "pull_request_merged");
        h.queue.push(&body);
        h.queue.push(&body);

        let acked = h.handler.drain_once().await.unwrap();

        assert_eq!(acked, 2);
        assert_eq!(h.board.score("leaderboard:global:all_time", "U"), Some(5));
        assert_eq!(h.persistence.processed().len(), 1);
    }

    #[tokio::test]
    async fn test_store_failure_naks_for_redelivery() {
        let h = harness();
        let id = h
            .queue
            .push(&payload("0a7e3c1e-5d7b-4b8e-8a51-3f0f6a2b9c13", "push"));

        h.board.fail_upserts(true);
        assert_eq!(h.handler.drain_once().await.unwrap(), 0);
        assert_eq!(h.queue.naked(), vec![id.clone()]);

        h.board.fail_upserts(false);
        assert_eq!(h.handler.drain_once().await.unwrap(), 1);
        assert_eq!(h.queue.acked(), vec![id]);
        assert_eq!(h.board.score("leaderboard:global:all_time", "U"), Some(1));
    }

    #[tokio::test]
    async fn test_marking_failure_naks() {
        let h = harness();
        let id = h
            .queue
            .push(&payload("0a7e3c1e-5d7b-4b8e-8a51-3f0f6a2b9c14", "issue_opened"));

        h.kv.fail_set_with_ttl(true);
        h.handler.drain_once().await.unwrap();
        assert_eq!(h.queue.naked(), vec![id.clone()]);

        h.kv.fail_set_with_ttl(false);
        h.handler.drain_once().await.unwrap();
        assert_eq!(h.queue.acked(), vec![id]);
        assert_eq!(h.board.score("leaderboard:global:all_time", "U"), Some(4));
    }
}
