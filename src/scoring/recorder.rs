use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::ScoringResult;
use crate::db::models::event::ScoreEvent;
use crate::db::models::record::ProcessedScoreEvent;
use crate::db::pg::persistence::EventPersistence;
use crate::queue::EventPublisher;

/// Where a scored event goes once its leaderboard increments are applied.
#[derive(Clone)]
pub enum EventRecorder {
    /// Write the audit row inline.
    Direct(Arc<dyn EventPersistence>),
    /// Publish the event for the batch consumer.
    Queue(Arc<dyn EventPublisher>),
}

impl EventRecorder {
    pub async fn record(&self, cancel: &CancellationToken, event: &ScoreEvent) -> ScoringResult<()> {
        match self {
            EventRecorder::Direct(persistence) => {
                persistence
                    .add_processed_score_events(cancel, &[ProcessedScoreEvent::from(event)])
                    .await?;
            }
            EventRecorder::Queue(publisher) => {
                let payload = serde_json::to_string(event).map_err(crate::queue::QueueError::from)?;
                let id = publisher.publish(&payload).await?;
                tracing::debug!(event_id = %event.id, message_id = %id, "score event published");
            }
        }

        Ok(())
    }
}
