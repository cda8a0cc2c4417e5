use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::event::ScoreEvent;

/// Append-only audit row mirroring a [`ScoreEvent`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProcessedScoreEvent {
    pub event_id: Uuid,
    pub user_id: String,
    pub event_type: String,
    pub repository_id: i64,
    pub repository_name: String,
    pub event_timestamp: DateTime<Utc>,
    pub score_delta: i64,
}

impl From<&ScoreEvent> for ProcessedScoreEvent {
    fn from(event: &ScoreEvent) -> Self {
        Self {
            event_id: event.id,
            user_id: event.user_id.clone(),
            event_type: event.event_kind.as_str().to_string(),
            repository_id: event.repository_id,
            repository_name: event.repository_name.clone(),
            event_timestamp: event.timestamp,
            score_delta: event.score_delta,
        }
    }
}

impl From<ScoreEvent> for ProcessedScoreEvent {
    fn from(event: ScoreEvent) -> Self {
        Self::from(&event)
    }
}

/// Point-in-time copy of one member of a scope's `all_time` set.
///
/// `scope` is `global` or a project id (see `Scope::from_column`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserTotalScore {
    pub scope: String,
    pub user_id: String,
    pub total_score: i64,
    pub snapshot_timestamp: DateTime<Utc>,
}
