//! Validates contribution events, fans their scores out across leaderboard keys, answers
//! leaderboard queries and owns snapshot/restore of the live sorted sets.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

use crate::db::models::event::{ContributionEvent, EventKind, ScoreEvent, ValidationError};
use crate::db::models::leaderboard::{LeaderboardKey, LeaderboardPage, Scope, Timeframe};
use crate::db::models::record::UserTotalScore;
use crate::db::pg::persistence::EventPersistence;
use crate::db::pg::retry::PersistenceError;
use crate::db::redis::idempotency::{GateError, IdempotencyGate, Outcome};
use crate::db::redis::leaderboard::{LeaderboardStore, ReplayRow};
use crate::db::redis::redis_pool::{RedisKey, StoreError};
use crate::db::redis::registry::ProjectRegistry;
use crate::queue::QueueError;

pub mod config;
pub mod recorder;

pub use config::{ScoringConfig, ScoringTable};
pub use recorder::EventRecorder;

/// Lock held by the instance rebuilding leaderboards from a snapshot.
const RESTORE_LOCK: &str = "leaderboard-restore";

/// Snapshot rows replayed per store round trip.
const RESTORE_CHUNK: usize = 500;

/// Result of [`ScoringService::restore_leaderboard_from_snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreReport {
    /// Live leaderboards already existed; nothing was touched.
    Skipped,
    /// Another instance holds the restore lock.
    Busy,
    Restored { rows: usize, projects: usize },
}

pub struct ScoringService {
    gate: IdempotencyGate,
    store: Arc<dyn LeaderboardStore>,
    registry: Arc<dyn ProjectRegistry>,
    recorder: EventRecorder,
    persistence: Arc<dyn EventPersistence>,
    config: ScoringConfig,
    clock: fn() -> DateTime<Utc>,
    cancel: CancellationToken,
}

impl ScoringService {
    pub fn new(
        gate: IdempotencyGate,
        store: Arc<dyn LeaderboardStore>,
        registry: Arc<dyn ProjectRegistry>,
        recorder: EventRecorder,
        persistence: Arc<dyn EventPersistence>,
        config: ScoringConfig,
    ) -> Self {
        Self {
            gate,
            store,
            registry,
            recorder,
            persistence,
            config,
            clock: Utc::now,
            cancel: CancellationToken::new(),
        }
    }

    /// Replaces the wall clock used for periods and the future-timestamp guard.
    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    /// Token observed by inline persistence during event processing.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn validate(&self, req: &ContributionEvent) -> Result<ScoreEvent, ValidationError> {
        if req.id.trim().is_empty() {
            return Err(ValidationError::MissingField("id"));
        }
        let id = Uuid::parse_str(req.id.trim())
            .map_err(|_| ValidationError::InvalidEventId(req.id.clone()))?;

        if req.event_kind.trim().is_empty() {
            return Err(ValidationError::MissingField("eventKind"));
        }
        let kind: EventKind = req.event_kind.trim().parse()?;

        if req.contributor_id.trim().is_empty() {
            return Err(ValidationError::MissingField("contributorID"));
        }
        if req.repository_name.trim().is_empty() {
            return Err(ValidationError::MissingField("repositoryName"));
        }
        if req.repository_id == 0 {
            return Err(ValidationError::InvalidRepositoryId);
        }
        if req.timestamp > (self.clock)() + self.config.max_clock_skew {
            return Err(ValidationError::FutureTimestamp(req.timestamp));
        }

        Ok(ScoreEvent {
            id,
            user_id: req.contributor_id.clone(),
            event_kind: kind,
            repository_id: req.repository_id,
            repository_name: req.repository_name.clone(),
            score_delta: self.config.table.delta(kind),
            timestamp: req.timestamp,
        })
    }

    /// Scores one event at most once: increments every affected leaderboard, registers the
    /// project, then records the event.
    #[instrument(skip(self, req), fields(event_id = %req.id, kind = %req.event_kind))]
    pub async fn process_score_event(&self, req: &ContributionEvent) -> ScoringResult<Outcome> {
        let event = self.validate(req).inspect_err(|e| {
            tracing::warn!(error = %e, "rejected contribution event");
        })?;

        let event_id = event.id.to_string();
        let project_id = event.project_id();
        let keys = LeaderboardKey::fan_out(&project_id, event.timestamp);

        let (event, keys, project_id, id) = (&event, &keys, &project_id, &event_id);
        let outcome = self
            .gate
            .process(id, move || async move {
                self.apply(id, event, keys, project_id).await
            })
            .await;

        match outcome {
            Ok(outcome) => {
                tracing::debug!(?outcome, "contribution event handled");
                Ok(outcome)
            }
            Err(GateError::EmptyEventId) => Err(ValidationError::MissingField("id").into()),
            Err(GateError::Store(e)) => Err(e.into()),
            Err(GateError::Operation(e)) => Err(e),
            Err(GateError::CriticalMarkingFailure { event_id, source }) => {
                Err(ScoringError::CriticalMarkingFailure { event_id, source })
            }
        }
    }

    async fn apply(
        &self,
        event_id: &str,
        event: &ScoreEvent,
        keys: &[LeaderboardKey],
        project_id: &str,
    ) -> ScoringResult<()> {
        let applied = self
            .store
            .upsert_scores_once(event_id, keys, event.score_delta, &event.user_id)
            .await?;

        if applied {
            tracing::debug!(
                keys = keys.len(),
                delta = event.score_delta,
                user_id = %event.user_id,
                "leaderboards incremented"
            );
        }

        self.registry.register(project_id).await?;
        self.recorder.record(&self.cancel, event).await
    }

    /// One page of the current period's leaderboard for `timeframe`, global unless a project
    /// is given.
    #[instrument(skip(self))]
    pub async fn get_leaderboard(
        &self,
        timeframe: &str,
        project_id: Option<&str>,
        page_size: i64,
        offset: i64,
    ) -> ScoringResult<LeaderboardPage> {
        let timeframe: Timeframe = timeframe.parse()?;
        if !(1..=self.config.max_page_size).contains(&page_size) {
            return Err(
                ValidationError::InvalidPageSize(page_size, self.config.max_page_size).into(),
            );
        }
        // the last rank on the page must still fit in an i64
        let stop = match offset.checked_add(page_size - 1) {
            Some(stop) if offset >= 0 => stop,
            _ => return Err(ValidationError::InvalidOffset(offset).into()),
        };

        let scope = match project_id {
            Some(id) if id.trim().is_empty() => {
                return Err(ValidationError::EmptyProjectId.into());
            }
            Some(id) => Scope::Project(id.to_string()),
            None => Scope::Global,
        };

        let key = LeaderboardKey::new(scope, timeframe, (self.clock)());
        let rows = self
            .store
            .get_leaderboard(&key, offset, stop)
            .await?;

        Ok(LeaderboardPage {
            timeframe,
            project_id: project_id.map(str::to_string),
            rows,
        })
    }

    /// Copies the global and every registered project's `all_time` set into the snapshot
    /// table under one timestamp. Returns the number of rows written.
    #[instrument(skip(self, cancel))]
    pub async fn create_leaderboard_snapshot(&self, cancel: &CancellationToken) -> ScoringResult<usize> {
        let pending_key = RedisKey::RestorePending.to_string();
        if self.gate.store().get_value(&pending_key).await?.is_some() {
            // a half-restored board would become the newest snapshot
            tracing::warn!("restore incomplete; snapshot skipped");
            return Ok(0);
        }

        let taken_at = (self.clock)();

        let scopes: Vec<Scope> = std::iter::once(Scope::Global)
            .chain(self.registry.list_projects().await?.into_iter().map(Scope::Project))
            .collect();

        let mut rows: Vec<UserTotalScore> = Vec::new();
        for scope in &scopes {
            let members = self
                .store
                .get_leaderboard(&LeaderboardKey::all_time(scope.clone()), 0, -1)
                .await?;

            rows.extend(members.into_iter().map(|row| UserTotalScore {
                scope: scope.as_str().to_string(),
                user_id: row.user_id,
                total_score: row.score,
                snapshot_timestamp: taken_at,
            }));
        }

        if rows.is_empty() {
            tracing::info!("no leaderboard members; snapshot skipped");
            return Ok(0);
        }

        self.persistence.add_user_total_scores(cancel, &rows).await?;
        tracing::info!(
            rows = rows.len(),
            scopes = scopes.len(),
            snapshot_timestamp = %taken_at,
            "leaderboard snapshot written"
        );

        Ok(rows.len())
    }

    /// Rebuilds each scope's `all_time` set from its latest snapshot rows, but only when no
    /// leaderboard exists yet or an earlier restore was cut short. Scores applied after that
    /// snapshot are not recovered.
    ///
    /// One instance restores at a time; the others report [`RestoreReport::Busy`]. Rows are
    /// replayed in chunks, each row at most once per restore run, so resuming an interrupted
    /// run never counts a row twice.
    #[instrument(skip(self, cancel))]
    pub async fn restore_leaderboard_from_snapshot(
        &self,
        cancel: &CancellationToken,
    ) -> ScoringResult<RestoreReport> {
        let report = self
            .gate
            .exclusive(RESTORE_LOCK, || self.restore_locked(cancel))
            .await?;

        Ok(report.unwrap_or_else(|| {
            tracing::info!("restore running on another instance");
            RestoreReport::Busy
        }))
    }

    async fn restore_locked(&self, cancel: &CancellationToken) -> ScoringResult<RestoreReport> {
        let kv = self.gate.store();
        let pending_key = RedisKey::RestorePending.to_string();

        let run_id = match kv.get_value(&pending_key).await? {
            Some(run_id) => {
                tracing::warn!(run_id = %run_id, "resuming interrupted restore");
                run_id
            }
            None => {
                // checked under the lock: an instance that restored before us left sets behind
                if !self.store.is_empty().await? {
                    tracing::info!("live leaderboards present; restore skipped");
                    return Ok(RestoreReport::Skipped);
                }
                let run_id = Uuid::new_v4().to_string();
                kv.set_with_ttl(&pending_key, &run_id, self.gate.config().processed_ttl)
                    .await?;
                run_id
            }
        };

        let latest = self.persistence.latest_user_total_scores(cancel).await?;
        let mut projects = std::collections::BTreeSet::new();
        let rows: Vec<ReplayRow> = latest
            .into_iter()
            .map(|row| {
                let scope = Scope::from_column(&row.scope);
                if let Scope::Project(id) = &scope {
                    projects.insert(id.clone());
                }
                ReplayRow {
                    key: LeaderboardKey::all_time(scope),
                    user_id: row.user_id,
                    score: row.total_score,
                }
            })
            .collect();

        let mut applied = 0;
        for chunk in rows.chunks(RESTORE_CHUNK) {
            applied += self.store.replay_once(&run_id, chunk).await?;
        }

        for id in &projects {
            self.registry.register(id).await?;
        }

        if !kv.compare_and_delete(&pending_key, &run_id).await? {
            tracing::warn!(run_id = %run_id, "restore marker changed while restoring");
        }

        tracing::info!(
            run_id = %run_id,
            rows = rows.len(),
            applied,
            projects = projects.len(),
            "leaderboards restored from snapshot"
        );

        Ok(RestoreReport::Restored {
            rows: applied,
            projects: projects.len(),
        })
    }
}

pub type ScoringResult<T> = core::result::Result<T, ScoringError>;

#[derive(Debug, Error)]
pub enum ScoringError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Scores were applied and recorded but the processed-marker is missing.
    #[error("event {event_id} applied but not marked processed: {source}")]
    CriticalMarkingFailure {
        event_id: String,
        #[source]
        source: StoreError,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
