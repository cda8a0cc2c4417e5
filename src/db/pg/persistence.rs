use async_trait::async_trait;
use sqlx::{PgPool, Pool, Postgres, QueryBuilder, Result as SqlxResult, Transaction};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::retry::{PersistenceError, PersistenceResult, RetryPolicy};
use crate::db::models::record::{ProcessedScoreEvent, UserTotalScore};

/// Rows per INSERT statement; keeps binds well under postgres' 65535 parameter limit.
const INSERT_CHUNK: usize = 5000;

/// Durable audit log and snapshot storage.
#[async_trait]
pub trait EventPersistence: Send + Sync {
    /// Empty batches are a no-op. Rows whose `event_id` already exists are skipped.
    async fn add_processed_score_events(
        &self,
        cancel: &CancellationToken,
        batch: &[ProcessedScoreEvent],
    ) -> PersistenceResult<()>;

    /// Empty batches are a no-op.
    async fn add_user_total_scores(
        &self,
        cancel: &CancellationToken,
        batch: &[UserTotalScore],
    ) -> PersistenceResult<()>;

    /// The most recent snapshot row for each `(scope, user_id)`.
    async fn latest_user_total_scores(
        &self,
        cancel: &CancellationToken,
    ) -> PersistenceResult<Vec<UserTotalScore>>;
}

pub struct PgPersistence {
    pool: &'static PgPool,
    retry: RetryPolicy,
}

impl PgPersistence {
    pub fn new(pool: &'static PgPool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }
}

#[async_trait]
impl EventPersistence for PgPersistence {
    #[instrument(skip(self, cancel, batch), fields(rows = batch.len()))]
    async fn add_processed_score_events(
        &self,
        cancel: &CancellationToken,
        batch: &[ProcessedScoreEvent],
    ) -> PersistenceResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let pool = self.pool;
        let inserted = self
            .retry
            .run(cancel, "add_processed_score_events", move || async move {
                let mut tx = Tx::begin(pool).await?;
                let inserted = tx.insert_processed_score_events(batch).await?;
                tx.commit().await?;
                Ok::<_, PersistenceError>(inserted)
            })
            .await?;

        tracing::debug!(
            inserted,
            duplicates = batch.len() as u64 - inserted,
            "persisted processed score events"
        );
        Ok(())
    }

    #[instrument(skip(self, cancel, batch), fields(rows = batch.len()))]
    async fn add_user_total_scores(
        &self,
        cancel: &CancellationToken,
        batch: &[UserTotalScore],
    ) -> PersistenceResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let pool = self.pool;
        self.retry
            .run(cancel, "add_user_total_scores", move || async move {
                let mut tx = Tx::begin(pool).await?;
                tx.insert_user_total_scores(batch).await?;
                tx.commit().await?;
                Ok::<_, PersistenceError>(())
            })
            .await
    }

    #[instrument(skip(self, cancel))]
    async fn latest_user_total_scores(
        &self,
        cancel: &CancellationToken,
    ) -> PersistenceResult<Vec<UserTotalScore>> {
        let pool = self.pool;
        self.retry
            .run(cancel, "latest_user_total_scores", move || async move {
                Ok::<_, PersistenceError>(sqlx::query_as::<_, UserTotalScore>(
                    r#"
                    SELECT DISTINCT ON (scope, user_id)
                        scope,
                        user_id,
                        total_score,
                        snapshot_timestamp
                    FROM user_total_scores
                    ORDER BY scope, user_id, snapshot_timestamp DESC
                    "#,
                )
                .fetch_all(pool)
                .await?)
            })
            .await
    }
}

/// One transaction; dropped without commit it rolls back.
pub struct Tx<'a> {
    inner: Option<Transaction<'a, Postgres>>,
}

impl<'a> Tx<'a> {
    #[instrument(skip(pool))]
    pub async fn begin(pool: &'static Pool<Postgres>) -> SqlxResult<Self> {
        let inner = pool.begin().await?;
        Ok(Self { inner: Some(inner) })
    }

    #[instrument(skip(self))]
    pub async fn commit(&mut self) -> SqlxResult<()> {
        if let Some(tx) = self.inner.take() {
            tx.commit().await
        } else {
            Err(sqlx::Error::Protocol("Transaction already completed".into()))
        }
    }

    fn inner_mut(&mut self) -> SqlxResult<&mut Transaction<'a, Postgres>> {
        self.inner
            .as_mut()
            .ok_or_else(|| sqlx::Error::Protocol("Transaction already completed".into()))
    }

    /// Returns the number of rows actually inserted (duplicates excluded).
    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    pub async fn insert_processed_score_events(
        &mut self,
        rows: &[ProcessedScoreEvent],
    ) -> SqlxResult<u64> {
        let mut inserted = 0;
        for chunk in rows.chunks(INSERT_CHUNK) {
            let done = processed_insert(chunk)
                .build()
                .execute(&mut **self.inner_mut()?)
                .await?;
            inserted += done.rows_affected();
        }

        Ok(inserted)
    }

    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    pub async fn insert_user_total_scores(&mut self, rows: &[UserTotalScore]) -> SqlxResult<()> {
        for chunk in rows.chunks(INSERT_CHUNK) {
            snapshot_insert(chunk)
                .build()
                .execute(&mut **self.inner_mut()?)
                .await?;
        }

        Ok(())
    }
}

fn processed_insert(chunk: &[ProcessedScoreEvent]) -> QueryBuilder<'_, Postgres> {
    let mut query = QueryBuilder::<Postgres>::new(
        r#"INSERT INTO processed_score_events (
            event_id,
            user_id,
            event_type,
            repository_id,
            repository_name,
            event_timestamp,
            score_delta
        ) "#,
    );

    query.push_values(chunk, |mut row, event| {
        row.push_bind(event.event_id)
            .push_bind(event.user_id.as_str())
            .push_bind(event.event_type.as_str())
            .push_bind(event.repository_id)
            .push_bind(event.repository_name.as_str())
            .push_bind(event.event_timestamp)
            .push_bind(event.score_delta);
    });
    query.push(" ON CONFLICT (event_id) DO NOTHING");

    query
}

fn snapshot_insert(chunk: &[UserTotalScore]) -> QueryBuilder<'_, Postgres> {
    let mut query = QueryBuilder::<Postgres>::new(
        "INSERT INTO user_total_scores (scope, user_id, total_score, snapshot_timestamp) ",
    );

    query.push_values(chunk, |mut row, score| {
        row.push_bind(score.scope.as_str())
            .push_bind(score.user_id.as_str())
            .push_bind(score.total_score)
            .push_bind(score.snapshot_timestamp);
    });

    query
}

#[cfg(test)]
mod test {
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    use super::*;

    fn processed(n: i64) -> ProcessedScoreEvent {
        ProcessedScoreEvent {
            event_id: Uuid::new_v4(),
            user_id: format!("user-{n}"),
            event_type: "push".into(),
            repository_id: 1001,
            repository_name: "acme/widgets".into(),
            event_timestamp: Utc.with_ymd_and_hms(2024, 7, 16, 10, 0, 0).unwrap(),
            score_delta: 1,
        }
    }

    #[test]
    fn test_processed_insert_skips_duplicates() {
        let rows: Vec<_> = (0..3).map(processed).collect();
        let query = processed_insert(&rows);
        let sql = query.sql();

        assert!(sql.trim_end().ends_with("ON CONFLICT (event_id) DO NOTHING"));
        // 3 rows x 7 columns
        assert!(sql.contains("$21"));
        assert!(!sql.contains("$22"));
    }

    #[test]
    fn test_snapshot_insert_binds_every_column() {
        let at = Utc.with_ymd_and_hms(2024, 7, 16, 12, 0, 0).unwrap();
        let rows = vec![
            UserTotalScore {
                scope: "global".into(),
                user_id: "U".into(),
                total_score: 7,
                snapshot_timestamp: at,
            },
            UserTotalScore {
                scope: "1001".into(),
                user_id: "U".into(),
                total_score: 7,
                snapshot_timestamp: at,
            },
        ];

        let query = snapshot_insert(&rows);
        let sql = query.sql();

        assert!(sql.starts_with("INSERT INTO user_total_scores"));
        assert!(sql.contains("$8"));
        assert!(!sql.contains("ON CONFLICT"));
    }
}
