use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::instrument;

use super::redis_pool::{RedisKey, StoreResult, bounded, ttl_millis};
use crate::db::models::leaderboard::{LeaderboardKey, LeaderboardRow};

/// Applies an event's increments and its scored-marker as one server-side step.
///
/// KEYS[1] = scored-marker, KEYS[2..] = sorted sets; ARGV = delta, member, marker ttl (ms).
static UPSERT_ONCE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        if redis.call("EXISTS", KEYS[1]) == 1 then
            return 0
        end
        for i = 2, #KEYS do
            redis.call("ZINCRBY", KEYS[i], ARGV[1], ARGV[2])
        end
        redis.call("SET", KEYS[1], "1", "PX", ARGV[3])
        return 1
        "#,
    )
});

/// Re-adds snapshot totals, each guarded by its own marker so a re-run skips what landed.
///
/// KEYS = (marker, sorted set) pairs; ARGV = (score, member) pairs, then marker ttl (ms).
static REPLAY_ONCE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        local ttl = ARGV[#ARGV]
        local applied = 0
        for i = 1, #KEYS, 2 do
            if redis.call("SET", KEYS[i], "1", "NX", "PX", ttl) then
                redis.call("ZINCRBY", KEYS[i + 1], ARGV[i], ARGV[i + 1])
                applied = applied + 1
            end
        end
        return applied
        "#,
    )
});

const SCAN_COUNT: usize = 500;

/// One snapshot total headed back into its sorted set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayRow {
    pub key: LeaderboardKey,
    pub user_id: String,
    pub score: i64,
}

impl ReplayRow {
    /// Marker recording that `run_id` already applied this row.
    pub fn marker(&self, run_id: &str) -> String {
        format!("{}:{}:{}", RedisKey::Restored(run_id), self.key, self.user_id)
    }
}

/// Live aggregate scores, one sorted set per [`LeaderboardKey`]. Members are user ids and are
/// only ever incremented.
#[async_trait]
pub trait LeaderboardStore: Send + Sync {
    /// One increment per key in a single round trip. A failure leaves per-key success
    /// undefined; callers treat the whole call as failed.
    async fn upsert_scores(
        &self,
        keys: &[LeaderboardKey],
        delta: i64,
        user_id: &str,
    ) -> StoreResult<()>;

    /// Like [`LeaderboardStore::upsert_scores`] but applied at most once per `event_id`;
    /// returns `false` when the event had already been scored.
    async fn upsert_scores_once(
        &self,
        event_id: &str,
        keys: &[LeaderboardKey],
        delta: i64,
        user_id: &str,
    ) -> StoreResult<bool>;

    /// Rows `start..=stop` in descending score order, ranked from `start + 1`. `stop = -1`
    /// reads to the end.
    async fn get_leaderboard(
        &self,
        key: &LeaderboardKey,
        start: i64,
        stop: i64,
    ) -> StoreResult<Vec<LeaderboardRow>>;

    /// Adds every row in one round trip, each at most once per `run_id`. Returns how many
    /// rows were applied by this call.
    async fn replay_once(&self, run_id: &str, rows: &[ReplayRow]) -> StoreResult<usize>;

    /// `true` when no leaderboard set exists at all.
    async fn is_empty(&self) -> StoreResult<bool>;
}

#[derive(Clone)]
pub struct RedisLeaderboardStore {
    manager: ConnectionManager,
    marker_ttl: Duration,
    op_timeout: Duration,
}

impl RedisLeaderboardStore {
    pub fn new(manager: ConnectionManager, marker_ttl: Duration, op_timeout: Duration) -> Self {
        Self {
            manager,
            marker_ttl,
            op_timeout,
        }
    }
}

#[async_trait]
impl LeaderboardStore for RedisLeaderboardStore {
    #[instrument(skip(self, keys), fields(key_count = keys.len()))]
    async fn upsert_scores(
        &self,
        keys: &[LeaderboardKey],
        delta: i64,
        user_id: &str,
    ) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        let mut pipeline = redis::pipe();

        keys.iter().for_each(|key| {
            pipeline.zincr(key.to_string(), user_id, delta).ignore();
        });

        bounded("upsert_scores", self.op_timeout, async move {
            let _: () = pipeline.query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self, keys), fields(key_count = keys.len()))]
    async fn upsert_scores_once(
        &self,
        event_id: &str,
        keys: &[LeaderboardKey],
        delta: i64,
        user_id: &str,
    ) -> StoreResult<bool> {
        let mut conn = self.manager.clone();
        let mut invocation = UPSERT_ONCE.prepare_invoke();
        invocation.key(RedisKey::Scored(event_id).to_string());
        keys.iter().for_each(|key| {
            invocation.key(key.to_string());
        });
        invocation
            .arg(delta)
            .arg(user_id)
            .arg(ttl_millis(self.marker_ttl));

        let applied: i64 = bounded("upsert_scores_once", self.op_timeout, async move {
            Ok(invocation.invoke_async(&mut conn).await?)
        })
        .await?;

        if applied == 0 {
            tracing::info!(event_id, "event already scored; skipping increments");
        }

        Ok(applied == 1)
    }

    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn replay_once(&self, run_id: &str, rows: &[ReplayRow]) -> StoreResult<usize> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut conn = self.manager.clone();
        let mut invocation = REPLAY_ONCE.prepare_invoke();
        for row in rows {
            invocation.key(row.marker(run_id)).key(row.key.to_string());
            invocation.arg(row.score).arg(&row.user_id);
        }
        invocation.arg(ttl_millis(self.marker_ttl));

        let applied: i64 = bounded("replay_once", self.op_timeout, async move {
            Ok(invocation.invoke_async(&mut conn).await?)
        })
        .await?;

        Ok(applied.max(0) as usize)
    }

    #[instrument(skip(self, key), fields(key = %key))]
    async fn get_leaderboard(
        &self,
        key: &LeaderboardKey,
        start: i64,
        stop: i64,
    ) -> StoreResult<Vec<LeaderboardRow>> {
        let mut conn = self.manager.clone();
        let key = key.to_string();

        let entries: Vec<(String, f64)> = bounded("get_leaderboard", self.op_timeout, async move {
            Ok(conn
                .zrevrange_withscores(key, start as isize, stop as isize)
                .await?)
        })
        .await?;

        // increments are integral, so the float score is exact
        Ok(rank_rows(
            start,
            entries
                .into_iter()
                .map(|(user_id, score)| (user_id, score.round() as i64)),
        ))
    }

    #[instrument(skip(self))]
    async fn is_empty(&self) -> StoreResult<bool> {
        let mut conn = self.manager.clone();
        let pattern = LeaderboardKey::wildcard();

        bounded("is_empty", self.op_timeout, async move {
            let mut cursor: u64 = 0;
            loop {
                let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(SCAN_COUNT)
                    .query_async(&mut conn)
                    .await?;

                if !keys.is_empty() {
                    return Ok(false);
                }
                if next == 0 {
                    return Ok(true);
                }
                cursor = next;
            }
        })
        .await
    }
}

/// Attach 1-based ranks to a descending page that began at offset `start`.
pub(crate) fn rank_rows(
    start: i64,
    entries: impl IntoIterator<Item = (String, i64)>,
) -> Vec<LeaderboardRow> {
    entries
        .into_iter()
        .enumerate()
        .map(|(idx, (user_id, score))| LeaderboardRow {
            rank: start.saturating_add(idx as i64).saturating_add(1),
            user_id,
            score,
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_rank_rows_offsets_from_start() {
        let first = rank_rows(0, [("a".to_string(), 9), ("b".to_string(), 7)]);
        let later = rank_rows(10, [("k".to_string(), 3), ("l".to_string(), 2)]);

        assert_eq!(first.iter().map(|r| r.rank).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(later.iter().map(|r| r.rank).collect::<Vec<_>>(), vec![11, 12]);
        assert_eq!(later[0].user_id, "k");
    }

    #[test]
    fn test_rank_rows_near_the_end_of_i64() {
        let rows = rank_rows(i64::MAX - 1, [("y".to_string(), 2), ("z".to_string(), 1)]);
        assert_eq!(rows.iter().map(|r| r.rank).collect::<Vec<_>>(), vec![i64::MAX, i64::MAX]);
    }

    #[test]
    fn test_replay_marker_is_per_run_key_and_user() {
        use crate::db::models::leaderboard::Scope;

        let row = ReplayRow {
            key: LeaderboardKey::all_time(Scope::Project("1001".into())),
            user_id: "alice".into(),
            score: 9,
        };

        assert_eq!(
            row.marker("run-1"),
            "restore:applied:run-1:leaderboard:1001:all_time:alice"
        );
        assert_ne!(row.marker("run-1"), row.marker("run-2"));
    }

    #[test]
    fn test_rank_rows_empty_page() {
        assert!(rank_rows(40, Vec::new()).is_empty());
    }
}
