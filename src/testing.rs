//! In-memory stand-ins for the redis, postgres and stream seams.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::db::models::leaderboard::{LeaderboardKey, LeaderboardRow};
use crate::db::models::record::{ProcessedScoreEvent, UserTotalScore};
use crate::db::pg::persistence::EventPersistence;
use crate::db::pg::retry::{PersistenceError, PersistenceResult};
use crate::db::redis::idempotency::IdempotencyStore;
use crate::db::redis::leaderboard::{LeaderboardStore, ReplayRow, rank_rows};
use crate::db::redis::redis_pool::{StoreError, StoreResult};
use crate::db::redis::registry::ProjectRegistry;
use crate::queue::{ConsumerInfo, EventPublisher, QueueConsumer, QueueError, QueueMessage, QueueResult};

/// String keys with optional expiry on the tokio clock.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, (String, Option<Instant>)>>,
    calls: AtomicUsize,
    fail_set_with_ttl: AtomicBool,
    on_lock: Mutex<Option<(String, String)>>,
}

impl MemoryKv {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn fail_set_with_ttl(&self, fail: bool) {
        self.fail_set_with_ttl.store(fail, Ordering::SeqCst);
    }

    pub fn insert(&self, key: &str, value: &str) {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), (value.to_string(), None));
    }

    /// Writes `key` right after the next successful `set_if_absent`, as if another worker
    /// finished in that window.
    pub fn insert_on_lock(&self, key: &str, value: &str) {
        *self.on_lock.lock().unwrap() = Some((key.to_string(), value.to_string()));
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().unwrap();
        Self::live(&mut entries, key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    fn live<'a>(
        entries: &'a mut HashMap<String, (String, Option<Instant>)>,
        key: &str,
    ) -> Option<&'a String> {
        let expired = matches!(entries.get(key), Some((_, Some(at))) if *at <= Instant::now());
        if expired {
            entries.remove(key);
        }
        entries.get(key).map(|(value, _)| value)
    }
}

#[async_trait]
impl IdempotencyStore for MemoryKv {
    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.contains(key))
    }

    async fn get_value(&self, key: &str) -> StoreResult<Option<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.get(key))
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut entries = self.entries.lock().unwrap();
        if Self::live(&mut entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            (value.to_string(), Some(Instant::now() + ttl)),
        );
        if let Some((key, value)) = self.on_lock.lock().unwrap().take() {
            entries.insert(key, (value, None));
        }
        Ok(true)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_set_with_ttl.load(Ordering::SeqCst) {
            return Err(StoreError::Timeout("set_with_ttl", Duration::ZERO));
        }
        self.entries.lock().unwrap().insert(
            key.to_string(),
            (value.to_string(), Some(Instant::now() + ttl)),
        );
        Ok(())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut entries = self.entries.lock().unwrap();
        if Self::live(&mut entries, key).map(String::as_str) == Some(expected) {
            entries.remove(key);
            return Ok(true);
        }
        Ok(false)
    }
}

#[derive(Default)]
struct Board {
    sets: HashMap<String, HashMap<String, i64>>,
    scored: HashSet<String>,
    replayed: HashSet<String>,
}

/// Sorted sets as nested maps; the scored-markers live beside them like the lua script's.
#[derive(Default)]
pub struct MemoryLeaderboard {
    board: Mutex<Board>,
    reads: AtomicUsize,
    replays: AtomicUsize,
    fail_upserts: AtomicBool,
    replay_budget: Mutex<Option<usize>>,
}

impl MemoryLeaderboard {
    pub fn score(&self, key: &str, user_id: &str) -> Option<i64> {
        let board = self.board.lock().unwrap();
        board.sets.get(key).and_then(|set| set.get(user_id)).copied()
    }

    /// Every existing set, sorted by name.
    pub fn keys(&self) -> Vec<String> {
        let board = self.board.lock().unwrap();
        let mut keys: Vec<String> = board.sets.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Calls to `replay_once`.
    pub fn replays(&self) -> usize {
        self.replays.load(Ordering::SeqCst)
    }

    pub fn fail_upserts(&self, fail: bool) {
        self.fail_upserts.store(fail, Ordering::SeqCst);
    }

    /// Lets only `rows` more replayed rows land before `replay_once` fails; `None` lifts it.
    pub fn limit_replay(&self, rows: Option<usize>) {
        *self.replay_budget.lock().unwrap() = rows;
    }

    /// Drops every sorted set, leaving scored and replay markers in place.
    pub fn clear(&self) {
        self.board.lock().unwrap().sets.clear();
    }

    fn check_failure(&self) -> StoreResult<()> {
        if self.fail_upserts.load(Ordering::SeqCst) {
            return Err(StoreError::Timeout("upsert", Duration::ZERO));
        }
        Ok(())
    }

    fn increment(board: &mut Board, keys: &[LeaderboardKey], delta: i64, user_id: &str) {
        for key in keys {
            *board
                .sets
                .entry(key.to_string())
                .or_default()
                .entry(user_id.to_string())
                .or_insert(0) += delta;
        }
    }
}

#[async_trait]
impl LeaderboardStore for MemoryLeaderboard {
    async fn upsert_scores(
        &self,
        keys: &[LeaderboardKey],
        delta: i64,
        user_id: &str,
    ) -> StoreResult<()> {
        self.check_failure()?;
        let mut board = self.board.lock().unwrap();
        Self::increment(&mut board, keys, delta, user_id);
        Ok(())
    }

    async fn upsert_scores_once(
        &self,
        event_id: &str,
        keys: &[LeaderboardKey],
        delta: i64,
        user_id: &str,
    ) -> StoreResult<bool> {
        self.check_failure()?;
        let mut board = self.board.lock().unwrap();
        if !board.scored.insert(event_id.to_string()) {
            return Ok(false);
        }
        Self::increment(&mut board, keys, delta, user_id);
        Ok(true)
    }

    async fn get_leaderboard(
        &self,
        key: &LeaderboardKey,
        start: i64,
        stop: i64,
    ) -> StoreResult<Vec<LeaderboardRow>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let board = self.board.lock().unwrap();

        let mut members: Vec<(String, i64)> = board
            .sets
            .get(&key.to_string())
            .map(|set| set.iter().map(|(u, s)| (u.clone(), *s)).collect())
            .unwrap_or_default();
        // ZREVRANGE order: score desc, then member desc
        members.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));

        let len = members.len() as i64;
        let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
        if start >= len || start > stop {
            return Ok(Vec::new());
        }

        let page = members
            .into_iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize);
        Ok(rank_rows(start, page))
    }

    async fn replay_once(&self, run_id: &str, rows: &[ReplayRow]) -> StoreResult<usize> {
        self.replays.fetch_add(1, Ordering::SeqCst);
        self.check_failure()?;
        let mut budget = self.replay_budget.lock().unwrap();
        let mut board = self.board.lock().unwrap();

        let mut applied = 0;
        for row in rows {
            if board.replayed.contains(&row.marker(run_id)) {
                continue;
            }
            match budget.as_mut() {
                Some(0) => return Err(StoreError::Timeout("replay_once", Duration::ZERO)),
                Some(left) => *left -= 1,
                None => (),
            }
            board.replayed.insert(row.marker(run_id));
            Self::increment(&mut board, std::slice::from_ref(&row.key), row.score, &row.user_id);
            applied += 1;
        }
        Ok(applied)
    }

    async fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.board.lock().unwrap().sets.is_empty())
    }
}

#[derive(Default)]
pub struct MemoryRegistry {
    projects: Mutex<BTreeSet<String>>,
}

impl MemoryRegistry {
    pub fn projects(&self) -> Vec<String> {
        self.projects.lock().unwrap().iter().cloned().collect()
    }
}

#[async_trait]
impl ProjectRegistry for MemoryRegistry {
    async fn register(&self, project_id: &str) -> StoreResult<()> {
        self.projects.lock().unwrap().insert(project_id.to_string());
        Ok(())
    }

    async fn list_projects(&self) -> StoreResult<Vec<String>> {
        Ok(self.projects())
    }
}

/// Audit rows dedupe on `event_id`, matching the table's primary key.
#[derive(Default)]
pub struct MemoryPersistence {
    processed: Mutex<Vec<ProcessedScoreEvent>>,
    totals: Mutex<Vec<UserTotalScore>>,
    calls: AtomicUsize,
    fail: AtomicBool,
}

impl MemoryPersistence {
    pub fn processed(&self) -> Vec<ProcessedScoreEvent> {
        self.processed.lock().unwrap().clone()
    }

    pub fn totals(&self) -> Vec<UserTotalScore> {
        self.totals.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn enter(&self, cancel: &CancellationToken) -> PersistenceResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if cancel.is_cancelled() {
            return Err(PersistenceError::Cancelled);
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(PersistenceError::Connection("database offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl EventPersistence for MemoryPersistence {
    async fn add_processed_score_events(
        &self,
        cancel: &CancellationToken,
        batch: &[ProcessedScoreEvent],
    ) -> PersistenceResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.enter(cancel)?;

        let mut processed = self.processed.lock().unwrap();
        for row in batch {
            if !processed.iter().any(|p| p.event_id == row.event_id) {
                processed.push(row.clone());
            }
        }
        Ok(())
    }

    async fn add_user_total_scores(
        &self,
        cancel: &CancellationToken,
        batch: &[UserTotalScore],
    ) -> PersistenceResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.enter(cancel)?;

        let mut totals = self.totals.lock().unwrap();
        let duplicate = batch.iter().any(|row| {
            totals.iter().any(|t| {
                t.scope == row.scope
                    && t.user_id == row.user_id
                    && t.snapshot_timestamp == row.snapshot_timestamp
            })
        });
        if duplicate {
            return Err(PersistenceError::UniqueViolation("user_total_scores".into()));
        }
        totals.extend_from_slice(batch);
        Ok(())
    }

    async fn latest_user_total_scores(
        &self,
        cancel: &CancellationToken,
    ) -> PersistenceResult<Vec<UserTotalScore>> {
        self.enter(cancel)?;

        let totals = self.totals.lock().unwrap();
        let mut latest: HashMap<(String, String), UserTotalScore> = HashMap::new();
        for row in totals.iter() {
            let key = (row.scope.clone(), row.user_id.clone());
            match latest.get(&key) {
                Some(seen) if seen.snapshot_timestamp >= row.snapshot_timestamp => (),
                _ => {
                    latest.insert(key, row.clone());
                }
            }
        }

        let mut rows: Vec<UserTotalScore> = latest.into_values().collect();
        rows.sort_by(|a, b| (&a.scope, &a.user_id).cmp(&(&b.scope, &b.user_id)));
        Ok(rows)
    }
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<QueueMessage>,
    in_flight: HashMap<String, QueueMessage>,
    acked: Vec<String>,
    naked: Vec<String>,
    termed: Vec<String>,
    next_id: u64,
}

/// A single-consumer queue; nak puts the message back at the front.
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    closed: AtomicBool,
}

impl MemoryQueue {
    /// Enqueues `payload`, returning its message id.
    pub fn push(&self, payload: &str) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("{}-0", state.next_id);
        state.ready.push_back(QueueMessage {
            id: id.clone(),
            payload: payload.to_string(),
            deliveries: 0,
        });
        id
    }

    pub fn acked(&self) -> Vec<String> {
        self.state.lock().unwrap().acked.clone()
    }

    pub fn naked(&self) -> Vec<String> {
        self.state.lock().unwrap().naked.clone()
    }

    pub fn termed(&self) -> Vec<String> {
        self.state.lock().unwrap().termed.clone()
    }
}

#[async_trait]
impl QueueConsumer for MemoryQueue {
    async fn fetch(&self, max: usize) -> QueueResult<Vec<QueueMessage>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }

        let mut state = self.state.lock().unwrap();
        let count = max.min(state.ready.len());
        let batch: Vec<QueueMessage> = state
            .ready
            .drain(..count)
            .map(|mut message| {
                message.deliveries += 1;
                message
            })
            .collect();

        for message in &batch {
            state.in_flight.insert(message.id.clone(), message.clone());
        }
        Ok(batch)
    }

    async fn ack(&self, message: &QueueMessage) -> QueueResult<()> {
        let mut state = self.state.lock().unwrap();
        state.in_flight.remove(&message.id);
        state.acked.push(message.id.clone());
        Ok(())
    }

    async fn nak(&self, message: &QueueMessage) -> QueueResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(message) = state.in_flight.remove(&message.id) {
            state.naked.push(message.id.clone());
            state.ready.push_front(message);
        }
        Ok(())
    }

    async fn term(&self, message: &QueueMessage, _reason: &str) -> QueueResult<()> {
        let mut state = self.state.lock().unwrap();
        state.in_flight.remove(&message.id);
        state.termed.push(message.id.clone());
        Ok(())
    }

    async fn info(&self) -> QueueResult<ConsumerInfo> {
        let state = self.state.lock().unwrap();
        Ok(ConsumerInfo {
            pending: state.ready.len() as u64,
            ack_pending: state.in_flight.len() as u64,
            redelivered: state.ready.iter().filter(|m| m.deliveries > 0).count() as u64,
            waiting: 1,
        })
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventPublisher for MemoryQueue {
    async fn publish(&self, payload: &str) -> QueueResult<String> {
        Ok(self.push(payload))
    }
}
