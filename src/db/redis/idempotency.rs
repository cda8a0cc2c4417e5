//! Distributed dedup + lock keyed by event id.
//!
//! An event runs at most once at a time (lock with a per-invocation token) and is skipped
//! once its processed-marker exists. The marker is written only after the guarded operation
//! succeeds, so a failed attempt leaves the event retryable once the lock is gone.

use std::future::Future;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, ExistenceCheck, Script, SetExpiry, SetOptions};
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

use super::redis_pool::{RedisKey, StoreError, StoreResult, bounded, ttl_millis};

/// Deletes `KEYS[1]` only while it still holds this caller's token.
static COMPARE_AND_DELETE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        if redis.call("GET", KEYS[1]) == ARGV[1] then
            return redis.call("DEL", KEYS[1])
        end
        return 0
        "#,
    )
});

/// Key-value primitives the gate needs. All coordination happens in the store.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn exists(&self, key: &str) -> StoreResult<bool>;

    async fn get_value(&self, key: &str) -> StoreResult<Option<String>>;

    /// `SET key value NX PX ttl`; `true` if this call created the key.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// Deletes `key` only if it currently holds `expected`; `true` if deleted.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool>;
}

#[derive(Clone)]
pub struct RedisIdempotencyStore {
    manager: ConnectionManager,
    op_timeout: Duration,
}

impl RedisIdempotencyStore {
    pub fn new(manager: ConnectionManager, op_timeout: Duration) -> Self {
        Self {
            manager,
            op_timeout,
        }
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.manager.clone();
        bounded("exists", self.op_timeout, async move {
            let found: bool = conn.exists(key).await?;
            Ok(found)
        })
        .await
    }

    async fn get_value(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.manager.clone();
        bounded("get_value", self.op_timeout, async move {
            let value: Option<String> = conn.get(key).await?;
            Ok(value)
        })
        .await
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.manager.clone();
        let options = SetOptions::default()
            .conditional_set(ExistenceCheck::NX)
            .with_expiration(SetExpiry::PX(ttl_millis(ttl) as _));

        bounded("set_if_absent", self.op_timeout, async move {
            let reply: Option<String> = conn.set_options(key, value, options).await?;
            Ok(reply.is_some())
        })
        .await
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        let options = SetOptions::default().with_expiration(SetExpiry::PX(ttl_millis(ttl) as _));

        bounded("set_with_ttl", self.op_timeout, async move {
            let _: () = conn.set_options(key, value, options).await?;
            Ok(())
        })
        .await
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut conn = self.manager.clone();
        bounded("compare_and_delete", self.op_timeout, async move {
            let deleted: i64 = COMPARE_AND_DELETE
                .key(key)
                .arg(expected)
                .invoke_async(&mut conn)
                .await?;
            Ok(deleted == 1)
        })
        .await
    }
}

/// What happened to an event handed to [`IdempotencyGate::process`]. None of these are errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The operation ran and the processed-marker was written.
    Processed,
    /// A previous delivery already completed; nothing ran.
    AlreadyProcessed,
    /// Another worker holds the lock; nothing ran.
    Locked,
}

#[derive(Debug, Clone, Copy)]
pub struct GateConfig {
    pub lock_ttl: Duration,
    pub processed_ttl: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(30),
            processed_ttl: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

#[derive(Debug, Error)]
pub enum GateError<E> {
    #[error("event id must not be empty")]
    EmptyEventId,

    #[error("idempotency store failure: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Operation(E),

    /// Effects were applied but the processed-marker could not be written; a retry may
    /// apply them again.
    #[error("event {event_id} applied but not marked processed: {source}")]
    CriticalMarkingFailure {
        event_id: String,
        #[source]
        source: StoreError,
    },
}

#[derive(Clone)]
pub struct IdempotencyGate {
    store: Arc<dyn IdempotencyStore>,
    config: GateConfig,
}

impl IdempotencyGate {
    pub fn new(store: Arc<dyn IdempotencyStore>, config: GateConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &dyn IdempotencyStore {
        self.store.as_ref()
    }

    pub fn config(&self) -> GateConfig {
        self.config
    }

    /// Runs `f` while holding the named lock. `None` when another worker holds it and `f`
    /// never ran.
    #[instrument(skip(self, f))]
    pub async fn exclusive<F, Fut, T, E>(&self, name: &str, f: F) -> Result<Option<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<StoreError>,
    {
        let lock_key = RedisKey::Lock(name).to_string();
        let token = Uuid::new_v4().to_string();
        if !self
            .store
            .set_if_absent(&lock_key, &token, self.config.lock_ttl)
            .await?
        {
            tracing::debug!("lock held by another worker");
            return Ok(None);
        }

        let result = f().await;
        self.release(&lock_key, &token).await;

        result.map(Some)
    }

    /// Runs `f` at most once per `event_id` across every worker sharing the store.
    #[instrument(skip(self, f))]
    pub async fn process<F, Fut, E>(&self, event_id: &str, f: F) -> Result<Outcome, GateError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        if event_id.is_empty() {
            return Err(GateError::EmptyEventId);
        }

        let processed_key = RedisKey::Processed(event_id).to_string();
        if self.store.exists(&processed_key).await? {
            tracing::debug!("event already processed");
            return Ok(Outcome::AlreadyProcessed);
        }

        let lock_key = RedisKey::Lock(event_id).to_string();
        let token = Uuid::new_v4().to_string();
        if !self
            .store
            .set_if_absent(&lock_key, &token, self.config.lock_ttl)
            .await?
        {
            tracing::debug!("event locked by another worker");
            return Ok(Outcome::Locked);
        }

        let result = self.run_locked(event_id, &processed_key, f).await;
        self.release(&lock_key, &token).await;

        result
    }

    async fn run_locked<F, Fut, E>(
        &self,
        event_id: &str,
        processed_key: &str,
        f: F,
    ) -> Result<Outcome, GateError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        // the previous holder may have marked + released between our first check and the lock
        if self.store.exists(processed_key).await? {
            tracing::debug!("event processed while acquiring lock");
            return Ok(Outcome::AlreadyProcessed);
        }

        f().await.map_err(GateError::Operation)?;

        if let Err(source) = self
            .store
            .set_with_ttl(processed_key, "1", self.config.processed_ttl)
            .await
        {
            tracing::error!(
                critical = true,
                event_id,
                error = ?source,
                "event effects applied but processed-marker write failed"
            );

            return Err(GateError::CriticalMarkingFailure {
                event_id: event_id.to_string(),
                source,
            });
        }

        Ok(Outcome::Processed)
    }

    async fn release(&self, lock_key: &str, token: &str) {
        match self.store.compare_and_delete(lock_key, token).await {
            Ok(true) => (),
            Ok(false) => {
                tracing::warn!(lock_key, "lock expired before release; left to current holder")
            }
            Err(e) => tracing::warn!(lock_key, error = ?e, "lock release failed; waiting on ttl"),
        }
    }
}
