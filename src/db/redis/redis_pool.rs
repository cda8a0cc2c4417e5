use core::fmt;
use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;

use redis::aio::ConnectionManager;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::instrument;

use crate::util::env::EnvErr;
use crate::var;

static REDIS_POOL: LazyLock<OnceCell<RedisPool>> = LazyLock::new(OnceCell::new);
pub async fn redis_pool() -> StoreResult<&'static RedisPool> {
    REDIS_POOL
        .get_or_try_init(|| async { RedisPool::new().await })
        .await
}

pub struct RedisPool {
    pub manager: ConnectionManager,
}

impl RedisPool {
    #[instrument]
    pub async fn new() -> StoreResult<Self> {
        let redis_url = var!(redis_url)?;
        tracing::debug!(redis_url, "connecting to redis server");

        let client = redis::Client::open(redis_url.as_str())?;
        let manager = ConnectionManager::new(client).await?;

        Ok(Self { manager })
    }
}

/// Non-leaderboard keys owned by this service.
#[derive(Debug, Clone, Copy)]
pub enum RedisKey<'a> {
    /// Set once an event's effects (scoring + recording) are complete.
    Processed(&'a str),
    /// Held while one worker runs an event.
    Lock(&'a str),
    /// Set atomically with the sorted-set increments of an event.
    Scored(&'a str),
    /// Set of every project id that has ever been scored.
    Projects,
    /// Holds the id of a snapshot restore that has started but not finished.
    RestorePending,
    /// Prefix of the per-row markers written by one restore run.
    Restored(&'a str),
}

impl fmt::Display for RedisKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RedisKey::Processed(id) => write!(f, "idempotency:processed:{}", id),
            RedisKey::Lock(id) => write!(f, "idempotency:lock:{}", id),
            RedisKey::Scored(id) => write!(f, "idempotency:scored:{}", id),
            RedisKey::Projects => write!(f, "registry:projects"),
            RedisKey::RestorePending => write!(f, "restore:pending"),
            RedisKey::Restored(run) => write!(f, "restore:applied:{}", run),
        }
    }
}

/// Bounds a single store round trip; the redis client itself has no per-call deadline.
pub async fn bounded<T, F>(op: &'static str, limit: Duration, fut: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(op, limit_ms = limit.as_millis() as u64, "store call timed out");
            Err(StoreError::Timeout(op, limit))
        }
    }
}

pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    ttl.as_millis().clamp(1, u64::MAX as u128) as u64
}

pub type StoreResult<T> = core::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    EnvErr(#[from] EnvErr),

    #[error(transparent)]
    RedisClientError(#[from] redis::RedisError),

    #[error("{0} timed out after {1:?}")]
    Timeout(&'static str, Duration),
}
