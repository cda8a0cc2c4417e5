//! Failure classification for relational writes, and the linear-backoff retry loop built on it.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub type PersistenceResult<T> = core::result::Result<T, PersistenceError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("unique violation: {0}")]
    UniqueViolation(String),

    #[error("foreign key violation: {0}")]
    ForeignKeyViolation(String),

    #[error("serialization failure: {0}")]
    SerializationFailure(String),

    #[error("deadlock detected: {0}")]
    Deadlock(String),

    #[error("connection failure: {0}")]
    Connection(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("{0}")]
    Other(String),
}

impl PersistenceError {
    /// Constraint violations and caller aborts are final. Anything unrecognised is retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            PersistenceError::UniqueViolation(_)
                | PersistenceError::ForeignKeyViolation(_)
                | PersistenceError::Cancelled
                | PersistenceError::DeadlineExceeded(_)
        )
    }

    /// Maps a postgres SQLSTATE onto a failure class.
    pub fn from_sqlstate(code: &str, message: String) -> Self {
        match code {
            "23505" => PersistenceError::UniqueViolation(message),
            "23503" => PersistenceError::ForeignKeyViolation(message),
            "40001" => PersistenceError::SerializationFailure(message),
            "40P01" => PersistenceError::Deadlock(message),
            // admin/crash shutdown, cannot-connect-now
            "57P01" | "57P02" | "57P03" => PersistenceError::Connection(message),
            c if c.starts_with("08") => PersistenceError::Connection(message),
            _ => PersistenceError::Other(message),
        }
    }
}

impl From<sqlx::Error> for PersistenceError {
    fn from(e: sqlx::Error) -> Self {
        let message = e.to_string();
        match &e {
            sqlx::Error::Database(db) => match db.code() {
                Some(code) => PersistenceError::from_sqlstate(&code, message),
                None => PersistenceError::Other(message),
            },
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => PersistenceError::Connection(message),
            _ => PersistenceError::Other(message),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_retries: u32,
    /// Sleep after failed attempt `n` is `base_delay * n`.
    pub base_delay: Duration,
    /// Bound on the whole call, backoff included.
    pub deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            deadline: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Runs `f` until it succeeds, fails permanently, runs out of attempts, the deadline passes
    /// or `cancel` fires.
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        op: &'static str,
        f: F,
    ) -> PersistenceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = PersistenceResult<T>>,
    {
        match tokio::time::timeout(self.deadline, self.attempt_loop(cancel, op, f)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(op, deadline = ?self.deadline, "persistence deadline exceeded");
                Err(PersistenceError::DeadlineExceeded(self.deadline))
            }
        }
    }

    async fn attempt_loop<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        op: &'static str,
        mut f: F,
    ) -> PersistenceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = PersistenceResult<T>>,
    {
        let attempts = self.max_retries.max(1);
        let mut attempt: u32 = 1;

        loop {
            if cancel.is_cancelled() {
                return Err(PersistenceError::Cancelled);
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(PersistenceError::Cancelled),
                r = f() => r,
            };

            let err = match result {
                Ok(val) => return Ok(val),
                Err(e) => e,
            };

            if !err.is_retryable() {
                tracing::error!(op, attempt, error = %err, "permanent persistence failure");
                return Err(err);
            }
            if attempt >= attempts {
                tracing::error!(op, attempt, error = %err, "persistence retries exhausted");
                return Err(err);
            }

            let delay = self.base_delay * attempt;
            tracing::warn!(op, attempt, ?delay, error = %err, "transient persistence failure; retrying");

            tokio::select! {
                _ = cancel.cancelled() => return Err(PersistenceError::Cancelled),
                _ = tokio::time::sleep(delay) => (),
            }
            attempt += 1;
        }
    }
}
