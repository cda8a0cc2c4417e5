pub mod models;
pub mod pg;
pub mod redis;

/// Storage types wired together at startup.
pub mod prelude {
    pub use crate::db::pg::persistence::{EventPersistence, PgPersistence};
    pub use crate::db::pg::retry::RetryPolicy;
    pub use crate::db::pg::{PgErr, db_pool};

    pub use crate::db::redis::idempotency::{GateConfig, IdempotencyGate, RedisIdempotencyStore};
    pub use crate::db::redis::leaderboard::RedisLeaderboardStore;
    pub use crate::db::redis::redis_pool::{StoreError, redis_pool};
    pub use crate::db::redis::registry::RedisProjectRegistry;
}
