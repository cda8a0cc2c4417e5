pub mod idempotency;
pub mod leaderboard;
pub mod redis_pool;
pub mod registry;
