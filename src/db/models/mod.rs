pub mod event;
pub mod leaderboard;
pub mod record;
