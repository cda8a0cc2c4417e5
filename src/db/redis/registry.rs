use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::instrument;

use super::redis_pool::{RedisKey, StoreResult, bounded};

/// Catalog of project scopes that have received at least one score.
#[async_trait]
pub trait ProjectRegistry: Send + Sync {
    async fn register(&self, project_id: &str) -> StoreResult<()>;

    /// Every registered project id, sorted.
    async fn list_projects(&self) -> StoreResult<Vec<String>>;
}

#[derive(Clone)]
pub struct RedisProjectRegistry {
    manager: ConnectionManager,
    op_timeout: Duration,
}

impl RedisProjectRegistry {
    pub fn new(manager: ConnectionManager, op_timeout: Duration) -> Self {
        Self {
            manager,
            op_timeout,
        }
    }
}

#[async_trait]
impl ProjectRegistry for RedisProjectRegistry {
    #[instrument(skip(self))]
    async fn register(&self, project_id: &str) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        bounded("register_project", self.op_timeout, async move {
            let added: i64 = conn.sadd(RedisKey::Projects.to_string(), project_id).await?;
            if added == 1 {
                tracing::info!(project_id, "registered new project scope");
            }
            Ok(())
        })
        .await
    }

    #[instrument(skip(self))]
    async fn list_projects(&self) -> StoreResult<Vec<String>> {
        let mut conn = self.manager.clone();
        let mut projects: Vec<String> = bounded("list_projects", self.op_timeout, async move {
            Ok(conn.smembers(RedisKey::Projects.to_string()).await?)
        })
        .await?;

        projects.sort();
        Ok(projects)
    }
}
