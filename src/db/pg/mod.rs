use std::sync::LazyLock;

use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::instrument;

use crate::util::env::EnvErr;
use crate::var;

pub mod persistence;
pub mod retry;

static DB_POOL: LazyLock<OnceCell<Db>> = LazyLock::new(OnceCell::new);
pub async fn db_pool() -> PgResult<&'static PgPool> {
    Ok(&DB_POOL
        .get_or_try_init(|| async { Db::new_pool().await })
        .await?
        .pool)
}

struct Db {
    pool: PgPool,
}

impl Db {
    #[instrument]
    pub async fn new_pool() -> PgResult<Self> {
        let db_url = var!(database_url)?;
        let pool = sqlx::PgPool::connect(db_url).await?;

        Ok(Self { pool })
    }
}

/// Applies the embedded `migrations/` directory.
#[instrument(skip(pool))]
pub async fn migrate(pool: &PgPool) -> PgResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("database migrations applied");
    Ok(())
}

pub type PgResult<T> = core::result::Result<T, PgErr>;

#[allow(clippy::enum_variant_names)]
#[derive(Debug, Error)]
pub enum PgErr {
    #[error(transparent)]
    SqlxError(#[from] sqlx::Error),

    #[error(transparent)]
    MigrateError(#[from] sqlx::migrate::MigrateError),

    #[error("{0}")]
    EnvError(#[from] EnvErr),
}
