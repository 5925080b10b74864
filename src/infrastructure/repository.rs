use sqlx::postgres::{PgPoolOptions, PgQueryResult};
use sqlx::PgPool;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::infrastructure::outbox::OutboxError;

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Row not found for ID: {0}")]
    NotFound(i64),
    #[error("Outbox write failed: {0}")]
    Outbox(#[from] OutboxError),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Maps an UPDATE that touched nothing to `NotFound(id)`.
pub(crate) fn expect_affected(result: PgQueryResult, id: i64) -> Result<(), RepositoryError> {
    if result.rows_affected() == 0 {
        return Err(RepositoryError::NotFound(id));
    }
    Ok(())
}

pub async fn connect_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .connect(database_url)
        .await?;
    info!("Connected to Postgres with pool size {}", max_connections);
    Ok(pool)
}
