use async_trait::async_trait;
use sqlx::PgPool;
use tracing::info;

use crate::domain::{next_pwd_version, OutboxKey, PwdVersionChanged, PwdVersionPayload};
use crate::infrastructure::outbox::PgOutboxStore;
use crate::infrastructure::repository::{expect_affected, RepositoryError};

#[async_trait]
pub trait AccountRepositoryTrait: Send + Sync {
    /// Stores the new hash, bumps the password version and records a
    /// `PwdVersionChanged` outbox row, all in one transaction. Returns the new version.
    async fn change_password(
        &self,
        user_id: OutboxKey,
        password_hash: &str,
    ) -> Result<i64, RepositoryError>;

    async fn update_store_id(&self, user_id: i64, seller_id: i64) -> Result<(), RepositoryError>;
}

#[derive(Clone)]
pub struct PostgresAccountRepository {
    pool: PgPool,
    outbox: PgOutboxStore<PwdVersionChanged>,
}

impl PostgresAccountRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            outbox: PgOutboxStore::new(pool.clone()),
            pool,
        }
    }

    pub async fn store_id(&self, user_id: i64) -> Result<Option<i64>, RepositoryError> {
        let row: Option<Option<i64>> =
            sqlx::query_scalar("SELECT store_id FROM accounts WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        row.ok_or(RepositoryError::NotFound(user_id))
    }
}

#[async_trait]
impl AccountRepositoryTrait for PostgresAccountRepository {
    async fn change_password(
        &self,
        user_id: OutboxKey,
        password_hash: &str,
    ) -> Result<i64, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let current: Option<i64> =
            sqlx::query_scalar("SELECT pwd_version FROM accounts WHERE id = $1 FOR UPDATE")
                .bind(user_id)
                .fetch_optional(&mut *tx)
                .await?;
        let current = current.ok_or(RepositoryError::NotFound(user_id))?;
        let pwd_version = next_pwd_version(current);

        sqlx::query("UPDATE accounts SET password_hash = $2, pwd_version = $3 WHERE id = $1")
            .bind(user_id)
            .bind(password_hash)
            .bind(pwd_version)
            .execute(&mut *tx)
            .await?;

        self.outbox
            .create_or_update(
                &mut tx,
                &PwdVersionPayload {
                    user_id,
                    pwd_version,
                },
            )
            .await?;

        tx.commit().await?;
        info!(
            "Password changed for user {}: pwd_version {} -> {}",
            user_id, current, pwd_version
        );
        Ok(pwd_version)
    }

    async fn update_store_id(&self, user_id: i64, seller_id: i64) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE accounts SET store_id = $2 WHERE id = $1")
            .bind(user_id)
            .bind(seller_id)
            .execute(&self.pool)
            .await?;
        expect_affected(result, user_id)
    }
}
